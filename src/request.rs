use async_trait::async_trait;
use serde_json::json;
use std::sync::Mutex;

use crate::{Error, Result};

/// Opaque correlation data a [`Source`] attaches to a request.
///
/// The engine never interprets it. Loggers receive it mutably and may append
/// metadata for the loggers that follow them.
pub type Tag = Vec<u8>;

/// One request to send: the bytes on the wire plus its tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub payload: Vec<u8>,
    pub tag: Tag,
}

impl Request {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            tag: Tag::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<Tag>) -> Self {
        self.tag = tag.into();
        self
    }
}

/// Supplies requests to a method.
///
/// `get_request` is called concurrently by every worker of the method, so
/// implementations serialize their own cursor. Returning `None` means the
/// source is exhausted; workers stop pulling once they observe it.
#[async_trait]
pub trait Source: Send + Sync {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn get_request(&self) -> Option<Request>;

    /// Source-specific counters included in the method's statistics output.
    fn stat(&self) -> Option<serde_json::Value> {
        None
    }

    async fn fini(&self) -> Result<()> {
        Ok(())
    }
}

/// Replays a fixed list of requests, `passes` times over.
#[derive(Debug)]
pub struct ListSource {
    requests: Vec<Request>,
    passes: usize,
    cursor: Mutex<usize>,
}

impl ListSource {
    pub fn new(requests: Vec<Request>) -> Self {
        Self {
            requests,
            passes: 1,
            cursor: Mutex::new(0),
        }
    }

    /// Builds a source from bare payloads with empty tags.
    pub fn from_payloads<I, P>(payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        Self::new(payloads.into_iter().map(Request::new).collect())
    }

    /// Replays the whole list `passes` times before exhausting.
    pub fn passes(mut self, passes: usize) -> Self {
        self.passes = passes;
        self
    }

    fn total(&self) -> usize {
        self.requests.len().saturating_mul(self.passes)
    }

    /// Number of requests handed out so far.
    pub fn issued(&self) -> usize {
        *self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Source for ListSource {
    async fn init(&self) -> Result<()> {
        if self.passes == 0 && !self.requests.is_empty() {
            return Err(Error::Source(format!(
                "{} requests listed but zero passes to replay them",
                self.requests.len()
            )));
        }
        Ok(())
    }

    async fn get_request(&self) -> Option<Request> {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        if *cursor >= self.total() {
            return None;
        }
        let request = self.requests[*cursor % self.requests.len()].clone();
        *cursor += 1;
        Some(request)
    }

    fn stat(&self) -> Option<serde_json::Value> {
        Some(json!({
            "issued": self.issued(),
            "total": self.total(),
        }))
    }
}
