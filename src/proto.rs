//! Reply framing for stream transports.
use typed_builder::TypedBuilder;

use crate::Severity;

/// Status reported for a reply that carries no status of its own.
pub const GENERIC_SUCCESS: u32 = 200;

/// What a [`Proto`] concluded from the bytes buffered so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A whole reply was present and the cursor moved past it.
    Complete { res_code: u32, severity: Severity },
    /// The buffer holds a prefix of a reply; nothing was consumed.
    NeedMore,
    /// The bytes cannot be a valid reply.
    Failed,
}

/// Reply parser for framed or pipelined stream transports.
///
/// `reply_parse` is a pure decision over `buf`, the bytes received so far:
///
/// - if a complete reply is present it advances `buf` by exactly the reply's
///   length and reports `Complete`;
/// - if more bytes are needed it returns `NeedMore` and leaves `buf` as is;
/// - otherwise `Failed`.
///
/// The same bytes must always produce the same answer.
pub trait Proto: Send + Sync {
    fn reply_parse(&self, buf: &mut &[u8], request: &[u8]) -> ParseStatus;

    fn stat(&self) -> Option<serde_json::Value> {
        None
    }
}

/// Largest body [`LengthPrefixed`] accepts unless configured otherwise.
pub const DEFAULT_MAX_LENGTH: u32 = 16 * 1024 * 1024;

/// Replies framed as a 4-byte length followed by that many body bytes.
///
/// The body is not interpreted; every complete frame is reported as
/// [`GENERIC_SUCCESS`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct LengthPrefixed {
    /// Byte order of the length field.
    #[builder(default = true)]
    pub big_endian: bool,
    /// Frames announcing a longer body are rejected as malformed. `None`
    /// lifts the cap, letting a peer make the read buffer grow up to 4 GiB.
    #[builder(default = Some(DEFAULT_MAX_LENGTH), setter(into))]
    pub max_length: Option<u32>,
}

impl Default for LengthPrefixed {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl LengthPrefixed {
    const HEADER: usize = 4;

    fn body_len(&self, header: [u8; 4]) -> u32 {
        if self.big_endian {
            u32::from_be_bytes(header)
        } else {
            u32::from_le_bytes(header)
        }
    }
}

impl Proto for LengthPrefixed {
    fn reply_parse(&self, buf: &mut &[u8], _request: &[u8]) -> ParseStatus {
        let Some(&[a, b, c, d]) = buf.get(..Self::HEADER) else {
            return ParseStatus::NeedMore;
        };
        let len = self.body_len([a, b, c, d]);
        if self.max_length.is_some_and(|max| len > max) {
            return ParseStatus::Failed;
        }

        let Some(frame) = Self::HEADER.checked_add(len as usize) else {
            return ParseStatus::Failed;
        };
        if buf.len() < frame {
            return ParseStatus::NeedMore;
        }

        *buf = &buf[frame..];
        ParseStatus::Complete {
            res_code: GENERIC_SUCCESS,
            severity: Severity::Ok,
        }
    }
}
