use serde::{Deserialize, Serialize};
use std::fmt;

/// How bad an attempt went.
///
/// Severities are totally ordered: a logger with threshold `level` receives
/// every result whose severity is `>= level`. `Ok` is the lowest, so a logger
/// at `Ok` sees everything.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Ok,
    ProtoWarning,
    NetworkWarning,
    ProtoError,
    NetworkError,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Ok,
        Severity::ProtoWarning,
        Severity::NetworkWarning,
        Severity::ProtoError,
        Severity::NetworkError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Ok => "ok",
            Severity::ProtoWarning => "proto_warning",
            Severity::NetworkWarning => "network_warning",
            Severity::ProtoError => "proto_error",
            Severity::NetworkError => "network_error",
        }
    }

    /// Position in [`Severity::ALL`], used to index per-severity counters.
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_from_ok_to_network_error() {
        for pair in Severity::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(Severity::default(), Severity::Ok);
    }

    #[test]
    fn index_matches_position() {
        for (i, s) in Severity::ALL.iter().enumerate() {
            assert_eq!(s.index(), i);
        }
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&Severity::NetworkError).unwrap();
        assert_eq!(json, "\"network_error\"");
    }
}
