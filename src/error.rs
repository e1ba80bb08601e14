use chrono::{DateTime, Utc};
use std::fmt;

/// Errors raised by the pipeline stages.
///
/// Each variant corresponds to one failure class; [`Error::kind`] returns the
/// short name used in logs and job status.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Missing or contradictory job settings. Fatal to the run.
    InvalidConfig(String),
    /// A value store is missing a field a callback depends on.
    InvalidState(String),
    /// Device id not present in the directory.
    InvalidDevice(String),
    /// Room id not present in the directory.
    InvalidRoom(String),
    /// The feeder cursor reached the end of its window.
    OutOfWindow,
    /// A page could not be narrowed enough to fit under the page cap.
    WindowTooDense {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        depth: usize,
    },
    /// An entity's persisted node is not part of the compiled graph.
    UnknownNode(String),
    /// A request against the event store or sink failed.
    Query(String),
    /// A checkpoint could not be read or written.
    Checkpoint(String),
}

impl Error {
    /// Short taxonomy name for the error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "invalid-config",
            Error::InvalidState(_) => "invalid-state",
            Error::InvalidDevice(_) => "invalid-device",
            Error::InvalidRoom(_) => "invalid-room",
            Error::OutOfWindow => "out-of-window",
            Error::WindowTooDense { .. } => "window-too-dense",
            Error::UnknownNode(_) => "unknown-node",
            Error::Query(_) => "query",
            Error::Checkpoint(_) => "checkpoint",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Error::InvalidDevice(id) => write!(f, "unknown device '{}'", id),
            Error::InvalidRoom(id) => write!(f, "unknown room '{}'", id),
            Error::OutOfWindow => write!(f, "out of time window"),
            Error::WindowTooDense { start, end, depth } => write!(
                f,
                "window {} - {} still overflows after {} splits",
                start.to_rfc3339(),
                end.to_rfc3339(),
                depth
            ),
            Error::UnknownNode(id) => write!(f, "unknown current node '{}'", id),
            Error::Query(msg) => write!(f, "query failed: {}", msg),
            Error::Checkpoint(msg) => write!(f, "checkpoint error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(Error::InvalidConfig("x".into()).kind(), "invalid-config");
        assert_eq!(Error::InvalidState("x".into()).kind(), "invalid-state");
        assert_eq!(Error::InvalidDevice("d".into()).kind(), "invalid-device");
        assert_eq!(Error::InvalidRoom("r".into()).kind(), "invalid-room");
        assert_eq!(Error::OutOfWindow.kind(), "out-of-window");
    }

    #[test]
    fn test_display_includes_identifier() {
        let err = Error::InvalidDevice("ITB-1101-D1".into());
        assert_eq!(err.to_string(), "unknown device 'ITB-1101-D1'");
    }
}
