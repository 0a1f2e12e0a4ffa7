//! Protocol errors

use thiserror::Error;

/// Broad classification of a [`PumpError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Port could not be opened, or the pump did not answer at its address
    Connection,
    /// Absent, malformed or unrecognized response
    Protocol,
    /// Value rejected locally or by the firmware (`OOR`)
    Range,
}

/// Errors that can occur while talking to a pump
#[derive(Error, Debug)]
pub enum PumpError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Out of range: {0}")]
    Range(String),

    #[error("Response is not valid text: {0}")]
    Decode(String),

    #[error("Timed out waiting for the pump to halt")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PumpError {
    /// Map this error onto one of the three error kinds callers branch on
    pub fn kind(&self) -> ErrorKind {
        match self {
            PumpError::Connection(_) => ErrorKind::Connection,
            PumpError::Range(_) => ErrorKind::Range,
            PumpError::Protocol(_)
            | PumpError::Decode(_)
            | PumpError::Timeout
            | PumpError::Io(_) => ErrorKind::Protocol,
        }
    }
}

impl From<serialport::Error> for PumpError {
    fn from(e: serialport::Error) -> Self {
        PumpError::Connection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(PumpError::Connection("x".into()).kind(), ErrorKind::Connection);
        assert_eq!(PumpError::Range("x".into()).kind(), ErrorKind::Range);
        assert_eq!(PumpError::Decode("x".into()).kind(), ErrorKind::Protocol);
        assert_eq!(PumpError::Timeout.kind(), ErrorKind::Protocol);
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(PumpError::from(io).kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_display() {
        let err = PumpError::Protocol("no response to command".into());
        assert_eq!(err.to_string(), "Protocol error: no response to command");
    }
}
