//! Errors returned by the daisy-chain driver.
//!
//! Input validation failures come from [`crate::protocol::Error`] and are raised
//! before the bus is touched. A PEC mismatch on its own is not an error: the
//! register access layer reports it per device and only the [`crate::monitor::Monitor`]
//! turns it into [`Error::PecRetriesExhausted`] once its retry policy gives up.
use crate::protocol as proto;

/// Represents all possible errors of a daisy-chain operation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps `proto::Error`.
    #[error(transparent)]
    Protocol(#[from] proto::Error),

    /// The underlying bus failed; the transport's own error is kept as source.
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Every read attempt returned at least one block with a bad PEC.
    #[error("PEC mismatch after {attempts} read attempts on device(s) {devices:?}")]
    PecRetriesExhausted { attempts: u32, devices: Vec<usize> },
}

impl Error {
    pub(crate) fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Transport(Box::new(err))
    }
}

/// The result type for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn protocol_errors_convert() {
        let err: Error = proto::Error::DeviceCountOutOfRange(0).into();
        assert_matches!(err, Error::Protocol(proto::Error::DeviceCountOutOfRange(0)));
    }

    #[test]
    fn transport_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "bus stuck");
        let err = Error::transport(io);
        assert_eq!(err.to_string(), "Transport error: bus stuck");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn exhausted_message_lists_devices() {
        let err = Error::PecRetriesExhausted {
            attempts: 5,
            devices: vec![1, 3],
        };
        assert_eq!(
            err.to_string(),
            "PEC mismatch after 5 read attempts on device(s) [1, 3]"
        );
    }
}
