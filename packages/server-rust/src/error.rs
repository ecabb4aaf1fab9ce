//! Errors raised while building or running a server.

use std::io;

use taskwire_core::CoreError;

/// Failures that propagate out of server construction and accept calls.
///
/// Faults inside a running service loop are logged and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No connection arrived within the accept timeout. Expected while idle.
    #[error("timed out waiting for a connection")]
    AcceptTimeout,

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("a job factory or request processor must be configured")]
    MissingJobFactory,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn core_errors_convert_transparently() {
        let core = CoreError::PoolTooSmall {
            requested: 1,
            minimum: 2,
        };
        let err: ServerError = core.clone().into();
        assert!(matches!(err, ServerError::Core(_)));
        assert_eq!(err.to_string(), core.to_string());
    }

    #[test]
    fn io_errors_keep_their_message() {
        let err: ServerError = io::Error::new(io::ErrorKind::AddrInUse, "port taken").into();
        assert_eq!(err.to_string(), "I/O error: port taken");
    }

    #[test]
    fn loop_rate_error_is_reported_through_server_error() {
        let err = ServerError::from(CoreError::LoopRateTooLow {
            requested: Duration::from_millis(1),
            minimum: Duration::from_millis(16),
        });
        assert!(err.to_string().contains("loop rate"));
    }
}
