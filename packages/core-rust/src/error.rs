//! Configuration errors raised by services and worker pools.

use std::time::Duration;

/// Errors reported when a service or pool is configured with invalid values.
///
/// These are never clamped silently: the offending call fails and the
/// previous configuration stays in effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("loop rate {requested:?} is lower than the minimum loop rate {minimum:?}")]
    LoopRateTooLow {
        requested: Duration,
        minimum: Duration,
    },
    #[error("worker pool size {requested} does not meet the minimum size {minimum}")]
    PoolTooSmall { requested: usize, minimum: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_rate_message_names_both_values() {
        let err = CoreError::LoopRateTooLow {
            requested: Duration::from_millis(1),
            minimum: Duration::from_millis(16),
        };
        let msg = err.to_string();
        assert!(msg.contains("1ms"));
        assert!(msg.contains("16ms"));
    }

    #[test]
    fn pool_size_message_names_both_values() {
        let err = CoreError::PoolTooSmall {
            requested: 1,
            minimum: 2,
        };
        assert_eq!(
            err.to_string(),
            "worker pool size 1 does not meet the minimum size 2"
        );
    }
}
