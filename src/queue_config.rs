//! Default sizing and timing for the ingest queue and the batching loop
//!
//! These are the values the configuration falls back to when a key is not
//! set. Keeping them together makes it easy to see how the queue, the batch
//! window and the retry pause relate to each other.

use std::time::Duration;

/// Records per sink call
/// At a busy receiver (~1,000 msg/s) this is one call every ~100ms
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Longest the dispatcher waits to fill a batch before sending what it has
pub const DEFAULT_BATCH_MAX_WAIT: Duration = Duration::from_secs(1);

/// Pause after a failed sink call before the next attempt
/// Keeps a dead sink from being hammered in a tight loop
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// How long `stop()` waits for each loop before interrupting it
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Depth at which a bounded queue starts warning (80% of capacity)
///
/// # Examples
///
/// ```
/// use adsb_bridge::queue_config::queue_warning_threshold;
///
/// assert_eq!(queue_warning_threshold(100), 80);
/// assert_eq!(queue_warning_threshold(1000), 800);
/// ```
pub const fn queue_warning_threshold(size: usize) -> usize {
    match size.checked_mul(80) {
        Some(scaled) => scaled / 100,
        None => size / 5 * 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_warning_threshold() {
        assert_eq!(queue_warning_threshold(100), 80);
        assert_eq!(queue_warning_threshold(1_000), 800);
        assert_eq!(queue_warning_threshold(10_000), 8_000);
        assert_eq!(queue_warning_threshold(50_000), 40_000);
        assert_eq!(queue_warning_threshold(7), 5);
    }

    #[test]
    fn test_queue_warning_threshold_huge_capacity() {
        let threshold = queue_warning_threshold(usize::MAX);
        assert!(threshold < usize::MAX);
        assert_eq!(threshold, usize::MAX / 5 * 4);
    }

    #[test]
    fn test_batch_window_fits_inside_shutdown_timeout() {
        assert!(DEFAULT_BATCH_MAX_WAIT < DEFAULT_SHUTDOWN_TIMEOUT);
        assert!(DEFAULT_FAILURE_BACKOFF < DEFAULT_SHUTDOWN_TIMEOUT);
    }
}
