//! Configuration for the session manager

use std::time::Duration;

/// Backoff schedule applied while a database file is locked/busy during
/// connection open.
///
/// The contract is bounded-retry-then-fail: most attempts sleep for
/// `short_delay`, every `long_every`-th attempt sleeps for `long_delay`, and
/// once `max_attempts` attempts have failed the open error is surfaced to the
/// caller. The defaults bound worst-case open latency to low tens of seconds.
///
/// # Examples
///
/// ```
/// use sqlite_session_mgr::RetryPolicy;
/// use std::time::Duration;
///
/// // Use defaults
/// let policy = RetryPolicy::default();
///
/// // Override just one field
/// let policy = RetryPolicy {
///     max_attempts: 20,
///     ..Default::default()
/// };
/// assert!(policy.delay_for(1) < Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
   /// Number of open attempts before giving up.
   ///
   /// Default: 200
   pub max_attempts: u32,

   /// Sleep applied after most failed attempts.
   ///
   /// Default: 50 ms
   pub short_delay: Duration,

   /// Longer sleep applied every `long_every`-th attempt.
   ///
   /// Default: 200 ms
   pub long_delay: Duration,

   /// How often the long delay applies.
   ///
   /// Default: every 10th attempt
   pub long_every: u32,
}

impl Default for RetryPolicy {
   fn default() -> Self {
      Self {
         max_attempts: 200,
         short_delay: Duration::from_millis(50),
         long_delay: Duration::from_millis(200),
         long_every: 10,
      }
   }
}

impl RetryPolicy {
   /// The sleep to apply after the given 1-based failed attempt.
   pub fn delay_for(&self, attempt: u32) -> Duration {
      if self.long_every > 0 && attempt % self.long_every == 0 {
         self.long_delay
      } else {
         self.short_delay
      }
   }
}

/// Configuration for a [`crate::ConnectionFactory`].
#[derive(Debug, Clone, Default)]
pub struct SessionManagerConfig {
   /// Backoff schedule for busy/locked failures during connection open.
   pub retry: RetryPolicy,
}
