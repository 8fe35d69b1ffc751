use std::time::Duration;

/// Outcome of a single attempt under a [`RetryPolicy`].
pub enum Attempt<T, E> {
    Done(T),
    /// Transient failure; eligible for another attempt.
    Retry(E),
    /// Terminal failure; returned immediately without further attempts.
    Fatal(E),
}

/// Bounded retry with exponential backoff.
///
/// The same policy is applied to every external call boundary (notification
/// API, storage API). An operation is attempted at most `max_retries + 1`
/// times; the delay before attempt `n + 1` is `base_delay * 2^n`.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Run `op` until it succeeds, fails terminally, or retries are exhausted.
    /// The attempt index (0-based) is passed to `op` for logging.
    pub fn run<T, E>(&self, mut op: impl FnMut(u32) -> Attempt<T, E>) -> Result<T, E> {
        let mut attempt = 0u32;
        loop {
            match op(attempt) {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fatal(err) => return Err(err),
                Attempt::Retry(err) => {
                    if attempt >= self.max_retries {
                        return Err(err);
                    }
                    let delay = self.base_delay * 2u32.saturating_pow(attempt);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
