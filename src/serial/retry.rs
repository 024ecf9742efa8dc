use std::time::Duration;

/// Fixed-count retry schedule with a constant delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Identity, frequency, lock and power queries
    pub const STANDARD: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(100));
    /// Temperature readings are slower and sometimes spurious
    pub const TEMPERATURE: RetryPolicy = RetryPolicy::new(5, Duration::from_millis(250));

    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Position of the current try within a [`RetryPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Zero-based
    pub index: u32,
    pub total: u32,
}

impl Attempt {
    pub fn is_last(&self) -> bool {
        self.index + 1 >= self.total
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `sleep` is called with the policy delay between failed attempts (not after
/// the last one). The error of the final attempt is returned; earlier errors
/// are only logged.
pub fn retry<T, E, S, F>(policy: &RetryPolicy, mut sleep: S, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    S: FnMut(Duration),
    F: FnMut(Attempt) -> Result<T, E>,
{
    let total = policy.attempts.max(1);
    let mut index = 0;
    loop {
        let attempt = Attempt { index, total };
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if attempt.is_last() => return Err(e),
            Err(e) => {
                log::debug!("Attempt {}/{} failed: {}", index + 1, total, e);
                sleep(policy.delay);
                index += 1;
            }
        }
    }
}
