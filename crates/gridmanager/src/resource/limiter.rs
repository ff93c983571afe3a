use std::time::Duration;

use tokio::time::Instant;

pub const SUBMISSION_DELAYS: [Duration; 4] = [
    Duration::ZERO,
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterStatus {
    Ok,
    Wait,
}

/// Slows down submissions to a resource that keeps rejecting them.
#[derive(Debug)]
pub struct SubmitRateLimiter {
    delays: Vec<Duration>,
    /// Index into `delays`.
    current_delay: usize,
    last_attempt: Option<Instant>,
    /// How many submissions failed in a row.
    submission_fails: usize,
}

impl Default for SubmitRateLimiter {
    fn default() -> Self {
        Self::new(SUBMISSION_DELAYS.to_vec())
    }
}

impl SubmitRateLimiter {
    pub fn new(delays: Vec<Duration>) -> Self {
        assert!(!delays.is_empty());
        Self {
            delays,
            current_delay: 0,
            last_attempt: None,
            submission_fails: 0,
        }
    }

    pub fn on_submission_attempt(&mut self) {
        self.last_attempt = Some(Instant::now());
    }

    pub fn on_submission_success(&mut self) {
        self.submission_fails = 0;
        self.current_delay = 0;
    }

    pub fn on_submission_fail(&mut self) {
        self.submission_fails += 1;
        if self.current_delay < self.delays.len() - 1 {
            self.current_delay += 1;
        }
    }

    pub fn submission_fails(&self) -> usize {
        self.submission_fails
    }

    pub fn current_delay(&self) -> Duration {
        self.delays[self.current_delay]
    }

    pub fn status(&self) -> RateLimiterStatus {
        match self.last_attempt {
            Some(last) if last.elapsed() < self.current_delay() => RateLimiterStatus::Wait,
            _ => RateLimiterStatus::Ok,
        }
    }
}
