//! Restart policy for supervised children.
//!
//! A crashed child may be restarted with an exponentially growing delay, at
//! most `max_restarts` times within the rolling window. Past that the
//! supervisor gives up and stops the whole service, so an external process
//! manager can take over.

use std::time::{Duration, Instant};

/// Restart policy parameters.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Maximum restarts within the window.
    pub max_restarts: u32,
    /// Rolling window the restarts are counted in.
    pub window: Duration,
    /// Delay before the first restart; doubles per attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(120),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Tracks restarts of one child against a policy.
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    history: Vec<Instant>,
}

impl RestartTracker {
    /// A tracker with no restarts on record.
    #[must_use]
    pub const fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            history: Vec::new(),
        }
    }

    /// Record a crash and decide on a restart.
    ///
    /// Returns the delay to wait before restarting, or `None` when the
    /// budget within the window is exhausted.
    pub fn next_restart(&mut self, now: Instant) -> Option<Duration> {
        self.history
            .retain(|at| now.duration_since(*at) < self.policy.window);

        let attempt = u32::try_from(self.history.len()).unwrap_or(u32::MAX);
        if attempt >= self.policy.max_restarts {
            return None;
        }

        self.history.push(now);

        let delay = self
            .policy
            .initial_delay
            .saturating_mul(1_u32 << attempt.min(16));
        Some(delay.min(self.policy.max_delay))
    }

    /// Restarts currently on record within the window.
    #[must_use]
    pub fn restart_count(&self) -> usize {
        self.history.len()
    }
}
