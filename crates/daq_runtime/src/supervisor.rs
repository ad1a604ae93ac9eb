//! Respawn supervision with a restart ceiling and exponential backoff

use std::time::Duration;

/// Restart policy configuration
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Maximum number of respawns before giving up for good
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

/// Restart bookkeeping for one supervised process
#[derive(Debug, Clone)]
pub struct Supervisor {
    policy: RestartPolicy,
    restart_count: u32,
    current_backoff: Duration,
    exhausted: bool,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy) -> Self {
        let initial_backoff = policy.initial_backoff;
        Self {
            policy,
            restart_count: 0,
            current_backoff: initial_backoff,
            exhausted: false,
        }
    }

    /// Called when the process died. Returns the delay before respawning,
    /// or None once the ceiling is reached; after that every call returns
    /// None.
    pub fn on_crash(&mut self) -> Option<Duration> {
        if self.exhausted {
            return None;
        }
        if self.restart_count >= self.policy.max_restarts {
            self.exhausted = true;
            return None;
        }
        self.restart_count += 1;

        let delay = self.current_backoff;
        self.current_backoff = Duration::from_secs_f64(
            (self.current_backoff.as_secs_f64() * self.policy.backoff_multiplier)
                .min(self.policy.max_backoff.as_secs_f64()),
        );
        Some(delay)
    }

    /// Forget past crashes, e.g. when the process was deliberately recreated
    pub fn reset(&mut self) {
        self.restart_count = 0;
        self.current_backoff = self.policy.initial_backoff;
        self.exhausted = false;
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// True once a crash arrived with no restarts left
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_of_three_restarts() {
        let mut supervisor = Supervisor::new(RestartPolicy::default());

        assert_eq!(supervisor.on_crash(), Some(Duration::from_secs(1)));
        assert_eq!(supervisor.on_crash(), Some(Duration::from_secs(2)));
        assert_eq!(supervisor.on_crash(), Some(Duration::from_secs(4)));
        assert!(!supervisor.is_exhausted());

        assert_eq!(supervisor.on_crash(), None);
        assert!(supervisor.is_exhausted());
        assert_eq!(supervisor.restart_count(), 3);
        assert_eq!(supervisor.on_crash(), None);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut supervisor = Supervisor::new(RestartPolicy {
            max_restarts: 10,
            initial_backoff: Duration::from_secs(20),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        });
        assert_eq!(supervisor.on_crash(), Some(Duration::from_secs(20)));
        assert_eq!(supervisor.on_crash(), Some(Duration::from_secs(30)));
        assert_eq!(supervisor.on_crash(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_reset_restores_budget() {
        let mut supervisor = Supervisor::new(RestartPolicy::default());
        for _ in 0..4 {
            supervisor.on_crash();
        }
        assert!(supervisor.is_exhausted());

        supervisor.reset();
        assert!(!supervisor.is_exhausted());
        assert_eq!(supervisor.on_crash(), Some(Duration::from_secs(1)));
    }
}
