//! Per-request attempt budget.
//!
//! A request may try each member of its route group at most once. The
//! budget defaults to the group size and can be lowered, never raised,
//! through [`RetryConfig::max_attempts`].

use tracing::debug;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Default)]
pub struct RetryConfig {
    /// Upper bound on attempts per request; `None` means the group size.
    pub max_attempts: Option<u32>,
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps attempts per request.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Creates the budget for one request against a group of `group_size`.
    pub fn budget(&self, group_size: usize) -> RetryBudget {
        let group_size = u32::try_from(group_size).unwrap_or(u32::MAX);
        let max_attempts = match self.max_attempts {
            Some(cap) => cap.clamp(1, group_size.max(1)),
            None => group_size.max(1),
        };
        RetryBudget::new(max_attempts)
    }
}

/// Tracks the attempts made for one client request.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_attempts: u32,
    tried: Vec<usize>,
}

impl RetryBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            tried: Vec::new(),
        }
    }

    /// Records an attempt against the endpoint with configuration `index`.
    pub fn record_attempt(&mut self, index: usize) {
        self.tried.push(index);
        debug!(
            attempt = self.tried.len(),
            max_attempts = self.max_attempts,
            endpoint = index,
            "recorded attempt"
        );
    }

    /// Number of attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.tried.len() as u32
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Endpoints already tried for this request.
    pub fn excluded(&self) -> &[usize] {
        &self.tried
    }

    pub fn has_remaining(&self) -> bool {
        self.attempts() < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_defaults_to_group_size() {
        let budget = RetryConfig::new().budget(3);
        assert_eq!(budget.max_attempts(), 3);
    }

    #[test]
    fn test_budget_cap_never_exceeds_group() {
        assert_eq!(
            RetryConfig::new().with_max_attempts(10).budget(2).max_attempts(),
            2
        );
        assert_eq!(
            RetryConfig::new().with_max_attempts(1).budget(4).max_attempts(),
            1
        );
        assert_eq!(
            RetryConfig::new().with_max_attempts(0).budget(4).max_attempts(),
            1
        );
    }

    #[test]
    fn test_budget_tracks_exclusions() {
        let mut budget = RetryConfig::new().budget(2);
        assert!(budget.has_remaining());
        assert!(budget.excluded().is_empty());

        budget.record_attempt(4);
        assert_eq!(budget.attempts(), 1);
        assert_eq!(budget.excluded(), &[4]);
        assert!(budget.has_remaining());

        budget.record_attempt(7);
        assert!(!budget.has_remaining());
        assert_eq!(budget.excluded(), &[4, 7]);
    }
}
