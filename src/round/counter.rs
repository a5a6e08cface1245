//! Counting of distinct contributions.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The outcome of counting a contribution.
pub enum CountOutcome {
    /// The contribution has been counted.
    Counted {
        /// The count including this contribution.
        count: u64,
        /// Whether this is the first contribution of the cycle.
        is_first: bool,
        /// Whether this contribution reached the threshold.
        is_last: bool,
    },
    /// The contributor has already been counted in this cycle.
    Duplicate,
    /// The threshold had already been reached, the contribution has not been counted.
    ThresholdReached,
}

#[derive(Debug, Clone)]
/// Counts the distinct contributors of a cycle up to a threshold.
pub struct RoundCounter {
    threshold: u64,
    contributors: HashSet<String>,
}

impl RoundCounter {
    /// Creates a counter which is reached after `threshold` distinct contributions.
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            contributors: HashSet::new(),
        }
    }

    /// Counts a contribution of the `contributor`.
    pub fn count(&mut self, contributor: impl Into<String>) -> CountOutcome {
        let contributor = contributor.into();
        if self.contributors.contains(&contributor) {
            return CountOutcome::Duplicate;
        }
        if self.is_reached() {
            return CountOutcome::ThresholdReached;
        }
        self.contributors.insert(contributor);
        let count = self.current();
        CountOutcome::Counted {
            count,
            is_first: count == 1,
            is_last: count == self.threshold,
        }
    }

    /// Checks whether the `contributor` has been counted in this cycle.
    pub fn contains(&self, contributor: &str) -> bool {
        self.contributors.contains(contributor)
    }

    /// Returns the number of distinct contributions of this cycle.
    pub fn current(&self) -> u64 {
        self.contributors.len() as u64
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Replaces the threshold. The contributions already counted are kept.
    pub fn set_threshold(&mut self, threshold: u64) {
        self.threshold = threshold;
    }

    /// Checks whether the threshold has been reached.
    pub fn is_reached(&self) -> bool {
        self.current() >= self.threshold
    }

    /// Forgets all the contributions, starting a new cycle.
    pub fn reset(&mut self) {
        self.contributors.clear();
    }
}
