//! Run-wide failure threshold.

use super::DriverError;

/// Counts failing results across the whole run. No threshold means
/// unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureCounter {
    count: u32,
    threshold: Option<u32>,
}

impl FailureCounter {
    /// A threshold of zero means unlimited.
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold: (threshold > 0).then_some(threshold),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn record(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn exceeded(&self) -> bool {
        matches!(self.threshold, Some(threshold) if self.count >= threshold)
    }

    pub fn check(&self) -> Result<(), DriverError> {
        match self.threshold {
            Some(threshold) if self.count >= threshold => Err(DriverError::TooManyFailures {
                count: self.count,
                threshold,
            }),
            _ => Ok(()),
        }
    }
}
