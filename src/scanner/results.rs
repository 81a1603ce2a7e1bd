use crate::address::AddressKey;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Measurements of one target that answered at least once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetResult {
    pub target: AddressKey,
    pub attempts: u32,
    pub successes: u32,
    /// Mean over the successful attempts only.
    pub average_delay: Duration,
    pub location: Option<String>,
}

impl TargetResult {
    /// Share of attempts that failed.
    pub fn loss_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        1.0 - f64::from(self.successes) / f64::from(self.attempts)
    }
}

/// Collects results from concurrent workers.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    results: Mutex<Vec<TargetResult>>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, result: TargetResult) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);
    }

    pub fn len(&self) -> usize {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stable sort by ascending average delay: equal delays keep their
    /// append order.
    pub fn finalize(self) -> ResultSet {
        let results = self
            .results
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        ResultSet::sorted(results)
    }

    /// Same as [`finalize`](Self::finalize) for an aggregator that is still shared.
    pub(crate) fn snapshot(&self) -> ResultSet {
        let results = self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        ResultSet::sorted(results)
    }
}

/// Reachable targets ordered by non-decreasing average delay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet(Vec<TargetResult>);

impl ResultSet {
    fn sorted(mut results: Vec<TargetResult>) -> Self {
        results.sort_by_key(|result| result.average_delay);
        Self(results)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TargetResult> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[TargetResult] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<TargetResult> {
        self.0
    }

    /// Keeps the results accepted by `filter`, in order.
    #[must_use]
    pub fn filter(&self, filter: &ResultFilter) -> Self {
        Self(
            self.0
                .iter()
                .filter(|result| filter.accepts(result))
                .cloned()
                .collect(),
        )
    }
}

impl IntoIterator for ResultSet {
    type Item = TargetResult;
    type IntoIter = std::vec::IntoIter<TargetResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a TargetResult;
    type IntoIter = std::slice::Iter<'a, TargetResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Bounds applied to a finalized [`ResultSet`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultFilter {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_loss_rate: f64,
}

impl Default for ResultFilter {
    fn default() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::MAX,
            max_loss_rate: 1.0,
        }
    }
}

impl ResultFilter {
    pub fn accepts(&self, result: &TargetResult) -> bool {
        result.average_delay >= self.min_delay
            && result.average_delay <= self.max_delay
            && result.loss_rate() <= self.max_loss_rate
    }
}
