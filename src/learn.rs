//! Advisory type hints gathered from what scripts actually do.
//!
//! Nothing here changes an evaluation result; it only feeds debug logging.

use dashmap::DashMap;
use indexmap::IndexMap;

/// Observed result types for an operation and the argument types it saw.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypePrediction {
    counts: IndexMap<String, u64>,
}

impl TypePrediction {
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn count(&self, type_name: &str) -> u64 {
        self.counts.get(type_name).copied().unwrap_or(0)
    }

    /// Share of observations that produced `type_name`, 0 when unseen.
    pub fn probability(&self, type_name: &str) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.count(type_name) as f64 / total as f64,
        }
    }

    /// The most frequently observed type; earlier observations win ties.
    pub fn probable_type(&self) -> Option<&str> {
        let mut best: Option<(&str, u64)> = None;
        for (name, &count) in &self.counts {
            if best.is_none_or(|(_, top)| count > top) {
                best = Some((name, count));
            }
        }
        best.map(|(name, _)| name)
    }
}

pub trait TypeLearner: Send + Sync {
    fn learn(&self, operation: &str, arg_types: &[&str], result_type: &str);

    fn predict(&self, operation: &str, arg_types: &[&str]) -> TypePrediction;
}

/// In-memory learner keyed by operation and argument types.
#[derive(Default)]
pub struct CountingTypeLearner {
    observations: DashMap<String, TypePrediction>,
}

impl CountingTypeLearner {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(operation: &str, arg_types: &[&str]) -> String {
        format!("{operation}({})", arg_types.join(","))
    }
}

impl TypeLearner for CountingTypeLearner {
    fn learn(&self, operation: &str, arg_types: &[&str], result_type: &str) {
        let mut entry = self
            .observations
            .entry(Self::key(operation, arg_types))
            .or_default();
        *entry.counts.entry(result_type.to_string()).or_insert(0) += 1;
    }

    fn predict(&self, operation: &str, arg_types: &[&str]) -> TypePrediction {
        self.observations
            .get(&Self::key(operation, arg_types))
            .map(|prediction| prediction.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicts_the_most_common_type() {
        let learner = CountingTypeLearner::new();
        learner.learn("plus", &["Integer", "Integer"], "Integer");
        learner.learn("plus", &["Integer", "Integer"], "Integer");
        learner.learn("plus", &["Integer", "Integer"], "Decimal");
        let prediction = learner.predict("plus", &["Integer", "Integer"]);
        assert_eq!(prediction.probable_type(), Some("Integer"));
        assert_eq!(prediction.total(), 3);
        assert!((prediction.probability("Decimal") - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_operations_have_no_prediction() {
        let learner = CountingTypeLearner::new();
        let prediction = learner.predict("minus", &[]);
        assert_eq!(prediction.probable_type(), None);
        assert_eq!(prediction.probability("Integer"), 0.0);
    }
}
