use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::topology::Rank;

/// The metrics blob produced by one trainer or server at the end of its run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub rank: Rank,
    pub payload: Value,
}

impl MetricsRecord {
    pub fn new(rank: Rank, payload: Value) -> Self {
        Self { rank, payload }
    }
}

/// An ordered, labelled list of metrics records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub label: String,
    pub records: Vec<MetricsRecord>,
}

impl Report {
    /// The payload reported by `rank`, if any.
    pub fn get(&self, rank: Rank) -> Option<&Value> {
        self.records
            .iter()
            .find(|record| record.rank == rank)
            .map(|record| &record.payload)
    }

    pub fn ranks(&self) -> Vec<Rank> {
        self.records.iter().map(|record| record.rank).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Both reports of a finished benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub trainers: Report,
    pub servers: Report,
}

/// Bundles `records` under `label`, keeping them in collection order.
pub fn aggregate(records: &[MetricsRecord], label: &str) -> Report {
    Report {
        label: label.to_string(),
        records: records.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn aggregate_is_lossless_and_ordered() {
        let records = vec![
            MetricsRecord::new(5, json!({ "updates": 2 })),
            MetricsRecord::new(4, json!({ "updates": 1 })),
        ];

        let report = aggregate(&records, "parameter server");
        assert_eq!(report.label, "parameter server");
        assert_eq!(report.ranks(), [5, 4]);
        assert_eq!(report.get(4), Some(&json!({ "updates": 1 })));
        assert_eq!(report.get(0), None);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn empty_report() {
        let report = aggregate(&[], "trainer");
        assert!(report.is_empty());
        assert_eq!(report.len(), 0);
    }
}
