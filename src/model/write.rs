//! Aggregated outcome of a write operation.

use crate::error::TidewireResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-call write summary returned by the engine and enriched by the model
/// layer. Row-level failures land in `errors`/`first_error` instead of
/// aborting the call; only connectivity and protocol faults raise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteReport {
    #[serde(default)]
    pub inserted: u64,
    #[serde(default)]
    pub replaced: u64,
    #[serde(default)]
    pub deleted: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl WriteReport {
    pub fn from_value(value: Value) -> TidewireResult<WriteReport> {
        Ok(serde_json::from_value(value)?)
    }

    /// Records one failed row.
    pub fn row_error(&mut self, message: impl Into<String>) {
        self.errors += 1;
        let message = message.into();
        if self.first_error.is_none() {
            self.first_error = Some(message);
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Folds another report into this one. Counts add up; the earliest
    /// first error wins.
    pub fn merge(&mut self, other: WriteReport) {
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.deleted += other.deleted;
        self.errors += other.errors;
        if self.first_error.is_none() {
            self.first_error = other.first_error;
        }
        self.generated_keys.extend(other.generated_keys);
        self.warnings.extend(other.warnings);
    }

    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_fields_default_to_zero() {
        let report = WriteReport::from_value(json!({"inserted": 2})).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.deleted, 0);
        assert!(report.first_error.is_none());
        assert!(report.is_clean());
    }

    #[test]
    fn test_merge_sums_counts_and_keeps_earliest_error() {
        let mut report = WriteReport::default();
        report.row_error("first");
        let mut engine = WriteReport::from_value(json!({
            "inserted": 3,
            "errors": 1,
            "first_error": "second",
            "generated_keys": ["k1"],
        }))
        .unwrap();
        engine.warn("slow write");
        report.merge(engine);
        assert_eq!(report.inserted, 3);
        assert_eq!(report.errors, 2);
        assert_eq!(report.first_error.as_deref(), Some("first"));
        assert_eq!(report.generated_keys, vec!["k1"]);
        assert_eq!(report.warnings, vec!["slow write"]);
    }
}
