//! Data-split ranges for multi-pass ingestion
//!
//! `AllVersions` numbers the versions of each key 1..n in the temp staging
//! table; every pass ingests one version band. Generated SQL carries
//! placeholders for the band's bounds that are substituted per pass.

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, IngestResult};
use crate::planner::{DATA_SPLIT_LOWER_BOUND_PLACEHOLDER, DATA_SPLIT_UPPER_BOUND_PLACEHOLDER};

/// Inclusive band of data-split values ingested in one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataSplitRange {
    pub lower_bound: i64,
    pub upper_bound: i64,
}

impl DataSplitRange {
    pub fn new(lower_bound: i64, upper_bound: i64) -> IngestResult<Self> {
        if lower_bound > upper_bound {
            return Err(IngestError::Configuration(format!(
                "Data split lower bound {} exceeds upper bound {}",
                lower_bound, upper_bound
            )));
        }
        Ok(Self {
            lower_bound,
            upper_bound,
        })
    }

    /// Band holding one data-split value
    pub fn single(value: i64) -> Self {
        Self {
            lower_bound: value,
            upper_bound: value,
        }
    }

    /// Replace the bound placeholders in `sql`
    pub fn apply(&self, sql: &str) -> String {
        sql.replace(
            DATA_SPLIT_LOWER_BOUND_PLACEHOLDER,
            &self.lower_bound.to_string(),
        )
        .replace(
            DATA_SPLIT_UPPER_BOUND_PLACEHOLDER,
            &self.upper_bound.to_string(),
        )
    }
}

impl std::fmt::Display for DataSplitRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.lower_bound, self.upper_bound)
    }
}

/// One pass per version up to `max_data_split`
///
/// An empty staging table still runs one pass so that snapshot modes see
/// the empty batch and the ledger records it.
pub fn ranges_up_to(max_data_split: i64) -> Vec<DataSplitRange> {
    if max_data_split < 1 {
        return vec![DataSplitRange::single(1)];
    }
    (1..=max_data_split).map(DataSplitRange::single).collect()
}

/// Check caller-supplied ranges: ascending and disjoint
pub fn validate_ranges(ranges: &[DataSplitRange]) -> IngestResult<()> {
    if ranges.is_empty() {
        return Err(IngestError::Configuration(
            "At least one data split range is required".to_string(),
        ));
    }
    for pair in ranges.windows(2) {
        if pair[1].lower_bound <= pair[0].upper_bound {
            return Err(IngestError::Configuration(format!(
                "Data split ranges {} and {} overlap or are out of order",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_substitutes_both_bounds() {
        let sql = format!(
            "WHERE (stage.\"data_split\" >= {}) AND (stage.\"data_split\" <= {})",
            DATA_SPLIT_LOWER_BOUND_PLACEHOLDER, DATA_SPLIT_UPPER_BOUND_PLACEHOLDER
        );
        assert_eq!(
            DataSplitRange::new(2, 4).unwrap().apply(&sql),
            "WHERE (stage.\"data_split\" >= 2) AND (stage.\"data_split\" <= 4)"
        );
    }

    #[test]
    fn test_ranges_up_to() {
        assert_eq!(
            ranges_up_to(3),
            vec![
                DataSplitRange::single(1),
                DataSplitRange::single(2),
                DataSplitRange::single(3)
            ]
        );
        assert_eq!(ranges_up_to(0), vec![DataSplitRange::single(1)]);
    }

    #[test]
    fn test_validate_ranges() {
        assert!(DataSplitRange::new(3, 1).is_err());
        assert!(validate_ranges(&[]).is_err());
        assert!(validate_ranges(&[DataSplitRange::single(1), DataSplitRange::new(2, 5).unwrap()]).is_ok());
        assert!(validate_ranges(&[DataSplitRange::new(1, 3).unwrap(), DataSplitRange::single(3)]).is_err());
    }
}
