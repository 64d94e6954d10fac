//! Processing-time and business-time milestoning descriptors

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, IngestResult};
use crate::models::{DataType, Field};

/// Batch id of an open row
pub const INFINITE_BATCH_ID: i64 = 999_999_999;

/// Default upper bound of an open time interval
pub const DEFAULT_INFINITY_DATE: &str = "9999-12-31 23:59:59";

/// Processing-time boundaries written by temporal modes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionMilestoning {
    BatchId {
        batch_id_in: String,
        batch_id_out: String,
    },
    BatchIdAndDateTime {
        batch_id_in: String,
        batch_id_out: String,
        date_time_in: String,
        date_time_out: String,
    },
    DateTime {
        date_time_in: String,
        date_time_out: String,
    },
}

impl TransactionMilestoning {
    pub fn batch_id(in_field: impl Into<String>, out_field: impl Into<String>) -> Self {
        TransactionMilestoning::BatchId {
            batch_id_in: in_field.into(),
            batch_id_out: out_field.into(),
        }
    }

    pub fn batch_id_and_date_time(
        batch_id_in: impl Into<String>,
        batch_id_out: impl Into<String>,
        date_time_in: impl Into<String>,
        date_time_out: impl Into<String>,
    ) -> Self {
        TransactionMilestoning::BatchIdAndDateTime {
            batch_id_in: batch_id_in.into(),
            batch_id_out: batch_id_out.into(),
            date_time_in: date_time_in.into(),
            date_time_out: date_time_out.into(),
        }
    }

    pub fn date_time(in_field: impl Into<String>, out_field: impl Into<String>) -> Self {
        TransactionMilestoning::DateTime {
            date_time_in: in_field.into(),
            date_time_out: out_field.into(),
        }
    }

    /// `(in, out)` batch id columns
    pub fn batch_id_fields(&self) -> Option<(&str, &str)> {
        match self {
            TransactionMilestoning::BatchId {
                batch_id_in,
                batch_id_out,
            }
            | TransactionMilestoning::BatchIdAndDateTime {
                batch_id_in,
                batch_id_out,
                ..
            } => Some((batch_id_in, batch_id_out)),
            TransactionMilestoning::DateTime { .. } => None,
        }
    }

    /// `(in, out)` timestamp columns
    pub fn date_time_fields(&self) -> Option<(&str, &str)> {
        match self {
            TransactionMilestoning::BatchId { .. } => None,
            TransactionMilestoning::BatchIdAndDateTime {
                date_time_in,
                date_time_out,
                ..
            }
            | TransactionMilestoning::DateTime {
                date_time_in,
                date_time_out,
            } => Some((date_time_in, date_time_out)),
        }
    }

    /// Column whose value opens a row; part of the main primary key
    pub fn in_field(&self) -> &str {
        match self.batch_id_fields() {
            Some((batch_in, _)) => batch_in,
            None => self.date_time_fields().map(|(t, _)| t).unwrap_or_default(),
        }
    }

    /// Main columns owned by the milestoning
    pub fn fields(&self) -> Vec<Field> {
        let mut fields = Vec::new();
        if let Some((batch_in, batch_out)) = self.batch_id_fields() {
            fields.push(Field::new(batch_in, DataType::Int).primary_key());
            fields.push(Field::new(batch_out, DataType::Int));
        }
        if let Some((time_in, time_out)) = self.date_time_fields() {
            let field = Field::new(time_in, DataType::DateTime);
            fields.push(if self.batch_id_fields().is_none() {
                field.primary_key()
            } else {
                field
            });
            fields.push(Field::new(time_out, DataType::DateTime));
        }
        fields
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields().into_iter().map(|f| f.name).collect()
    }

    pub fn map_names(&self, convert: &impl Fn(&str) -> String) -> Self {
        match self {
            TransactionMilestoning::BatchId {
                batch_id_in,
                batch_id_out,
            } => TransactionMilestoning::BatchId {
                batch_id_in: convert(batch_id_in),
                batch_id_out: convert(batch_id_out),
            },
            TransactionMilestoning::BatchIdAndDateTime {
                batch_id_in,
                batch_id_out,
                date_time_in,
                date_time_out,
            } => TransactionMilestoning::BatchIdAndDateTime {
                batch_id_in: convert(batch_id_in),
                batch_id_out: convert(batch_id_out),
                date_time_in: convert(date_time_in),
                date_time_out: convert(date_time_out),
            },
            TransactionMilestoning::DateTime {
                date_time_in,
                date_time_out,
            } => TransactionMilestoning::DateTime {
                date_time_in: convert(date_time_in),
                date_time_out: convert(date_time_out),
            },
        }
    }
}

/// Where the business-time interval of a staged row comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidityDerivation {
    /// A single start (or snapshot date) column; the end is derived
    FromOnly { source_from: String },
    /// Explicit start and end columns
    FromAndThrough {
        source_from: String,
        source_through: String,
        #[serde(default = "default_true")]
        from_inclusive: bool,
        #[serde(default)]
        through_inclusive: bool,
    },
}

fn default_true() -> bool {
    true
}

fn default_infinity_date() -> String {
    DEFAULT_INFINITY_DATE.to_string()
}

/// Business-time dimension of a bitemporal main table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityMilestoning {
    /// Main column holding the interval start
    pub from_field: String,
    /// Main column holding the interval end
    pub through_field: String,
    pub derivation: ValidityDerivation,
    /// Sentinel end of an open interval
    #[serde(default = "default_infinity_date")]
    pub infinity_date: String,
}

impl ValidityMilestoning {
    /// Interval start taken from `source_from`, end derived
    pub fn from_only(
        from_field: impl Into<String>,
        through_field: impl Into<String>,
        source_from: impl Into<String>,
    ) -> Self {
        Self {
            from_field: from_field.into(),
            through_field: through_field.into(),
            derivation: ValidityDerivation::FromOnly {
                source_from: source_from.into(),
            },
            infinity_date: default_infinity_date(),
        }
    }

    /// Interval `[source_from, source_through)` taken from staging
    pub fn from_and_through(
        from_field: impl Into<String>,
        through_field: impl Into<String>,
        source_from: impl Into<String>,
        source_through: impl Into<String>,
    ) -> Self {
        Self {
            from_field: from_field.into(),
            through_field: through_field.into(),
            derivation: ValidityDerivation::FromAndThrough {
                source_from: source_from.into(),
                source_through: source_through.into(),
                from_inclusive: true,
                through_inclusive: false,
            },
            infinity_date: default_infinity_date(),
        }
    }

    /// Set boundary inclusivity (from-and-through only)
    pub fn with_inclusivity(mut self, from: bool, through: bool) -> Self {
        if let ValidityDerivation::FromAndThrough {
            from_inclusive,
            through_inclusive,
            ..
        } = &mut self.derivation
        {
            *from_inclusive = from;
            *through_inclusive = through;
        }
        self
    }

    pub fn with_infinity_date(mut self, infinity_date: impl Into<String>) -> Self {
        self.infinity_date = infinity_date.into();
        self
    }

    pub fn source_from(&self) -> &str {
        match &self.derivation {
            ValidityDerivation::FromOnly { source_from }
            | ValidityDerivation::FromAndThrough { source_from, .. } => source_from,
        }
    }

    pub fn source_through(&self) -> Option<&str> {
        match &self.derivation {
            ValidityDerivation::FromOnly { .. } => None,
            ValidityDerivation::FromAndThrough { source_through, .. } => Some(source_through),
        }
    }

    pub fn is_from_only(&self) -> bool {
        matches!(self.derivation, ValidityDerivation::FromOnly { .. })
    }

    /// Staging columns consumed by the derivation
    pub fn source_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.source_from()];
        fields.extend(self.source_through());
        fields
    }

    /// Main columns owned by the dimension
    pub fn fields(&self) -> Vec<Field> {
        vec![
            Field::new(&self.from_field, DataType::DateTime).primary_key(),
            Field::new(&self.through_field, DataType::DateTime),
        ]
    }

    pub fn validate(&self) -> IngestResult<()> {
        // intervals are cut and joined at shared boundaries, so exactly one end may be inclusive
        if let ValidityDerivation::FromAndThrough {
            from_inclusive,
            through_inclusive,
            ..
        } = self.derivation
            && from_inclusive == through_inclusive
        {
            let kind = if from_inclusive { "inclusive" } else { "exclusive" };
            return Err(IngestError::Configuration(format!(
                "Validity intervals {} at both ends cannot be split at a shared boundary; \
                 use [from, through) or (from, through]",
                kind
            )));
        }
        if self.from_field == self.through_field {
            return Err(IngestError::Configuration(format!(
                "Validity from and through fields must differ, both are '{}'",
                self.from_field
            )));
        }
        Ok(())
    }

    pub fn map_names(&self, convert: &impl Fn(&str) -> String) -> Self {
        let derivation = match &self.derivation {
            ValidityDerivation::FromOnly { source_from } => ValidityDerivation::FromOnly {
                source_from: convert(source_from),
            },
            ValidityDerivation::FromAndThrough {
                source_from,
                source_through,
                from_inclusive,
                through_inclusive,
            } => ValidityDerivation::FromAndThrough {
                source_from: convert(source_from),
                source_through: convert(source_through),
                from_inclusive: *from_inclusive,
                through_inclusive: *through_inclusive,
            },
        };
        Self {
            from_field: convert(&self.from_field),
            through_field: convert(&self.through_field),
            derivation,
            infinity_date: self.infinity_date.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_fields() {
        let tm = TransactionMilestoning::batch_id_and_date_time(
            "batch_in", "batch_out", "time_in", "time_out",
        );
        let names = tm.field_names();
        assert_eq!(names, vec!["batch_in", "batch_out", "time_in", "time_out"]);
        assert_eq!(tm.in_field(), "batch_in");
        let fields = tm.fields();
        assert!(fields[0].primary_key);
        assert!(!fields[2].primary_key);

        let tm = TransactionMilestoning::date_time("t_in", "t_out");
        assert_eq!(tm.in_field(), "t_in");
        assert!(tm.fields()[0].primary_key);
        assert!(tm.batch_id_fields().is_none());
    }

    #[test]
    fn test_closed_interval_rejected() {
        let validity = ValidityMilestoning::from_and_through("from_z", "thru_z", "start", "end")
            .with_inclusivity(true, true);
        assert!(matches!(
            validity.validate(),
            Err(IngestError::Configuration(_))
        ));

        let validity = validity.with_inclusivity(true, false);
        assert!(validity.validate().is_ok());
        assert_eq!(validity.source_fields(), vec!["start", "end"]);
    }

    #[test]
    fn test_open_interval_rejected() {
        let validity = ValidityMilestoning::from_and_through("from_z", "thru_z", "start", "end")
            .with_inclusivity(false, false);
        let err = validity.validate().unwrap_err();
        assert!(err.to_string().contains("exclusive at both ends"));

        // half-open the other way round splits at the same boundaries
        assert!(validity.with_inclusivity(false, true).validate().is_ok());
    }

    #[test]
    fn test_from_only_defaults() {
        let validity = ValidityMilestoning::from_only("from_z", "thru_z", "snapshot_date");
        assert!(validity.is_from_only());
        assert_eq!(validity.infinity_date, DEFAULT_INFINITY_DATE);
        assert!(validity.source_through().is_none());
    }
}
