//! Row filters for derived and filtered staging datasets

use serde::{Deserialize, Serialize};

/// Comparison operator of a dataset filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "EQ",
            FilterOperator::Ne => "NE",
            FilterOperator::Gt => "GT",
            FilterOperator::Gte => "GTE",
            FilterOperator::Lt => "LT",
            FilterOperator::Lte => "LTE",
        }
    }
}

/// Literal compared against a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        FilterValue::Integer(v)
    }
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        FilterValue::String(v.to_string())
    }
}

impl FilterValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FilterValue::Boolean(b) => serde_json::Value::Bool(*b),
            FilterValue::Integer(i) => serde_json::Value::from(*i),
            FilterValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FilterValue::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// `field <op> value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetFilter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: FilterValue,
}

impl DatasetFilter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<FilterValue>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

/// Boolean combination of filters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    Leaf(DatasetFilter),
    And(Vec<FilterCondition>),
    Or(Vec<FilterCondition>),
}

impl FilterCondition {
    /// Every field referenced anywhere in the tree
    pub fn fields(&self) -> Vec<&str> {
        match self {
            FilterCondition::Leaf(f) => vec![f.field.as_str()],
            FilterCondition::And(children) | FilterCondition::Or(children) => {
                children.iter().flat_map(|c| c.fields()).collect()
            }
        }
    }
}

/// Ledger representation of a list of ANDed filters:
/// `{"field": {"GT": 1, "LTE": 5}}`
pub fn filters_to_json(filters: &[DatasetFilter]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for filter in filters {
        let entry = map
            .entry(filter.field.clone())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        if let serde_json::Value::Object(ops) = entry {
            ops.insert(filter.operator.as_str().to_string(), filter.value.to_json());
        }
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_to_json_groups_by_field() {
        let filters = vec![
            DatasetFilter::new("batch", FilterOperator::Gt, 5),
            DatasetFilter::new("batch", FilterOperator::Lte, 10),
            DatasetFilter::new("region", FilterOperator::Eq, "EU"),
        ];
        let json = filters_to_json(&filters);
        assert_eq!(json["batch"]["GT"], 5);
        assert_eq!(json["batch"]["LTE"], 10);
        assert_eq!(json["region"]["EQ"], "EU");
    }

    #[test]
    fn test_condition_fields() {
        let cond = FilterCondition::Or(vec![
            FilterCondition::Leaf(DatasetFilter::new("a", FilterOperator::Eq, 1)),
            FilterCondition::And(vec![FilterCondition::Leaf(DatasetFilter::new(
                "b",
                FilterOperator::Ne,
                "x",
            ))]),
        ]);
        assert_eq!(cond.fields(), vec!["a", "b"]);
    }
}
