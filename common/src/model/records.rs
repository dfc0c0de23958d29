use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::amount::Amount;

/// Raw ingested cost for one (node, date, dimension). Dimensions are
/// free-form strings such as "compute_hours" or "storage_gb_month".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyCost {
    pub node_id: Uuid,
    pub cost_date: NaiveDate,
    pub dimension: String,
    pub amount: Amount,
    pub currency: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Raw ingested usage for one (node, date, metric). Labels enable segment
/// filtering in the allocation strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyUsage {
    pub node_id: Uuid,
    pub usage_date: NaiveDate,
    pub metric: String,
    pub value: Amount,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub labels: IndexMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelOperator {
    Eq,
    In,
    Exists,
}

/// Predicate over a usage row's labels map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelFilter {
    pub label: String,
    pub operator: LabelOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelFilter {
    pub fn matches(&self, labels: &IndexMap<String, String>) -> bool {
        match self.operator {
            LabelOperator::Exists => labels.contains_key(&self.label),
            LabelOperator::Eq => labels
                .get(&self.label)
                .is_some_and(|v| self.values.first().is_some_and(|wanted| v == wanted)),
            LabelOperator::In => labels
                .get(&self.label)
                .is_some_and(|v| self.values.iter().any(|wanted| wanted == v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_eq_filter() {
        let filter = LabelFilter {
            label: "tier".to_string(),
            operator: LabelOperator::Eq,
            values: vec!["premium".to_string()],
        };
        assert!(filter.matches(&labels(&[("tier", "premium")])));
        assert!(!filter.matches(&labels(&[("tier", "free")])));
        assert!(!filter.matches(&labels(&[])));
    }

    #[test]
    fn test_in_filter() {
        let filter = LabelFilter {
            label: "region".to_string(),
            operator: LabelOperator::In,
            values: vec!["eu-west".to_string(), "eu-north".to_string()],
        };
        assert!(filter.matches(&labels(&[("region", "eu-north")])));
        assert!(!filter.matches(&labels(&[("region", "us-east")])));
    }

    #[test]
    fn test_exists_filter() {
        let filter = LabelFilter {
            label: "customer".to_string(),
            operator: LabelOperator::Exists,
            values: Vec::new(),
        };
        assert!(filter.matches(&labels(&[("customer", "acme")])));
        assert!(!filter.matches(&labels(&[("tier", "premium")])));
    }
}
