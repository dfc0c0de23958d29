use std::collections::{BTreeMap, HashMap};

use chrono::{Duration, NaiveDate};
use costwise_common::{
    amount::Amount,
    model::{DailyUsage, LabelFilter},
};
use uuid::Uuid;

struct UsageSample {
    value: Amount,
    labels: indexmap::IndexMap<String, String>,
}

/// Usage rows for one engine day, indexed for the evaluators: by node, then
/// metric, then date (ordered, so look-back windows are range scans).
/// Built once per day from a single repository fetch; evaluation itself
/// never touches the repository.
#[derive(Default)]
pub struct UsageIndex {
    rows: HashMap<Uuid, HashMap<String, BTreeMap<NaiveDate, UsageSample>>>,
}

impl UsageIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<DailyUsage>) -> Self {
        let mut index = Self::empty();
        for row in rows {
            index
                .rows
                .entry(row.node_id)
                .or_default()
                .entry(row.metric)
                .or_default()
                .insert(
                    row.usage_date,
                    UsageSample {
                        value: row.value,
                        labels: row.labels,
                    },
                );
        }
        index
    }

    pub fn value_on(&self, node: &Uuid, metric: &str, date: NaiveDate) -> Option<Amount> {
        self.rows
            .get(node)?
            .get(metric)?
            .get(&date)
            .map(|sample| sample.value)
    }

    /// Sum over the `window_days` days ending at `end` (inclusive). Missing
    /// days count as zero. Proportional strategies only consume ratios, so
    /// the sum stands in for the mean: the constant divisor cancels.
    pub fn window_sum(
        &self,
        node: &Uuid,
        metric: &str,
        end: NaiveDate,
        window_days: u32,
    ) -> Amount {
        let start = end - Duration::days(window_days.saturating_sub(1) as i64);
        self.rows
            .get(node)
            .and_then(|metrics| metrics.get(metric))
            .map(|days| days.range(start..=end).map(|(_, sample)| sample.value).sum())
            .unwrap_or(Amount::ZERO)
    }

    /// The day's value if the row's labels satisfy `filter`, zero otherwise.
    /// One usage row exists per (node, date, metric), so segment filtering
    /// is a row-level predicate.
    pub fn filtered_value_on(
        &self,
        node: &Uuid,
        metric: &str,
        date: NaiveDate,
        filter: &LabelFilter,
    ) -> Option<Amount> {
        let sample = self.rows.get(node)?.get(metric)?.get(&date)?;
        if filter.matches(&sample.labels) {
            Some(sample.value)
        } else {
            Some(Amount::ZERO)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use costwise_common::model::LabelOperator;
    use std::str::FromStr;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn usage(node: Uuid, day: &str, metric: &str, value: &str) -> DailyUsage {
        DailyUsage {
            node_id: node,
            usage_date: date(day),
            metric: metric.to_string(),
            value: Amount::from_str(value).unwrap(),
            unit: String::new(),
            labels: indexmap::IndexMap::new(),
        }
    }

    #[test]
    fn test_value_on() {
        let node = Uuid::new_v4();
        let index = UsageIndex::from_rows(vec![usage(node, "2024-03-10", "cpu_hours", "12.5")]);
        assert_eq!(
            index.value_on(&node, "cpu_hours", date("2024-03-10")),
            Some(Amount::from_str("12.5").unwrap())
        );
        assert_eq!(index.value_on(&node, "cpu_hours", date("2024-03-11")), None);
        assert_eq!(index.value_on(&node, "memory_gb", date("2024-03-10")), None);
    }

    #[test]
    fn test_window_sum_skips_outside_days() {
        let node = Uuid::new_v4();
        let index = UsageIndex::from_rows(vec![
            usage(node, "2024-03-08", "cpu_hours", "1"),
            usage(node, "2024-03-09", "cpu_hours", "2"),
            usage(node, "2024-03-10", "cpu_hours", "4"),
            // outside a 3-day window ending 2024-03-10
            usage(node, "2024-03-07", "cpu_hours", "100"),
        ]);
        assert_eq!(
            index.window_sum(&node, "cpu_hours", date("2024-03-10"), 3),
            Amount::from(7i64)
        );
    }

    #[test]
    fn test_filtered_value_on() {
        let node = Uuid::new_v4();
        let mut row = usage(node, "2024-03-10", "requests", "50");
        row.labels.insert("tier".to_string(), "premium".to_string());
        let index = UsageIndex::from_rows(vec![row]);

        let premium = LabelFilter {
            label: "tier".to_string(),
            operator: LabelOperator::Eq,
            values: vec!["premium".to_string()],
        };
        let free = LabelFilter {
            label: "tier".to_string(),
            operator: LabelOperator::Eq,
            values: vec!["free".to_string()],
        };
        assert_eq!(
            index.filtered_value_on(&node, "requests", date("2024-03-10"), &premium),
            Some(Amount::from(50i64))
        );
        assert_eq!(
            index.filtered_value_on(&node, "requests", date("2024-03-10"), &free),
            Some(Amount::ZERO)
        );
    }
}
