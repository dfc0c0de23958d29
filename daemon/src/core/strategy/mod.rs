//! Allocation strategies: resolution, parameter parsing and evaluation.
//!
//! A strategy decides what share of a parent's holistic cost one child
//! receives for a (dimension, date). Configuration is resolved per edge
//! with dimension-specific overrides taking precedence over the edge-wide
//! override, which in turn beats the edge default. Parameters are parsed
//! once per (edge, dimension) per day and cached as a [`StrategySpec`];
//! evaluation is pure and never blocks.
//!
//! Every evaluator shares one fallback: when the configured signal is
//! absent (zero usage totals), the share degrades to an equal split across
//! the parent's outgoing edges.

mod params;
mod usage;

pub use usage::UsageIndex;

use std::{collections::HashMap, sync::Arc};

use chrono::NaiveDate;
use costwise_common::{amount::Amount, model::LabelFilter};
use serde_json::Value;
use uuid::Uuid;

use super::{error::AllocationError, graph::GraphEdge};
use crate::config::DEFAULT_WEIGHTED_AVERAGE_WINDOW_DAYS;

/// Inputs to one share evaluation. `siblings` holds the child of every
/// outgoing edge of the parent, in edge order, including `child` itself.
pub struct ShareContext<'a> {
    pub date: NaiveDate,
    pub dimension: &'a str,
    pub child: Uuid,
    pub siblings: &'a [Uuid],
    pub usage: &'a UsageIndex,
}

/// A parsed, ready-to-evaluate allocation strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategySpec {
    Equal,
    ProportionalOn {
        metric: String,
    },
    FixedPercent {
        percent: Amount,
    },
    CappedProportional {
        metric: String,
        cap: Amount,
    },
    ResidualToMax {
        metric: String,
    },
    WeightedAverage {
        metric: String,
        window_days: u32,
    },
    HybridFixedProportional {
        fixed_percent: Amount,
        metric: String,
    },
    MinFloorProportional {
        min_floor_percent: Amount,
        metric: String,
    },
    SegmentFilteredProportional {
        metric: String,
        segment_filter: LabelFilter,
    },
}

impl StrategySpec {
    /// Parse a (strategy name, parameter map) pair. The error is a plain
    /// reason string; the resolver attaches the edge identity.
    pub fn parse(strategy: &str, parameters: &Value) -> Result<Self, String> {
        match strategy {
            "equal" => Ok(StrategySpec::Equal),
            "proportional_on" => Ok(StrategySpec::ProportionalOn {
                metric: params::require_string(parameters, "metric")?,
            }),
            "fixed_percent" => Ok(StrategySpec::FixedPercent {
                percent: params::require_percent(parameters, "percent")?,
            }),
            "capped_proportional" => Ok(StrategySpec::CappedProportional {
                metric: params::require_string(parameters, "metric")?,
                cap: params::require_percent(parameters, "cap")?,
            }),
            "residual_to_max" => Ok(StrategySpec::ResidualToMax {
                metric: params::require_string(parameters, "metric")?,
            }),
            "weighted_average" => Ok(StrategySpec::WeightedAverage {
                metric: params::require_string(parameters, "metric")?,
                window_days: params::optional_window_days(
                    parameters,
                    "window_days",
                    DEFAULT_WEIGHTED_AVERAGE_WINDOW_DAYS,
                )?,
            }),
            "hybrid_fixed_proportional" => Ok(StrategySpec::HybridFixedProportional {
                fixed_percent: params::require_percent(parameters, "fixed_percent")?,
                metric: params::require_string(parameters, "metric")?,
            }),
            "min_floor_proportional" => Ok(StrategySpec::MinFloorProportional {
                min_floor_percent: params::require_percent(parameters, "min_floor_percent")?,
                metric: params::require_string(parameters, "metric")?,
            }),
            "segment_filtered_proportional" => Ok(StrategySpec::SegmentFilteredProportional {
                metric: params::require_string(parameters, "metric")?,
                segment_filter: params::require_segment_filter(parameters, "segment_filter")?,
            }),
            unknown => Err(format!("unknown strategy '{}'", unknown)),
        }
    }

    /// The usage metric this strategy reads, if any. Drives the engine's
    /// one-shot usage prefetch.
    pub fn metric(&self) -> Option<&str> {
        match self {
            StrategySpec::Equal | StrategySpec::FixedPercent { .. } => None,
            StrategySpec::ProportionalOn { metric }
            | StrategySpec::CappedProportional { metric, .. }
            | StrategySpec::ResidualToMax { metric }
            | StrategySpec::WeightedAverage { metric, .. }
            | StrategySpec::HybridFixedProportional { metric, .. }
            | StrategySpec::MinFloorProportional { metric, .. }
            | StrategySpec::SegmentFilteredProportional { metric, .. } => Some(metric),
        }
    }

    /// How many days of usage history evaluation needs, counting the
    /// allocation day itself.
    pub fn lookback_days(&self) -> u32 {
        match self {
            StrategySpec::WeightedAverage { window_days, .. } => *window_days,
            _ => 1,
        }
    }

    /// The child's share of the parent's holistic cost, in [0, 1].
    pub fn evaluate(&self, ctx: &ShareContext<'_>) -> Amount {
        let share = match self {
            StrategySpec::Equal => equal_share(ctx.siblings.len()),
            StrategySpec::ProportionalOn { metric } => proportional_share(ctx, metric, 1),
            StrategySpec::FixedPercent { percent } => *percent,
            StrategySpec::CappedProportional { metric, cap } => {
                proportional_share(ctx, metric, 1).min(*cap)
            }
            StrategySpec::ResidualToMax { metric } => residual_to_max_share(ctx, metric),
            StrategySpec::WeightedAverage {
                metric,
                window_days,
            } => proportional_share(ctx, metric, *window_days),
            StrategySpec::HybridFixedProportional {
                fixed_percent,
                metric,
            } => {
                let fixed = *fixed_percent * equal_share(ctx.siblings.len());
                let variable = Amount::ONE - *fixed_percent;
                fixed + variable * proportional_share(ctx, metric, 1)
            }
            StrategySpec::MinFloorProportional {
                min_floor_percent,
                metric,
            } => {
                let floor_total = *min_floor_percent * Amount::from(ctx.siblings.len());
                if floor_total >= Amount::ONE {
                    // floors alone exceed the whole: degrade to equal split
                    equal_share(ctx.siblings.len())
                } else {
                    *min_floor_percent
                        + (Amount::ONE - floor_total) * proportional_share(ctx, metric, 1)
                }
            }
            StrategySpec::SegmentFilteredProportional {
                metric,
                segment_filter,
            } => segment_filtered_share(ctx, metric, segment_filter),
        };
        share.clamp_unit()
    }
}

fn equal_share(sibling_count: usize) -> Amount {
    Amount::ONE
        .checked_div(Amount::from(sibling_count))
        .unwrap_or(Amount::ZERO)
}

fn ratio(value: Amount, total: Amount) -> Amount {
    value.checked_div(total).unwrap_or(Amount::ZERO)
}

// usage for one sibling: the day's value, or a window sum for look-back
// strategies; sums stand in for means since the divisor cancels in ratios
fn usage_of(ctx: &ShareContext<'_>, node: &Uuid, metric: &str, window_days: u32) -> Amount {
    if window_days > 1 {
        ctx.usage.window_sum(node, metric, ctx.date, window_days)
    } else {
        ctx.usage
            .value_on(node, metric, ctx.date)
            .unwrap_or(Amount::ZERO)
    }
}

fn proportional_share(ctx: &ShareContext<'_>, metric: &str, window_days: u32) -> Amount {
    let total: Amount = ctx
        .siblings
        .iter()
        .map(|sibling| usage_of(ctx, sibling, metric, window_days))
        .sum();
    if total.is_zero() {
        debug!(
            "{}; falling back to equal split",
            AllocationError::MissingUsageData {
                metric: metric.to_string(),
                date: ctx.date,
            }
        );
        return equal_share(ctx.siblings.len());
    }
    ratio(usage_of(ctx, &ctx.child, metric, window_days), total)
}

// The sibling with the highest usage absorbs whatever the proportional
// shares of the others leave over; everyone else keeps their proportional
// share. Ties go to the smaller node id so the outcome is deterministic.
fn residual_to_max_share(ctx: &ShareContext<'_>, metric: &str) -> Amount {
    let values: Vec<(Uuid, Amount)> = ctx
        .siblings
        .iter()
        .map(|sibling| (*sibling, usage_of(ctx, sibling, metric, 1)))
        .collect();
    let total: Amount = values.iter().map(|(_, value)| value).sum();
    if total.is_zero() {
        debug!(
            "{}; falling back to equal split",
            AllocationError::MissingUsageData {
                metric: metric.to_string(),
                date: ctx.date,
            }
        );
        return equal_share(ctx.siblings.len());
    }

    let Some(winner) = values
        .iter()
        .reduce(|best, candidate| {
            if candidate.1 > best.1 || (candidate.1 == best.1 && candidate.0 < best.0) {
                candidate
            } else {
                best
            }
        })
        .map(|(id, _)| *id)
    else {
        return Amount::ZERO;
    };

    if ctx.child == winner {
        let others: Amount = values
            .iter()
            .filter(|(id, _)| *id != winner)
            .map(|(_, value)| ratio(*value, total))
            .sum();
        Amount::ONE - others
    } else {
        ratio(usage_of(ctx, &ctx.child, metric, 1), total)
    }
}

fn segment_filtered_share(ctx: &ShareContext<'_>, metric: &str, filter: &LabelFilter) -> Amount {
    let filtered = |node: &Uuid| -> Amount {
        ctx.usage
            .filtered_value_on(node, metric, ctx.date, filter)
            .unwrap_or(Amount::ZERO)
    };
    let total: Amount = ctx.siblings.iter().map(filtered).sum();
    if total.is_zero() {
        debug!(
            "no usage matched segment filter on label '{}' for metric '{}' on {}; falling back to equal split",
            filter.label, metric, ctx.date
        );
        return equal_share(ctx.siblings.len());
    }
    ratio(filtered(&ctx.child), total)
}

/// Per-day resolver and parse cache. Misconfigured edges (unknown strategy,
/// missing parameter) are logged and degraded to an equal split; the run
/// keeps going.
pub struct StrategyResolver {
    cache: HashMap<(Uuid, String), Arc<StrategySpec>>,
    equal: Arc<StrategySpec>,
}

impl Default for StrategyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyResolver {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
            equal: Arc::new(StrategySpec::Equal),
        }
    }

    /// Precedence: dimension override, then edge-wide override (null
    /// dimension), then the edge default.
    pub fn resolve(&mut self, edge: &GraphEdge, dimension: &str) -> Arc<StrategySpec> {
        let key = (edge.id, dimension.to_string());
        if let Some(spec) = self.cache.get(&key) {
            return spec.clone();
        }

        let (name, parameters) = select_configuration(edge, dimension);
        let spec = match StrategySpec::parse(name, parameters) {
            Ok(parsed) => Arc::new(parsed),
            Err(reason) => {
                warn!(
                    "{}; substituting equal split for dimension '{}'",
                    AllocationError::StrategyMisconfigured {
                        edge_id: edge.id,
                        reason,
                    },
                    dimension
                );
                self.equal.clone()
            }
        };
        self.cache.insert(key, spec.clone());
        spec
    }
}

fn select_configuration<'a>(edge: &'a GraphEdge, dimension: &str) -> (&'a str, &'a Value) {
    if let Some(entry) = edge
        .overrides
        .iter()
        .find(|entry| entry.dimension.as_deref() == Some(dimension))
    {
        return (&entry.strategy, &entry.parameters);
    }
    if let Some(entry) = edge.overrides.iter().find(|entry| entry.dimension.is_none()) {
        return (&entry.strategy, &entry.parameters);
    }
    (&edge.default_strategy, &edge.default_parameters)
}
