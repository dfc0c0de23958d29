use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    // completed and failed are terminal, no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// One batch execution of the allocation engine over a date window.
/// Results of a completed run are immutable; recomputation always creates a
/// new run. Deleting a run cascades to its allocation and contribution rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationRun {
    pub id: Uuid,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    /// Content hash of the dependency graph at `window_start`.
    #[serde(default)]
    pub graph_hash: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for (variant, text) in [
            (RunStatus::Pending, "pending"),
            (RunStatus::Running, "running"),
            (RunStatus::Completed, "completed"),
            (RunStatus::Failed, "failed"),
        ] {
            assert_eq!(variant.to_string(), text);
            assert_eq!(text.parse::<RunStatus>().unwrap(), variant);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }
}
