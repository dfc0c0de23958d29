use std::fmt;

use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

/// Failure kinds reported by the storage layer.
///
/// The engine never retries: `TransientIO` fails the run and the operator
/// (or a supervisor) decides whether to re-run; `ConstraintViolation` is
/// always fatal because it means the write itself is wrong.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("transient I/O error: {0}")]
    TransientIO(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation() =>
            {
                StorageError::ConstraintViolation(db.to_string())
            }
            other => StorageError::TransientIO(other.to_string()),
        }
    }
}

/// A witness cycle, printed as a chain of node ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePath(pub Vec<Uuid>);

impl fmt::Display for CyclePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for id in &self.0 {
            if !first {
                write!(f, " -> ")?;
            }
            write!(f, "{}", id)?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("cycle detected in dependency graph: {0}")]
    CycleDetected(CyclePath),

    #[error("strategy misconfigured on edge {edge_id}: {reason}")]
    StrategyMisconfigured { edge_id: Uuid, reason: String },

    #[error("missing usage data for metric '{metric}' on {date}")]
    MissingUsageData { metric: String, date: NaiveDate },

    #[error("invalid run window: {0}")]
    InvalidWindow(String),

    #[error("run {0} was cancelled")]
    Cancelled(Uuid),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_path_display() {
        let a = Uuid::nil();
        let path = CyclePath(vec![a, a]);
        let text = path.to_string();
        assert!(text.contains(" -> "));
        assert!(text.starts_with("00000000"));
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let err: StorageError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
