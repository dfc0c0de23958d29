use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::Amount;

/// Final per-(node, day, dimension) cost attribution of one run.
///
/// `direct_amount` is the cost originating at the node (from the raw cost
/// records), `indirect_amount` the cost received from ancestors through
/// allocation. `total_amount` is always their exact sum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub run_id: Uuid,
    pub node_id: Uuid,
    pub allocation_date: NaiveDate,
    pub dimension: String,
    pub direct_amount: Amount,
    pub indirect_amount: Amount,
    pub total_amount: Amount,
}

impl AllocationResult {
    pub fn is_consistent(&self) -> bool {
        self.total_amount == self.direct_amount + self.indirect_amount
    }
}

/// The amount that flowed across one edge on one day for one dimension.
/// `path` documents provenance as an ordered node id list; in the direct
/// allocation stage it is always `[parent, child]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionResult {
    pub run_id: Uuid,
    pub parent_id: Uuid,
    pub child_id: Uuid,
    pub contribution_date: NaiveDate,
    pub dimension: String,
    pub contributed_amount: Amount,
    pub path: Vec<Uuid>,
}
