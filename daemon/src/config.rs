use costwise_common::amount::Amount;
use rust_decimal::Decimal;

// bind addresses
// The read API carries no authentication, so it binds to loopback by
// default; expose it deliberately with --rpc-bind-address 0.0.0.0:8080.
pub const DEFAULT_RPC_BIND_ADDRESS: &str = "127.0.0.1:8080";

// Environment variable fallbacks for CLI flags
pub const DATABASE_URL_ENV: &str = "COSTWISE_DATABASE_URL";

// Maximum rows per INSERT statement, caps statement size on bulk writes
pub const WRITE_BATCH_SIZE: usize = 1000;

// Connection pool sizing for the Postgres backend
pub const DEFAULT_MAX_DB_CONNECTIONS: u32 = 8;

// Look-back window (in days, including the allocation day itself) used by
// the weighted_average strategy when none is configured on the edge
pub const DEFAULT_WEIGHTED_AVERAGE_WINDOW_DAYS: u32 = 7;

// Report-time rounding, half-even. Intermediate engine state is never rounded.
pub const REPORT_DECIMAL_PLACES: u32 = 2;

// Read API paging
pub const DEFAULT_QUERY_LIMIT: i64 = 50;
pub const MAX_QUERY_LIMIT: i64 = 500;

// Number of products on the dashboard composition
pub const DASHBOARD_TOP_PRODUCTS: i64 = 5;

// Default number of runs returned by the run listing
pub const DEFAULT_RUN_LIST_LIMIT: i64 = 20;

// Relative tolerance for the conservation, contribution-balance and
// no-amplification checks: sums may exceed their bound by at most 1 + 1e-4
pub fn invariant_tolerance() -> Amount {
    Amount::new(Decimal::new(1, 4))
}

// A non-product node must carry at least this much direct cost over the
// queried range before a missing-usage finding is worth reporting
pub fn idle_resource_cost_floor() -> Amount {
    Amount::new(Decimal::new(100, 2))
}
