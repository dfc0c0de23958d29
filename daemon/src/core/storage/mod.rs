mod providers;

pub mod memory;
pub mod postgres;

pub use self::{memory::MemoryStorage, postgres::PgStorage, providers::*};

/// Everything the engine and the read API need from a datastore.
///
/// Each provider is an independent contract; a backend implements them all.
/// Reads take `&self` so concurrent readers never contend in the backend's
/// public surface; write serialization is the backend's concern.
pub trait Storage:
    NodeProvider
    + EdgeProvider
    + CostProvider
    + UsageProvider
    + RunProvider
    + AggregationProvider
    + Sync
    + Send
    + 'static
{
}
