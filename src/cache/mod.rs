//! Per-North durable cache: pending, error and archive stores plus the dispatch and
//! retention logic that moves entries between them.

mod dispatch;
mod router;
mod store;
mod sweep;

pub use self::dispatch::{run_dispatch_cycle, DispatchReport, DispatchSettings};
pub use self::router::{CacheRouter, RouteTarget};
pub use self::store::{CacheStats, FailureOutcome, NorthCache, StoreStats};
pub use self::sweep::{sweep_north, SweepReport};
