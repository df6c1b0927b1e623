//! Distributed proxy checker
//!
//! A dispatcher sizes a pool of workers every 15 s; each worker pops due
//! proxies from the shared queue, probes them over every enabled protocol
//! against judge endpoints, records the results and requeues with a
//! drift-free cadence.

pub mod classify;
pub mod dispatcher;
pub mod geo;
pub mod judges;
pub mod probe;
pub mod worker;

pub use dispatcher::CheckerDispatcher;
pub use geo::{GeoEnricher, NoopGeo};
pub use judges::JudgePool;

use std::sync::Arc;

use crate::config::CheckerConfig;
use crate::queue::ProxyQueue;
use crate::repository::{ProxyRepository, StatisticsRepository};

/// Shared dependencies of every checker worker
pub struct CheckerContext {
    pub queue: ProxyQueue,
    pub judges: Arc<JudgePool>,
    pub statistics: StatisticsRepository,
    pub proxies: ProxyRepository,
    pub geo: Arc<dyn GeoEnricher>,
    pub config: CheckerConfig,
}
