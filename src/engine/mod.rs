//! Purpose: Port contracts for the managed proxy/routing engine.
//! Exports: `Engine`, `EngineFactory`, `Spawned`, `StatsOptions`, `StatsService`,
//! `TrafficCounters`, plus the process-backed adapter.
//! Role: Seam between the control surface and whichever engine build is linked.
//! Invariants: Optional engine features are reached through `Introspect`, never
//! through per-version branches in callers.
//! Invariants: `close` is called at most once per engine by the registry.
use std::any::Any;
use std::sync::Arc;

use crate::core::cancel::CancelToken;
use crate::core::error::Error;
use crate::core::probe::Introspect;

pub mod clash;
pub mod process;

/// Options handed to the engine's stats subsystem.
///
/// Fields beyond the outbound list differ between engine releases and are
/// reached by probing.
pub trait StatsOptions: Introspect + Send {
    fn outbounds(&self) -> &[String];

    /// Hands the options back to the engine that built them.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// Traffic counters keyed by the engine's composite stat names.
pub trait TrafficCounters: Send + Sync {
    fn query(&self, key: &str) -> i64;
}

/// A stats subsystem attached to a running engine.
pub trait StatsService: Introspect + Send + Sync {
    /// Counter lookup, when this subsystem is of the counting kind.
    fn traffic(&self) -> Option<&dyn TrafficCounters> {
        None
    }
}

pub trait Engine: Send + Sync {
    fn new_stats_options(&self, outbounds: Vec<String>) -> Box<dyn StatsOptions>;

    fn install_stats(&self, options: Box<dyn StatsOptions>) -> Result<(), Error>;

    fn stats(&self) -> Option<Arc<dyn StatsService>>;

    /// Local proxy endpoint that routes through this engine, used to build
    /// HTTP clients bound to the instance.
    fn proxy_url(&self) -> Option<String> {
        None
    }

    fn close(&self) -> Result<(), Error>;
}

/// A freshly created engine and the handle that cancels its background work.
pub struct Spawned {
    pub engine: Arc<dyn Engine>,
    pub teardown: CancelToken,
}

pub trait EngineFactory: Send + Sync {
    /// Creates an engine from a configuration blob.
    ///
    /// Implementations should give up promptly once `cancel` fires.
    fn create(&self, config: &[u8], cancel: &CancelToken) -> Result<Spawned, Error>;
}
