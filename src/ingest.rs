mod build;
mod events;
mod history;
mod lock;
mod orchestrator;

#[cfg(test)]
mod tests;

pub use events::{EventBus, MeasureProcessor, SubscriptionId};
pub use history::{HistorySink, StoreHistorySink};
pub use lock::KeyedLocks;
pub use orchestrator::UserMeasure;

use crate::measures::MeasureRegistry;
use crate::store::DocumentStore;
use std::sync::Arc;
use std::time::Duration;

pub const DEVICES_COLLECTION: &str = "devices";
pub const ASSETS_COLLECTION: &str = "assets";
pub const MEASURES_COLLECTION: &str = "measures";
pub const HISTORY_COLLECTION: &str = "assets-history";

/// Measure ingestion pipeline: merges decoded measurements into device and
/// asset twins, persists the measure log and emits asset history events.
/// Ingestions for one device are serialized by a keyed lock.
#[derive(Clone)]
pub struct MeasureIngestor {
    store: Arc<dyn DocumentStore>,
    bus: Arc<EventBus>,
    history: Arc<dyn HistorySink>,
    registry: Arc<MeasureRegistry>,
    locks: Arc<KeyedLocks>,
    admin_index: String,
    retry_on_conflict: u32,
}

impl MeasureIngestor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        bus: Arc<EventBus>,
        history: Arc<dyn HistorySink>,
        registry: Arc<MeasureRegistry>,
        admin_index: impl Into<String>,
        lock_timeout: Duration,
        retry_on_conflict: u32,
    ) -> Self {
        Self {
            store,
            bus,
            history,
            registry,
            locks: Arc::new(KeyedLocks::new(lock_timeout)),
            admin_index: admin_index.into(),
            retry_on_conflict,
        }
    }
}
