use crate::error::IngestError;
use crate::model::{AssetDoc, DeviceDoc, MeasureRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Enrichment subscriber.
///
/// `process_before` runs after the measures are built and before the snapshot
/// merge; it receives the in-flight batch and must return it (possibly
/// mutated — entries may be added, removed or rewritten, and the device/asset
/// metadata may be touched). `process_after` runs once persistence completed,
/// for read-only side effects. An error from either aborts the ingestion.
#[async_trait]
pub trait MeasureProcessor: Send + Sync {
    async fn process_before(
        &self,
        device: &mut DeviceDoc,
        asset: Option<&mut AssetDoc>,
        measures: Vec<MeasureRecord>,
    ) -> anyhow::Result<Vec<MeasureRecord>> {
        let _ = (device, asset);
        Ok(measures)
    }

    async fn process_after(
        &self,
        device: &DeviceDoc,
        asset: Option<&AssetDoc>,
        measures: &[MeasureRecord],
    ) -> anyhow::Result<()> {
        let _ = (device, asset, measures);
        Ok(())
    }
}

/// Handle returned by registration, usable to unregister a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Ordered registry of enrichment subscribers.
///
/// Global subscribers run first, then the subscribers scoped to the device's
/// engine, chained on the previous output. Dispatch is sequential so later
/// subscribers observe earlier subscribers' mutations.
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    global: Vec<(SubscriptionId, Arc<dyn MeasureProcessor>)>,
    engines: HashMap<String, Vec<(SubscriptionId, Arc<dyn MeasureProcessor>)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn MeasureProcessor>) -> SubscriptionId {
        let id = self.allocate_id();
        self.global.push((id, processor));
        id
    }

    pub fn register_for_engine(
        &mut self,
        engine_id: impl Into<String>,
        processor: Arc<dyn MeasureProcessor>,
    ) -> SubscriptionId {
        let id = self.allocate_id();
        self.engines
            .entry(engine_id.into())
            .or_default()
            .push((id, processor));
        id
    }

    pub fn unregister(&mut self, id: SubscriptionId) {
        self.global.retain(|(existing, _)| *existing != id);
        for subscribers in self.engines.values_mut() {
            subscribers.retain(|(existing, _)| *existing != id);
        }
    }

    fn allocate_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }

    fn chain<'a>(
        &'a self,
        engine_id: Option<&str>,
    ) -> impl Iterator<Item = &'a Arc<dyn MeasureProcessor>> {
        let scoped = engine_id
            .and_then(|engine_id| self.engines.get(engine_id))
            .map(|subscribers| subscribers.as_slice())
            .unwrap_or(&[]);
        self.global
            .iter()
            .chain(scoped.iter())
            .map(|(_, processor)| processor)
    }

    pub(crate) async fn run_before(
        &self,
        device: &mut DeviceDoc,
        mut asset: Option<&mut AssetDoc>,
        engine_id: Option<&str>,
        mut measures: Vec<MeasureRecord>,
    ) -> Result<Vec<MeasureRecord>, IngestError> {
        for processor in self.chain(engine_id) {
            measures = processor
                .process_before(device, asset.as_deref_mut(), measures)
                .await
                .map_err(IngestError::Enrichment)?;
        }
        Ok(measures)
    }

    pub(crate) async fn run_after(
        &self,
        device: &DeviceDoc,
        asset: Option<&AssetDoc>,
        engine_id: Option<&str>,
        measures: &[MeasureRecord],
    ) -> Result<(), IngestError> {
        for processor in self.chain(engine_id) {
            processor
                .process_after(device, asset, measures)
                .await
                .map_err(IngestError::Enrichment)?;
        }
        Ok(())
    }
}
