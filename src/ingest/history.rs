use crate::model::{
    AssetDoc, HistoryEvent, HistoryEventMeasure, HistoryEventMetadata, MeasureRecord, Metadata,
};
use crate::store::DocumentStore;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

/// Destination for asset change events. Dispatch is fire-and-forget relative
/// to the ingestion outcome: the orchestrator logs sink failures but never
/// fails an already-acknowledged asset update because of them.
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn add(&self, event: &HistoryEvent, asset: &AssetDoc) -> anyhow::Result<()>;
}

/// Sink appending history documents to the engine's asset-history collection.
pub struct StoreHistorySink {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl StoreHistorySink {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }
}

#[async_trait]
impl HistorySink for StoreHistorySink {
    async fn add(&self, event: &HistoryEvent, asset: &AssetDoc) -> anyhow::Result<()> {
        let body = json!({
            "event": serde_json::to_value(event)?,
            "asset": serde_json::to_value(&asset.content)?,
        });
        let result = self
            .store
            .m_create(&event.engine_id, &self.collection, &[body])
            .await?;
        if let Some(error) = result.errors.first() {
            anyhow::bail!("cannot save history event: {}", error.reason);
        }
        Ok(())
    }
}

/// Derive the change event for an ingestion that touched an asset.
///
/// `measure.names` lists the asset-side names that actually had a link
/// mapping; `metadata.names` is the dot-path diff between the metadata
/// captured before enrichment and the persisted one, omitted when empty.
pub(crate) fn build_history_event(
    asset: &AssetDoc,
    engine_id: &str,
    measures: &[MeasureRecord],
    before_metadata: &Metadata,
) -> HistoryEvent {
    let names: Vec<String> = measures
        .iter()
        .filter_map(|measure| measure.asset.as_ref())
        .filter_map(|context| context.measure_name.clone())
        .collect();

    let changed = metadata_diff(before_metadata, &asset.content.metadata);

    HistoryEvent {
        asset_id: asset.id.clone(),
        engine_id: engine_id.to_string(),
        timestamp: Utc::now().timestamp_millis(),
        name: "measure".to_string(),
        measure: HistoryEventMeasure { names },
        metadata: if changed.is_empty() {
            None
        } else {
            Some(HistoryEventMetadata { names: changed })
        },
    }
}

/// Recursive metadata diff reporting dot-paths (`trailer.capacity`). Added
/// and removed keys count as changed.
pub(crate) fn metadata_diff(before: &Metadata, after: &Metadata) -> Vec<String> {
    let mut names = Vec::new();
    diff_objects("", before, after, &mut names);
    names
}

fn diff_objects(prefix: &str, before: &Metadata, after: &Metadata, names: &mut Vec<String>) {
    for (key, before_value) in before {
        let path = join_path(prefix, key);
        match after.get(key) {
            None => names.push(path),
            Some(after_value) => match (before_value, after_value) {
                (serde_json::Value::Object(before_obj), serde_json::Value::Object(after_obj)) => {
                    diff_objects(&path, before_obj, after_obj, names);
                }
                _ => {
                    if before_value != after_value {
                        names.push(path);
                    }
                }
            },
        }
    }
    for key in after.keys() {
        if !before.contains_key(key) {
            names.push(join_path(prefix, key));
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}
