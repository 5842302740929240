use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Free-form metadata bag carried by devices, assets and measure values.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Device identity: a device is uniquely identified by its model and reference.
pub fn device_id(model: &str, reference: &str) -> String {
    format!("{}-{}", model.trim(), reference.trim())
}

/// A single typed reading produced by a decoder.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub measure_name: String,
    #[serde(rename = "type")]
    pub measure_type: String,
    /// Unix timestamp in milliseconds.
    pub measured_at: i64,
    pub values: Metadata,
}

/// Most recent measure of a given name, embedded in a digital twin document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureSnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub measure_type: String,
    pub measured_at: i64,
    pub values: Metadata,
    #[serde(default)]
    pub payload_uuids: Vec<String>,
}

/// Device digital twin document body.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceContent {
    pub model: String,
    pub reference: String,
    #[serde(default)]
    pub engine_id: Option<String>,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub measures: HashMap<String, MeasureSnapshot>,
}

/// Mapping between a device-side and an asset-side measure name within a link.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureNameLink {
    pub device: String,
    pub asset: String,
}

/// One device linked to an asset, with its measure-name mappings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLink {
    pub device_id: String,
    #[serde(default)]
    pub measure_names: Vec<MeasureNameLink>,
}

/// Asset digital twin document body.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetContent {
    pub model: String,
    pub reference: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub measures: HashMap<String, MeasureSnapshot>,
    #[serde(default)]
    pub linked_devices: Vec<DeviceLink>,
}

/// A device document together with its id.
#[derive(Clone, Debug)]
pub struct DeviceDoc {
    pub id: String,
    pub content: DeviceContent,
}

/// An asset document together with its id.
#[derive(Clone, Debug)]
pub struct AssetDoc {
    pub id: String,
    pub content: AssetContent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginType {
    Device,
    User,
    Computed,
}

/// Where a measure record came from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureOrigin {
    #[serde(rename = "type")]
    pub origin_type: OriginType,
    /// Device id, user id or producer name depending on `origin_type`.
    pub id: String,
    pub measure_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload_uuids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// Asset context captured at measure time. `measure_name` is None when the
/// device measure has no mapping in the device-asset link.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMeasureContext {
    pub id: String,
    pub measure_name: Option<String>,
    pub metadata: Metadata,
    pub model: String,
    pub reference: String,
}

/// Append-only measure record, one per measurement per ingestion.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureRecord {
    #[serde(rename = "type")]
    pub measure_type: String,
    pub measured_at: i64,
    pub values: Metadata,
    pub origin: MeasureOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetMeasureContext>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEventMeasure {
    pub names: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEventMetadata {
    pub names: Vec<String>,
}

/// Change event dispatched to the asset-history sink after a successful
/// asset update.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub asset_id: String,
    pub engine_id: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub name: String,
    pub measure: HistoryEventMeasure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HistoryEventMetadata>,
}

/// Deep-merge `incoming` into `target`; incoming keys win, nested objects are
/// merged key by key.
pub fn merge_metadata(target: &mut Metadata, incoming: &Metadata) {
    for (key, value) in incoming {
        match (target.get_mut(key), value) {
            (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(update)) => {
                merge_metadata(existing, update);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
