use crate::error::IngestError;
use crate::ingest::{MeasureIngestor, DEVICES_COLLECTION};
use crate::model::{device_id, DeviceContent, DeviceDoc, Measurement, Metadata};
use crate::store::{DocumentStore, StoreError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub const PAYLOADS_COLLECTION: &str = "payloads";

/// Output of a device decoder: typed measurements plus metadata extracted
/// from the raw frame.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DecodedPayload {
    #[serde(default)]
    pub measurements: Vec<Measurement>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Turns a raw device payload into measurements. One decoder per device
/// model; `validate` rejects malformed frames before any decoding happens.
#[async_trait]
pub trait Decoder: Send + Sync {
    async fn validate(&self, payload: &Value) -> anyhow::Result<bool> {
        let _ = payload;
        Ok(true)
    }

    async fn decode(&self, payload: &Value) -> anyhow::Result<DecodedPayload>;
}

/// Decoder for devices that already publish the wire shape
/// `{"reference": ..., "measures": [...], "metadata": {...}}`.
pub struct JsonDecoder;

#[async_trait]
impl Decoder for JsonDecoder {
    async fn validate(&self, payload: &Value) -> anyhow::Result<bool> {
        Ok(payload.get("measures").map(Value::is_array).unwrap_or(false))
    }

    async fn decode(&self, payload: &Value) -> anyhow::Result<DecodedPayload> {
        let measurements = serde_json::from_value(payload["measures"].clone())?;
        let metadata = match payload.get("metadata") {
            Some(Value::Object(map)) => map.clone(),
            _ => Metadata::new(),
        };
        Ok(DecodedPayload {
            measurements,
            metadata,
        })
    }
}

/// Entry point for raw device frames.
///
/// Every frame is archived to the payloads collection before anything else,
/// valid or not, so a broken decoder never loses data. Decoded frames are
/// then handed to the ingestor under the device's identity.
pub struct PayloadService {
    store: Arc<dyn DocumentStore>,
    ingestor: MeasureIngestor,
    decoders: HashMap<String, Arc<dyn Decoder>>,
    admin_index: String,
}

impl PayloadService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        ingestor: MeasureIngestor,
        admin_index: impl Into<String>,
    ) -> Self {
        Self {
            store,
            ingestor,
            decoders: HashMap::new(),
            admin_index: admin_index.into(),
        }
    }

    pub fn register_decoder(&mut self, device_model: impl Into<String>, decoder: Arc<dyn Decoder>) {
        self.decoders.insert(device_model.into(), decoder);
    }

    /// Process one raw frame published by `device_model`/`reference`.
    pub async fn receive(
        &self,
        device_model: &str,
        reference: &str,
        payload: Value,
    ) -> Result<(), IngestError> {
        let Some(decoder) = self.decoders.get(device_model) else {
            return Err(IngestError::validation(format!(
                "no decoder registered for device model \"{device_model}\""
            )));
        };

        let valid = match decoder.validate(&payload).await {
            Ok(valid) => valid,
            Err(err) => {
                self.archive(device_model, &payload, false).await?;
                return Err(IngestError::validation(format!(
                    "invalid payload for device model \"{device_model}\": {err}"
                )));
            }
        };
        let uuid = self.archive(device_model, &payload, valid).await?;
        if !valid {
            return Err(IngestError::validation(format!(
                "invalid payload for device model \"{device_model}\""
            )));
        }

        let decoded = decoder.decode(&payload).await.map_err(|err| {
            IngestError::validation(format!(
                "cannot decode payload for device model \"{device_model}\": {err}"
            ))
        })?;

        let id = device_id(device_model, reference);
        let document = match self
            .store
            .get(&self.admin_index, DEVICES_COLLECTION, &id)
            .await
        {
            Ok(document) => document,
            Err(StoreError::NotFound { .. }) => {
                tracing::warn!(device = %id, "payload received for unprovisioned device");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let mut device = DeviceDoc {
            id: document.id.clone(),
            content: document.content::<DeviceContent>()?,
        };

        self.ingestor
            .ingest(
                &mut device,
                decoded.measurements,
                decoded.metadata,
                vec![uuid],
            )
            .await
    }

    async fn archive(
        &self,
        device_model: &str,
        payload: &Value,
        valid: bool,
    ) -> Result<String, IngestError> {
        let uuid = Uuid::new_v4().to_string();
        let body = json!({
            "deviceModel": device_model,
            "uuid": uuid,
            "valid": valid,
            "payload": payload,
        });
        self.store
            .create(&self.admin_index, PAYLOADS_COLLECTION, &uuid, &body)
            .await
            .map_err(|err| IngestError::persistence("payload", err))?;
        Ok(uuid)
    }
}
