use super::build::{self, TwinKind};
use super::history::build_history_event;
use super::{MeasureIngestor, ASSETS_COLLECTION, DEVICES_COLLECTION, MEASURES_COLLECTION};
use crate::error::IngestError;
use crate::model::{
    AssetContent, AssetDoc, AssetMeasureContext, DeviceDoc, MeasureOrigin, MeasureRecord,
    Measurement, Metadata, OriginType,
};
use crate::store::{StoreError, UpdateOptions};
use chrono::Utc;
use futures::future::{self, BoxFuture};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// A measure pushed directly onto an asset by a user, outside the device
/// decoding path.
#[derive(Clone, Debug)]
pub struct UserMeasure {
    pub name: String,
    pub measure_type: String,
    /// Defaults to now when not provided.
    pub measured_at: Option<i64>,
    pub values: Metadata,
}

fn encode<T: Serialize>(entity: &str, value: &T) -> Result<Value, IngestError> {
    serde_json::to_value(value).map_err(|err| IngestError::persistence(entity, err))
}

impl MeasureIngestor {
    /// Ingest a batch of decoded measurements for a device.
    ///
    /// Updates the admin device, the engine device, the linked asset and the
    /// engine measure log, firing the before/after enrichment events around
    /// the snapshot merge. The whole pipeline runs under the device's lock so
    /// two ingestions for the same device never race on its snapshot.
    ///
    /// Two devices linked to the same asset can still race on the asset
    /// document; that write relies on the store's optimistic
    /// retry-on-conflict instead of a shared lock.
    pub async fn ingest(
        &self,
        device: &mut DeviceDoc,
        measurements: Vec<Measurement>,
        metadata: Metadata,
        payload_uuids: Vec<String>,
    ) -> Result<(), IngestError> {
        let key = format!("measure:ingest:{}", device.id);
        let locks = self.locks.clone();
        locks
            .with_lock(
                &key,
                self.ingest_locked(device, measurements, metadata, payload_uuids),
            )
            .await
    }

    async fn ingest_locked(
        &self,
        device: &mut DeviceDoc,
        measurements: Vec<Measurement>,
        metadata: Metadata,
        payload_uuids: Vec<String>,
    ) -> Result<(), IngestError> {
        if measurements.is_empty() {
            tracing::warn!(
                device = %device.id,
                reference = %device.content.reference,
                "no measurements to ingest for device"
            );
            return Ok(());
        }
        for measurement in &measurements {
            self.registry.validate(measurement)?;
        }

        // A batch queued behind another ingestion must merge onto the freshly
        // persisted snapshot, not the copy read before the lock was granted.
        match self
            .store
            .get(&self.admin_index, DEVICES_COLLECTION, &device.id)
            .await
        {
            Ok(document) => device.content = document.content()?,
            Err(StoreError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        let engine_id = device.content.engine_id.clone();
        let mut asset = self
            .try_get_linked_asset(engine_id.as_deref(), device.content.asset_id.as_deref())
            .await;
        let original_asset_metadata = asset
            .as_ref()
            .map(|asset| asset.content.metadata.clone())
            .unwrap_or_default();

        crate::model::merge_metadata(&mut device.content.metadata, &metadata);

        let measures = build::build_measures(device, asset.as_ref(), &measurements, &payload_uuids)?;
        let measures = self
            .bus
            .run_before(device, asset.as_mut(), engine_id.as_deref(), measures)
            .await?;

        build::update_embedded_measures(TwinKind::Device, &mut device.content.measures, &measures);
        if let Some(asset) = asset.as_mut() {
            build::update_embedded_measures(TwinKind::Asset, &mut asset.content.measures, &measures);
        }

        let options = UpdateOptions {
            retry_on_conflict: self.retry_on_conflict,
        };
        let device_body = encode(&format!("device \"{}\"", device.id), &device.content)?;
        let measure_bodies: Vec<Value> = measures
            .iter()
            .map(|measure| encode("measures", measure))
            .collect::<Result<_, _>>()?;
        let asset_body = match asset.as_ref() {
            Some(asset) => Some(encode(&format!("asset \"{}\"", asset.id), &asset.content)?),
            None => None,
        };

        // Writes are issued concurrently but all awaited before the after
        // events run; the first failure aborts with the failing entity named.
        // Committed siblings are not rolled back.
        let this = &*self;
        let device_id: &str = &device.id;
        let device_body = &device_body;
        let measure_bodies = &measure_bodies;
        let asset_ref = asset.as_ref();
        let asset_body = asset_body.as_ref();
        let built_measures = &measures;
        let before_metadata = &original_asset_metadata;
        let engine: Option<&str> = engine_id.as_deref();

        let mut writes: Vec<BoxFuture<'_, Result<(), IngestError>>> = Vec::new();

        writes.push(Box::pin(async move {
            this.store
                .update(
                    &this.admin_index,
                    DEVICES_COLLECTION,
                    device_id,
                    device_body,
                    options,
                )
                .await
                .map(|_| ())
                .map_err(|err| IngestError::persistence(format!("device \"{device_id}\""), err))
        }));

        if let Some(engine_id) = engine {
            writes.push(Box::pin(async move {
                this.store
                    .update(
                        engine_id,
                        DEVICES_COLLECTION,
                        device_id,
                        device_body,
                        options,
                    )
                    .await
                    .map(|_| ())
                    .map_err(|err| {
                        IngestError::persistence(format!("engine device \"{device_id}\""), err)
                    })
            }));

            writes.push(Box::pin(async move {
                let result = this
                    .store
                    .m_create(engine_id, MEASURES_COLLECTION, measure_bodies)
                    .await
                    .map_err(|err| IngestError::persistence("measures", err))?;
                if let Some(error) = result.errors.first() {
                    return Err(IngestError::persistence(
                        format!("measures[{}]", error.index),
                        &error.reason,
                    ));
                }
                Ok(())
            }));

            if let (Some(asset), Some(asset_body)) = (asset_ref, asset_body) {
                writes.push(Box::pin(async move {
                    let updated = this
                        .store
                        .update(engine_id, ASSETS_COLLECTION, &asset.id, asset_body, options)
                        .await
                        .map_err(|err| {
                            IngestError::persistence(format!("asset \"{}\"", asset.id), err)
                        })?;
                    let updated_asset = AssetDoc {
                        id: updated.id.clone(),
                        content: updated.content::<AssetContent>()?,
                    };

                    let event = build_history_event(
                        &updated_asset,
                        engine_id,
                        built_measures,
                        before_metadata,
                    );
                    if let Err(err) = this.history.add(&event, &updated_asset).await {
                        tracing::error!(
                            error = %err,
                            asset = %updated_asset.id,
                            "failed to dispatch asset history event"
                        );
                    }
                    Ok(())
                }));
            }
        }

        let results = future::join_all(writes).await;
        for result in results {
            result?;
        }

        self.bus
            .run_after(device, asset.as_ref(), engine_id.as_deref(), &measures)
            .await?;

        Ok(())
    }

    /// Push a single user-originated measure onto an asset.
    pub async fn register_by_asset(
        &self,
        engine_id: &str,
        asset_id: &str,
        measure: UserMeasure,
        user_id: &str,
    ) -> Result<AssetDoc, IngestError> {
        let key = format!("asset:{engine_id}:{asset_id}");
        self.locks
            .clone()
            .with_lock(&key, async {
                if measure.measure_type.trim().is_empty() {
                    return Err(IngestError::validation(format!(
                        "invalid measure for asset \"{asset_id}\": missing \"type\""
                    )));
                }
                if measure.name.trim().is_empty() {
                    return Err(IngestError::validation(format!(
                        "invalid measure for asset \"{asset_id}\": missing \"name\""
                    )));
                }
                if measure.values.is_empty() {
                    return Err(IngestError::validation(format!(
                        "invalid measure for asset \"{asset_id}\": missing \"values\""
                    )));
                }
                if self.registry.get(&measure.measure_type).is_none() {
                    return Err(IngestError::validation(format!(
                        "unknown measure type \"{}\"",
                        measure.measure_type
                    )));
                }

                let document = self.store.get(engine_id, ASSETS_COLLECTION, asset_id).await?;
                let mut asset = AssetDoc {
                    id: document.id.clone(),
                    content: document.content::<AssetContent>()?,
                };

                let record = MeasureRecord {
                    measure_type: measure.measure_type.clone(),
                    measured_at: measure
                        .measured_at
                        .unwrap_or_else(|| Utc::now().timestamp_millis()),
                    values: measure.values.clone(),
                    origin: MeasureOrigin {
                        origin_type: OriginType::User,
                        id: user_id.to_string(),
                        measure_name: measure.name.clone(),
                        payload_uuids: Vec::new(),
                        device_model: None,
                        reference: None,
                    },
                    asset: Some(AssetMeasureContext {
                        id: asset.id.clone(),
                        measure_name: Some(measure.name.clone()),
                        metadata: asset.content.metadata.clone(),
                        model: asset.content.model.clone(),
                        reference: asset.content.reference.clone(),
                    }),
                };
                build::update_embedded_measures(
                    TwinKind::Asset,
                    &mut asset.content.measures,
                    std::slice::from_ref(&record),
                );

                let partial = encode(
                    &format!("asset \"{}\"", asset.id),
                    &serde_json::json!({
                        "measures": serde_json::to_value(&asset.content.measures)
                            .map_err(|err| IngestError::persistence("asset measures", err))?,
                    }),
                )?;
                let record_body = encode("measure", &record)?;
                let options = UpdateOptions {
                    retry_on_conflict: self.retry_on_conflict,
                };

                let measure_id = Uuid::new_v4().to_string();
                let (updated, created) = futures::join!(
                    self.store
                        .update(engine_id, ASSETS_COLLECTION, &asset.id, &partial, options),
                    self.store.create(
                        engine_id,
                        MEASURES_COLLECTION,
                        &measure_id,
                        &record_body,
                    )
                );
                let updated = updated.map_err(|err| {
                    IngestError::persistence(format!("asset \"{}\"", asset.id), err)
                })?;
                created.map_err(|err| IngestError::persistence("measure", err))?;

                Ok(AssetDoc {
                    id: updated.id.clone(),
                    content: updated.content::<AssetContent>()?,
                })
            })
            .await
    }

    /// Fetch the asset a device claims to be linked to. Lookup failures are
    /// soft: the ingestion proceeds without asset context so a dangling
    /// assetId never blocks device-side updates.
    async fn try_get_linked_asset(
        &self,
        engine_id: Option<&str>,
        asset_id: Option<&str>,
    ) -> Option<AssetDoc> {
        let asset_id = asset_id.map(str::trim).filter(|id| !id.is_empty())?;
        let Some(engine_id) = engine_id else {
            tracing::error!(asset = %asset_id, "device references an asset but has no engine");
            return None;
        };

        let document = match self.store.get(engine_id, ASSETS_COLLECTION, asset_id).await {
            Ok(document) => document,
            Err(err) => {
                tracing::error!(
                    engine = %engine_id,
                    asset = %asset_id,
                    error = %err,
                    "cannot find linked asset"
                );
                return None;
            }
        };
        match document.content::<AssetContent>() {
            Ok(content) => Some(AssetDoc {
                id: document.id,
                content,
            }),
            Err(err) => {
                tracing::error!(
                    engine = %engine_id,
                    asset = %asset_id,
                    error = %err,
                    "linked asset document is malformed"
                );
                None
            }
        }
    }
}
