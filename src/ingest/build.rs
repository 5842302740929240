use crate::error::IngestError;
use crate::model::{
    AssetDoc, AssetMeasureContext, DeviceDoc, MeasureOrigin, MeasureRecord, MeasureSnapshot,
    Measurement, OriginType,
};
use std::collections::HashMap;

/// Which side of a device-asset link a snapshot merge targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TwinKind {
    Device,
    Asset,
}

/// Resolve the asset-side measure name for a device measure.
///
/// Returns `Ok(None)` when the device has no asset, or when the link exists
/// but does not map this particular measure name (device-only by design).
/// A device pointing at an asset that has no link entry for it is a
/// configuration error and fails the ingestion.
pub(crate) fn find_asset_measure_name(
    device: &DeviceDoc,
    asset: Option<&AssetDoc>,
    device_measure_name: &str,
) -> Result<Option<String>, IngestError> {
    let Some(asset) = asset else {
        return Ok(None);
    };

    let link = asset
        .content
        .linked_devices
        .iter()
        .find(|link| link.device_id == device.id)
        .ok_or_else(|| IngestError::LinkInconsistency {
            device_id: device.id.clone(),
            asset_id: asset.id.clone(),
        })?;

    Ok(link
        .measure_names
        .iter()
        .find(|names| names.device == device_measure_name)
        .map(|names| names.asset.clone()))
}

/// Build the measure records to persist. Pure transformation, no I/O;
/// output order matches input order.
pub(crate) fn build_measures(
    device: &DeviceDoc,
    asset: Option<&AssetDoc>,
    measurements: &[Measurement],
    payload_uuids: &[String],
) -> Result<Vec<MeasureRecord>, IngestError> {
    let mut measures = Vec::with_capacity(measurements.len());

    for measurement in measurements {
        let asset_measure_name =
            find_asset_measure_name(device, asset, &measurement.measure_name)?;

        measures.push(MeasureRecord {
            measure_type: measurement.measure_type.clone(),
            measured_at: measurement.measured_at,
            values: measurement.values.clone(),
            origin: MeasureOrigin {
                origin_type: OriginType::Device,
                id: device.id.clone(),
                measure_name: measurement.measure_name.clone(),
                payload_uuids: payload_uuids.to_vec(),
                device_model: Some(device.content.model.clone()),
                reference: Some(device.content.reference.clone()),
            },
            asset: asset.map(|asset| AssetMeasureContext {
                id: asset.id.clone(),
                measure_name: asset_measure_name,
                metadata: asset.content.metadata.clone(),
                model: asset.content.model.clone(),
                reference: asset.content.reference.clone(),
            }),
        });
    }

    Ok(measures)
}

/// Merge measure records into a twin's embedded snapshots.
///
/// Newest wins: a record only overwrites the stored snapshot for its name
/// when its `measuredAt` is strictly greater, so replays with the same or
/// older data are no-ops. Records without an asset-side name are skipped for
/// asset targets.
pub(crate) fn update_embedded_measures(
    kind: TwinKind,
    snapshots: &mut HashMap<String, MeasureSnapshot>,
    records: &[MeasureRecord],
) {
    for record in records {
        let measure_name = match kind {
            TwinKind::Device => Some(record.origin.measure_name.as_str()),
            TwinKind::Asset => record
                .asset
                .as_ref()
                .and_then(|asset| asset.measure_name.as_deref()),
        };
        let Some(measure_name) = measure_name else {
            continue;
        };

        if let Some(previous) = snapshots.get(measure_name) {
            if previous.measured_at >= record.measured_at {
                continue;
            }
        }

        snapshots.insert(
            measure_name.to_string(),
            MeasureSnapshot {
                name: measure_name.to_string(),
                measure_type: record.measure_type.clone(),
                measured_at: record.measured_at,
                values: record.values.clone(),
                payload_uuids: record.origin.payload_uuids.clone(),
            },
        );
    }
}
