use super::*;
use crate::error::IngestError;
use crate::model::{
    AssetContent, AssetDoc, AssetMeasureContext, DeviceContent, DeviceDoc, DeviceLink,
    MeasureNameLink, MeasureOrigin, MeasureRecord, Measurement, Metadata, OriginType,
};
use crate::store::MemoryStore;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const ADMIN_INDEX: &str = "device-manager";
const ENGINE_INDEX: &str = "engine-kuzzle";

fn obj(value: serde_json::Value) -> Metadata {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn device_content(asset_id: Option<&str>) -> DeviceContent {
    DeviceContent {
        model: "DummyTemp".to_string(),
        reference: "linked1".to_string(),
        engine_id: Some(ENGINE_INDEX.to_string()),
        asset_id: asset_id.map(str::to_string),
        metadata: obj(json!({"color": "red"})),
        measures: HashMap::new(),
    }
}

fn asset_content() -> AssetContent {
    AssetContent {
        model: "Container".to_string(),
        reference: "linked1".to_string(),
        metadata: obj(json!({"height": 11, "trailer": {"capacity": 100}})),
        measures: HashMap::new(),
        linked_devices: vec![DeviceLink {
            device_id: "DummyTemp-linked1".to_string(),
            measure_names: vec![MeasureNameLink {
                device: "temperature".to_string(),
                asset: "temperatureExt".to_string(),
            }],
        }],
    }
}

fn temperature(measured_at: i64, degrees: f64) -> Measurement {
    Measurement {
        measure_name: "temperature".to_string(),
        measure_type: "temperature".to_string(),
        measured_at,
        values: obj(json!({"temperature": degrees})),
    }
}

struct Fixture {
    store: Arc<MemoryStore>,
    ingestor: MeasureIngestor,
    device: DeviceDoc,
}

async fn fixture_with_bus(bus: EventBus, asset: Option<AssetContent>) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let device = DeviceDoc {
        id: "DummyTemp-linked1".to_string(),
        content: device_content(asset.as_ref().map(|_| "Container-linked1")),
    };

    let device_body = serde_json::to_value(&device.content).unwrap();
    store
        .create(ADMIN_INDEX, DEVICES_COLLECTION, &device.id, &device_body)
        .await
        .unwrap();
    store
        .create(ENGINE_INDEX, DEVICES_COLLECTION, &device.id, &device_body)
        .await
        .unwrap();
    if let Some(asset) = &asset {
        store
            .create(
                ENGINE_INDEX,
                ASSETS_COLLECTION,
                "Container-linked1",
                &serde_json::to_value(asset).unwrap(),
            )
            .await
            .unwrap();
    }

    let history = Arc::new(StoreHistorySink::new(store.clone(), HISTORY_COLLECTION));
    let ingestor = MeasureIngestor::new(
        store.clone(),
        Arc::new(bus),
        history,
        Arc::new(crate::measures::MeasureRegistry::with_defaults()),
        ADMIN_INDEX,
        Duration::from_secs(5),
        10,
    );

    Fixture {
        store,
        ingestor,
        device,
    }
}

async fn fixture(asset: Option<AssetContent>) -> Fixture {
    fixture_with_bus(EventBus::new(), asset).await
}

async fn stored_measures(store: &MemoryStore) -> Vec<MeasureRecord> {
    store
        .search(ENGINE_INDEX, MEASURES_COLLECTION, &json!({}))
        .await
        .unwrap()
        .hits
        .iter()
        .map(|hit| hit.content::<MeasureRecord>().unwrap())
        .collect()
}

async fn stored_asset(store: &MemoryStore) -> AssetContent {
    store
        .get(ENGINE_INDEX, ASSETS_COLLECTION, "Container-linked1")
        .await
        .unwrap()
        .content::<AssetContent>()
        .unwrap()
}

#[tokio::test]
async fn linked_device_ingestion_updates_twins_log_and_history() {
    let mut fixture = fixture(Some(asset_content())).await;

    fixture
        .ingestor
        .ingest(
            &mut fixture.device,
            vec![temperature(1700000000000, 42.2)],
            obj(json!({"color": "blue"})),
            vec!["payload-uuid-1".to_string()],
        )
        .await
        .unwrap();

    // Measure log carries the resolved asset-side name and the payload trace.
    let measures = stored_measures(&fixture.store).await;
    assert_eq!(measures.len(), 1);
    let record = &measures[0];
    assert_eq!(record.origin.origin_type, OriginType::Device);
    assert_eq!(record.origin.measure_name, "temperature");
    assert_eq!(record.origin.payload_uuids, vec!["payload-uuid-1"]);
    let context = record.asset.as_ref().unwrap();
    assert_eq!(context.measure_name.as_deref(), Some("temperatureExt"));

    // Asset snapshot lands under the asset-side name.
    let asset = stored_asset(&fixture.store).await;
    let snapshot = &asset.measures["temperatureExt"];
    assert_eq!(snapshot.values["temperature"], 42.2);
    assert_eq!(snapshot.measured_at, 1700000000000);

    // Both device copies got the merged metadata and the device-side snapshot.
    for index in [ADMIN_INDEX, ENGINE_INDEX] {
        let stored = fixture
            .store
            .get(index, DEVICES_COLLECTION, "DummyTemp-linked1")
            .await
            .unwrap()
            .content::<DeviceContent>()
            .unwrap();
        assert_eq!(stored.metadata["color"], "blue");
        assert_eq!(stored.measures["temperature"].values["temperature"], 42.2);
    }

    let history = fixture
        .store
        .search(ENGINE_INDEX, HISTORY_COLLECTION, &json!({}))
        .await
        .unwrap();
    assert_eq!(history.total, 1);
    let event = &history.hits[0].source["event"];
    assert_eq!(event["name"], "measure");
    assert_eq!(event["assetId"], "Container-linked1");
    assert_eq!(event["measure"]["names"], json!(["temperatureExt"]));
}

#[tokio::test]
async fn stale_batch_is_logged_but_does_not_rewind_snapshots() {
    let mut fixture = fixture(Some(asset_content())).await;

    fixture
        .ingestor
        .ingest(
            &mut fixture.device,
            vec![temperature(2000, 25.0)],
            Metadata::new(),
            Vec::new(),
        )
        .await
        .unwrap();
    fixture
        .ingestor
        .ingest(
            &mut fixture.device,
            vec![temperature(1000, -3.0)],
            Metadata::new(),
            Vec::new(),
        )
        .await
        .unwrap();

    // The log is append-only even for out-of-order data.
    assert_eq!(stored_measures(&fixture.store).await.len(), 2);

    let asset = stored_asset(&fixture.store).await;
    assert_eq!(asset.measures["temperatureExt"].measured_at, 2000);
    assert_eq!(asset.measures["temperatureExt"].values["temperature"], 25.0);
    assert_eq!(fixture.device.content.measures["temperature"].measured_at, 2000);
}

#[tokio::test]
async fn unknown_measure_type_rejects_the_batch_without_writes() {
    let mut fixture = fixture(Some(asset_content())).await;
    let mut bogus = temperature(1000, 1.0);
    bogus.measure_type = "gps".to_string();

    let err = fixture
        .ingestor
        .ingest(
            &mut fixture.device,
            vec![temperature(1000, 1.0), bogus],
            Metadata::new(),
            Vec::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Validation(_)));
    assert!(err.to_string().contains("unknown measure type \"gps\""));

    assert!(stored_measures(&fixture.store).await.is_empty());
    let asset = stored_asset(&fixture.store).await;
    assert!(asset.measures.is_empty());
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let mut fixture = fixture(None).await;

    fixture
        .ingestor
        .ingest(&mut fixture.device, Vec::new(), Metadata::new(), Vec::new())
        .await
        .unwrap();

    assert!(stored_measures(&fixture.store).await.is_empty());
}

struct Overlap {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl MeasureProcessor for Overlap {
    async fn process_before(
        &self,
        _device: &mut DeviceDoc,
        _asset: Option<&mut AssetDoc>,
        measures: Vec<MeasureRecord>,
    ) -> anyhow::Result<Vec<MeasureRecord>> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(measures)
    }
}

#[tokio::test]
async fn concurrent_ingestions_for_one_device_are_serialized() {
    let probe = Arc::new(Overlap {
        active: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let mut bus = EventBus::new();
    bus.register(probe.clone());
    let fixture = fixture_with_bus(bus, None).await;

    let first = {
        let ingestor = fixture.ingestor.clone();
        let mut device = fixture.device.clone();
        tokio::spawn(async move {
            ingestor
                .ingest(
                    &mut device,
                    vec![temperature(1000, 1.0)],
                    Metadata::new(),
                    Vec::new(),
                )
                .await
        })
    };
    let second = {
        let ingestor = fixture.ingestor.clone();
        let mut device = fixture.device.clone();
        tokio::spawn(async move {
            ingestor
                .ingest(
                    &mut device,
                    vec![temperature(2000, 2.0)],
                    Metadata::new(),
                    Vec::new(),
                )
                .await
        })
    };

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
    assert_eq!(stored_measures(&fixture.store).await.len(), 2);

    // Whichever ingestion ran last merged onto the other's persisted
    // snapshot, so the stored twin holds the later timestamp either way.
    let stored = fixture
        .store
        .get(ADMIN_INDEX, DEVICES_COLLECTION, "DummyTemp-linked1")
        .await
        .unwrap()
        .content::<DeviceContent>()
        .unwrap();
    assert_eq!(stored.measures["temperature"].measured_at, 2000);
    assert_eq!(stored.measures["temperature"].values["temperature"], 2.0);
}

struct Synthesizer;

#[async_trait]
impl MeasureProcessor for Synthesizer {
    async fn process_before(
        &self,
        device: &mut DeviceDoc,
        asset: Option<&mut AssetDoc>,
        mut measures: Vec<MeasureRecord>,
    ) -> anyhow::Result<Vec<MeasureRecord>> {
        let source = measures
            .first()
            .ok_or_else(|| anyhow::anyhow!("expected at least one measure"))?;
        let values = obj(json!({
            "temperature": source.values["temperature"].as_f64().unwrap_or(0.0) * 1.8 + 32.0,
        }));
        measures.push(MeasureRecord {
            measure_type: "temperature".to_string(),
            measured_at: source.measured_at,
            values,
            origin: MeasureOrigin {
                origin_type: OriginType::Computed,
                id: "fahrenheit-converter".to_string(),
                measure_name: "temperatureF".to_string(),
                payload_uuids: Vec::new(),
                device_model: Some(device.content.model.clone()),
                reference: Some(device.content.reference.clone()),
            },
            asset: asset.map(|asset| AssetMeasureContext {
                id: asset.id.clone(),
                measure_name: Some("temperatureFahrenheit".to_string()),
                metadata: asset.content.metadata.clone(),
                model: asset.content.model.clone(),
                reference: asset.content.reference.clone(),
            }),
        });
        Ok(measures)
    }
}

#[tokio::test]
async fn before_subscriber_can_add_computed_measures() {
    let mut bus = EventBus::new();
    bus.register(Arc::new(Synthesizer));
    let mut fixture = fixture_with_bus(bus, Some(asset_content())).await;

    fixture
        .ingestor
        .ingest(
            &mut fixture.device,
            vec![temperature(1000, 10.0)],
            Metadata::new(),
            Vec::new(),
        )
        .await
        .unwrap();

    let measures = stored_measures(&fixture.store).await;
    assert_eq!(measures.len(), 2);
    assert!(measures
        .iter()
        .any(|record| record.origin.origin_type == OriginType::Computed));

    let asset = stored_asset(&fixture.store).await;
    assert_eq!(asset.measures["temperatureExt"].values["temperature"], 10.0);
    assert_eq!(
        asset.measures["temperatureFahrenheit"].values["temperature"],
        50.0
    );
    assert_eq!(
        fixture.device.content.measures["temperatureF"].values["temperature"],
        50.0
    );
}

struct MetadataStamper;

#[async_trait]
impl MeasureProcessor for MetadataStamper {
    async fn process_before(
        &self,
        _device: &mut DeviceDoc,
        asset: Option<&mut AssetDoc>,
        measures: Vec<MeasureRecord>,
    ) -> anyhow::Result<Vec<MeasureRecord>> {
        if let Some(asset) = asset {
            asset
                .content
                .metadata
                .insert("lastSeen".to_string(), json!(1700000000000i64));
            if let Some(serde_json::Value::Object(trailer)) =
                asset.content.metadata.get_mut("trailer")
            {
                trailer.insert("capacity".to_string(), json!(200));
            }
        }
        Ok(measures)
    }
}

#[tokio::test]
async fn metadata_changes_are_reported_in_the_history_event() {
    let mut bus = EventBus::new();
    bus.register(Arc::new(MetadataStamper));
    let mut fixture = fixture_with_bus(bus, Some(asset_content())).await;

    fixture
        .ingestor
        .ingest(
            &mut fixture.device,
            vec![temperature(1000, 3.0)],
            Metadata::new(),
            Vec::new(),
        )
        .await
        .unwrap();

    let history = fixture
        .store
        .search(ENGINE_INDEX, HISTORY_COLLECTION, &json!({}))
        .await
        .unwrap();
    assert_eq!(history.total, 1);
    let event = &history.hits[0].source["event"];
    let mut names: Vec<String> = event["metadata"]["names"]
        .as_array()
        .unwrap()
        .iter()
        .map(|name| name.as_str().unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["lastSeen", "trailer.capacity"]);
}

#[tokio::test]
async fn failing_before_subscriber_aborts_before_any_write() {
    struct Rejector;

    #[async_trait]
    impl MeasureProcessor for Rejector {
        async fn process_before(
            &self,
            _device: &mut DeviceDoc,
            _asset: Option<&mut AssetDoc>,
            _measures: Vec<MeasureRecord>,
        ) -> anyhow::Result<Vec<MeasureRecord>> {
            anyhow::bail!("quarantined device")
        }
    }

    let mut bus = EventBus::new();
    bus.register(Arc::new(Rejector));
    let mut fixture = fixture_with_bus(bus, Some(asset_content())).await;

    let err = fixture
        .ingestor
        .ingest(
            &mut fixture.device,
            vec![temperature(1000, 1.0)],
            Metadata::new(),
            Vec::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Enrichment(_)));
    assert!(stored_measures(&fixture.store).await.is_empty());
    assert!(stored_asset(&fixture.store).await.measures.is_empty());
}

#[tokio::test]
async fn dangling_asset_reference_degrades_to_device_only() {
    let mut fixture = fixture(None).await;
    fixture.device.content.asset_id = Some("Container-ghost".to_string());
    // Keep the stored copies consistent with the in-memory doc.
    let body = serde_json::to_value(&fixture.device.content).unwrap();
    for index in [ADMIN_INDEX, ENGINE_INDEX] {
        fixture
            .store
            .update(
                index,
                DEVICES_COLLECTION,
                &fixture.device.id,
                &body,
                Default::default(),
            )
            .await
            .unwrap();
    }

    fixture
        .ingestor
        .ingest(
            &mut fixture.device,
            vec![temperature(1000, 7.0)],
            Metadata::new(),
            Vec::new(),
        )
        .await
        .unwrap();

    let measures = stored_measures(&fixture.store).await;
    assert_eq!(measures.len(), 1);
    assert!(measures[0].asset.is_none());
    assert_eq!(fixture.device.content.measures["temperature"].values["temperature"], 7.0);
}

#[tokio::test]
async fn failed_engine_write_names_the_entity_and_keeps_committed_siblings() {
    let store = Arc::new(MemoryStore::new());
    let mut device = DeviceDoc {
        id: "DummyTemp-linked1".to_string(),
        content: device_content(None),
    };
    // The engine-index copy of the device is deliberately missing, so its
    // update is the one write in the batch that fails.
    store
        .create(
            ADMIN_INDEX,
            DEVICES_COLLECTION,
            &device.id,
            &serde_json::to_value(&device.content).unwrap(),
        )
        .await
        .unwrap();

    let ingestor = MeasureIngestor::new(
        store.clone(),
        Arc::new(EventBus::new()),
        Arc::new(StoreHistorySink::new(store.clone(), HISTORY_COLLECTION)),
        Arc::new(crate::measures::MeasureRegistry::with_defaults()),
        ADMIN_INDEX,
        Duration::from_secs(5),
        10,
    );

    let err = ingestor
        .ingest(
            &mut device,
            vec![temperature(1000, 5.0)],
            Metadata::new(),
            Vec::new(),
        )
        .await
        .unwrap_err();

    match err {
        IngestError::Persistence { entity, .. } => {
            assert_eq!(entity, "engine device \"DummyTemp-linked1\"");
        }
        other => panic!("expected a persistence error, got {other}"),
    }

    // Sibling writes stay committed; a failed ingestion is partially applied
    // and safe to retry, never rolled back.
    assert_eq!(stored_measures(&store).await.len(), 1);
    let admin = store
        .get(ADMIN_INDEX, DEVICES_COLLECTION, "DummyTemp-linked1")
        .await
        .unwrap()
        .content::<DeviceContent>()
        .unwrap();
    assert_eq!(admin.measures["temperature"].values["temperature"], 5.0);
}

#[tokio::test]
async fn user_measure_lands_on_the_asset() {
    let fixture = fixture(Some(asset_content())).await;

    let updated = fixture
        .ingestor
        .register_by_asset(
            ENGINE_INDEX,
            "Container-linked1",
            UserMeasure {
                name: "manualWeight".to_string(),
                measure_type: "battery".to_string(),
                measured_at: Some(1700000000000),
                values: obj(json!({"battery": 87})),
            },
            "user-ayse",
        )
        .await
        .unwrap();

    assert_eq!(updated.content.measures["manualWeight"].measured_at, 1700000000000);

    let stored = stored_asset(&fixture.store).await;
    assert_eq!(stored.measures["manualWeight"].values["battery"], 87);

    let measures = stored_measures(&fixture.store).await;
    assert_eq!(measures.len(), 1);
    assert_eq!(measures[0].origin.origin_type, OriginType::User);
    assert_eq!(measures[0].origin.id, "user-ayse");
}

#[tokio::test]
async fn user_measure_with_unknown_type_is_rejected() {
    let fixture = fixture(Some(asset_content())).await;

    let err = fixture
        .ingestor
        .register_by_asset(
            ENGINE_INDEX,
            "Container-linked1",
            UserMeasure {
                name: "manualWeight".to_string(),
                measure_type: "weight".to_string(),
                measured_at: None,
                values: obj(json!({"weight": 12})),
            },
            "user-ayse",
        )
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Validation(_)));
    assert!(stored_measures(&fixture.store).await.is_empty());
}
