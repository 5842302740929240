mod config;
mod error;
mod ingest;
mod measures;
mod model;
mod mqtt;
mod payload;
mod store;

use crate::config::Config;
use crate::ingest::{EventBus, MeasureIngestor, StoreHistorySink, HISTORY_COLLECTION};
use crate::measures::MeasureRegistry;
use crate::payload::{JsonDecoder, PayloadService};
use crate::store::{build_pool, DocumentStore, PostgresStore};
use anyhow::Result;
use futures::future;
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,twin_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer = install_otlp_tracer(endpoint)?;
            registry
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()?;
        }
        None => registry.try_init()?,
    }
    Ok(())
}

fn install_otlp_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};

    // The OTLP http exporter wants the full traces path, not the base URL.
    let trimmed = endpoint.trim().trim_end_matches('/');
    let endpoint = if trimmed.contains("/v1/traces") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1/traces")
    };

    let exporter = opentelemetry_otlp::new_exporter()
        .http()
        .with_endpoint(endpoint);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
            KeyValue::new("service.name", "twin-ingest"),
        ])))
        .install_batch(Tokio)?;
    Ok(tracer)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    let postgres = PostgresStore::new(pool);
    postgres.ensure_schema().await?;
    let store: Arc<dyn DocumentStore> = Arc::new(postgres);

    let registry = Arc::new(MeasureRegistry::with_defaults());
    let bus = Arc::new(EventBus::new());
    let history = Arc::new(StoreHistorySink::new(store.clone(), HISTORY_COLLECTION));
    let ingestor = MeasureIngestor::new(
        store.clone(),
        bus,
        history,
        registry,
        config.admin_index.clone(),
        config.lock_timeout(),
        config.retry_on_conflict,
    );

    let mut service = PayloadService::new(store, ingestor, config.admin_index.clone());
    service.register_decoder("DummyTemp", Arc::new(JsonDecoder));
    service.register_decoder("DummyTempPosition", Arc::new(JsonDecoder));
    let service = Arc::new(service);

    let mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let service_clone = service.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, service_clone).await
        }))
    } else {
        None
    };

    tokio::select! {
        _ = async {
            if let Some(handle) = mqtt_handle {
                if let Err(err) = handle.await { tracing::warn!(error=%err, "MQTT task failed"); }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}
