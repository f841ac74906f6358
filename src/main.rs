use anyhow::Result;
use helmet_presence::broadcast::Broadcaster;
use helmet_presence::config::Config;
use helmet_presence::mqtt;
use helmet_presence::presence::{
    AdmissionFilter, DebounceGate, OfflineSweeper, PresenceCache, PresenceEngine,
};
use helmet_presence::store::{self, PgPositionStore, PositionStore};
use futures::future;
use std::sync::Arc;
use tokio::sync::watch;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,helmet_presence=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "helmet-presence"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = store::build_pool(&config.database_url, config.db_pool_size).await?;
    let pg_store = PgPositionStore::new(pool);
    pg_store.ensure_schema().await?;
    let position_store: Arc<dyn PositionStore> = Arc::new(pg_store);

    // Every store is one long-lived instance owned here and handed out
    // by Arc; the engine and sweeper share them without globals.
    let cache = Arc::new(PresenceCache::new(config.cache_ttl()));
    let admission = Arc::new(AdmissionFilter::new(
        config.admission_threshold,
        config.admission_gap(),
        config.admission_idle_window(),
    ));
    let debounce = Arc::new(DebounceGate::new(
        config.alert_cooldown(),
        config.admission_idle_window(),
    ));
    let broadcaster = Arc::new(Broadcaster::new(config.broadcast_capacity));

    let engine = PresenceEngine::new(
        cache.clone(),
        admission.clone(),
        debounce.clone(),
        broadcaster.clone(),
        config.offline_threshold(),
        config.health_thresholds(),
    );

    let sweeper = Arc::new(OfflineSweeper::new(
        cache,
        admission,
        debounce,
        broadcaster,
        position_store,
        config.offline_threshold(),
        config.health_thresholds(),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper_handle = sweeper.spawn(config.sweep_interval(), stop_rx);

    let mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let engine_clone = engine.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, engine_clone).await
        }))
    } else {
        None
    };

    tokio::select! {
        _ = async {
            if let Some(handle) = mqtt_handle {
                if let Err(err) = handle.await {
                    tracing::warn!(error = %err, "MQTT task failed");
                }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Let an in-flight sweep finish its pass; aborting mid-persist
    // could leave an episode claimed but unwritten.
    let _ = stop_tx.send(true);
    let _ = sweeper_handle.await;

    Ok(())
}
