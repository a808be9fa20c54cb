//! Access engine - vehicle access matching and fraud classification
//!
//! Matches plate detections against a cached vehicle registry, classifies
//! each one VALID or SUSPICIOUS, and fans the ordered result stream out to
//! live subscribers, rolling aggregates and the access-log store.
//!
//! Module structure:
//! - `domain/` - Core business types (Detection, Verdict, ClassifiedEvent)
//! - `io/` - External interfaces (MQTT, registry sources, sinks, TCP, HTTP)
//! - `services/` - Business logic (Engine, Registry, Dispatcher, Aggregator)
//! - `infra/` - Infrastructure (Config, Metrics)

use access_engine::domain::Seq;
use access_engine::infra::{Config, Metrics, RegistrySourceKind, SinkKind};
use access_engine::io::{
    start_http_server, start_subscriber_listener, FileRegistrySource, HttpRegistrySource,
    HttpSink, HttpState, JsonlSink, MqttEgress,
};
use access_engine::services::{
    create_persist_worker, create_registry_refresher, Engine, EngineSettings, PersistSink,
    Registry, RegistrySource, RetryPolicy,
};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Vehicle access matching and fraud-classification engine
#[derive(Parser, Debug)]
#[command(name = "access-engine", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

/// How long shutdown waits for the persist worker to flush
const PERSIST_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

fn init_logging(json: bool) {
    // Default: INFO, use RUST_LOG=debug for per-detection visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_registry_source(config: &Config) -> anyhow::Result<Arc<dyn RegistrySource>> {
    let source: Arc<dyn RegistrySource> = match config.registry_source() {
        RegistrySourceKind::File => Arc::new(FileRegistrySource::new(config.registry_file())),
        RegistrySourceKind::Http => Arc::new(
            HttpRegistrySource::from_config(config).context("invalid [registry] section")?,
        ),
    };
    Ok(source)
}

/// Build the sink and the last sequence it already holds
fn build_sink(config: &Config) -> anyhow::Result<Option<(Arc<dyn PersistSink>, Seq)>> {
    let (sink, last): (Arc<dyn PersistSink>, Seq) = match config.sink() {
        SinkKind::Jsonl => {
            let sink = JsonlSink::new(config.persist_file());
            let last = sink.last_sequence();
            (Arc::new(sink), last)
        }
        SinkKind::Http => {
            let sink = HttpSink::from_config(config).context("invalid [persistence] section")?;
            (Arc::new(sink), Seq::ZERO)
        }
        SinkKind::None => return Ok(None),
    };
    Ok(Some((sink, last)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    info!("access-engine starting");

    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_enabled = %config.mqtt_enabled(),
        mqtt_host = %config.mqtt_host(),
        detections_topic = %config.detections_topic(),
        registry_source = ?config.registry_source(),
        sink = ?config.sink(),
        bucket_width_ms = %config.bucket_width_ms(),
        queue_capacity = %config.queue_capacity(),
        http_port = %config.http_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Registry: initial load, then background refresh
    let registry = Arc::new(Registry::new());
    let source = build_registry_source(&config)?;
    match registry.refresh_from(source.as_ref(), config.registry_fetch_timeout()).await {
        Ok(count) => {
            metrics.record_registry_refresh(count);
            info!(source = %source.name(), vehicles = %count, "registry_loaded");
        }
        Err(e) => {
            metrics.record_registry_refresh_failed();
            warn!(source = %source.name(), error = %e, "registry_initial_load_failed");
        }
    }
    let (refresh_trigger, refresher) = create_registry_refresher(
        registry.clone(),
        source,
        config.registry_refresh_interval(),
        config.registry_fetch_timeout(),
        metrics.clone(),
    );
    tokio::spawn(refresher.run(shutdown_rx.clone()));

    // Persistence
    let (persist_tx, persist_handle, start_after) = match build_sink(&config)? {
        Some((sink, last_seq)) => {
            let policy = RetryPolicy {
                initial: config.retry_initial(),
                max: config.retry_max(),
                unhealthy_after: config.unhealthy_after(),
            };
            let (tx, worker) = create_persist_worker(sink, policy, metrics.clone());
            let handle = tokio::spawn(worker.run(shutdown_rx.clone()));
            (Some(tx), Some(handle), last_seq)
        }
        None => {
            warn!("persistence_disabled");
            (None, None, Seq::ZERO)
        }
    };
    if start_after > Seq::ZERO {
        info!(last_seq = %start_after, "sequence_recovered");
    }

    let engine = Engine::new(
        EngineSettings::from_config(&config, start_after),
        registry,
        persist_tx,
        metrics.clone(),
    );

    tokio::spawn(engine.dispatcher().clone().run_pump(config.pump_interval(), shutdown_rx.clone()));

    if config.recompute_on_reload() {
        tokio::spawn(engine.clone().run_recompute_on_reload(shutdown_rx.clone()));
    }

    // Detection payloads (bounded for backpressure)
    let (payload_tx, payload_rx) = mpsc::channel::<String>(1000);

    if config.mqtt_enabled() {
        let mqtt_config = config.clone();
        let mqtt_tx = payload_tx.clone();
        let mqtt_trigger = refresh_trigger.clone();
        let mqtt_metrics = metrics.clone();
        let mqtt_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = access_engine::io::mqtt::start_mqtt_client(
                &mqtt_config,
                mqtt_tx,
                Some(mqtt_trigger),
                mqtt_metrics,
                mqtt_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "mqtt_client_error");
            }
        });
    }

    if config.listener_enabled() {
        let listener_engine = engine.clone();
        let port = config.listener_port();
        let listener_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_subscriber_listener(port, listener_engine, listener_shutdown).await
            {
                tracing::error!(error = %e, "subscriber_listener_error");
            }
        });
    }

    // HTTP server (if port > 0)
    let http_port = config.http_port();
    if http_port > 0 {
        let state = HttpState {
            engine: engine.clone(),
            refresh: Some(refresh_trigger.clone()),
            site_id: config.site_id().to_string(),
        };
        let http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_http_server(http_port, state, http_shutdown).await {
                tracing::error!(error = %e, "http_server_error");
            }
        });
    }

    if config.mqtt_egress_enabled() {
        let egress = MqttEgress::new(&config, engine.clone());
        tokio::spawn(egress.run(shutdown_rx.clone()));
    }

    // Metrics reporter
    let reporter_metrics = metrics.clone();
    let metrics_interval = Duration::from_secs(config.metrics_interval_secs().max(1));
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(metrics_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => reporter_metrics.report().log(),
                result = reporter_shutdown.changed() => {
                    if result.is_err() || *reporter_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Runs until shutdown; payload_tx stays alive here so the channel only
    // closes once every producer is gone
    engine.clone().run(payload_rx, config.delta_interval(), shutdown_rx).await;
    drop(payload_tx);

    if let Some(handle) = persist_handle {
        if tokio::time::timeout(PERSIST_FLUSH_TIMEOUT, handle).await.is_err() {
            warn!(backlog = %metrics.persist_backlog(), "persist_flush_timed_out");
        }
    }

    metrics.snapshot().log();
    info!(last_seq = %engine.last_seq(), "access-engine shutdown complete");
    Ok(())
}
