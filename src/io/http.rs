//! HTTP endpoint for metrics, health and queries
//!
//! - `GET /metrics` - Prometheus text format
//! - `GET /health` - JSON health report, 503 while degraded
//! - `GET /aggregates?from=&to=` - aggregate buckets overlapping the range
//! - `GET /events?after=&limit=&classification=` - retained classified events
//! - `POST /registry/refresh` - invalidate the registry snapshot
//!
//! Uses hyper for the HTTP server.

use crate::domain::access_log::Classification;
use crate::domain::types::Seq;
use crate::infra::metrics::{HistogramSnapshot, MetricsSummary, METRICS_BUCKET_BOUNDS};
use crate::services::engine::Engine;
use crate::services::registry::RefreshTrigger;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 1000;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(output: &mut String, name: &str, help: &str, site: &str, hist: &HistogramSnapshot) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += hist.buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += hist.buckets[METRICS_BUCKET_BOUNDS.len()];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {}", hist.sum_us);
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {}", hist.count);
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(summary: &MetricsSummary, site: &str) -> String {
    use MetricType::{Counter, Gauge};

    let mut output = String::with_capacity(4096);
    let o = &mut output;

    write_metric(o, "access_detections_total", "Detections classified", Counter, site, summary.detections_total);
    write_metric(o, "access_malformed_total", "Detections rejected at ingestion", Counter, site, summary.malformed_total);
    write_metric(o, "access_valid_total", "Detections classified VALID", Counter, site, summary.valid_total);
    write_metric(o, "access_plate_unknown_total", "Suspicious: plate not registered", Counter, site, summary.plate_unknown_total);
    write_metric(o, "access_color_mismatch_total", "Suspicious: color differs from registry", Counter, site, summary.color_mismatch_total);
    write_histogram(o, "access_ingest_latency_us", "Match and classify latency in microseconds", site, &summary.ingest_latency);

    write_metric(o, "access_persisted_total", "Access-log rows written", Counter, site, summary.persisted_total);
    write_metric(o, "access_persist_failures_total", "Failed access-log write attempts", Counter, site, summary.persist_failures_total);
    write_metric(o, "access_persist_backlog", "Events waiting to be persisted", Gauge, site, summary.persist_backlog);
    write_metric(o, "access_persist_unhealthy", "1 while persistence is failing", Gauge, site, summary.persist_unhealthy as u64);
    write_histogram(o, "access_persist_latency_us", "Access-log write latency in microseconds", site, &summary.persist_latency);

    write_metric(o, "access_registry_refresh_ok_total", "Successful registry refreshes", Counter, site, summary.registry_refresh_ok);
    write_metric(o, "access_registry_refresh_failed_total", "Failed registry refreshes", Counter, site, summary.registry_refresh_failed);
    write_metric(o, "access_registry_refresh_superseded_total", "Registry refreshes abandoned for a newer one", Counter, site, summary.registry_refresh_superseded);
    write_metric(o, "access_registry_size", "Vehicles in the current snapshot", Gauge, site, summary.registry_size);
    write_metric(o, "access_registry_stale", "1 while the registry snapshot is stale", Gauge, site, summary.registry_stale as u64);

    write_metric(o, "access_subscribers_active", "Connected subscribers", Gauge, site, summary.subscribers_active);
    write_metric(o, "access_subscriber_overflows_total", "Subscriber queues that filled up", Counter, site, summary.subscriber_overflows);
    write_metric(o, "access_subscriber_closes_total", "Subscribers closed after the drain grace period", Counter, site, summary.subscriber_closes);
    write_metric(o, "access_subscriber_recoveries_total", "Draining subscribers that caught up", Counter, site, summary.subscriber_recoveries);
    write_metric(o, "access_aggregate_deltas_skipped_total", "Aggregate deltas skipped on full queues", Counter, site, summary.aggregate_deltas_skipped);
    write_metric(o, "access_mqtt_messages_dropped_total", "MQTT detections dropped on a full channel", Counter, site, summary.mqtt_messages_dropped);

    output
}

/// Value of `key` in a raw query string
pub fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (k == key).then_some(v)
    })
}

fn parse_param<T: std::str::FromStr>(query: Option<&str>, key: &str, default: T) -> Result<T, String> {
    match query_param(query, key) {
        None | Some("") => Ok(default),
        Some(raw) => raw.parse().map_err(|_| format!("invalid {key}: {raw}")),
    }
}

/// Shared state for request handlers
pub struct HttpState {
    pub engine: Arc<Engine>,
    pub refresh: Option<RefreshTrigger>,
    pub site_id: String,
}

/// Handler result before it becomes a hyper response
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl Reply {
    fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self { status, content_type: "application/json", body },
            Err(e) => Self::error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        }
    }

    fn error(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: serde_json::json!({ "ok": false, "error": message }).to_string(),
        }
    }

    fn into_response(self) -> Response<Full<Bytes>> {
        Response::builder()
            .status(self.status)
            .header("Content-Type", self.content_type)
            .header("Access-Control-Allow-Origin", "*")
            .body(Full::new(Bytes::from(self.body)))
            .expect("static response should not fail")
    }
}

#[derive(Serialize)]
struct BucketsBody<'a> {
    from: u64,
    to: u64,
    buckets: &'a [crate::services::aggregator::AggregateBucket],
}

/// Dispatch one request
pub fn route(state: &HttpState, method: &Method, path: &str, query: Option<&str>) -> Reply {
    match (method, path) {
        (&Method::GET, "/metrics") => Reply {
            status: StatusCode::OK,
            content_type: "text/plain; version=0.0.4; charset=utf-8",
            body: format_prometheus_metrics(&state.engine.metrics().snapshot(), &state.site_id),
        },
        (&Method::GET, "/health") => {
            let health = state.engine.health();
            let status =
                if health.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
            Reply::json(status, &health)
        }
        (&Method::GET, "/aggregates") => {
            let range = parse_param(query, "from", 0u64)
                .and_then(|from| parse_param(query, "to", u64::MAX).map(|to| (from, to)));
            match range {
                Ok((from, to)) => {
                    let buckets = state.engine.query(from, to);
                    Reply::json(StatusCode::OK, &BucketsBody { from, to, buckets: &buckets })
                }
                Err(message) => Reply::error(StatusCode::BAD_REQUEST, &message),
            }
        }
        (&Method::GET, "/events") => {
            let filter = match query_param(query, "classification") {
                None | Some("") => None,
                Some(c) if c.eq_ignore_ascii_case("valid") => Some(Classification::Valid),
                Some(c) if c.eq_ignore_ascii_case("suspicious") => Some(Classification::Suspicious),
                Some(other) => {
                    return Reply::error(
                        StatusCode::BAD_REQUEST,
                        &format!("invalid classification: {other}"),
                    )
                }
            };
            let params = parse_param(query, "after", 0u64).and_then(|after| {
                parse_param(query, "limit", DEFAULT_EVENT_LIMIT).map(|limit| (after, limit))
            });
            let (after, limit) = match params {
                Ok(p) => p,
                Err(message) => return Reply::error(StatusCode::BAD_REQUEST, &message),
            };
            let limit = limit.min(MAX_EVENT_LIMIT);

            let events = state.engine.dispatcher().events_after_matching(
                Seq(after),
                limit,
                |e| filter.map_or(true, |c| e.classification == c),
            );
            Reply::json(StatusCode::OK, &events)
        }
        (&Method::POST, "/registry/refresh") => match &state.refresh {
            Some(trigger) => {
                trigger.invalidate();
                info!("registry_refresh_requested");
                Reply::json(StatusCode::ACCEPTED, &serde_json::json!({ "ok": true }))
            }
            None => Reply::error(StatusCode::SERVICE_UNAVAILABLE, "registry_refresh_not_configured"),
        },
        _ => Reply {
            status: StatusCode::NOT_FOUND,
            content_type: "text/plain",
            body: "Not Found".to_string(),
        },
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<HttpState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let reply = route(&state, req.method(), req.uri().path(), req.uri().query());
    Ok(reply.into_response())
}

/// Start the HTTP server
pub async fn start_http_server(
    port: u16,
    state: HttpState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let state = Arc::new(state);

    info!(port = %port, site = %state.site_id, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
