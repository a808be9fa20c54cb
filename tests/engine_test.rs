//! End-to-end tests for the ingestion pipeline

use access_engine::domain::{Classification, DetectionEvent, ReasonCode, Seq, VehicleRecord};
use access_engine::infra::Metrics;
use access_engine::io::{InMemoryRegistrySource, JsonlSink, MemorySink};
use access_engine::services::{
    create_persist_worker, create_registry_refresher, Delivery, Engine, EngineSettings,
    PersistSink, Registry, RetryPolicy, Subscription,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;

fn camry_registry() -> Arc<Registry> {
    Arc::new(Registry::with_records(vec![VehicleRecord::new("ABC1234", "Toyota Camry", "Red")]))
}

fn engine_with(registry: Arc<Registry>) -> Arc<Engine> {
    Engine::new(EngineSettings::default(), registry, None, Arc::new(Metrics::new()))
}

/// Sequence numbers of every queued event, skipping markers
fn drain_seqs(sub: &mut Subscription) -> Vec<u64> {
    let mut seqs = Vec::new();
    while let Some(delivery) = sub.try_recv() {
        if let Delivery::Event(event) = delivery {
            seqs.push(event.seq.0);
        }
    }
    seqs
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        initial: Duration::from_millis(1),
        max: Duration::from_millis(5),
        unhealthy_after: 3,
    }
}

#[test]
fn test_registry_scenario_end_to_end() {
    let engine = engine_with(camry_registry());
    let results = engine.ingest_json(
        r#"[
            {"ts":1704067200000,"plate":"ABC1234","color":"Red"},
            {"ts":1704067201000,"plate":"ABC1234","color":"Blue"},
            {"ts":1704067202000,"plate":"XYZ9999","color":"Red"}
        ]"#,
    );
    let outcomes: Vec<(Classification, ReasonCode)> = results
        .into_iter()
        .map(|r| {
            let event = r.unwrap();
            (event.classification, event.reason)
        })
        .collect();

    assert_eq!(
        outcomes,
        vec![
            (Classification::Valid, ReasonCode::Ok),
            (Classification::Suspicious, ReasonCode::ColorMismatch),
            (Classification::Suspicious, ReasonCode::PlateUnknown),
        ]
    );
}

#[test]
fn test_case_insensitive_color_and_normalized_plate() {
    let engine = engine_with(camry_registry());
    let event = engine.ingest(DetectionEvent::new(1, "abc 1234", "RED"));
    assert_eq!(event.classification, Classification::Valid);
    assert_eq!(event.verdict.plate.as_str(), "ABC1234");
}

#[test]
fn test_late_subscriber_resuming_from_zero_gets_everything() {
    let engine = engine_with(camry_registry());
    for ts in 1..=50 {
        engine.ingest(DetectionEvent::new(ts, "ABC1234", "Red"));
    }

    let mut sub = engine.subscribe(Some(Seq::ZERO), "late");
    for ts in 51..=100 {
        engine.ingest(DetectionEvent::new(ts, "ABC1234", "Red"));
    }

    assert_eq!(drain_seqs(&mut sub), (1..=100).collect::<Vec<u64>>());
}

#[test]
fn test_subscriber_at_head_waits_for_new_events() {
    let engine = engine_with(camry_registry());
    for ts in 1..=100 {
        engine.ingest(DetectionEvent::new(ts, "ABC1234", "Red"));
    }

    let mut sub = engine.subscribe(Some(Seq(100)), "current");
    assert_eq!(sub.try_recv(), Some(Delivery::CaughtUp { last_seq: Seq(100) }));
    assert_eq!(sub.try_recv(), None);

    engine.ingest(DetectionEvent::new(101, "ABC1234", "Red"));
    assert_eq!(drain_seqs(&mut sub), vec![101]);
}

#[test]
fn test_reconnect_receives_each_event_once() {
    let engine = engine_with(camry_registry());
    let mut first = engine.subscribe(Some(Seq::ZERO), "client");
    for ts in 1..=30 {
        engine.ingest(DetectionEvent::new(ts, "ABC1234", "Red"));
    }
    let seen = drain_seqs(&mut first);
    let last_seen = Seq(*seen.last().unwrap());
    drop(first);

    for ts in 31..=60 {
        engine.ingest(DetectionEvent::new(ts, "ABC1234", "Red"));
    }
    let mut second = engine.subscribe(Some(last_seen), "client");
    let resumed = drain_seqs(&mut second);

    let mut all = seen;
    all.extend(resumed);
    assert_eq!(all, (1..=60).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_persistence_pipeline_writes_every_event_in_order() {
    let sink = Arc::new(MemorySink::new());
    let metrics = Arc::new(Metrics::new());
    let (persist_tx, worker) = create_persist_worker(sink.clone(), fast_policy(), metrics.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    let engine =
        Engine::new(EngineSettings::default(), camry_registry(), Some(persist_tx), metrics.clone());

    // Store outage: classification and dispatch carry on
    sink.set_failing(true);
    let mut sub = engine.subscribe(None, "live");
    for ts in 1..=10 {
        engine.ingest(DetectionEvent::new(ts, "ABC1234", "Red"));
    }
    assert_eq!(drain_seqs(&mut sub), (1..=10).collect::<Vec<u64>>());

    for _ in 0..400 {
        if metrics.persist_unhealthy() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(metrics.persist_unhealthy());
    assert!(!engine.health().healthy);

    sink.set_failing(false);
    for _ in 0..400 {
        if sink.len() == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let seqs: Vec<u64> = sink.rows().iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
    assert_eq!(metrics.persist_backlog(), 0);
    assert!(!metrics.persist_unhealthy());
    assert!(engine.health().healthy);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_sequence_continues_after_restart_with_jsonl_sink() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("access_logs.jsonl");

    {
        let metrics = Arc::new(Metrics::new());
        let sink: Arc<dyn PersistSink> = Arc::new(JsonlSink::new(&path));
        let (persist_tx, worker) = create_persist_worker(sink, fast_policy(), metrics.clone());
        let engine =
            Engine::new(EngineSettings::default(), camry_registry(), Some(persist_tx), metrics);
        for ts in 1..=3 {
            engine.ingest(DetectionEvent::new(ts, "ABC1234", "Red"));
        }
        // Dropping the engine closes the channel; the worker drains and exits
        drop(engine);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        worker.run(shutdown_rx).await;
    }

    let last = JsonlSink::new(&path).last_sequence();
    assert_eq!(last, Seq(3));

    let settings = EngineSettings { start_after: last, ..EngineSettings::default() };
    let engine = Engine::new(settings, camry_registry(), None, Arc::new(Metrics::new()));

    // Resuming from before the restart reports what cannot be replayed
    let mut sub = engine.subscribe(Some(Seq(1)), "after-restart");
    assert_eq!(sub.try_recv(), Some(Delivery::Gap { from: Seq(2), to: Seq(3) }));
    assert_eq!(sub.try_recv(), Some(Delivery::CaughtUp { last_seq: Seq(3) }));

    assert_eq!(engine.ingest(DetectionEvent::new(4, "ABC1234", "Red")).seq, Seq(4));
    assert_eq!(drain_seqs(&mut sub), vec![4]);
}

#[tokio::test]
async fn test_registry_refresh_and_stale_fallback() {
    let registry = Arc::new(Registry::new());
    let source = Arc::new(InMemoryRegistrySource::new(vec![VehicleRecord::new(
        "NEW0001",
        "Honda Civic",
        "Blue",
    )]));
    let metrics = Arc::new(Metrics::new());
    let (trigger, refresher) = create_registry_refresher(
        registry.clone(),
        source.clone(),
        Duration::from_secs(3600),
        Duration::from_secs(1),
        metrics.clone(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(refresher.run(shutdown_rx));

    let engine = Engine::new(EngineSettings::default(), registry.clone(), None, metrics);

    // Initial tick loads the table
    for _ in 0..200 {
        if !registry.is_stale() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!registry.is_stale());
    assert_eq!(
        engine.ingest(DetectionEvent::new(1, "NEW0001", "blue")).reason,
        ReasonCode::Ok
    );

    // Store goes away: last good snapshot keeps serving, flagged stale
    source.set_unavailable(Some("maintenance"));
    trigger.invalidate();
    for _ in 0..200 {
        if registry.is_stale() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(registry.is_stale());
    assert!(!engine.health().healthy);
    assert_eq!(
        engine.ingest(DetectionEvent::new(2, "NEW0001", "Blue")).reason,
        ReasonCode::Ok
    );

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[test]
fn test_aggregates_match_event_log_for_hourly_buckets() {
    let settings = EngineSettings { bucket_width_ms: 3_600_000, ..EngineSettings::default() };
    let engine = Engine::new(settings, camry_registry(), None, Arc::new(Metrics::new()));

    let base = 1_704_067_200_000u64;
    let specs = [
        (base, "ABC1234", "Red"),
        (base + 60_000, "ABC1234", "Green"),
        (base + 3_600_000, "XYZ9999", "Red"),
        (base + 3_700_000, "ABC1234", ""),
        (base + 7_300_000, "ABC1234", "Red"),
    ];
    for (ts, plate, color) in specs {
        engine.ingest(DetectionEvent::new(ts, plate, color));
    }

    let buckets = engine.query(base, base + 3 * 3_600_000);
    assert_eq!(buckets.len(), 3);
    assert_eq!((buckets[0].total, buckets[0].color_mismatch), (2, 1));
    assert_eq!((buckets[1].total, buckets[1].plate_unknown, buckets[1].valid), (2, 1, 1));
    assert_eq!(buckets[2].total, 1);
    assert_eq!(engine.totals().total, 5);
}

#[test]
fn test_concurrent_ingest_is_linearized() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 500;
    let total = THREADS * PER_THREAD;

    let settings = EngineSettings {
        queue_capacity: total as usize + 16,
        log_retention: total as usize + 16,
        ..EngineSettings::default()
    };
    let engine = Engine::new(settings, camry_registry(), None, Arc::new(Metrics::new()));
    let mut sub = engine.subscribe(None, "collector");

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let color = if i % 2 == 0 { "Red" } else { "Blue" };
                    let ts = 1_704_067_200_000 + t * 1_000 + i;
                    engine.ingest(DetectionEvent::new(ts, "ABC1234", color));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let seqs = drain_seqs(&mut sub);
    assert_eq!(seqs, (1..=total).collect::<Vec<u64>>());
    assert_eq!(engine.last_seq(), Seq(total));

    let totals = engine.totals();
    assert_eq!(totals.total, total);
    assert_eq!(totals.valid, total / 2);
    assert_eq!(totals.color_mismatch, total / 2);
}
