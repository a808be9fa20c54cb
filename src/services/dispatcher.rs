//! Fan-out of classified events to live subscribers
//!
//! The dispatcher keeps a bounded, sequence-addressed log of recent events
//! and one bounded queue per subscriber. Each subscriber has a cursor: the
//! highest sequence already placed on its queue. Deliveries always go to
//! `cursor + 1`, so a subscriber sees every sequence once and in order.
//!
//! State machine per subscriber:
//!
//! ```text
//! Connecting --caught up--> Active --queue full--> Draining --caught up--> Active
//!                                                     |
//!                                                     +--grace elapsed--> Closed
//! ```
//!
//! `publish` never waits: Active subscribers get a `try_send`, everyone else
//! is filled from the log by `pump`, which runs on a short interval.

use crate::domain::access_log::ClassifiedEvent;
use crate::domain::error::EngineError;
use crate::domain::types::Seq;
use crate::infra::metrics::Metrics;
use crate::services::aggregator::AggregateBucket;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub type SubscriberId = u64;

/// One item on a subscriber's queue
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delivery {
    Event(Arc<ClassifiedEvent>),
    /// Backlog delivered; live events follow
    CaughtUp { last_seq: Seq },
    Aggregate(AggregateBucket),
    /// Sequences `from..=to` are no longer retained and will not be delivered
    Gap { from: Seq, to: Seq },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriberState {
    Connecting,
    Active,
    Draining,
    Closed,
}

/// Subscriber status for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberInfo {
    pub id: SubscriberId,
    pub label: String,
    pub state: SubscriberState,
    /// Highest sequence placed on the queue
    pub cursor: Seq,
    /// Highest sequence the subscriber acknowledged
    pub acked: Seq,
    pub queued: usize,
}

struct Slot {
    label: String,
    state: SubscriberState,
    tx: mpsc::Sender<Delivery>,
    cursor: Seq,
    acked: Seq,
    draining_since: Option<Instant>,
}

struct DispatcherInner {
    log: VecDeque<Arc<ClassifiedEvent>>,
    retention: usize,
    /// Highest sequence published
    head: Seq,
    /// Events dropped from the front of the log
    evicted: u64,
    subscribers: FxHashMap<SubscriberId, Slot>,
    next_id: SubscriberId,
}

impl DispatcherInner {
    /// Lowest sequence still addressable in the log
    fn first_retained(&self) -> Seq {
        self.log.front().map(|e| e.seq).unwrap_or_else(|| self.head.next())
    }

    fn event_at(&self, seq: Seq) -> Option<&Arc<ClassifiedEvent>> {
        let first = self.log.front()?.seq;
        if seq < first {
            return None;
        }
        self.log.get((seq.0 - first.0) as usize)
    }
}

enum FillOutcome {
    CaughtUp,
    Behind,
    Disconnected,
}

pub struct Dispatcher {
    inner: Mutex<DispatcherInner>,
    queue_capacity: usize,
    drain_grace: Duration,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    /// `start_after` is the last sequence issued before this process started;
    /// resumption below it reports a gap.
    pub fn new(
        queue_capacity: usize,
        retention: usize,
        drain_grace: Duration,
        start_after: Seq,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Mutex::new(DispatcherInner {
                log: VecDeque::with_capacity(retention.min(4096)),
                retention: retention.max(1),
                head: start_after,
                evicted: 0,
                subscribers: FxHashMap::default(),
                next_id: 1,
            }),
            queue_capacity: queue_capacity.max(1),
            drain_grace,
            metrics,
        }
    }

    /// Register a subscriber resuming after `last_seen`, or from the current
    /// head when `None`. A `last_seen` beyond the head is treated as the head.
    pub fn subscribe(self: &Arc<Self>, last_seen: Option<Seq>, label: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut inner = self.inner.lock();

        let id = inner.next_id;
        inner.next_id += 1;
        let cursor = match last_seen {
            Some(seq) => seq.min(inner.head),
            None => inner.head,
        };
        inner.subscribers.insert(
            id,
            Slot {
                label: label.to_string(),
                state: SubscriberState::Connecting,
                tx,
                cursor,
                acked: cursor,
                draining_since: None,
            },
        );
        info!(
            subscriber = %id,
            label = %label,
            last_seen = ?last_seen.map(|s| s.0),
            head = %inner.head,
            "subscriber_connected"
        );

        self.service_slot(&mut inner, id, Instant::now());
        self.metrics.set_subscribers_active(inner.subscribers.len());
        drop(inner);

        Subscription { id, rx, dispatcher: Arc::clone(self) }
    }

    /// Append to the log and hand the event to every Active subscriber.
    /// Never blocks: a full queue moves the subscriber to Draining.
    pub fn publish(&self, event: Arc<ClassifiedEvent>) {
        let mut inner = self.inner.lock();
        let seq = event.seq;
        if seq <= inner.head {
            warn!(seq = %seq, head = %inner.head, "dispatcher_out_of_order_publish_ignored");
            return;
        }

        inner.head = seq;
        inner.log.push_back(event.clone());
        while inner.log.len() > inner.retention {
            inner.log.pop_front();
            inner.evicted += 1;
        }

        let mut disconnected = Vec::new();
        for (&id, slot) in inner.subscribers.iter_mut() {
            if slot.state != SubscriberState::Active {
                continue;
            }
            match slot.tx.try_send(Delivery::Event(event.clone())) {
                Ok(()) => slot.cursor = seq,
                Err(TrySendError::Full(_)) => {
                    slot.state = SubscriberState::Draining;
                    slot.draining_since = Some(Instant::now());
                    self.metrics.record_subscriber_overflow();
                    let overflow = EngineError::SubscriberOverflow { subscriber: id, seq: seq.0 };
                    warn!(
                        subscriber = %id,
                        label = %slot.label,
                        error = %overflow,
                        "subscriber_draining"
                    );
                }
                Err(TrySendError::Closed(_)) => disconnected.push(id),
            }
        }

        if !disconnected.is_empty() {
            for id in disconnected {
                inner.subscribers.remove(&id);
                debug!(subscriber = %id, "subscriber_receiver_dropped");
            }
            self.metrics.set_subscribers_active(inner.subscribers.len());
        }
    }

    /// Offer an aggregate update to Active subscribers. Buckets carry full
    /// counts, so a subscriber whose queue is full simply misses this one.
    pub fn broadcast_aggregate(&self, bucket: AggregateBucket) {
        let inner = self.inner.lock();
        for slot in inner.subscribers.values() {
            if slot.state != SubscriberState::Active {
                continue;
            }
            if let Err(TrySendError::Full(_)) = slot.tx.try_send(Delivery::Aggregate(bucket)) {
                self.metrics.record_aggregate_delta_skipped();
            }
        }
    }

    /// Fill Connecting and Draining subscribers from the log and close
    /// Draining subscribers whose grace period has elapsed
    pub fn pump(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let ids: Vec<SubscriberId> = inner
            .subscribers
            .iter()
            .filter(|(_, s)| s.state != SubscriberState::Active)
            .map(|(&id, _)| id)
            .collect();
        if ids.is_empty() {
            return;
        }
        for id in ids {
            self.service_slot(&mut inner, id, now);
        }
        self.metrics.set_subscribers_active(inner.subscribers.len());
    }

    fn service_slot(&self, inner: &mut DispatcherInner, id: SubscriberId, now: Instant) {
        let outcome = Self::fill(inner, id);
        let head = inner.head;
        let Some(slot) = inner.subscribers.get_mut(&id) else {
            return;
        };

        match (outcome, slot.state) {
            (FillOutcome::Disconnected, _) => {
                inner.subscribers.remove(&id);
                debug!(subscriber = %id, "subscriber_receiver_dropped");
            }
            (FillOutcome::CaughtUp, SubscriberState::Connecting) => {
                if slot.tx.try_send(Delivery::CaughtUp { last_seq: head }).is_ok() {
                    slot.state = SubscriberState::Active;
                    debug!(subscriber = %id, last_seq = %head, "subscriber_active");
                }
            }
            (FillOutcome::CaughtUp, SubscriberState::Draining) => {
                slot.state = SubscriberState::Active;
                slot.draining_since = None;
                self.metrics.record_subscriber_recovered();
                info!(subscriber = %id, label = %slot.label, "subscriber_recovered");
            }
            (FillOutcome::Behind, SubscriberState::Draining) => {
                let since = slot.draining_since.get_or_insert(now);
                if now.duration_since(*since) >= self.drain_grace {
                    slot.state = SubscriberState::Closed;
                    warn!(
                        subscriber = %id,
                        label = %slot.label,
                        cursor = %slot.cursor,
                        head = %head,
                        "subscriber_closed"
                    );
                    inner.subscribers.remove(&id);
                    self.metrics.record_subscriber_closed();
                }
            }
            _ => {}
        }
    }

    /// Move one subscriber's cursor towards the head as far as its queue allows
    fn fill(inner: &mut DispatcherInner, id: SubscriberId) -> FillOutcome {
        let first_retained = inner.first_retained();
        let head = inner.head;
        let (mut cursor, tx) = match inner.subscribers.get(&id) {
            Some(slot) => (slot.cursor, slot.tx.clone()),
            None => return FillOutcome::Disconnected,
        };

        let mut outcome = FillOutcome::CaughtUp;
        if cursor.next() < first_retained {
            let to = Seq(first_retained.0 - 1);
            match tx.try_send(Delivery::Gap { from: cursor.next(), to }) {
                Ok(()) => cursor = to,
                Err(TrySendError::Full(_)) => outcome = FillOutcome::Behind,
                Err(TrySendError::Closed(_)) => return FillOutcome::Disconnected,
            }
        }

        if matches!(outcome, FillOutcome::CaughtUp) {
            while cursor < head {
                let Some(event) = inner.event_at(cursor.next()) else {
                    break;
                };
                match tx.try_send(Delivery::Event(event.clone())) {
                    Ok(()) => cursor = cursor.next(),
                    Err(TrySendError::Full(_)) => break,
                    Err(TrySendError::Closed(_)) => return FillOutcome::Disconnected,
                }
            }
            if cursor < head {
                outcome = FillOutcome::Behind;
            }
        }

        if let Some(slot) = inner.subscribers.get_mut(&id) {
            slot.cursor = cursor;
        }
        outcome
    }

    /// Record the highest sequence a subscriber has processed
    pub fn ack(&self, id: SubscriberId, seq: Seq) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.subscribers.get_mut(&id) {
            slot.acked = slot.acked.max(seq.min(slot.cursor));
        }
    }

    /// Release a subscriber immediately; queued deliveries are discarded
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut inner = self.inner.lock();
        if inner.subscribers.remove(&id).is_some() {
            debug!(subscriber = %id, "subscriber_unsubscribed");
            self.metrics.set_subscribers_active(inner.subscribers.len());
        }
    }

    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        let inner = self.inner.lock();
        let mut infos: Vec<SubscriberInfo> = inner
            .subscribers
            .iter()
            .map(|(&id, slot)| SubscriberInfo {
                id,
                label: slot.label.clone(),
                state: slot.state,
                cursor: slot.cursor,
                acked: slot.acked,
                queued: self.queue_capacity - slot.tx.capacity(),
            })
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    pub fn subscriber_state(&self, id: SubscriberId) -> Option<SubscriberState> {
        self.inner.lock().subscribers.get(&id).map(|s| s.state)
    }

    /// Retained events with sequence greater than `after`, oldest first
    pub fn events_after(&self, after: Seq, limit: usize) -> Vec<Arc<ClassifiedEvent>> {
        self.events_after_matching(after, limit, |_| true)
    }

    /// Like `events_after`, keeping only events accepted by `matches`.
    /// The walk stops as soon as `limit` events are collected.
    pub fn events_after_matching<F>(
        &self,
        after: Seq,
        limit: usize,
        matches: F,
    ) -> Vec<Arc<ClassifiedEvent>>
    where
        F: Fn(&ClassifiedEvent) -> bool,
    {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(limit.min(64));
        let mut seq = after.next().max(inner.first_retained());
        while out.len() < limit && seq <= inner.head {
            match inner.event_at(seq) {
                Some(event) if matches(event.as_ref()) => out.push(event.clone()),
                Some(_) => {}
                None => break,
            }
            seq = seq.next();
        }
        out
    }

    /// Every event published since start, or `None` once any were evicted
    pub fn complete_history(&self) -> Option<Vec<Arc<ClassifiedEvent>>> {
        let inner = self.inner.lock();
        if inner.evicted > 0 {
            return None;
        }
        Some(inner.log.iter().cloned().collect())
    }

    pub fn head(&self) -> Seq {
        self.inner.lock().head
    }

    pub fn retained(&self) -> usize {
        self.inner.lock().log.len()
    }

    /// Run the pump until shutdown
    pub async fn run_pump(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.pump(),
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("dispatcher_pump_stopped");
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Delivery>,
    dispatcher: Arc<Dispatcher>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next delivery; `None` once the dispatcher has closed this subscriber
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Next delivery if one is queued
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    pub fn ack(&self, seq: Seq) {
        self.dispatcher.ack(self.id, seq);
    }

    pub fn state(&self) -> Option<SubscriberState> {
        self.dispatcher.subscriber_state(self.id)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(self.id);
    }
}
