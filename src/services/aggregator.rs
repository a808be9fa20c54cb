//! Rolling per-window classification counters
//!
//! Buckets are fixed-width windows aligned to the epoch, created lazily on
//! the first event that falls in them. Each absorbed event touches exactly
//! one bucket. Buckets touched since the last delta broadcast are tracked so
//! observers receive only what changed.

use crate::domain::access_log::{Classification, ClassifiedEvent, ReasonCode};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub const DAY_MS: u64 = 86_400_000;

/// Counters for one time window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AggregateBucket {
    /// Window start (epoch ms, inclusive)
    pub window_start: u64,
    pub window_ms: u64,
    pub total: u64,
    pub valid: u64,
    pub suspicious: u64,
    pub plate_unknown: u64,
    pub color_mismatch: u64,
}

impl AggregateBucket {
    fn empty(window_start: u64, window_ms: u64) -> Self {
        Self { window_start, window_ms, ..Default::default() }
    }

    fn add(&mut self, classification: Classification, reason: ReasonCode) {
        self.total += 1;
        match classification {
            Classification::Valid => self.valid += 1,
            Classification::Suspicious => self.suspicious += 1,
        }
        match reason {
            ReasonCode::PlateUnknown => self.plate_unknown += 1,
            ReasonCode::ColorMismatch => self.color_mismatch += 1,
            ReasonCode::Ok => {}
        }
    }

    /// Window end (epoch ms, exclusive)
    pub fn window_end(&self) -> u64 {
        self.window_start.saturating_add(self.window_ms)
    }
}

pub struct Aggregator {
    width_ms: u64,
    buckets: BTreeMap<u64, AggregateBucket>,
    dirty: BTreeSet<u64>,
}

impl Aggregator {
    pub fn new(width_ms: u64) -> Self {
        Self { width_ms: width_ms.max(1), buckets: BTreeMap::new(), dirty: BTreeSet::new() }
    }

    /// Daily buckets
    pub fn daily() -> Self {
        Self::new(DAY_MS)
    }

    pub fn width_ms(&self) -> u64 {
        self.width_ms
    }

    #[inline]
    fn window_start(&self, ts: u64) -> u64 {
        ts - ts % self.width_ms
    }

    /// Count one event into the bucket containing its timestamp.
    /// Not idempotent: the caller absorbs each event once.
    pub fn absorb(&mut self, event: &ClassifiedEvent) -> AggregateBucket {
        self.count(event.ts(), event.classification, event.reason)
    }

    fn count(&mut self, ts: u64, classification: Classification, reason: ReasonCode) -> AggregateBucket {
        let start = self.window_start(ts);
        let width = self.width_ms;
        let bucket =
            self.buckets.entry(start).or_insert_with(|| AggregateBucket::empty(start, width));
        bucket.add(classification, reason);
        self.dirty.insert(start);
        *bucket
    }

    /// Buckets overlapping `[from, to)`, in window order
    pub fn query(&self, from: u64, to: u64) -> Vec<AggregateBucket> {
        let start = self.window_start(from);
        if start >= to {
            return Vec::new();
        }
        self.buckets.range(start..to).map(|(_, b)| *b).collect()
    }

    /// Buckets changed since the previous call, in window order
    pub fn take_dirty(&mut self) -> Vec<AggregateBucket> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty.into_iter().filter_map(|start| self.buckets.get(&start).copied()).collect()
    }

    /// Discard all counters and recount from `(ts, classification, reason)`
    /// tuples covering the complete history. Every rebuilt bucket is
    /// reported as changed.
    pub fn rebuild<I>(&mut self, outcomes: I)
    where
        I: IntoIterator<Item = (u64, Classification, ReasonCode)>,
    {
        self.buckets.clear();
        self.dirty.clear();
        for (ts, classification, reason) in outcomes {
            self.count(ts, classification, reason);
        }
    }

    /// Sum over all buckets
    pub fn totals(&self) -> AggregateBucket {
        self.buckets.values().fold(AggregateBucket::empty(0, 0), |mut acc, b| {
            acc.total += b.total;
            acc.valid += b.valid;
            acc.suspicious += b.suspicious;
            acc.plate_unknown += b.plate_unknown;
            acc.color_mismatch += b.color_mismatch;
            acc
        })
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::daily()
    }
}
