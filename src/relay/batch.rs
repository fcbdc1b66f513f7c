//! Outbound change coalescing.
//!
//! Changes seen during one batch window collapse to their final state per
//! record id: a put after a remove revives the record, a remove after a put
//! cancels it. A flush emits at most one `put_records` and one
//! `remove_records` operation.
//!
//! The flush deadline trails the latest change, capped at a maximum wait from
//! the first change, so continuous drawing still streams.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::Operation;
use crate::canvas::{CanvasChange, record_id};

#[derive(Debug, Default)]
pub struct OutboundBatch {
    puts: BTreeMap<String, Value>,
    removes: BTreeSet<String>,
    started: Option<Instant>,
}

impl OutboundBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, change: &CanvasChange) {
        for record in change.added.iter().chain(&change.updated) {
            let Some(id) = record_id(record) else {
                continue;
            };
            self.removes.remove(id);
            self.puts.insert(id.to_owned(), record.clone());
        }
        for id in &change.removed {
            self.puts.remove(id);
            self.removes.insert(id.clone());
        }
    }

    /// Flush deadline after a change at `now`: `window` past it, but no
    /// later than `max_wait` past the first change of the batch.
    pub fn deadline_at(&mut self, now: Instant, window: Duration, max_wait: Duration) -> Instant {
        let started = *self.started.get_or_insert(now);
        (now + window).min(started + max_wait.max(window))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.removes.is_empty()
    }

    /// Drain the batch into at most two operations stamped with `timestamp`.
    pub fn flush(&mut self, timestamp: i64) -> Vec<Operation> {
        self.started = None;
        let mut ops = Vec::with_capacity(2);
        if !self.puts.is_empty() {
            let records = std::mem::take(&mut self.puts).into_values().collect();
            ops.push(Operation::PutRecords { records, timestamp });
        }
        if !self.removes.is_empty() {
            let record_ids = std::mem::take(&mut self.removes).into_iter().collect();
            ops.push(Operation::RemoveRecords { record_ids, timestamp });
        }
        ops
    }
}

#[cfg(test)]
#[path = "batch_test.rs"]
mod tests;
