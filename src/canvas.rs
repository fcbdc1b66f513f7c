//! In-memory canvas model for the open document.
//!
//! The drawing surface itself belongs to the host. This module keeps the
//! record set the host renders from: a map of JSON records keyed by their
//! string `id`, plus a broadcast of every change tagged with where it came
//! from. Autosave and the outbound relay listen to user-originated changes;
//! remote applies are tagged so they are never echoed back out.
//!
//! Payloads are validated completely before anything is applied, so a
//! malformed document never leaves the model half loaded.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

const CHANGE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("canvas payload must be a record array, got {0}")]
    NotAnArray(&'static str),
    #[error("canvas payload string is not valid JSON: {0}")]
    Json(String),
    #[error("record {index} is malformed: {reason}")]
    MalformedRecord { index: usize, reason: &'static str },
}

impl crate::error::ErrorCode for CanvasError {
    fn error_code(&self) -> &'static str {
        "E_CANVAS_MALFORMED"
    }
}

// =============================================================================
// RECORDS
// =============================================================================

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The record's id, if it is an object with a non-empty string `id`.
#[must_use]
pub fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str).filter(|id| !id.is_empty())
}

#[must_use]
pub fn is_valid_record(record: &Value) -> bool {
    record.is_object() && record_id(record).is_some()
}

/// Decode a stored `data`/`snapshot` payload into its records.
///
/// `null`, `""` and `[]` are the empty canvas. A string holding an encoded
/// array is decoded first.
///
/// # Errors
///
/// Returns a `CanvasError` if the payload is not an array or any element is
/// not an object with a string `id`.
pub fn parse_records(payload: &Value) -> Result<Vec<Value>, CanvasError> {
    match payload {
        Value::Null => Ok(Vec::new()),
        Value::String(raw) if raw.trim().is_empty() => Ok(Vec::new()),
        Value::String(raw) => {
            let decoded: Value = serde_json::from_str(raw).map_err(|e| CanvasError::Json(e.to_string()))?;
            match decoded {
                Value::Array(_) => parse_records(&decoded),
                other => Err(CanvasError::NotAnArray(json_kind(&other))),
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                if !item.is_object() {
                    return Err(CanvasError::MalformedRecord { index, reason: "not an object" });
                }
                if !is_valid_record(item) {
                    return Err(CanvasError::MalformedRecord { index, reason: "missing string id" });
                }
            }
            Ok(items.clone())
        }
        other => Err(CanvasError::NotAnArray(json_kind(other))),
    }
}

// =============================================================================
// CHANGES
// =============================================================================

/// Who caused a change to the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    User,
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanvasChange {
    pub source: ChangeSource,
    pub added: Vec<Value>,
    pub updated: Vec<Value>,
    pub removed: Vec<String>,
}

impl CanvasChange {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

// =============================================================================
// CANVAS
// =============================================================================

/// Shared handle to the open document's record set.
#[derive(Clone)]
pub struct Canvas {
    records: Arc<Mutex<BTreeMap<String, Value>>>,
    changes: broadcast::Sender<CanvasChange>,
}

impl Default for Canvas {
    fn default() -> Self {
        Self::new()
    }
}

impl Canvas {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self { records: Arc::new(Mutex::new(BTreeMap::new())), changes }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CanvasChange> {
        self.changes.subscribe()
    }

    /// Replace the whole record set with a stored payload. Emits no change.
    ///
    /// # Errors
    ///
    /// Returns a `CanvasError` for a malformed payload; the current records
    /// are left untouched then.
    pub fn load_snapshot(&self, payload: &Value) -> Result<usize, CanvasError> {
        let records = parse_records(payload)?;
        let mut map = BTreeMap::new();
        for record in records {
            if let Some(id) = record_id(&record) {
                map.insert(id.to_owned(), record);
            }
        }
        let count = map.len();
        *self.lock() = map;
        Ok(count)
    }

    /// Insert or replace records. Invalid and unchanged records are skipped.
    /// Returns the number of records that changed.
    pub fn put_records(&self, records: Vec<Value>, source: ChangeSource) -> usize {
        let mut change = CanvasChange { source, added: Vec::new(), updated: Vec::new(), removed: Vec::new() };
        {
            let mut map = self.lock();
            for record in records {
                let Some(id) = record_id(&record).map(str::to_owned) else {
                    debug!(?source, "canvas: skipping record without id");
                    continue;
                };
                match map.insert(id, record.clone()) {
                    None => change.added.push(record),
                    Some(previous) if previous != record => change.updated.push(record),
                    Some(_) => {}
                }
            }
        }
        let changed = change.added.len() + change.updated.len();
        self.publish(change);
        changed
    }

    /// Remove records by id. Returns the number that existed.
    pub fn remove_records(&self, ids: &[String], source: ChangeSource) -> usize {
        let removed: Vec<String> = {
            let mut map = self.lock();
            ids.iter().filter(|id| map.remove(id.as_str()).is_some()).cloned().collect()
        };
        let count = removed.len();
        self.publish(CanvasChange { source, added: Vec::new(), updated: Vec::new(), removed });
        count
    }

    /// The full record set as a payload, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        Value::Array(self.lock().values().cloned().collect())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Value> {
        self.lock().get(id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn publish(&self, change: CanvasChange) {
        if change.is_empty() {
            return;
        }
        if self.changes.send(change).is_err() {
            debug!("canvas: change dropped, no subscribers");
        }
    }
}

#[cfg(test)]
#[path = "canvas_test.rs"]
mod tests;
