//! Core record and processor contracts
//!
//! This module provides the fundamental types of the runtime:
//! - Record: the key/value pair passed between processors
//! - Value: the polymorphic record payload
//! - Processor: the uniform stateful computation unit (feed / finalize)
//! - Mergeable: optional cross-instance aggregation capability
//! - Deadline: coarse-grained finalization time cap

use std::any::Any;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::error::{Result, SluiceError};

/// Key of a [`Record`]; always a finite string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RecordKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for RecordKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Aggregated output of a table finalize: surviving key → result value.
pub type ResultMap = HashMap<RecordKey, Value>;

/// Polymorphic record payload.
///
/// The core never inspects values; it only moves them between processors.
/// Leaf processors pick the shape they understand through the typed
/// accessors and fail with a type-mismatch error otherwise. `Opaque` covers
/// pipeline-specific types the built-in variants cannot express; it cannot
/// be serialized.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bytes(Vec<u8>),
    Text(String),
    Metric(f64),
    Int(i64),
    List(Vec<Value>),
    Map(ResultMap),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Numeric view used by aggregators. Accepts both `Metric` and `Int`.
    pub fn as_metric(&self) -> Result<f64> {
        match self {
            Value::Metric(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            other => Err(SluiceError::TypeMismatch {
                expected: "metric",
                actual: other.kind(),
            }),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            Value::Text(s) => Ok(s.as_bytes()),
            other => Err(SluiceError::TypeMismatch {
                expected: "bytes",
                actual: other.kind(),
            }),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Text(s) => Ok(s),
            Value::Bytes(b) => std::str::from_utf8(b).map_err(|_| SluiceError::TypeMismatch {
                expected: "utf-8 text",
                actual: "bytes",
            }),
            other => Err(SluiceError::TypeMismatch {
                expected: "text",
                actual: other.kind(),
            }),
        }
    }

    pub fn as_map(&self) -> Result<&ResultMap> {
        match self {
            Value::Map(m) => Ok(m),
            other => Err(SluiceError::TypeMismatch {
                expected: "map",
                actual: other.kind(),
            }),
        }
    }

    /// Downcast an `Opaque` payload to a concrete type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Result<&T> {
        match self {
            Value::Opaque(any) => {
                any.downcast_ref::<T>().ok_or(SluiceError::TypeMismatch {
                    expected: "opaque (concrete type)",
                    actual: "opaque (other type)",
                })
            }
            other => Err(SluiceError::TypeMismatch {
                expected: "opaque",
                actual: other.kind(),
            }),
        }
    }

    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Value::Opaque(Arc::new(value))
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bytes(_) => "bytes",
            Value::Text(_) => "text",
            Value::Metric(_) => "metric",
            Value::Int(_) => "int",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Opaque(_) => "opaque",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Metric(a), Value::Metric(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Metric(v) => serializer.serialize_f64(*v),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(map) => {
                let mut ser = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    ser.serialize_entry(key.as_str(), value)?;
                }
                ser.end()
            }
            Value::Opaque(_) => Err(serde::ser::Error::custom(
                "opaque value cannot be serialized",
            )),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Metric(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// The data item passed between processors: a keyed, polymorphic value.
///
/// `sort_order` is an optional hint for storage layers that sort persisted
/// records within a key; the compute core ignores it.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: RecordKey,
    pub value: Value,
    pub sort_order: u64,
}

impl Record {
    pub fn new(key: impl Into<RecordKey>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            sort_order: 0,
        }
    }

    pub fn with_sort_order(mut self, sort_order: u64) -> Self {
        self.sort_order = sort_order;
        self
    }
}

/// Cap on total finalization time, checked at coarse boundaries (between
/// shards, between children), never per record.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline; finalization runs to completion.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn within(budget: Duration) -> Self {
        Self(Some(Instant::now() + budget))
    }

    pub fn expired(&self) -> bool {
        matches!(self.0, Some(at) if Instant::now() >= at)
    }

    /// Err(`DeadlineExceeded`) once the deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.expired() {
            Err(SluiceError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

/// The uniform stateful computation unit.
///
/// A processor ingests records through [`feed`](Processor::feed) and yields
/// its aggregated result through [`finalize`](Processor::finalize). After
/// finalize a processor is terminal; feeding it again is a contract
/// violation and implementations may release resources.
///
/// Concurrent-safety of `feed` is not required of arbitrary processors:
/// containers (tables, windows, queues) serialize calls into the processors
/// they own, and leaf aggregators may rely on that upstream serialization.
/// Since `feed` takes `&self`, leaves keep their state behind a short-lived
/// lock.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Feed one record into the processor.
    async fn feed(&self, record: Record) -> Result<()>;

    /// Compute the final result. `Ok(None)` signals "no contribution";
    /// containers omit such children from their aggregated map.
    ///
    /// May block on downstream finalization; the deadline caps total time
    /// and is checked between children or shards rather than per record.
    async fn finalize(&self, deadline: &Deadline) -> Result<Option<Value>>;

    /// Capability query for cross-instance aggregation. Containers use this
    /// to combine snapshots of equivalent processors from other instances.
    fn as_mergeable(&self) -> Option<&dyn Mergeable> {
        None
    }
}

/// Shared handle to a processor; the form containers and the hub traffic in.
pub type SharedProcessor = Arc<dyn Processor>;

/// Optional capability: export a snapshot of internal state and merge a
/// snapshot exported by an equivalent processor instance.
pub trait Mergeable: Send + Sync {
    fn export(&self) -> Result<Value>;

    fn merge(&self, snapshot: Value) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_metric_accessor() {
        assert_eq!(Value::Metric(1.5).as_metric().unwrap(), 1.5);
        assert_eq!(Value::Int(3).as_metric().unwrap(), 3.0);
        assert!(Value::Text("x".into()).as_metric().is_err());
    }

    #[test]
    fn test_value_equality() {
        assert_eq!(Value::Metric(2.0), Value::Metric(2.0));
        assert_ne!(Value::Metric(2.0), Value::Int(2));

        let opaque = Value::opaque(42u32);
        assert_eq!(opaque, opaque.clone());
        assert_ne!(opaque, Value::opaque(42u32));
    }

    #[test]
    fn test_value_serialize_json() {
        let mut map = ResultMap::new();
        map.insert(RecordKey::from("a"), Value::Metric(3.0));
        let json = serde_json::to_string(&Value::Map(map)).unwrap();
        assert_eq!(json, r#"{"a":3.0}"#);

        assert!(serde_json::to_string(&Value::opaque(1u8)).is_err());
    }

    #[test]
    fn test_value_downcast() {
        let v = Value::opaque(String::from("payload"));
        assert_eq!(v.downcast::<String>().unwrap(), "payload");
        assert!(v.downcast::<u64>().is_err());
    }

    #[test]
    fn test_deadline() {
        assert!(!Deadline::none().expired());
        assert!(Deadline::none().check().is_ok());

        let passed = Deadline::at(Instant::now() - Duration::from_millis(1));
        assert!(passed.expired());
        assert!(matches!(
            passed.check(),
            Err(SluiceError::DeadlineExceeded)
        ));

        assert!(!Deadline::within(Duration::from_secs(60)).expired());
    }

    #[test]
    fn test_record_key_borrow() {
        let mut map = HashMap::new();
        map.insert(RecordKey::from("k"), 1);
        assert_eq!(map.get("k"), Some(&1));
    }
}
