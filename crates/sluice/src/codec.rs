//! Pluggable value ↔ bytes transforms
//!
//! Encoders run when a table persists results; decoders run when the batch
//! runner re-reads persisted output for a downstream pass. The core never
//! interprets the encoded bytes.

use std::sync::Arc;

use crate::core::{RecordKey, ResultMap, Value};
use crate::error::{Result, SluiceError};

/// Encode a value into a caller-provided buffer. The buffer arrives cleared;
/// implementations append and must not retain it.
pub trait ValueEncoder: Send + Sync {
    fn encode(&self, value: &Value, buf: &mut Vec<u8>) -> Result<()>;
}

/// Decode a value from a byte buffer.
pub trait ValueDecoder: Send + Sync {
    fn decode(&self, buf: &[u8]) -> Result<Value>;
}

pub type SharedEncoder = Arc<dyn ValueEncoder>;
pub type SharedDecoder = Arc<dyn ValueDecoder>;

/// Self-describing JSON codec.
///
/// Numbers decode to `Int` when integral and `Metric` otherwise; objects to
/// `Map`, arrays to `List`, strings to `Text`. `Opaque` values fail at
/// encode time.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ValueEncoder for JsonCodec {
    fn encode(&self, value: &Value, buf: &mut Vec<u8>) -> Result<()> {
        serde_json::to_writer(&mut *buf, value)?;
        Ok(())
    }
}

impl ValueDecoder for JsonCodec {
    fn decode(&self, buf: &[u8]) -> Result<Value> {
        let parsed: serde_json::Value = serde_json::from_slice(buf)?;
        Ok(from_json(parsed))
    }
}

fn from_json(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Int(b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Metric(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Text(s),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(fields) => {
            let mut map = ResultMap::with_capacity(fields.len());
            for (key, field) in fields {
                map.insert(RecordKey::from(key), from_json(field));
            }
            Value::Map(map)
        }
    }
}

/// Identity codec over raw byte values; anything else is a type error.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl ValueEncoder for RawCodec {
    fn encode(&self, value: &Value, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(value.as_bytes()?);
        Ok(())
    }
}

impl ValueDecoder for RawCodec {
    fn decode(&self, buf: &[u8]) -> Result<Value> {
        Ok(Value::Bytes(buf.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip_metric() {
        let mut buf = Vec::new();
        JsonCodec.encode(&Value::Metric(3.0), &mut buf).unwrap();
        assert_eq!(buf, b"3.0");
        assert_eq!(JsonCodec.decode(&buf).unwrap(), Value::Metric(3.0));
    }

    #[test]
    fn test_json_round_trip_map() {
        let mut map = ResultMap::new();
        map.insert("a".into(), Value::Metric(1.5));
        map.insert("b".into(), Value::Text("x".into()));
        let mut buf = Vec::new();
        JsonCodec.encode(&Value::Map(map.clone()), &mut buf).unwrap();
        assert_eq!(JsonCodec.decode(&buf).unwrap(), Value::Map(map));
    }

    #[test]
    fn test_json_integer_decodes_as_int() {
        assert_eq!(JsonCodec.decode(b"7").unwrap(), Value::Int(7));
        assert_eq!(JsonCodec.decode(b"7.5").unwrap(), Value::Metric(7.5));
    }

    #[test]
    fn test_json_rejects_opaque() {
        let mut buf = Vec::new();
        assert!(matches!(
            JsonCodec.encode(&Value::opaque(1u8), &mut buf),
            Err(SluiceError::Codec(_))
        ));
    }

    #[test]
    fn test_raw_codec() {
        let mut buf = Vec::new();
        RawCodec
            .encode(&Value::Bytes(vec![1, 2, 3]), &mut buf)
            .unwrap();
        assert_eq!(buf, vec![1, 2, 3]);
        assert_eq!(
            RawCodec.decode(&buf).unwrap(),
            Value::Bytes(vec![1, 2, 3])
        );
        assert!(RawCodec.encode(&Value::Metric(1.0), &mut buf).is_err());
    }
}
