//! Write-only collect table
//!
//! Streams every record straight to external storage, sharded by key hash.
//! Used standalone for raw collection and as the persistence sibling of
//! [`MemTable`](super::mem::MemTable) during finalize.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::TableSpec;
use crate::core::{Deadline, Processor, Record, Value};
use crate::error::{Result, SluiceError, TableError};
use crate::metrics::{report_int, VarInt};
use crate::storage::{RecordWriter, ResourceSpec};

struct ShardWriter {
    writer: Box<dyn RecordWriter>,
    /// Reusable encode buffer, recycled through the written record.
    buf: Vec<u8>,
}

/// Write-only sharded sink over a persistent resource.
///
/// After [`finalize`](Processor::finalize) the table is unusable; further
/// feeds fail with [`TableError::Closed`].
pub struct CollectTable {
    spec: TableSpec,
    target: ResourceSpec,
    shards: Vec<Mutex<Option<ShardWriter>>>,
    count_var: VarInt,
    errors_var: VarInt,
}

impl CollectTable {
    /// Open a shard writer for every shard of the spec's persistent
    /// resource (one writer when the resource is unsharded). Already opened
    /// writers are closed again when a later one fails to open.
    pub async fn new(spec: TableSpec) -> Result<Self> {
        let target = spec.persistent.clone().ok_or_else(|| TableError::InvalidSpec {
            name: spec.name.clone(),
            reason: "collect table requires a persistent target".to_string(),
        })?;

        let num_shards = target.shard_count();
        let mut writers: Vec<ShardWriter> = Vec::with_capacity(num_shards);
        for shard in 0..num_shards {
            match target.open_writer(shard).await {
                Ok(writer) => writers.push(ShardWriter {
                    writer,
                    buf: Vec::with_capacity(spec.encode_buffer_size),
                }),
                Err(err) => {
                    for mut opened in writers {
                        let _ = opened.writer.close().await;
                    }
                    return Err(err);
                }
            }
        }

        let count_var = report_int(&spec.name, "count");
        let errors_var = report_int(&spec.name, "errors");
        Ok(Self {
            spec,
            target,
            shards: writers
                .into_iter()
                .map(|writer| Mutex::new(Some(writer)))
                .collect(),
            count_var,
            errors_var,
        })
    }

    async fn write_shard(&self, shard_idx: usize, record: Record) -> Result<()> {
        let mut guard = self.shards[shard_idx].lock().await;
        let shard = guard.as_mut().ok_or_else(|| TableError::Closed {
            name: self.spec.name.clone(),
        })?;

        let out = match &self.spec.value_encoder {
            Some(encoder) => {
                let mut buf = std::mem::take(&mut shard.buf);
                buf.clear();
                if let Err(err) = encoder.encode(&record.value, &mut buf) {
                    buf.clear();
                    shard.buf = buf;
                    return Err(err);
                }
                Record {
                    key: record.key,
                    value: Value::Bytes(buf),
                    sort_order: record.sort_order,
                }
            }
            None => record,
        };
        let written = shard.writer.write(&out).await;
        // Reclaim the encode buffer for the next record on this shard.
        if self.spec.value_encoder.is_some() {
            if let Value::Bytes(buf) = out.value {
                shard.buf = buf;
            }
        }
        written
    }
}

#[async_trait]
impl Processor for CollectTable {
    async fn feed(&self, record: Record) -> Result<()> {
        let shard_idx = (self.spec.key_hash)(&record.key) as usize % self.shards.len();
        let written = self.write_shard(shard_idx, record).await;
        self.count_var.add(1);
        if written.is_err() {
            self.errors_var.add(1);
        }
        written
    }

    /// Close every shard writer. The target resource path is returned so a
    /// driver can hand it to a downstream pass.
    async fn finalize(&self, _deadline: &Deadline) -> Result<Option<Value>> {
        let mut retained: Option<SluiceError> = None;
        for shard in &self.shards {
            let mut guard = shard.lock().await;
            if let Some(mut writer) = guard.take() {
                if let Err(err) = writer.writer.close().await {
                    debug!(table = %self.spec.name, %err, "shard writer close failed");
                    retained.get_or_insert(err);
                }
            }
        }
        match retained {
            Some(err) => Err(err),
            None => Ok(Some(Value::Text(self.target.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Sum;
    use crate::codec::JsonCodec;
    use crate::core::RecordKey;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn unique_name(tag: &str) -> String {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        format!("{}_{}", tag, NEXT.fetch_add(1, Ordering::Relaxed))
    }

    fn spec_for(target: ResourceSpec) -> TableSpec {
        TableSpec::new(unique_name("collect"), Sum::factory())
            .persist_to(target, Arc::new(JsonCodec))
    }

    #[tokio::test]
    async fn test_requires_persistent_target() {
        let spec = TableSpec::new(unique_name("collect"), Sum::factory());
        assert!(matches!(
            CollectTable::new(spec).await,
            Err(SluiceError::Table(TableError::InvalidSpec { .. }))
        ));
    }

    #[tokio::test]
    async fn test_feed_writes_encoded_records_by_shard() {
        let dir = tempfile::tempdir().unwrap();
        let target: ResourceSpec = format!("recordkv:{}@2", dir.path().join("out").display())
            .parse()
            .unwrap();
        let spec = spec_for(target.clone());
        let key_hash = spec.key_hash.clone();
        let table = CollectTable::new(spec).await.unwrap();

        let keys: Vec<String> = (0..20).map(|i| format!("k{}", i)).collect();
        for key in &keys {
            table
                .feed(Record::new(key.as_str(), Value::Metric(1.5)))
                .await
                .unwrap();
        }
        table.finalize(&Deadline::none()).await.unwrap();

        let mut seen = 0;
        for shard in 0..2 {
            let mut reader = target.open_reader(shard).await.unwrap();
            while let Some(record) = reader.next().await.unwrap() {
                assert_eq!(
                    key_hash(&record.key) as usize % 2,
                    shard,
                    "record in wrong shard"
                );
                assert_eq!(record.value.as_bytes().unwrap(), b"1.5");
                seen += 1;
            }
        }
        assert_eq!(seen, keys.len());
    }

    #[tokio::test]
    async fn test_feed_after_finalize_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target: ResourceSpec = format!("recordkv:{}", dir.path().join("once").display())
            .parse()
            .unwrap();
        let table = CollectTable::new(spec_for(target)).await.unwrap();
        table.finalize(&Deadline::none()).await.unwrap();

        let err = table
            .feed(Record::new("late", Value::Metric(1.0)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SluiceError::Table(TableError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn test_encoder_failure_keeps_shard_writable() {
        let dir = tempfile::tempdir().unwrap();
        let target: ResourceSpec = format!("recordkv:{}", dir.path().join("enc").display())
            .parse()
            .unwrap();
        let table = CollectTable::new(spec_for(target.clone())).await.unwrap();

        // Opaque values cannot be JSON encoded.
        assert!(table
            .feed(Record::new("bad", Value::opaque(1u8)))
            .await
            .is_err());
        table
            .feed(Record::new("good", Value::Metric(2.0)))
            .await
            .unwrap();
        table.finalize(&Deadline::none()).await.unwrap();

        let mut reader = target.open_reader(0).await.unwrap();
        let record = reader.next().await.unwrap().unwrap();
        assert_eq!(record.key, RecordKey::from("good"));
        assert!(reader.next().await.unwrap().is_none());
    }
}
