//! Aggregation tables
//!
//! A table dispatches records per key to an owned processor instance built
//! by the spec's item factory. [`SimpleTable`] is the non-concurrent
//! building block; [`MemTable`](mem::MemTable) shards simple tables behind
//! per-shard locks; [`CollectTable`](collect::CollectTable) streams every
//! record straight to external storage.

pub mod collect;
pub mod mem;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::codec::SharedEncoder;
use crate::core::{Deadline, Processor, Record, RecordKey, ResultMap};
use crate::error::{Result, SluiceError};
use crate::metrics::{report_int, VarInt};
use crate::storage::ResourceSpec;

pub use collect::CollectTable;
pub use mem::{InspectMode, InspectSelect, MemTable};

/// Builds the processor owned for a key; called at most once per key per
/// table. Receives the table name so factories can register shared
/// reporting variables.
pub type ItemFactory = Arc<dyn Fn(&str, &RecordKey) -> Result<Box<dyn Processor>> + Send + Sync>;

/// Assigns a record key to a shard; must be stable across processes when
/// the table persists sharded output.
pub type KeyHashFn = Arc<dyn Fn(&RecordKey) -> u32 + Send + Sync>;

const DEFAULT_NUM_SHARDS: usize = 127;
const DEFAULT_ENCODE_BUFFER_SIZE: usize = 256;

/// Stable FNV-1a over the key bytes; the default shard hash.
pub fn default_key_hash(key: &RecordKey) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Configuration shared by every table kind.
#[derive(Clone)]
pub struct TableSpec {
    /// Metrics namespace.
    pub name: String,
    pub item_factory: ItemFactory,
    pub key_hash: KeyHashFn,
    pub num_shards: usize,
    /// When present, final results are streamed there.
    pub persistent: Option<ResourceSpec>,
    /// Required when persisting non-bytes results.
    pub value_encoder: Option<SharedEncoder>,
    /// Sizing hint for the reusable per-shard encode buffers.
    pub encode_buffer_size: usize,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, item_factory: ItemFactory) -> Self {
        Self {
            name: name.into(),
            item_factory,
            key_hash: Arc::new(default_key_hash),
            num_shards: DEFAULT_NUM_SHARDS,
            persistent: None,
            value_encoder: None,
            encode_buffer_size: DEFAULT_ENCODE_BUFFER_SIZE,
        }
    }

    pub fn num_shards(mut self, num_shards: usize) -> Self {
        self.num_shards = num_shards.max(1);
        self
    }

    pub fn key_hash(mut self, key_hash: KeyHashFn) -> Self {
        self.key_hash = key_hash;
        self
    }

    pub fn persist_to(mut self, target: ResourceSpec, encoder: SharedEncoder) -> Self {
        self.persistent = Some(target);
        self.value_encoder = Some(encoder);
        self
    }

    pub fn encode_buffer_size(mut self, size: usize) -> Self {
        self.encode_buffer_size = size;
        self
    }
}

/// Single-threaded map from key to owned processor with lazy creation and
/// ban-on-factory-error. Not a [`Processor`] itself: it is the building
/// block the sharded table serializes, and callers own the exclusion.
pub struct SimpleTable {
    spec: TableSpec,
    items: HashMap<RecordKey, Box<dyn Processor>>,
    banned: HashMap<RecordKey, Arc<SluiceError>>,
    keys_var: VarInt,
    errors_var: VarInt,
}

impl SimpleTable {
    pub fn new(spec: TableSpec) -> Self {
        let keys_var = report_int(&spec.name, "keys");
        let errors_var = report_int(&spec.name, "errors");
        Self {
            spec,
            items: HashMap::new(),
            banned: HashMap::new(),
            keys_var,
            errors_var,
        }
    }

    /// Processor owned for `key`, creating it on first sight. A factory
    /// failure poisons the key: the error is cached and replayed for every
    /// later record with the same key, without reinvoking the factory.
    fn ensure(&mut self, key: &RecordKey) -> Result<&dyn Processor> {
        if !self.items.contains_key(key) {
            if let Some(cached) = self.banned.get(key) {
                return Err(cached.clone().into());
            }
            match (self.spec.item_factory)(&self.spec.name, key) {
                Ok(item) => {
                    self.items.insert(key.clone(), item);
                    self.keys_var.add(1);
                }
                Err(err) => {
                    let cached = err.into_cached();
                    self.banned.insert(key.clone(), cached.clone());
                    return Err(cached.into());
                }
            }
        }
        Ok(self.items[key].as_ref())
    }

    pub async fn feed(&mut self, record: Record) -> Result<()> {
        let errors_var = self.errors_var.clone();
        let item = self.ensure(&record.key)?;
        if let Err(err) = item.feed(record).await {
            errors_var.add(1);
            return Err(err);
        }
        Ok(())
    }

    /// Finalize every owned processor. A child error skips that key but the
    /// walk continues; one error is remembered and returned alongside the
    /// surviving results. Null child results are dropped. The deadline is
    /// checked between children.
    pub async fn finalize(&mut self, deadline: &Deadline) -> (ResultMap, Option<SluiceError>) {
        let items = std::mem::take(&mut self.items);
        let mut result = ResultMap::with_capacity(items.len());
        let mut retained: Option<SluiceError> = None;
        for (key, item) in items {
            if deadline.expired() {
                retained.get_or_insert(SluiceError::DeadlineExceeded);
                break;
            }
            match item.finalize(deadline).await {
                Ok(Some(value)) => {
                    result.insert(key, value);
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(table = %self.spec.name, key = %key, %err, "child finalize failed");
                    retained.get_or_insert(err);
                }
            }
        }
        (result, retained)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &RecordKey) -> Option<&dyn Processor> {
        self.items.get(key).map(|item| item.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordKey, &dyn Processor)> {
        self.items.iter().map(|(key, item)| (key, item.as_ref()))
    }

    pub(crate) fn ensure_for_merge(&mut self, key: &RecordKey) -> Result<&dyn Processor> {
        self.ensure(key)
    }
}
