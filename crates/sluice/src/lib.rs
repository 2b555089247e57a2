//! Sluice: a streaming/batch ETL runtime core
//!
//! Everything in a sluice pipeline is a [`Processor`]: a stateful unit that
//! ingests key/value [`Record`]s and finalizes into an aggregated result.
//! Containers compose processors into pipelines:
//!
//! - [`table::MemTable`] dispatches records per key to an owned processor
//!   behind per-shard locks, with optional end-of-job persistence.
//! - [`window::Window`] keeps a sliding ring of frame processors keyed by a
//!   sequence number, finalizing evicted frames asynchronously.
//! - [`hub::Hub`] broadcasts records to topic subscribers in-process.
//! - [`runner`] reads sharded external sources and publishes them onto
//!   topics through a shard-affine worker pool.
//!
//! A batch job wires subscribers to topics, runs the batch, then finalizes
//! its root processors to flush results to persistent targets.

pub mod aggregate;
pub mod codec;
pub mod core;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod runner;
pub mod storage;
pub mod table;
pub mod window;

// Re-export commonly used types
pub use crate::core::{
    Deadline, Mergeable, Processor, Record, RecordKey, ResultMap, SharedProcessor, Value,
};

pub use error::{Result, SluiceError, StorageError, TableError};

pub use aggregate::{Count, Quantile, QuantileState, QuantileSummary, Sum};

pub use codec::{JsonCodec, RawCodec, SharedDecoder, SharedEncoder, ValueDecoder, ValueEncoder};

pub use hub::{register_transform, Hub, TopicId, TransformSpec};

pub use metrics::{report_float, report_int, MetricsRegistry, VarFloat, VarInt};

pub use runner::{run_batch, run_batch_on, BatchSpec};

pub use storage::{
    must_parse, register_format, register_media, RecordFormat, RecordReader, RecordWriter,
    ResourceSpec, StorageMedia,
};

pub use table::{
    default_key_hash, CollectTable, InspectMode, InspectSelect, ItemFactory, KeyHashFn, MemTable,
    SimpleTable, TableSpec,
};

pub use window::{SeqId, Window, WindowSpec};
