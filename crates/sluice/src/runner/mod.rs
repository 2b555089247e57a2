//! Batch runner
//!
//! Reads sharded external sources and publishes every record onto a hub
//! topic through a pool of worker queues. Input shards are allocated to
//! workers (or queues to shards) in balanced contiguous runs so per-shard
//! read order is preserved while downstream parallelism stays high.
//!
//! The runner only moves data: it returns once every record has been
//! published. Flushing in-memory aggregation to persistent targets is the
//! caller's job, by finalizing its root processors afterwards.

pub mod queue;

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::codec::SharedDecoder;
use crate::core::{Deadline, Processor, Record, Value};
use crate::error::Result;
use crate::hub::{Hub, TopicId};
use crate::storage::ResourceSpec;
use crate::table::KeyHashFn;

pub use queue::{Par, Queue, QueueGroup};

const DEFAULT_QUEUE_BUFFER: usize = 64;

/// One data source of a batch computation.
#[derive(Clone)]
pub struct BatchSpec {
    /// Reads data from here.
    pub input: ResourceSpec,
    /// Optional: decode input values instead of publishing raw bytes.
    pub decoder: Option<SharedDecoder>,
    /// Every record is published to this topic.
    pub topic: TopicId,
    /// Worker queues calling subscribers in parallel; only useful when the
    /// subscriber handles concurrent feeds (tables and windows do).
    pub num_workers: usize,
    pub queue_buffer: usize,
    /// Pre-hash keys so records of one key stay on one queue; eliminates
    /// avoidable shard-lock contention when the subscriber is a table.
    pub key_hash: Option<KeyHashFn>,
}

impl BatchSpec {
    pub fn new(input: ResourceSpec, topic: impl Into<TopicId>) -> Self {
        Self {
            input,
            decoder: None,
            topic: topic.into(),
            num_workers: 1,
            queue_buffer: DEFAULT_QUEUE_BUFFER,
            key_hash: None,
        }
    }

    pub fn decoder(mut self, decoder: SharedDecoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    pub fn queue_buffer(mut self, queue_buffer: usize) -> Self {
        self.queue_buffer = queue_buffer.max(1);
        self
    }

    pub fn key_hash(mut self, key_hash: KeyHashFn) -> Self {
        self.key_hash = Some(key_hash);
        self
    }
}

/// Queue destination: decode, then publish on the topic.
struct PublishSink {
    hub: Arc<Hub>,
    topic: TopicId,
    decoder: Option<SharedDecoder>,
}

#[async_trait]
impl Processor for PublishSink {
    async fn feed(&self, mut record: Record) -> Result<()> {
        if let Some(decoder) = &self.decoder {
            let decoded = decoder.decode(record.value.as_bytes()?)?;
            record.value = decoded;
        }
        self.hub.publish(&self.topic, record).await;
        Ok(())
    }

    async fn finalize(&self, _deadline: &Deadline) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// Contiguous, balanced allocation of `total` items over `buckets` buckets
/// (running-remainder rounding). Every bucket gets at least one item when
/// `total >= buckets`.
fn balanced_runs(total: usize, buckets: usize) -> Vec<Range<usize>> {
    let per_bucket = total as f64 / buckets as f64;
    let mut runs = Vec::with_capacity(buckets);
    let mut remain = 0.0;
    let mut current = 0usize;
    for _ in 0..buckets {
        let next = remain + per_bucket;
        let take = (next + 0.5).floor() as usize;
        remain = next - take as f64;
        runs.push(current..current + take);
        current += take;
    }
    runs
}

/// Sequentially drain a contiguous run of input shards onto a par.
async fn run_shards(
    input: ResourceSpec,
    topic: TopicId,
    key_hash: Option<KeyHashFn>,
    shards: Range<usize>,
    par: Par,
) {
    for shard in shards {
        let mut reader = match input.open_reader(shard).await {
            Ok(reader) => reader,
            Err(err) => {
                error!(input = %input, shard, %err, "unable to open record reader");
                continue;
            }
        };
        loop {
            match reader.next().await {
                Ok(Some(record)) => {
                    let hash = key_hash.as_ref().map(|hash_fn| hash_fn(&record.key));
                    par.sched(record, hash).await;
                }
                Ok(None) => break,
                Err(err) => {
                    error!(input = %input, shard, topic = %topic, %err, "record read failed");
                    break;
                }
            }
        }
    }
}

fn start_batch(
    hub: &Arc<Hub>,
    spec: BatchSpec,
    group: &mut QueueGroup,
) -> Vec<JoinHandle<()>> {
    let num_input_shards = spec.input.shard_count();
    let sink: Arc<PublishSink> = Arc::new(PublishSink {
        hub: hub.clone(),
        topic: spec.topic.clone(),
        decoder: spec.decoder.clone(),
    });

    let mut producers = Vec::new();
    if spec.num_workers < num_input_shards {
        // Few workers, many shards: each worker owns one queue and drains a
        // contiguous run of input shards in sequence.
        for run in balanced_runs(num_input_shards, spec.num_workers) {
            let par = group.new_par(sink.clone(), 1, spec.queue_buffer);
            info!(
                input = %spec.input, topic = %spec.topic,
                shards = ?run, queues = 1, "starting batch producer"
            );
            producers.push(tokio::spawn(run_shards(
                spec.input.clone(),
                spec.topic.clone(),
                spec.key_hash.clone(),
                run,
                par,
            )));
        }
    } else {
        // At least one worker per shard: each shard gets a dedicated
        // producer with a balanced number of queues behind it, preserving
        // per-shard read order while maximizing downstream parallelism.
        for (shard, queues) in balanced_runs(spec.num_workers, num_input_shards)
            .into_iter()
            .map(|run| run.len())
            .enumerate()
        {
            let par = group.new_par(sink.clone(), queues, spec.queue_buffer);
            info!(
                input = %spec.input, topic = %spec.topic,
                shard, queues = par.num_queues(), "starting batch producer"
            );
            producers.push(tokio::spawn(run_shards(
                spec.input.clone(),
                spec.topic.clone(),
                spec.key_hash.clone(),
                shard..shard + 1,
                par,
            )));
        }
    }
    producers
}

/// Run a batch job against a specific hub: ingest all source data in
/// parallel and return once every record has been published to its topic
/// and every queue has drained.
pub async fn run_batch_on(hub: Arc<Hub>, specs: Vec<BatchSpec>) {
    let mut group = QueueGroup::new();
    let mut producers = Vec::new();
    for spec in specs {
        producers.extend(start_batch(&hub, spec, &mut group));
    }
    for outcome in join_all(producers).await {
        if let Err(err) = outcome {
            error!(%err, "batch producer task failed");
        }
    }
    group.join().await;
}

/// Run a batch job against the global hub; see [`run_batch_on`].
pub async fn run_batch(specs: Vec<BatchSpec>) {
    run_batch_on(Hub::global(), specs).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_runs_fewer_buckets() {
        let runs = balanced_runs(10, 3);
        assert_eq!(runs.len(), 3);
        let sizes: Vec<usize> = runs.iter().map(|r| r.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 10);
        assert!(sizes.iter().all(|&s| s == 3 || s == 4));
        // Runs are contiguous and cover 0..10.
        assert_eq!(runs[0].start, 0);
        assert_eq!(runs[2].end, 10);
        assert_eq!(runs[0].end, runs[1].start);
        assert_eq!(runs[1].end, runs[2].start);
    }

    #[test]
    fn test_balanced_runs_every_bucket_served() {
        for (total, buckets) in [(7, 7), (8, 3), (3, 2), (127, 16)] {
            let runs = balanced_runs(total, buckets);
            assert_eq!(runs.len(), buckets);
            assert_eq!(runs.iter().map(|r| r.len()).sum::<usize>(), total);
            assert!(runs.iter().all(|r| !r.is_empty()), "{}/{}", total, buckets);
        }
    }

    #[test]
    fn test_balanced_runs_more_buckets_than_total() {
        // Queues-per-shard distribution: 5 workers over 2 shards.
        let runs = balanced_runs(5, 2);
        let sizes: Vec<usize> = runs.iter().map(|r| r.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 5);
        assert!(sizes.iter().all(|&s| s >= 2));
    }
}
