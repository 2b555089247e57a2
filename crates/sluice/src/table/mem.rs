//! Sharded in-memory aggregation table
//!
//! `num_shards` simple tables behind a per-shard exclusive lock array. Feed
//! is always mutating, so the locks are plain mutexes rather than
//! reader/writer locks, and no lock ever spans more than one shard.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::collect::CollectTable;
use super::{SimpleTable, TableSpec};
use crate::core::{Deadline, Processor, Record, RecordKey, ResultMap, Value};
use crate::error::{Result, SluiceError, TableError};

/// Which keys an inspection visits.
#[derive(Debug, Clone)]
pub enum InspectSelect {
    Key(RecordKey),
    Keys(Vec<RecordKey>),
    All,
}

/// Whether inspection walks shards one by one or fans out shard-by-shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectMode {
    Serial,
    Parallel,
}

/// Callback invoked under the owning shard's lock; the processor is
/// guaranteed not to be concurrently fed while the callback runs.
pub type InspectFn = dyn Fn(&RecordKey, &dyn Processor) -> Result<()> + Send + Sync;

/// Concurrent-safe table of per-key processors with optional end-of-job
/// persistence through a sibling [`CollectTable`].
pub struct MemTable {
    spec: TableSpec,
    shards: Vec<Mutex<SimpleTable>>,
}

impl MemTable {
    pub fn new(spec: TableSpec) -> Self {
        let shards = (0..spec.num_shards.max(1))
            .map(|_| Mutex::new(SimpleTable::new(spec.clone())))
            .collect();
        Self { spec, shards }
    }

    fn shard_for(&self, key: &RecordKey) -> usize {
        (self.spec.key_hash)(key) as usize % self.shards.len()
    }

    /// Finalize all shards concurrently, each under its own lock, and merge
    /// the per-shard maps. With a persistent target configured, stream every
    /// surviving `(key, value)` pair into a collect table on the same
    /// resource and close it. Child and persistence errors are collected;
    /// the partial map and one representative error are returned.
    pub async fn finalize_partial(
        &self,
        deadline: &Deadline,
    ) -> (ResultMap, Option<SluiceError>) {
        let shard_results = join_all(self.shards.iter().map(|shard| async move {
            if deadline.expired() {
                return (ResultMap::new(), Some(SluiceError::DeadlineExceeded));
            }
            let mut guard = shard.lock().await;
            guard.finalize(deadline).await
        }))
        .await;

        let mut result = ResultMap::new();
        let mut retained: Option<SluiceError> = None;
        for (shard_map, shard_err) in shard_results {
            if let Some(err) = shard_err {
                retained.get_or_insert(err);
            }
            result.extend(shard_map);
        }

        if let Some(err) = self.persist(&result, deadline).await {
            retained.get_or_insert(err);
        }
        (result, retained)
    }

    async fn persist(&self, result: &ResultMap, deadline: &Deadline) -> Option<SluiceError> {
        if self.spec.persistent.is_none() {
            return None;
        }
        if let Err(err) = deadline.check() {
            return Some(err);
        }
        let collect = match CollectTable::new(self.spec.clone()).await {
            Ok(collect) => collect,
            Err(err) => return Some(err),
        };
        let mut retained: Option<SluiceError> = None;
        for (key, value) in result {
            if let Err(err) = collect
                .feed(Record::new(key.clone(), value.clone()))
                .await
            {
                warn!(table = %self.spec.name, key = %key, %err, "persist failed");
                retained.get_or_insert(err);
            }
        }
        if let Err(err) = collect.finalize(deadline).await {
            retained.get_or_insert(err);
        }
        retained
    }

    /// Visit selected processors under their shard locks. Stops at the
    /// first callback error; the error reports how many processors were
    /// visited before the stop.
    pub async fn inspect(
        &self,
        select: InspectSelect,
        mode: InspectMode,
        f: &InspectFn,
    ) -> Result<usize> {
        let per_shard = self.partition(select);
        match mode {
            InspectMode::Serial => {
                let mut visited = 0;
                for (shard_idx, keys) in per_shard.iter().enumerate() {
                    let guard = self.shards[shard_idx].lock().await;
                    Self::inspect_shard(&guard, keys, f, &mut visited)
                        .map_err(|source| inspect_error(visited, source))?;
                }
                Ok(visited)
            }
            InspectMode::Parallel => {
                let outcomes = join_all(per_shard.iter().enumerate().map(
                    |(shard_idx, keys)| async move {
                        let guard = self.shards[shard_idx].lock().await;
                        let mut visited = 0;
                        let result = Self::inspect_shard(&guard, keys, f, &mut visited);
                        (visited, result)
                    },
                ))
                .await;
                let mut visited = 0;
                let mut first_err: Option<SluiceError> = None;
                for (count, outcome) in outcomes {
                    visited += count;
                    if let Err(err) = outcome {
                        first_err.get_or_insert(err);
                    }
                }
                match first_err {
                    Some(source) => Err(inspect_error(visited, source)),
                    None => Ok(visited),
                }
            }
        }
    }

    /// Keys to visit per shard; `None` means the whole shard.
    fn partition(&self, select: InspectSelect) -> Vec<Option<Vec<RecordKey>>> {
        let mut per_shard: Vec<Option<Vec<RecordKey>>> = match select {
            InspectSelect::All => return vec![None; self.shards.len()],
            _ => vec![Some(Vec::new()); self.shards.len()],
        };
        let keys = match select {
            InspectSelect::Key(key) => vec![key],
            InspectSelect::Keys(keys) => keys,
            InspectSelect::All => unreachable!(),
        };
        for key in keys {
            let shard = self.shard_for(&key);
            if let Some(bucket) = per_shard[shard].as_mut() {
                bucket.push(key);
            }
        }
        per_shard
    }

    fn inspect_shard(
        shard: &SimpleTable,
        keys: &Option<Vec<RecordKey>>,
        f: &InspectFn,
        visited: &mut usize,
    ) -> Result<()> {
        match keys {
            None => {
                for (key, item) in shard.iter() {
                    f(key, item)?;
                    *visited += 1;
                }
            }
            Some(keys) => {
                for key in keys {
                    if let Some(item) = shard.get(key) {
                        f(key, item)?;
                        *visited += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Merge another table's state into this one. Children exposing the
    /// [`Mergeable`](crate::core::Mergeable) capability are exported and
    /// merged into the processor owned here for the same key (created
    /// through the factory when missing); children without the capability
    /// are skipped with a warning.
    pub async fn merge_from(&self, other: &MemTable) -> Result<()> {
        for other_shard in &other.shards {
            let snapshots: Vec<(RecordKey, Value)> = {
                let guard = other_shard.lock().await;
                let mut out = Vec::with_capacity(guard.len());
                for (key, item) in guard.iter() {
                    match item.as_mergeable() {
                        Some(mergeable) => out.push((key.clone(), mergeable.export()?)),
                        None => {
                            warn!(
                                table = %self.spec.name,
                                key = %key,
                                "child is not mergeable, skipped"
                            );
                        }
                    }
                }
                out
            };
            for (key, snapshot) in snapshots {
                let shard_idx = self.shard_for(&key);
                let mut guard = self.shards[shard_idx].lock().await;
                let item = guard.ensure_for_merge(&key)?;
                match item.as_mergeable() {
                    Some(mergeable) => mergeable.merge(snapshot)?,
                    None => return Err(SluiceError::NotMergeable),
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

fn inspect_error(visited: usize, source: SluiceError) -> SluiceError {
    TableError::Inspect {
        visited,
        source: Box::new(source),
    }
    .into()
}

#[async_trait]
impl Processor for MemTable {
    async fn feed(&self, record: Record) -> Result<()> {
        let shard_idx = self.shard_for(&record.key);
        let mut shard = self.shards[shard_idx].lock().await;
        shard.feed(record).await
    }

    async fn finalize(&self, deadline: &Deadline) -> Result<Option<Value>> {
        let (result, retained) = self.finalize_partial(deadline).await;
        match retained {
            None => Ok(Some(Value::Map(result))),
            Some(source) => {
                debug!(table = %self.spec.name, %source, "finalize completed partially");
                Err(TableError::Partial {
                    result,
                    source: Box::new(source),
                }
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::aggregate::Sum;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn unique_name(tag: &str) -> String {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        format!("{}_{}", tag, NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[tokio::test]
    async fn test_feed_and_finalize() {
        let spec = TableSpec::new(unique_name("mem"), Sum::factory()).num_shards(4);
        let table = MemTable::new(spec);

        for key in ["a", "b", "a", "c", "a", "b"] {
            table.feed(Record::new(key, 1.0)).await.unwrap();
        }

        let result = table.finalize(&Deadline::none()).await.unwrap().unwrap();
        let map = result.as_map().unwrap();
        assert_eq!(map["a"], Value::Metric(3.0));
        assert_eq!(map["b"], Value::Metric(2.0));
        assert_eq!(map["c"], Value::Metric(1.0));
    }

    #[tokio::test]
    async fn test_concurrent_feed_keeps_per_key_counts() {
        let spec = TableSpec::new(unique_name("mem"), Sum::factory()).num_shards(8);
        let table = Arc::new(MemTable::new(spec));

        let tasks: Vec<_> = (0..16)
            .map(|task| {
                let table = table.clone();
                tokio::spawn(async move {
                    for i in 0..100 {
                        let key = format!("key-{}", (task + i) % 10);
                        table.feed(Record::new(key, 1.0)).await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let result = table.finalize(&Deadline::none()).await.unwrap().unwrap();
        let map = result.as_map().unwrap();
        let total: f64 = map
            .values()
            .map(|v| v.as_metric().unwrap())
            .sum();
        assert_eq!(total, 1600.0);
    }

    #[tokio::test]
    async fn test_factory_once_per_key_across_shards() {
        let calls = Arc::new(AtomicUsize::new(0));
        let spec =
            TableSpec::new(unique_name("mem"), counting_factory(calls.clone())).num_shards(4);
        let table = MemTable::new(spec);

        for _ in 0..5 {
            for key in ["x", "y", "z"] {
                table.feed(Record::new(key, 1.0)).await.unwrap();
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_partial_failure_returns_good_keys() {
        let spec = TableSpec::new(unique_name("mem"), faulty_factory()).num_shards(4);
        let table = MemTable::new(spec);

        for i in 0..50 {
            let key = if i % 5 == 0 {
                format!("bad-{}", i)
            } else {
                format!("good-{}", i)
            };
            let _ = table.feed(Record::new(key, 1.0)).await;
        }

        let result = table.finalize(&Deadline::none()).await.unwrap().unwrap();
        let map = result.as_map().unwrap();
        assert_eq!(map.len(), 40);
        assert!(map.keys().all(|k| k.as_str().starts_with("good-")));
    }

    #[tokio::test]
    async fn test_inspect_all_counts_and_locks() {
        let spec = TableSpec::new(unique_name("mem"), Sum::factory()).num_shards(4);
        let table = MemTable::new(spec);
        for i in 0..20 {
            table
                .feed(Record::new(format!("k{}", i), 1.0))
                .await
                .unwrap();
        }

        let visited = table
            .inspect(InspectSelect::All, InspectMode::Serial, &|_, _| Ok(()))
            .await
            .unwrap();
        assert_eq!(visited, 20);

        let visited = table
            .inspect(InspectSelect::All, InspectMode::Parallel, &|_, _| Ok(()))
            .await
            .unwrap();
        assert_eq!(visited, 20);
    }

    #[tokio::test]
    async fn test_inspect_selected_keys() {
        let spec = TableSpec::new(unique_name("mem"), Sum::factory()).num_shards(4);
        let table = MemTable::new(spec);
        for key in ["a", "b", "c"] {
            table.feed(Record::new(key, 1.0)).await.unwrap();
        }

        let visited = table
            .inspect(
                InspectSelect::Keys(vec!["a".into(), "c".into(), "missing".into()]),
                InspectMode::Serial,
                &|_, _| Ok(()),
            )
            .await
            .unwrap();
        assert_eq!(visited, 2);

        let visited = table
            .inspect(
                InspectSelect::Key("b".into()),
                InspectMode::Serial,
                &|_, _| Ok(()),
            )
            .await
            .unwrap();
        assert_eq!(visited, 1);
    }

    #[tokio::test]
    async fn test_inspect_stops_on_callback_error() {
        let spec = TableSpec::new(unique_name("mem"), Sum::factory()).num_shards(2);
        let table = MemTable::new(spec);
        for i in 0..10 {
            table
                .feed(Record::new(format!("k{}", i), 1.0))
                .await
                .unwrap();
        }

        let err = table
            .inspect(InspectSelect::All, InspectMode::Serial, &|key, _| {
                if key.as_str() == "k3" {
                    Err(SluiceError::Unexpected("stop".to_string()))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap_err();
        match err {
            SluiceError::Table(TableError::Inspect { visited, .. }) => assert!(visited < 10),
            other => panic!("expected inspect error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_merge_from_combines_sums() {
        let left = MemTable::new(TableSpec::new(unique_name("mem"), Sum::factory()).num_shards(3));
        let right =
            MemTable::new(TableSpec::new(unique_name("mem"), Sum::factory()).num_shards(5));

        for key in ["a", "b"] {
            left.feed(Record::new(key, 1.0)).await.unwrap();
            right.feed(Record::new(key, 2.0)).await.unwrap();
        }
        right.feed(Record::new("c", 4.0)).await.unwrap();

        left.merge_from(&right).await.unwrap();
        let result = left.finalize(&Deadline::none()).await.unwrap().unwrap();
        let map = result.as_map().unwrap();
        assert_eq!(map["a"], Value::Metric(3.0));
        assert_eq!(map["b"], Value::Metric(3.0));
        assert_eq!(map["c"], Value::Metric(4.0));
    }
}
