//! Worker queues for the batch runner
//!
//! A [`Queue`] is a bounded channel draining into one destination processor
//! on its own task; a [`Par`] fans records over a set of queues by key hash
//! or round-robin. A [`QueueGroup`] owns the consumer tasks of a batch run
//! and joins them once every producer has dropped its senders.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::{Record, SharedProcessor};

/// Single-producer single-consumer record queue. The consumer task feeds
/// the destination processor in send order; destination errors are
/// swallowed, observable through the destination's own metrics.
pub struct Queue {
    tx: mpsc::Sender<Record>,
}

impl Queue {
    /// Enqueue a record, applying backpressure when the queue is full.
    pub async fn sched(&self, record: Record) {
        if self.tx.send(record).await.is_err() {
            debug!("queue consumer is gone, record discarded");
        }
    }
}

/// Fan of queues scheduled by key hash or round-robin.
///
/// A hash pins records of one key to one queue so downstream feeds for that
/// key stay ordered; it is an optimization against contention, and callers
/// must not rely on the specific queue selected.
pub struct Par {
    round: AtomicU32,
    queues: Vec<Queue>,
}

impl Par {
    pub async fn sched(&self, record: Record, hash: Option<u32>) {
        let idx = match hash {
            Some(hash) => hash as usize % self.queues.len(),
            None => self.round.fetch_add(1, Ordering::Relaxed) as usize % self.queues.len(),
        };
        self.queues[idx].sched(record).await;
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }
}

/// Owns the consumer tasks backing a set of queues.
#[derive(Default)]
pub struct QueueGroup {
    workers: Vec<JoinHandle<()>>,
}

impl QueueGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue draining into `dst` on a fresh consumer task.
    pub fn new_queue(&mut self, dst: SharedProcessor, buffer_size: usize) -> Queue {
        let (tx, mut rx) = mpsc::channel(buffer_size.max(1));
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(err) = dst.feed(record).await {
                    debug!(%err, "queue destination rejected record");
                }
            }
        });
        self.workers.push(handle);
        Queue { tx }
    }

    /// Create a par with `num_queues` queues, all draining into `dst`.
    pub fn new_par(
        &mut self,
        dst: SharedProcessor,
        num_queues: usize,
        buffer_size: usize,
    ) -> Par {
        let queues = (0..num_queues.max(1))
            .map(|_| self.new_queue(dst.clone(), buffer_size))
            .collect();
        Par {
            round: AtomicU32::new(0),
            queues,
        }
    }

    /// Wait for every queue to drain and its consumer task to finish. The
    /// queues close when the last producer drops its `Par`.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(err) = worker.await {
                debug!(%err, "queue consumer task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Count, Sum};
    use crate::core::{Deadline, Processor, Value};
    use std::sync::Arc;

    struct Trace(parking_lot::Mutex<Vec<f64>>);

    #[async_trait::async_trait]
    impl Processor for Trace {
        async fn feed(&self, record: Record) -> crate::error::Result<()> {
            self.0.lock().push(record.value.as_metric()?);
            Ok(())
        }

        async fn finalize(&self, _deadline: &Deadline) -> crate::error::Result<Option<Value>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_queue_preserves_send_order() {
        let trace = Arc::new(Trace(parking_lot::Mutex::new(Vec::new())));
        let mut group = QueueGroup::new();
        let queue = group.new_queue(trace.clone(), 4);

        for i in 0..50 {
            queue.sched(Record::new("k", f64::from(i))).await;
        }
        drop(queue);
        group.join().await;
        let seen = trace.0.lock().clone();
        assert_eq!(seen, (0..50).map(f64::from).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_par_round_robin_covers_all_queues() {
        let count = Arc::new(Count::new());
        let mut group = QueueGroup::new();
        let par = group.new_par(count.clone(), 4, 2);

        for _ in 0..40 {
            par.sched(Record::new("k", Value::Null), None).await;
        }
        drop(par);
        group.join().await;
        assert_eq!(count.current(), 40);
    }

    #[tokio::test]
    async fn test_par_hash_pins_queue() {
        let sum = Arc::new(Sum::new());
        let mut group = QueueGroup::new();
        let par = group.new_par(sum.clone(), 3, 2);

        for _ in 0..9 {
            par.sched(Record::new("k", 1.0), Some(7)).await;
        }
        drop(par);
        group.join().await;
        assert_eq!(sum.current(), 9.0);
    }

    #[tokio::test]
    async fn test_destination_error_swallowed() {
        let sum = Arc::new(Sum::new());
        let mut group = QueueGroup::new();
        let queue = group.new_queue(sum.clone(), 2);

        queue.sched(Record::new("k", "text")).await;
        queue.sched(Record::new("k", 5.0)).await;
        drop(queue);
        group.join().await;
        assert_eq!(sum.current(), 5.0);
    }

    #[tokio::test]
    async fn test_join_waits_for_drain() {
        struct Slow(Arc<Sum>);

        #[async_trait::async_trait]
        impl Processor for Slow {
            async fn feed(&self, record: Record) -> crate::error::Result<()> {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                self.0.feed(record).await
            }

            async fn finalize(
                &self,
                _deadline: &Deadline,
            ) -> crate::error::Result<Option<Value>> {
                Ok(None)
            }
        }

        let sum = Arc::new(Sum::new());
        let mut group = QueueGroup::new();
        let queue = group.new_queue(Arc::new(Slow(sum.clone())), 64);
        for _ in 0..50 {
            queue.sched(Record::new("k", 1.0)).await;
        }
        drop(queue);
        group.join().await;
        assert_eq!(sum.current(), 50.0);
    }
}
