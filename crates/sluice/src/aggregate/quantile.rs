//! Approximate quantile sketch
//!
//! Buffer-based streaming quantile estimation after Manku, Rajagopalan and
//! Lindsay: an unsorted leaf buffer of up to `2b` samples collapses into a
//! stack of sorted, fixed-width weighted buffers, where the buffer at level
//! `l` carries implicit weight `2^(l+2)`. Memory is bounded by
//! `(log2(N/b) + 1) * b` samples; rank error is on the order of `0.5 / b`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::{Deadline, Mergeable, Processor, Record, Value};
use crate::error::{Result, SluiceError};
use crate::table::ItemFactory;

/// Mergeable sketch state. Single-threaded; [`Quantile`] wraps it for use
/// as a processor.
#[derive(Debug, Clone)]
pub struct QuantileState {
    buffer_size: usize,
    leaf: Vec<f64>,
    levels: Vec<Option<Vec<f64>>>,
    min: f64,
    max: f64,
    has_value: bool,
    /// Parity toggle keeping the collapse down-sampling unbiased.
    collapse_flip: usize,
}

impl QuantileState {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            leaf: Vec::with_capacity(buffer_size.max(1) * 2),
            levels: Vec::new(),
            min: 0.0,
            max: 0.0,
            has_value: false,
            collapse_flip: 0,
        }
    }

    pub fn add(&mut self, sample: f64) {
        self.leaf.push(sample);
        if self.leaf.len() == self.buffer_size * 2 {
            let mut left = std::mem::take(&mut self.leaf);
            let mut right = left.split_off(self.buffer_size);
            left.sort_by(f64::total_cmp);
            right.sort_by(f64::total_cmp);
            let collapsed = self.collapse(&left, &right);
            self.leaf = left;
            self.leaf.clear();
            self.merge_into_levels(0, collapsed);
        }
        if self.has_value {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        } else {
            self.min = sample;
            self.max = sample;
            self.has_value = true;
        }
    }

    /// Merge two sorted buffers into one of half the combined length by
    /// keeping every second element of the merged sequence, starting at
    /// index 0 or 1 according to the parity toggle.
    fn collapse(&mut self, left: &[f64], right: &[f64]) -> Vec<f64> {
        let total = left.len() + right.len();
        let mut merged = Vec::with_capacity(total / 2);
        let (mut li, mut ri) = (0, 0);
        for pos in 0..total {
            let pick = if li >= left.len() {
                ri += 1;
                right[ri - 1]
            } else if ri >= right.len() {
                li += 1;
                left[li - 1]
            } else if left[li] < right[ri] {
                li += 1;
                left[li - 1]
            } else {
                ri += 1;
                right[ri - 1]
            };
            if pos % 2 == self.collapse_flip {
                merged.push(pick);
            }
        }
        self.collapse_flip = 1 - self.collapse_flip;
        merged
    }

    /// Carry `buf` up the level stack: install it in the first empty slot
    /// at or above `start_level`, collapsing with each occupant on the way.
    /// The stack grows when `start_level` is above the current height, which
    /// happens only when merging another sketch.
    fn merge_into_levels(&mut self, start_level: usize, buf: Vec<f64>) {
        let mut level = start_level;
        let mut carry = buf;
        while level < self.levels.len() {
            match self.levels[level].take() {
                None => {
                    self.levels[level] = Some(carry);
                    return;
                }
                Some(existing) => {
                    carry = self.collapse(&existing, &carry);
                    level += 1;
                }
            }
        }
        while self.levels.len() < level {
            self.levels.push(None);
        }
        self.levels.push(Some(carry));
    }

    /// Merge another sketch built with the same buffer size; a size
    /// mismatch leaves this sketch unchanged.
    pub fn merge_from(&mut self, other: &QuantileState) -> Result<()> {
        if self.buffer_size != other.buffer_size {
            return Err(SluiceError::NotMergeable);
        }
        if !other.has_value {
            return Ok(());
        }
        if self.has_value {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        } else {
            self.min = other.min;
            self.max = other.max;
            self.has_value = true;
        }
        for level in (0..other.levels.len()).rev() {
            if let Some(buf) = &other.levels[level] {
                self.merge_into_levels(level, buf.clone());
            }
        }
        for sample in &other.leaf {
            self.add(*sample);
        }
        Ok(())
    }

    /// Flatten the sketch into a sorted, weighted sample list for queries.
    pub fn summary(&self) -> QuantileSummary {
        let mut entries = Vec::with_capacity(
            self.leaf.len() + self.levels.iter().flatten().map(Vec::len).sum::<usize>(),
        );
        let mut total: u64 = 0;
        for sample in &self.leaf {
            entries.push((*sample, 1));
            total += 1;
        }
        for (level, buf) in self.levels.iter().enumerate() {
            if let Some(buf) = buf {
                let weight = 1u64 << (level + 2);
                for sample in buf {
                    entries.push((*sample, weight));
                    total += weight;
                }
            }
        }
        entries.sort_by(|a, b| f64::total_cmp(&a.0, &b.0));
        QuantileSummary {
            total,
            min: self.min,
            max: self.max,
            entries,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// Query view over a finished sketch; meaningful once at least one sample
/// was added.
#[derive(Debug, Clone)]
pub struct QuantileSummary {
    total: u64,
    min: f64,
    max: f64,
    entries: Vec<(f64, u64)>,
}

impl QuantileSummary {
    /// Value at cumulative weight ratio: `min` at or below 0, `max` at or
    /// above 1, otherwise the first entry whose cumulative weight reaches
    /// `ratio * total`.
    pub fn at(&self, ratio: f64) -> f64 {
        if ratio <= 0.0 {
            return self.min;
        }
        if ratio >= 1.0 {
            return self.max;
        }
        let target = self.total as f64 * ratio;
        let mut cumulative = 0.0;
        for (value, weight) in &self.entries {
            cumulative += *weight as f64;
            if cumulative >= target {
                return *value;
            }
        }
        self.max
    }

    /// Bucket boundaries `[min, q_1, …, q_{n-1}, max]`; `[min, max]` when
    /// `num_buckets` is at most 1.
    pub fn buckets(&self, num_buckets: usize) -> Vec<f64> {
        if num_buckets <= 1 {
            return vec![self.min, self.max];
        }
        let mut output = vec![0.0; num_buckets + 1];
        output[0] = self.min;
        output[num_buckets] = self.max;

        let step = self.total as f64 / num_buckets as f64;
        let mut target = step;
        let mut cumulative = 0.0;
        let mut idx = 1;
        for (value, weight) in &self.entries {
            if idx >= num_buckets {
                break;
            }
            cumulative += *weight as f64;
            while cumulative >= target && idx < num_buckets {
                output[idx] = *value;
                idx += 1;
                target += step;
            }
        }
        output
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Total weight of the summarized samples.
    pub fn total_weight(&self) -> u64 {
        self.total
    }
}

/// Quantile sketch as a processor: feeds metric values, finalizes to an
/// opaque [`QuantileSummary`].
pub struct Quantile {
    state: Mutex<QuantileState>,
}

impl Quantile {
    /// The underlying buffer is sized `desired_buckets * samples_per_bucket`;
    /// more samples per bucket buys lower rank error at the cost of memory.
    pub fn new(desired_buckets: usize, samples_per_bucket: usize) -> Self {
        Self {
            state: Mutex::new(QuantileState::new(desired_buckets * samples_per_bucket)),
        }
    }

    pub fn factory(desired_buckets: usize, samples_per_bucket: usize) -> ItemFactory {
        Arc::new(move |_table, _key| {
            Ok(Box::new(Quantile::new(desired_buckets, samples_per_bucket)) as Box<dyn Processor>)
        })
    }

    pub fn summary(&self) -> QuantileSummary {
        self.state.lock().summary()
    }
}

#[async_trait]
impl Processor for Quantile {
    async fn feed(&self, record: Record) -> Result<()> {
        let sample = record.value.as_metric()?;
        self.state.lock().add(sample);
        Ok(())
    }

    async fn finalize(&self, _deadline: &Deadline) -> Result<Option<Value>> {
        Ok(Some(Value::opaque(self.summary())))
    }

    fn as_mergeable(&self) -> Option<&dyn Mergeable> {
        Some(self)
    }
}

impl Mergeable for Quantile {
    fn export(&self) -> Result<Value> {
        Ok(Value::opaque(self.state.lock().clone()))
    }

    fn merge(&self, snapshot: Value) -> Result<()> {
        let other = snapshot.downcast::<QuantileState>()?;
        self.state.lock().merge_from(other)
    }
}
