//! Leaf aggregators
//!
//! Small stateful processors meant to live inside tables or window frames,
//! one instance per key. They rely on upstream serialization for feed
//! ordering and keep state behind a short-lived lock only because `feed`
//! takes `&self`. All of them expose the [`Mergeable`] capability.

pub mod quantile;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::{Deadline, Mergeable, Processor, Record, Value};
use crate::error::Result;
use crate::table::ItemFactory;

pub use quantile::{Quantile, QuantileState, QuantileSummary};

/// Sum of the metric values fed in.
#[derive(Debug, Default)]
pub struct Sum {
    current: Mutex<f64>,
}

impl Sum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table item factory producing a fresh `Sum` per key.
    pub fn factory() -> ItemFactory {
        Arc::new(|_table, _key| Ok(Box::new(Sum::new()) as Box<dyn Processor>))
    }

    pub fn current(&self) -> f64 {
        *self.current.lock()
    }
}

#[async_trait]
impl Processor for Sum {
    async fn feed(&self, record: Record) -> Result<()> {
        let value = record.value.as_metric()?;
        *self.current.lock() += value;
        Ok(())
    }

    async fn finalize(&self, _deadline: &Deadline) -> Result<Option<Value>> {
        Ok(Some(Value::Metric(self.current())))
    }

    fn as_mergeable(&self) -> Option<&dyn Mergeable> {
        Some(self)
    }
}

impl Mergeable for Sum {
    fn export(&self) -> Result<Value> {
        Ok(Value::Metric(self.current()))
    }

    fn merge(&self, snapshot: Value) -> Result<()> {
        let value = snapshot.as_metric()?;
        *self.current.lock() += value;
        Ok(())
    }
}

/// Number of records fed in, regardless of value shape.
#[derive(Debug, Default)]
pub struct Count {
    current: Mutex<i64>,
}

impl Count {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> ItemFactory {
        Arc::new(|_table, _key| Ok(Box::new(Count::new()) as Box<dyn Processor>))
    }

    pub fn current(&self) -> i64 {
        *self.current.lock()
    }
}

#[async_trait]
impl Processor for Count {
    async fn feed(&self, _record: Record) -> Result<()> {
        *self.current.lock() += 1;
        Ok(())
    }

    async fn finalize(&self, _deadline: &Deadline) -> Result<Option<Value>> {
        Ok(Some(Value::Int(self.current())))
    }

    fn as_mergeable(&self) -> Option<&dyn Mergeable> {
        Some(self)
    }
}

impl Mergeable for Count {
    fn export(&self) -> Result<Value> {
        Ok(Value::Int(self.current()))
    }

    fn merge(&self, snapshot: Value) -> Result<()> {
        let value = snapshot.as_metric()? as i64;
        *self.current.lock() += value;
        Ok(())
    }
}
