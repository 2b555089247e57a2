//! In-process pub/sub hub
//!
//! Topics give loosely coupled pipeline stages a place to meet: processors
//! register as subscribers during setup, producers publish records during
//! the data plane. Delivery is local and synchronous; parallelism belongs
//! to queues and tables, not to the hub.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::core::{Deadline, Processor, Record, SharedProcessor, Value};
use crate::error::Result;
use crate::metrics::{report_int, VarInt};

/// Name of a broadcast channel within a hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicId(String);

impl TopicId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TopicId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TopicId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

struct Topic {
    subscribers: Vec<SharedProcessor>,
    count_var: VarInt,
}

/// Topic registry with synchronous broadcast.
///
/// Registration takes the exclusive lock and replaces the topic wholesale,
/// so a publisher never observes a half-built subscriber list. Publishing
/// clones the topic handle out of a read lock and delivers outside it;
/// registration is expected to finish before the data plane starts.
pub struct Hub {
    prefix: String,
    topics: RwLock<HashMap<TopicId, Arc<Topic>>>,
    dead_letter_var: VarInt,
}

impl Hub {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let dead_letter_var = report_int(&format!("{}.DEAD", prefix), "count");
        Self {
            prefix,
            topics: RwLock::new(HashMap::new()),
            dead_letter_var,
        }
    }

    /// The process-default hub, prefix `global`.
    pub fn global() -> Arc<Hub> {
        static GLOBAL_HUB: OnceLock<Arc<Hub>> = OnceLock::new();
        GLOBAL_HUB.get_or_init(|| Arc::new(Hub::new("global"))).clone()
    }

    /// Subscribe a processor to a list of topics, creating topics on
    /// demand. A setup-phase operation.
    pub fn register(&self, processor: SharedProcessor, subscribes: &[TopicId]) {
        let mut topics = self.topics.write();
        for topic_id in subscribes {
            let updated = match topics.get(topic_id) {
                Some(existing) => {
                    let mut subscribers = existing.subscribers.clone();
                    subscribers.push(processor.clone());
                    Topic {
                        subscribers,
                        count_var: existing.count_var.clone(),
                    }
                }
                None => Topic {
                    subscribers: vec![processor.clone()],
                    count_var: report_int(&format!("{}.{}", self.prefix, topic_id), "count"),
                },
            };
            topics.insert(topic_id.clone(), Arc::new(updated));
        }
    }

    /// Deliver a record to every subscriber of the topic in registration
    /// order. Publishing to an unknown topic counts a dead letter and is
    /// not an error; subscriber errors are swallowed and observable only
    /// through the subscriber's own metrics.
    pub async fn publish(&self, topic_id: &TopicId, record: Record) {
        let topic = self.topics.read().get(topic_id).cloned();
        let topic = match topic {
            Some(topic) => topic,
            None => {
                self.dead_letter_var.add(1);
                return;
            }
        };
        for subscriber in &topic.subscribers {
            if let Err(err) = subscriber.feed(record.clone()).await {
                debug!(hub = %self.prefix, topic = %topic_id, %err, "subscriber rejected record");
            }
        }
        topic.count_var.add(1);
    }
}

/// A stateless record-to-record stage: applies a pure function to each
/// input and republishes the output to the configured topics.
#[derive(Clone)]
pub struct TransformSpec {
    pub name: String,
    pub transform: Arc<dyn Fn(Record) -> Result<Record> + Send + Sync>,
    pub inputs: Vec<TopicId>,
    pub outputs: Vec<TopicId>,
}

impl TransformSpec {
    pub fn new(
        name: impl Into<String>,
        transform: Arc<dyn Fn(Record) -> Result<Record> + Send + Sync>,
    ) -> Self {
        Self {
            name: name.into(),
            transform,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, topic: impl Into<TopicId>) -> Self {
        self.inputs.push(topic.into());
        self
    }

    pub fn output(mut self, topic: impl Into<TopicId>) -> Self {
        self.outputs.push(topic.into());
        self
    }
}

struct Transform {
    spec: TransformSpec,
    hub: Arc<Hub>,
    errors_var: VarInt,
}

#[async_trait]
impl Processor for Transform {
    async fn feed(&self, record: Record) -> Result<()> {
        let output = match (self.spec.transform)(record) {
            Ok(output) => output,
            Err(err) => {
                self.errors_var.add(1);
                return Err(err);
            }
        };
        for topic in &self.spec.outputs {
            self.hub.publish(topic, output.clone()).await;
        }
        Ok(())
    }

    async fn finalize(&self, _deadline: &Deadline) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// Create a transform and register it on the hub under its input topics.
pub fn register_transform(hub: &Arc<Hub>, spec: TransformSpec) {
    let errors_var = report_int(&spec.name, "errors");
    let inputs = spec.inputs.clone();
    let transform = Arc::new(Transform {
        spec,
        hub: hub.clone(),
        errors_var,
    });
    hub.register(transform, &inputs);
}
