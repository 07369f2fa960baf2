//! Partitioned queue boundary
//!
//! Provides:
//! - Producer/consumer traits over any broker (send, poll, commit)
//! - Topic/partition addressing
//! - Request/response correlation with deadlines
//! - An in-memory broker for tests and standalone nodes

mod memory;
mod request;

pub use memory::{InMemoryConsumer, InMemoryProducer, InMemoryQueue};
pub use request::{RequestTemplate, REQUEST_ID_HEADER, RESPONSE_TOPIC_HEADER};

use crate::data::TenantId;
use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Destination of a message: topic plus optional partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartitionInfo {
    pub topic: String,
    pub partition: Option<u32>,
    pub tenant_id: Option<TenantId>,
}

impl TopicPartitionInfo {
    pub fn new(topic: impl Into<String>, partition: Option<u32>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            tenant_id: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Broker-level name, `topic.partition` when partitioned
    pub fn full_topic_name(&self) -> String {
        match self.partition {
            Some(partition) => format!("{}.{}", self.topic, partition),
            None => self.topic.clone(),
        }
    }
}

impl fmt::Display for TopicPartitionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_topic_name())
    }
}

/// Keyed message with string headers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMsg<T> {
    pub key: Uuid,
    pub value: T,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl<T> QueueMsg<T> {
    pub fn new(key: Uuid, value: T) -> Self {
        Self {
            key,
            value,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Where a sent message landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMsgMetadata {
    pub topic: String,
    pub offset: u64,
}

/// Sending side of a topic
#[async_trait]
pub trait QueueProducer<T: Send + 'static>: Send + Sync {
    fn default_topic(&self) -> &str;

    async fn send(&self, tpi: &TopicPartitionInfo, msg: QueueMsg<T>) -> Result<QueueMsgMetadata>;
}

/// Receiving side of a topic; messages stay pending until `commit`
#[async_trait]
pub trait QueueConsumer<T: Send + 'static>: Send + Sync {
    fn topic(&self) -> &str;

    /// Wait up to `max_wait` for at least one message
    async fn poll(&self, max_wait: Duration) -> Result<Vec<QueueMsg<T>>>;

    /// Acknowledge everything returned by previous polls
    async fn commit(&self) -> Result<()>;
}
