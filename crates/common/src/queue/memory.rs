//! In-process broker

use super::{QueueConsumer, QueueMsg, QueueMsgMetadata, QueueProducer, TopicPartitionInfo};
use crate::errors::{Result, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct MemoryInner<T> {
    topics: Mutex<HashMap<String, VecDeque<QueueMsg<T>>>>,
    notify: Notify,
    offset: AtomicU64,
    failing: AtomicBool,
}

/// Topic map shared by every producer and consumer created from it
pub struct InMemoryQueue<T> {
    inner: Arc<MemoryInner<T>>,
}

impl<T> Clone for InMemoryQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Default for InMemoryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> InMemoryQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                topics: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                offset: AtomicU64::new(0),
                failing: AtomicBool::new(false),
            }),
        }
    }

    pub fn producer(&self, default_topic: impl Into<String>) -> InMemoryProducer<T> {
        InMemoryProducer {
            inner: self.inner.clone(),
            default_topic: default_topic.into(),
        }
    }

    /// Consumer of one broker-level topic (see `TopicPartitionInfo::full_topic_name`)
    pub fn consumer(&self, topic: impl Into<String>, max_records: usize) -> InMemoryConsumer<T> {
        InMemoryConsumer {
            inner: self.inner.clone(),
            topic: topic.into(),
            max_records: max_records.max(1),
            uncommitted: AtomicUsize::new(0),
            committed: AtomicU64::new(0),
        }
    }

    /// Make every subsequent send fail, to exercise error paths
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Messages queued on `topic` or any of its partitions
    pub fn len(&self, topic: &str) -> usize {
        lock(&self.inner.topics)
            .iter()
            .filter(|(name, _)| matches_topic(name, topic))
            .map(|(_, queue)| queue.len())
            .sum()
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Remove and return everything queued on `topic` or any of its partitions
    pub fn drain(&self, topic: &str) -> Vec<QueueMsg<T>> {
        let mut topics = lock(&self.inner.topics);
        let mut drained = Vec::new();
        for (name, queue) in topics.iter_mut() {
            if matches_topic(name, topic) {
                drained.extend(queue.drain(..));
            }
        }
        drained
    }
}

fn matches_topic(name: &str, topic: &str) -> bool {
    name == topic
        || name
            .strip_prefix(topic)
            .is_some_and(|rest| rest.starts_with('.'))
}

pub struct InMemoryProducer<T> {
    inner: Arc<MemoryInner<T>>,
    default_topic: String,
}

#[async_trait]
impl<T: Send + 'static> QueueProducer<T> for InMemoryProducer<T> {
    fn default_topic(&self) -> &str {
        &self.default_topic
    }

    async fn send(&self, tpi: &TopicPartitionInfo, msg: QueueMsg<T>) -> Result<QueueMsgMetadata> {
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(TransportError::queue(format!(
                "Failed to send message to {}",
                tpi
            )));
        }
        let topic = tpi.full_topic_name();
        let offset = self.inner.offset.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.topics)
            .entry(topic.clone())
            .or_default()
            .push_back(msg);
        self.inner.notify.notify_waiters();
        debug!(topic = %topic, offset, "Message sent to in-memory queue");
        Ok(QueueMsgMetadata { topic, offset })
    }
}

pub struct InMemoryConsumer<T> {
    inner: Arc<MemoryInner<T>>,
    topic: String,
    max_records: usize,
    uncommitted: AtomicUsize,
    committed: AtomicU64,
}

impl<T> InMemoryConsumer<T> {
    /// Total messages acknowledged so far
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    fn take_batch(&self) -> Vec<QueueMsg<T>> {
        let mut topics = lock(&self.inner.topics);
        match topics.get_mut(&self.topic) {
            Some(queue) => {
                let n = queue.len().min(self.max_records);
                queue.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> QueueConsumer<T> for InMemoryConsumer<T> {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(&self, max_wait: Duration) -> Result<Vec<QueueMsg<T>>> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_batch();
            if !batch.is_empty() {
                self.uncommitted.fetch_add(batch.len(), Ordering::SeqCst);
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&self) -> Result<()> {
        let n = self.uncommitted.swap(0, Ordering::SeqCst);
        self.committed.fetch_add(n as u64, Ordering::SeqCst);
        Ok(())
    }
}
