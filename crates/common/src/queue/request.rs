//! Request/response correlation over a pair of topics

use super::{QueueConsumer, QueueMsg, QueueProducer, TopicPartitionInfo};
use crate::errors::{Result, TransportError};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Header carrying the correlation id
pub const REQUEST_ID_HEADER: &str = "requestId";

/// Header naming the topic the responder must reply to
pub const RESPONSE_TOPIC_HEADER: &str = "responseTopic";

/// Sends requests and completes the matching waiter when a response with the
/// same `requestId` header arrives, or fails it with `RpcTimeout`.
pub struct RequestTemplate<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    producer: Arc<dyn QueueProducer<Req>>,
    consumer: Arc<dyn QueueConsumer<Resp>>,
    request_topic: TopicPartitionInfo,
    pending: DashMap<Uuid, oneshot::Sender<Resp>>,
    timeout: Duration,
    poll_interval: Duration,
}

impl<Req, Resp> RequestTemplate<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(
        producer: Arc<dyn QueueProducer<Req>>,
        consumer: Arc<dyn QueueConsumer<Resp>>,
        request_topic: TopicPartitionInfo,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            producer,
            consumer,
            request_topic,
            pending: DashMap::new(),
            timeout,
            poll_interval,
        }
    }

    /// Number of requests waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for its response
    pub async fn send(&self, request: Req) -> Result<Resp> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        // removes the waiter on every exit, including a dropped caller
        let _pending = PendingGuard {
            pending: &self.pending,
            request_id,
        };

        let msg = QueueMsg::new(request_id, request)
            .with_header(REQUEST_ID_HEADER, request_id.to_string())
            .with_header(RESPONSE_TOPIC_HEADER, self.consumer.topic());

        self.producer.send(&self.request_topic, msg).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::ServiceUnavailable {
                message: "request template stopped".to_string(),
            }),
            Err(_) => {
                debug!(request_id = %request_id, "Request timed out");
                Err(TransportError::RpcTimeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Consume responses until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(topic = %self.consumer.topic(), "Response consumer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.consumer.poll(self.poll_interval) => {
                    match result {
                        Ok(responses) => {
                            if responses.is_empty() {
                                continue;
                            }
                            for response in responses {
                                self.complete(response);
                            }
                            if let Err(e) = self.consumer.commit().await {
                                warn!(error = %e, "Failed to commit responses");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to poll responses");
                            tokio::time::sleep(self.poll_interval).await;
                        }
                    }
                }
            }
        }
        self.pending.clear();
        info!(topic = %self.consumer.topic(), "Response consumer stopped");
    }

    fn complete(&self, response: QueueMsg<Resp>) {
        let request_id = match response
            .header(REQUEST_ID_HEADER)
            .and_then(|id| Uuid::parse_str(id).ok())
        {
            Some(id) => id,
            None => {
                warn!("Response without a valid request id, skipping");
                return;
            }
        };

        match self.pending.remove(&request_id) {
            Some((_, tx)) => {
                // receiver may already be gone after a timeout
                let _ = tx.send(response.value);
            }
            None => debug!(request_id = %request_id, "Response for unknown or expired request"),
        }
    }
}

struct PendingGuard<'a, Resp> {
    pending: &'a DashMap<Uuid, oneshot::Sender<Resp>>,
    request_id: Uuid,
}

impl<Resp> Drop for PendingGuard<'_, Resp> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}
