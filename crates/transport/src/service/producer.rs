use devgate_common::metrics::{self, MessagesStats};
use devgate_common::queue::{QueueMsg, QueueProducer, TopicPartitionInfo};
use devgate_common::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Producer for one downstream stage with send statistics
pub struct StageProducer<T: Send + 'static> {
    producer: Arc<dyn QueueProducer<T>>,
    stats: MessagesStats,
}

impl<T: Send + 'static> StageProducer<T> {
    pub fn new(stage: &'static str, producer: Arc<dyn QueueProducer<T>>) -> Self {
        Self {
            producer,
            stats: MessagesStats::new(stage),
        }
    }

    pub async fn send(&self, tpi: &TopicPartitionInfo, key: Uuid, msg: T) -> Result<()> {
        let start = Instant::now();
        self.stats.increment_total();
        let result = self.producer.send(tpi, QueueMsg::new(key, msg)).await;
        metrics::record_send_duration(self.stats.name(), start.elapsed().as_secs_f64());

        match result {
            Ok(metadata) => {
                self.stats.increment_successful();
                debug!(stage = self.stats.name(), topic = %metadata.topic, offset = metadata.offset, "Message sent");
                Ok(())
            }
            Err(e) => {
                self.stats.increment_failed();
                warn!(stage = self.stats.name(), topic = %tpi, error = %e, "Failed to send message");
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> &MessagesStats {
        &self.stats
    }
}
