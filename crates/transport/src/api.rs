//! Transport API backend access
//!
//! Credential validation, device provisioning and profile/resource lookups
//! are request/response exchanges with the system of record.

use async_trait::async_trait;
use devgate_common::metrics::MessagesStats;
use devgate_common::msg::{TransportApiRequest, TransportApiResponse};
use devgate_common::queue::RequestTemplate;
use devgate_common::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[async_trait]
pub trait TransportApi: Send + Sync + 'static {
    async fn request(&self, request: TransportApiRequest) -> Result<TransportApiResponse>;
}

/// Backend reached over the request/response topics
pub struct QueueTransportApi {
    template: Arc<RequestTemplate<TransportApiRequest, TransportApiResponse>>,
    stats: MessagesStats,
}

impl QueueTransportApi {
    pub fn new(template: Arc<RequestTemplate<TransportApiRequest, TransportApiResponse>>) -> Self {
        Self {
            template,
            stats: MessagesStats::new("transport_api"),
        }
    }

    pub fn stats(&self) -> &MessagesStats {
        &self.stats
    }

    /// Consume responses until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        self.template.run(cancel).await;
    }
}

#[async_trait]
impl TransportApi for QueueTransportApi {
    async fn request(&self, request: TransportApiRequest) -> Result<TransportApiResponse> {
        let kind = request.kind();
        self.stats.increment_total();
        match self.template.send(request).await {
            Ok(response) => {
                self.stats.increment_successful();
                Ok(response)
            }
            Err(e) => {
                self.stats.increment_failed();
                debug!(request = kind, error = %e, "Transport API request failed");
                Err(e)
            }
        }
    }
}
