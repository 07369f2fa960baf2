use super::callback::{ServiceCallback, TransportServiceCallback};
use super::producer::StageProducer;
use crate::partition::PartitionService;
use dashmap::DashMap;
use devgate_common::data::{CustomerId, TenantId};
use devgate_common::msg::{ToCoreMsg, UsageRecordKey, UsageStatsItem};
use devgate_common::{Result, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

type UsageKey = (TenantId, Option<CustomerId>, UsageRecordKey);

/// Transport message and data-point counters per tenant and customer
#[derive(Default)]
pub struct UsageStatsAggregator {
    counters: DashMap<UsageKey, u64>,
}

impl UsageStatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one delivered message carrying `data_points` values
    pub fn record(&self, tenant_id: TenantId, customer_id: Option<CustomerId>, data_points: u64) {
        *self
            .counters
            .entry((tenant_id, customer_id, UsageRecordKey::TransportMsgCount))
            .or_insert(0) += 1;
        if data_points > 0 {
            *self
                .counters
                .entry((tenant_id, customer_id, UsageRecordKey::TransportDpCount))
                .or_insert(0) += data_points;
        }
    }

    /// Take every non-zero counter, resetting it
    pub fn drain(&self) -> Vec<UsageStatsItem> {
        let keys: Vec<UsageKey> = self.counters.iter().map(|e| *e.key()).collect();
        keys.into_iter()
            .filter_map(|key| {
                let (_, value) = self.counters.remove(&key)?;
                (value > 0).then(|| UsageStatsItem {
                    tenant_id: key.0,
                    customer_id: key.1,
                    key: key.2,
                    value,
                })
            })
            .collect()
    }

    /// Send drained counters to the core stage, one message per tenant
    ///
    /// Counters of a failed send are added back for the next flush.
    pub async fn flush(
        &self,
        service_id: &str,
        producer: &StageProducer<ToCoreMsg>,
        partitions: &PartitionService,
    ) -> Result<usize> {
        let mut by_tenant: HashMap<TenantId, Vec<UsageStatsItem>> = HashMap::new();
        for item in self.drain() {
            by_tenant.entry(item.tenant_id).or_default().push(item);
        }

        let tenants = by_tenant.len();
        let mut first_error: Option<TransportError> = None;
        for (tenant_id, items) in by_tenant {
            let tpi = partitions.core_partition(tenant_id, tenant_id.id());
            let msg = ToCoreMsg::UsageStats {
                service_id: service_id.to_string(),
                items: items.clone(),
            };
            if let Err(e) = producer.send(&tpi, Uuid::new_v4(), msg).await {
                self.restore(items);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                if tenants > 0 {
                    debug!(tenants, "Usage stats flushed");
                }
                Ok(tenants)
            }
        }
    }

    fn restore(&self, items: Vec<UsageStatsItem>) {
        for item in items {
            *self
                .counters
                .entry((item.tenant_id, item.customer_id, item.key))
                .or_insert(0) += item.value;
        }
    }
}

/// Counts usage once the wrapped request succeeded
pub struct UsageCallback {
    usage: Arc<UsageStatsAggregator>,
    tenant_id: TenantId,
    customer_id: Option<CustomerId>,
    data_points: u64,
    delegate: ServiceCallback<()>,
}

impl UsageCallback {
    pub fn wrap(
        usage: Arc<UsageStatsAggregator>,
        tenant_id: TenantId,
        customer_id: Option<CustomerId>,
        data_points: u64,
        delegate: ServiceCallback<()>,
    ) -> ServiceCallback<()> {
        Arc::new(Self {
            usage,
            tenant_id,
            customer_id,
            data_points,
            delegate,
        })
    }
}

impl TransportServiceCallback<()> for UsageCallback {
    fn on_success(&self, result: ()) {
        self.usage.record(self.tenant_id, self.customer_id, self.data_points);
        self.delegate.on_success(result);
    }

    fn on_error(&self, error: TransportError) {
        self.delegate.on_error(error);
    }
}
