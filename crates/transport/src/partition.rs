//! Topic and partition resolution
//!
//! Maps an entity id to a partition of the core or rule-engine topic. The
//! mapping only depends on the id and the partition count, so every node in
//! the cluster resolves the same partition.

use devgate_common::config::QueueConfig;
use devgate_common::data::TenantId;
use devgate_common::queue::TopicPartitionInfo;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue used when a profile names none
pub const MAIN_QUEUE_NAME: &str = "Main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    Core,
    RuleEngine,
    Transport,
}

#[derive(Debug, Clone)]
pub struct PartitionService {
    core_topic: String,
    core_partitions: u32,
    rule_engine_topic: String,
    rule_engine_partitions: u32,
    notifications_topic: String,
}

impl PartitionService {
    pub fn new(queue: &QueueConfig, notifications_topic: String) -> Self {
        Self {
            core_topic: queue.core_topic.clone(),
            core_partitions: queue.core_partitions.max(1),
            rule_engine_topic: queue.rule_engine_topic.clone(),
            rule_engine_partitions: queue.rule_engine_partitions.max(1),
            notifications_topic,
        }
    }

    /// Partition of the core topic owning `entity`
    pub fn core_partition(&self, tenant_id: TenantId, entity: Uuid) -> TopicPartitionInfo {
        TopicPartitionInfo::new(
            self.core_topic.clone(),
            Some(partition_of(entity, self.core_partitions)),
        )
        .with_tenant(tenant_id)
    }

    /// Partition of a rule-engine queue owning `entity`
    pub fn rule_engine_partition(
        &self,
        queue_name: Option<&str>,
        tenant_id: TenantId,
        entity: Uuid,
    ) -> TopicPartitionInfo {
        let queue_name = queue_name.unwrap_or(MAIN_QUEUE_NAME);
        TopicPartitionInfo::new(
            format!("{}.{}", self.rule_engine_topic, queue_name),
            Some(partition_of(entity, self.rule_engine_partitions)),
        )
        .with_tenant(tenant_id)
    }

    /// Notifications topic this node consumes
    pub fn notifications_topic(&self) -> TopicPartitionInfo {
        TopicPartitionInfo::new(self.notifications_topic.clone(), None)
    }

    /// Resolve the topic partition for a service type
    pub fn resolve(
        &self,
        service_type: ServiceType,
        queue_name: Option<&str>,
        tenant_id: TenantId,
        entity: Uuid,
    ) -> TopicPartitionInfo {
        match service_type {
            ServiceType::Core => self.core_partition(tenant_id, entity),
            ServiceType::RuleEngine => self.rule_engine_partition(queue_name, tenant_id, entity),
            ServiceType::Transport => self.notifications_topic(),
        }
    }
}

/// Fold the 128-bit id into a partition index
pub fn partition_of(id: Uuid, partitions: u32) -> u32 {
    let bits = id.as_u128();
    let folded = ((bits >> 64) as u64) ^ (bits as u64);
    (folded % partitions.max(1) as u64) as u32
}
