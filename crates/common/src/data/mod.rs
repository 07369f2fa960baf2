//! Entity data shared between the transport and the system of record
//!
//! Provides:
//! - Typed identifiers
//! - Device, device-profile and tenant-profile descriptors
//! - Resource descriptors and keys
//! - Wire encoding helpers for broadcast payloads

mod ids;

pub use ids::{
    CustomerId, DeviceId, DeviceProfileId, EntityId, EntityType, RuleChainId, TenantId,
    TenantProfileId,
};

use crate::errors::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Transport a device profile is bound to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceTransportType {
    /// Accepted by every transport
    #[default]
    Default,
    Mqtt,
    Coap,
    Lwm2m,
    Snmp,
}

/// Device as known to the system of record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub tenant_id: TenantId,
    pub customer_id: Option<CustomerId>,
    pub name: String,
    pub device_type: String,
    pub device_profile_id: DeviceProfileId,
    #[serde(default)]
    pub additional_info: serde_json::Value,
}

/// Device identity returned by credential validation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    pub tenant_id: TenantId,
    pub customer_id: Option<CustomerId>,
    pub device_id: DeviceId,
    pub device_name: String,
    pub device_type: String,
    pub device_profile_id: DeviceProfileId,
    #[serde(default)]
    pub is_gateway: bool,
}

/// Shared configuration template for devices
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceProfile {
    pub id: DeviceProfileId,
    pub tenant_id: TenantId,
    pub name: String,
    pub default_rule_chain_id: Option<RuleChainId>,
    pub default_queue_name: Option<String>,
    #[serde(default)]
    pub transport_type: DeviceTransportType,
}

/// Rate-limit specs per scope, each `"capacity:windowSeconds[,capacity:windowSeconds]"`
///
/// `None` or an empty string means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RateLimitSpecs {
    #[serde(default)]
    pub tenant_messages: Option<String>,
    #[serde(default)]
    pub tenant_data_points: Option<String>,
    #[serde(default)]
    pub device_messages: Option<String>,
    #[serde(default)]
    pub device_data_points: Option<String>,
    #[serde(default)]
    pub gateway_messages: Option<String>,
    #[serde(default)]
    pub gateway_data_points: Option<String>,
}

/// Tenant-wide configuration template
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenantProfile {
    pub id: TenantProfileId,
    pub name: String,
    #[serde(default)]
    pub isolated_rule_engine: bool,
    #[serde(default)]
    pub rate_limits: RateLimitSpecs,
}

/// Tenant with its profile assignment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub tenant_profile_id: TenantProfileId,
}

/// Per-tenant usage switches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiUsageState {
    pub tenant_id: TenantId,
    pub transport_enabled: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Lwm2mModel,
    JksKeystore,
    Pkcs12,
    JsModule,
}

/// Composite resource key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub tenant_id: TenantId,
    pub resource_type: ResourceType,
    pub resource_key: String,
}

impl ResourceKey {
    pub fn new(tenant_id: TenantId, resource_type: ResourceType, key: impl Into<String>) -> Self {
        Self {
            tenant_id,
            resource_type,
            resource_key: key.into(),
        }
    }

    /// Same resource under the system tenant
    pub fn system_fallback(&self) -> Self {
        Self {
            tenant_id: TenantId::SYSTEM,
            ..self.clone()
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{:?}/{}",
            self.tenant_id, self.resource_type, self.resource_key
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub tenant_id: TenantId,
    pub resource_type: ResourceType,
    pub resource_key: String,
    pub title: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Resource {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.tenant_id, self.resource_type, self.resource_key.clone())
    }
}

/// Encode an entity for the wire
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode an entity from the wire
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}
