//! Message types crossing the transport boundary
//!
//! Provides:
//! - Session identity and lifecycle events
//! - Device-originated payloads (telemetry, attributes, RPC, claims)
//! - Outbound envelopes for the core and rule-engine stages
//! - Inbound unicast and broadcast notifications

mod api;

pub use api::{
    GetEntityProfileRequest, GetEntityProfileResponse, GetOrCreateDeviceRequest,
    GetOrCreateDeviceResponse, GetResourceRequest, GetResourceResponse, ProvisionDeviceRequest,
    ProvisionDeviceResponse, ProvisionStatus, TransportApiRequest, TransportApiResponse,
    ValidateCredentialsRequest, ValidateDeviceResponse,
};

use crate::data::{CustomerId, DeviceId, DeviceProfileId, EntityId, ResourceKey, RuleChainId, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Synchronous sessions expect one bounded response; asynchronous ones are long-lived
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionType {
    Sync,
    Async,
}

/// Identity bound to a device session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub node_id: String,
    pub tenant_id: TenantId,
    pub customer_id: Option<CustomerId>,
    pub device_id: DeviceId,
    pub device_name: String,
    pub device_type: String,
    pub device_profile_id: DeviceProfileId,
    /// Set when the device talks through a gateway
    pub gateway_id: Option<DeviceId>,
    pub gateway_session_id: Option<Uuid>,
    #[serde(default)]
    pub is_gateway: bool,
}

impl SessionInfo {
    pub fn is_gateway_routed(&self) -> bool {
        self.gateway_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEvent {
    Open,
    Closed,
}

/// Single key/value pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: serde_json::Value,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Key/values sharing one timestamp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TsKvList {
    pub ts: i64,
    pub values: Vec<KeyValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PostTelemetryMsg {
    pub entries: Vec<TsKvList>,
}

impl PostTelemetryMsg {
    pub fn data_points(&self) -> u64 {
        self.entries.iter().map(|e| e.values.len() as u64).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PostAttributeMsg {
    pub values: Vec<KeyValue>,
}

impl PostAttributeMsg {
    pub fn data_points(&self) -> u64 {
        self.values.len() as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GetAttributeRequestMsg {
    pub request_id: i32,
    pub client_keys: Vec<String>,
    pub shared_keys: Vec<String>,
    #[serde(default)]
    pub only_shared: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GetAttributeResponseMsg {
    pub request_id: i32,
    pub client_attributes: Vec<KeyValue>,
    pub shared_attributes: Vec<KeyValue>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AttributeUpdateNotificationMsg {
    pub shared_updated: Vec<KeyValue>,
    pub shared_deleted: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SubscribeToAttributeUpdatesMsg {
    pub unsubscribe: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SubscribeToRpcMsg {
    pub unsubscribe: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToDeviceRpcRequestMsg {
    pub request_id: i32,
    pub method: String,
    pub params: String,
    pub expiration_time: i64,
    #[serde(default)]
    pub oneway: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToDeviceRpcResponseMsg {
    pub request_id: i32,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToServerRpcRequestMsg {
    pub request_id: i32,
    pub method: String,
    pub params: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToServerRpcResponseMsg {
    pub request_id: i32,
    pub payload: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionCloseReason {
    SessionTimeout,
    CredentialsUpdated,
    MaxConcurrentSessions,
    DeviceDeleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionCloseNotification {
    pub reason: SessionCloseReason,
    pub message: String,
}

impl SessionCloseNotification {
    pub fn timeout() -> Self {
        Self {
            reason: SessionCloseReason::SessionTimeout,
            message: "session timeout".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClaimDeviceMsg {
    pub secret_key: String,
    pub duration_ms: i64,
}

/// Subscription flags and liveness reported to the core stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SubscriptionInfo {
    pub attribute_subscription: bool,
    pub rpc_subscription: bool,
    pub last_activity_time: i64,
}

/// Rule-engine message kinds produced by the transport
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgType {
    PostTelemetryRequest,
    PostAttributesRequest,
    ToServerRpcRequest,
}

/// Routing-agnostic envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutedMsg {
    pub id: Uuid,
    pub ts: i64,
    pub msg_type: MsgType,
    pub originator: EntityId,
    pub customer_id: Option<CustomerId>,
    pub rule_chain_id: Option<RuleChainId>,
    pub queue_name: Option<String>,
    pub metadata: HashMap<String, String>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToRuleEngineMsg {
    pub tenant_id: TenantId,
    pub msg: RoutedMsg,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageRecordKey {
    TransportMsgCount,
    TransportDpCount,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageStatsItem {
    pub tenant_id: TenantId,
    pub customer_id: Option<CustomerId>,
    pub key: UsageRecordKey,
    pub value: u64,
}

/// Messages for the core (device state) stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ToCoreMsg {
    SessionEvent {
        session: SessionInfo,
        event: SessionEvent,
    },
    SubscribeToAttributes {
        session: SessionInfo,
        msg: SubscribeToAttributeUpdatesMsg,
    },
    SubscribeToRpc {
        session: SessionInfo,
        msg: SubscribeToRpcMsg,
    },
    GetAttributes {
        session: SessionInfo,
        msg: GetAttributeRequestMsg,
    },
    ToDeviceRpcResponse {
        session: SessionInfo,
        msg: ToDeviceRpcResponseMsg,
    },
    SubscriptionInfo {
        session: SessionInfo,
        info: SubscriptionInfo,
    },
    ClaimDevice {
        session: SessionInfo,
        msg: ClaimDeviceMsg,
    },
    UsageStats {
        service_id: String,
        items: Vec<UsageStatsItem>,
    },
}

/// Payloads addressed to a single session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SessionNotification {
    GetAttributesResponse(GetAttributeResponseMsg),
    AttributeUpdate(AttributeUpdateNotificationMsg),
    SessionClose(SessionCloseNotification),
    ToDeviceRpcRequest(ToDeviceRpcRequestMsg),
    ToServerRpcResponse(ToServerRpcResponseMsg),
}

/// Broadcast entity changes, payloads in wire encoding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EntityUpdateMsg {
    Device(Vec<u8>),
    DeviceProfile(Vec<u8>),
    Tenant(Vec<u8>),
    TenantProfile(Vec<u8>),
    ApiUsageState(Vec<u8>),
}

/// Notifications consumed by a transport node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ToTransportMsg {
    Session {
        session_id: Uuid,
        notification: SessionNotification,
    },
    EntityUpdate(EntityUpdateMsg),
    EntityDelete(EntityId),
    ResourceUpdate(ResourceKey),
    ResourceDelete(ResourceKey),
}
