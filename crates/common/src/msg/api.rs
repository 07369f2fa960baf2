//! Request/response pairs for the transport API backend

use crate::data::{ApiUsageState, DeviceId, DeviceInfo, EntityId, EntityType, Resource, ResourceKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ValidateCredentialsRequest {
    AccessToken {
        token: String,
    },
    Basic {
        client_id: Option<String>,
        username: Option<String>,
        password: Option<String>,
    },
    X509 {
        certificate: String,
    },
}

impl ValidateCredentialsRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ValidateCredentialsRequest::AccessToken { .. } => "access_token",
            ValidateCredentialsRequest::Basic { .. } => "basic",
            ValidateCredentialsRequest::X509 { .. } => "x509",
        }
    }
}

/// Device identity, optionally with the device profile piggy-backed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ValidateDeviceResponse {
    pub device_info: Option<DeviceInfo>,
    pub profile_bytes: Option<Vec<u8>>,
    pub credentials: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetOrCreateDeviceRequest {
    pub gateway_id: DeviceId,
    pub device_name: String,
    pub device_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GetOrCreateDeviceResponse {
    pub device_info: Option<DeviceInfo>,
    pub profile_bytes: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionDeviceRequest {
    pub device_name: String,
    pub provision_key: String,
    pub provision_secret: String,
    pub credentials_type: Option<String>,
    pub credentials_value: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionStatus {
    Success,
    NotFound,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionDeviceResponse {
    pub status: ProvisionStatus,
    pub credentials_type: Option<String>,
    pub credentials_value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetEntityProfileRequest {
    pub entity: EntityId,
}

/// Encoded profile of the requested entity; `data` is absent when unknown
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetEntityProfileResponse {
    pub entity_type: EntityType,
    pub data: Option<Vec<u8>>,
    pub api_usage_state: Option<ApiUsageState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetResourceRequest {
    pub key: ResourceKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GetResourceResponse {
    pub resource: Option<Resource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TransportApiRequest {
    ValidateCredentials(ValidateCredentialsRequest),
    GetOrCreateDevice(GetOrCreateDeviceRequest),
    Provision(ProvisionDeviceRequest),
    GetEntityProfile(GetEntityProfileRequest),
    GetResource(GetResourceRequest),
}

impl TransportApiRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportApiRequest::ValidateCredentials(_) => "validate_credentials",
            TransportApiRequest::GetOrCreateDevice(_) => "get_or_create_device",
            TransportApiRequest::Provision(_) => "provision",
            TransportApiRequest::GetEntityProfile(_) => "get_entity_profile",
            TransportApiRequest::GetResource(_) => "get_resource",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TransportApiResponse {
    ValidateCredentials(ValidateDeviceResponse),
    GetOrCreateDevice(GetOrCreateDeviceResponse),
    Provision(ProvisionDeviceResponse),
    GetEntityProfile(GetEntityProfileResponse),
    GetResource(GetResourceResponse),
}
