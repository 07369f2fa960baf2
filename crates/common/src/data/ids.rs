//! Typed entity identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of entity an identifier points at
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Tenant,
    Customer,
    Device,
    DeviceProfile,
    TenantProfile,
    RuleChain,
    ApiUsageState,
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident => $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub const ENTITY_TYPE: EntityType = $kind;

            /// Random (v4) identifier
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn id(&self) -> Uuid {
                self.0
            }

            /// Untyped form used in envelopes and broadcasts
            pub fn entity_id(&self) -> EntityId {
                EntityId::new($kind, self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

entity_id!(
    /// Tenant identifier; the nil UUID is the system tenant
    TenantId => EntityType::Tenant
);
entity_id!(CustomerId => EntityType::Customer);
entity_id!(DeviceId => EntityType::Device);
entity_id!(DeviceProfileId => EntityType::DeviceProfile);
entity_id!(TenantProfileId => EntityType::TenantProfile);
entity_id!(RuleChainId => EntityType::RuleChain);

impl TenantId {
    /// Owner of system-wide resources
    pub const SYSTEM: TenantId = TenantId(Uuid::nil());

    pub fn is_system(&self) -> bool {
        self.0.is_nil()
    }
}

/// Untyped entity reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub entity_type: EntityType,
    pub id: Uuid,
}

impl EntityId {
    pub fn new(entity_type: EntityType, id: Uuid) -> Self {
        Self { entity_type, id }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{}]", self.entity_type, self.id)
    }
}
