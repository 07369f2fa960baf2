//! devgate Transport Layer
//!
//! Device-facing session and traffic-control layer shared by every protocol
//! adapter. Provides:
//! - Token-bucket rate limiting per tenant, gateway and device
//! - Activity tracking with pluggable reporting strategies
//! - Device profile, tenant profile and resource caches
//! - Session registry with sync timeouts
//! - Routing of device traffic to the core and rule-engine stages

pub mod activity;
pub mod api;
pub mod cache;
pub mod executor;
pub mod partition;
pub mod rate_limit;
pub mod service;
pub mod session;

pub use activity::{ActivityHost, ActivityTracker};
pub use api::{QueueTransportApi, TransportApi};
pub use cache::{DeviceProfileCache, ResourceCache, TenantProfileCache};
pub use executor::CallbackExecutor;
pub use partition::{PartitionService, ServiceType};
pub use rate_limit::{RateLimitHost, RateLimiter};
pub use service::{ServiceCallback, TransportQueues, TransportService, TransportServiceCallback};
pub use session::{SessionMetaData, SessionMsgListener, SessionRegistry};
