//! devgate Common Library
//!
//! Shared code for the devgate transport services including:
//! - Typed entity ids, profiles and resources
//! - Transport messages and envelopes
//! - Queue boundary (producer/consumer, request correlation, in-memory broker)
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability
//! - Clock abstraction

pub mod config;
pub mod data;
pub mod errors;
pub mod metrics;
pub mod msg;
pub mod queue;
pub mod time;

// Re-export commonly used types
pub use config::AppConfig;
pub use errors::{RateLimitScope, Result, TransportError};
pub use time::{Clock, ManualClock, SharedClock, SystemClock};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
