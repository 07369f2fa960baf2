//! Configuration management for devgate services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use crate::data::RateLimitSpecs;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AppConfig {
    /// Node identity
    #[serde(default)]
    pub service: ServiceConfig,

    /// Admission control
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Session liveness and activity reporting
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Callback and scheduler pools
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Request deadlines
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Topics and partitions
    #[serde(default)]
    pub queue: QueueConfig,

    /// Usage accounting
    #[serde(default)]
    pub usage_stats: UsageStatsConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Id used for the notifications topic of this node
    #[serde(default = "default_service_id")]
    pub service_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Specs used for tenants whose profile is not known yet
    #[serde(default)]
    pub defaults: RateLimitSpecs,

    /// Buckets untouched for this long are dropped by the sweep
    #[serde(default = "default_idle_bucket_ttl")]
    pub idle_bucket_ttl_ms: u64,

    /// Idle bucket sweep period
    #[serde(default = "default_rate_limit_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Rate-limit-exceeded events logged per tenant and scope per minute
    #[serde(default = "default_exceeded_events_per_minute")]
    pub exceeded_events_per_minute: u32,
}

/// Which activity timestamps get reported to the core stage
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityReportingStrategy {
    /// Every activity and every period end
    All,
    /// First activity of each period
    First,
    /// Latest activity at period end
    #[default]
    Last,
    /// First activity of each period and the latest at period end
    FirstAndLast,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Sessions without activity for this long are closed
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_ms: u64,

    /// Activity reporting period
    #[serde(default = "default_report_timeout")]
    pub report_timeout_ms: u64,

    #[serde(default)]
    pub activity_reporting_strategy: ActivityReportingStrategy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Concurrent listener/caller callbacks
    #[serde(default = "default_callback_pool_size")]
    pub callback_pool_size: usize,

    /// Runtime worker threads driving timers and queue I/O
    #[serde(default = "default_scheduler_threads")]
    pub scheduler_threads: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcConfig {
    /// Device-to-server RPC response deadline
    #[serde(default = "default_client_side_rpc_timeout")]
    pub client_side_timeout_ms: u64,

    /// Transport API request deadline
    #[serde(default = "default_api_request_timeout")]
    pub api_request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_core_topic")]
    pub core_topic: String,

    #[serde(default = "default_partitions")]
    pub core_partitions: u32,

    /// Prefix; the queue name is appended
    #[serde(default = "default_rule_engine_topic")]
    pub rule_engine_topic: String,

    #[serde(default = "default_partitions")]
    pub rule_engine_partitions: u32,

    /// Prefix; the service id is appended
    #[serde(default = "default_notifications_topic")]
    pub notifications_topic: String,

    #[serde(default = "default_api_requests_topic")]
    pub api_requests_topic: String,

    /// Prefix; the service id is appended
    #[serde(default = "default_api_responses_topic")]
    pub api_responses_topic: String,

    /// Long polling timeout in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum messages to receive per poll
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UsageStatsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_usage_report_interval")]
    pub report_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_service_id() -> String { "transport-1".to_string() }
fn default_enabled() -> bool { true }
fn default_idle_bucket_ttl() -> u64 { 3_600_000 }
fn default_rate_limit_sweep_interval() -> u64 { 60_000 }
fn default_exceeded_events_per_minute() -> u32 { 1 }
fn default_inactivity_timeout() -> u64 { 600_000 }
fn default_report_timeout() -> u64 { 3_000 }
fn default_callback_pool_size() -> usize { 20 }
fn default_scheduler_threads() -> usize { 2 }
fn default_client_side_rpc_timeout() -> u64 { 60_000 }
fn default_api_request_timeout() -> u64 { 10_000 }
fn default_core_topic() -> String { "devgate.core".to_string() }
fn default_partitions() -> u32 { 10 }
fn default_rule_engine_topic() -> String { "devgate.rule-engine".to_string() }
fn default_notifications_topic() -> String { "devgate.transport.notifications".to_string() }
fn default_api_requests_topic() -> String { "devgate.transport.api.requests".to_string() }
fn default_api_responses_topic() -> String { "devgate.transport.api.responses".to_string() }
fn default_poll_interval() -> u64 { 25 }
fn default_max_poll_records() -> usize { 100 }
fn default_usage_report_interval() -> u64 { 10_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "devgate-transport".to_string() }

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_id: default_service_id(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            defaults: RateLimitSpecs::default(),
            idle_bucket_ttl_ms: default_idle_bucket_ttl(),
            sweep_interval_ms: default_rate_limit_sweep_interval(),
            exceeded_events_per_minute: default_exceeded_events_per_minute(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: default_inactivity_timeout(),
            report_timeout_ms: default_report_timeout(),
            activity_reporting_strategy: ActivityReportingStrategy::default(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            callback_pool_size: default_callback_pool_size(),
            scheduler_threads: default_scheduler_threads(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            client_side_timeout_ms: default_client_side_rpc_timeout(),
            api_request_timeout_ms: default_api_request_timeout(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            core_topic: default_core_topic(),
            core_partitions: default_partitions(),
            rule_engine_topic: default_rule_engine_topic(),
            rule_engine_partitions: default_partitions(),
            notifications_topic: default_notifications_topic(),
            api_requests_topic: default_api_requests_topic(),
            api_responses_topic: default_api_responses_topic(),
            poll_interval_ms: default_poll_interval(),
            max_poll_records: default_max_poll_records(),
        }
    }
}

impl Default for UsageStatsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            report_interval_ms: default_usage_report_interval(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // e.g., APP__SESSIONS__INACTIVITY_TIMEOUT_MS=300000
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.sessions.inactivity_timeout_ms)
    }

    /// Period of the activity sweep
    pub fn report_period(&self) -> Duration {
        Duration::from_millis(self.sessions.report_timeout_ms.max(1))
    }

    pub fn client_side_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.client_side_timeout_ms)
    }

    pub fn api_request_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.api_request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue.poll_interval_ms.max(1))
    }

    /// Notifications topic consumed by this node
    pub fn notifications_topic(&self) -> String {
        format!("{}.{}", self.queue.notifications_topic, self.service.service_id)
    }

    /// Transport API responses topic consumed by this node
    pub fn api_responses_topic(&self) -> String {
        format!("{}.{}", self.queue.api_responses_topic, self.service.service_id)
    }
}
