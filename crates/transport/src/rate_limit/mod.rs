//! Admission control keyed by tenant, gateway and device
//!
//! Provides:
//! - Hierarchical checks (tenant, then gateway, then device) with refunds on rejection
//! - Separate message and data-point budgets per entity
//! - Per-tenant limits taken from the tenant profile, falling back to configured defaults
//! - Transport enable/disable per tenant
//! - Eviction on entity deletion and an idle-bucket sweep

mod bucket;

pub use bucket::{Bucket, LimitSpec, LimitWindow};

use dashmap::{DashMap, DashSet};
use devgate_common::config::RateLimitConfig;
use devgate_common::data::{DeviceId, RateLimitSpecs, TenantId};
use devgate_common::metrics;
use devgate_common::{RateLimitScope, SharedClock};
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Capabilities the limiter needs from its owner
pub trait RateLimitHost: Send + Sync + 'static {
    /// Limits of the tenant's profile if already known; must not block on a fetch
    fn tenant_limits(&self, tenant_id: TenantId) -> Option<RateLimitSpecs>;

    /// Called once per rejected request
    fn on_rate_limit_exceeded(&self, tenant_id: TenantId, scope: RateLimitScope, entity: Uuid);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BucketKind {
    Tenant,
    Gateway,
    Device,
}

/// Parsed specs of one tenant
#[derive(Debug, Default)]
struct TenantLimits {
    tenant_messages: Option<LimitSpec>,
    tenant_data_points: Option<LimitSpec>,
    device_messages: Option<LimitSpec>,
    device_data_points: Option<LimitSpec>,
    gateway_messages: Option<LimitSpec>,
    gateway_data_points: Option<LimitSpec>,
}

impl TenantLimits {
    fn parse(tenant_id: TenantId, specs: &RateLimitSpecs) -> Self {
        let parse = |name: &str, spec: &Option<String>| -> Option<LimitSpec> {
            let raw = spec.as_deref()?;
            match LimitSpec::parse(raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(tenant_id = %tenant_id, limit = name, error = %e, "Ignoring rate limit");
                    None
                }
            }
        };

        Self {
            tenant_messages: parse("tenant_messages", &specs.tenant_messages),
            tenant_data_points: parse("tenant_data_points", &specs.tenant_data_points),
            device_messages: parse("device_messages", &specs.device_messages),
            device_data_points: parse("device_data_points", &specs.device_data_points),
            gateway_messages: parse("gateway_messages", &specs.gateway_messages),
            gateway_data_points: parse("gateway_data_points", &specs.gateway_data_points),
        }
    }

    fn for_kind(&self, kind: BucketKind) -> (Option<&LimitSpec>, Option<&LimitSpec>) {
        match kind {
            BucketKind::Tenant => (self.tenant_messages.as_ref(), self.tenant_data_points.as_ref()),
            BucketKind::Gateway => (self.gateway_messages.as_ref(), self.gateway_data_points.as_ref()),
            BucketKind::Device => (self.device_messages.as_ref(), self.device_data_points.as_ref()),
        }
    }
}

/// Message and data-point buckets of one entity
#[derive(Debug)]
struct EntityBuckets {
    tenant_id: TenantId,
    messages: Option<Bucket>,
    data_points: Option<Bucket>,
    last_used: i64,
}

impl EntityBuckets {
    fn new(tenant_id: TenantId, messages: Option<&LimitSpec>, data_points: Option<&LimitSpec>, now: i64) -> Self {
        Self {
            tenant_id,
            messages: messages.map(LimitSpec::new_bucket),
            data_points: data_points.map(LimitSpec::new_bucket),
            last_used: now,
        }
    }

    fn try_acquire(&mut self, now: i64, data_points: u64) -> bool {
        self.last_used = now;
        let messages_ok = self.messages.as_mut().map_or(true, |b| b.has_room(now, 1));
        let points_ok = self
            .data_points
            .as_mut()
            .map_or(true, |b| b.has_room(now, data_points));
        if !(messages_ok && points_ok) {
            return false;
        }
        if let Some(b) = self.messages.as_mut() {
            b.consume(now, 1);
        }
        if let Some(b) = self.data_points.as_mut() {
            b.consume(now, data_points);
        }
        true
    }

    fn release(&mut self, now: i64, data_points: u64) {
        if let Some(b) = self.messages.as_mut() {
            b.refund(now, 1);
        }
        if let Some(b) = self.data_points.as_mut() {
            b.refund(now, data_points);
        }
    }
}

/// Per-tenant, per-gateway and per-device admission control
pub struct RateLimiter {
    enabled: bool,
    defaults: RateLimitSpecs,
    idle_ttl_ms: i64,
    host: Arc<dyn RateLimitHost>,
    clock: SharedClock,
    limits: DashMap<TenantId, Arc<TenantLimits>>,
    tenants: DashMap<TenantId, EntityBuckets>,
    gateways: DashMap<DeviceId, EntityBuckets>,
    devices: DashMap<DeviceId, EntityBuckets>,
    disabled_tenants: DashSet<TenantId>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, host: Arc<dyn RateLimitHost>, clock: SharedClock) -> Self {
        Self {
            enabled: config.enabled,
            defaults: config.defaults.clone(),
            idle_ttl_ms: config.idle_bucket_ttl_ms as i64,
            host,
            clock,
            limits: DashMap::new(),
            tenants: DashMap::new(),
            gateways: DashMap::new(),
            devices: DashMap::new(),
            disabled_tenants: DashSet::new(),
        }
    }

    /// Admit one message for a single scope
    ///
    /// `key` is the tenant id for TENANT scope, the gateway id for GATEWAY
    /// and the device id otherwise.
    pub fn check_limit(&self, scope: RateLimitScope, tenant_id: TenantId, key: Uuid) -> bool {
        if !self.enabled {
            return true;
        }
        if self.disabled_tenants.contains(&tenant_id) {
            return false;
        }

        let now = self.clock.now_millis();
        let limits = self.limits_for(tenant_id);
        let admitted = match scope {
            RateLimitScope::Tenant => {
                acquire(&self.tenants, tenant_id, tenant_id, &limits, BucketKind::Tenant, now, 0)
            }
            RateLimitScope::Gateway => acquire(
                &self.gateways,
                DeviceId::from_uuid(key),
                tenant_id,
                &limits,
                BucketKind::Gateway,
                now,
                0,
            ),
            RateLimitScope::Device | RateLimitScope::GatewayDevice => acquire(
                &self.devices,
                DeviceId::from_uuid(key),
                tenant_id,
                &limits,
                BucketKind::Device,
                now,
                0,
            ),
        };

        if !admitted {
            self.rejected(tenant_id, scope, key);
        }
        admitted
    }

    /// Admit one message carrying `data_points` values
    ///
    /// Checks tenant, then gateway (when the traffic is gateway-routed), then
    /// device. A later rejection gives back what earlier scopes consumed.
    pub fn check_limits(
        &self,
        tenant_id: TenantId,
        gateway_id: Option<DeviceId>,
        device_id: Option<DeviceId>,
        data_points: u64,
    ) -> std::result::Result<(), RateLimitScope> {
        if !self.enabled {
            return Ok(());
        }
        if self.disabled_tenants.contains(&tenant_id) {
            debug!(tenant_id = %tenant_id, "Transport disabled for tenant");
            return Err(RateLimitScope::Tenant);
        }

        let now = self.clock.now_millis();
        let limits = self.limits_for(tenant_id);

        if !acquire(&self.tenants, tenant_id, tenant_id, &limits, BucketKind::Tenant, now, data_points) {
            return Err(self.rejected(tenant_id, RateLimitScope::Tenant, tenant_id.id()));
        }

        if let Some(gateway_id) = gateway_id {
            if !acquire(&self.gateways, gateway_id, tenant_id, &limits, BucketKind::Gateway, now, data_points) {
                release(&self.tenants, &tenant_id, now, data_points);
                return Err(self.rejected(tenant_id, RateLimitScope::Gateway, gateway_id.id()));
            }
        }

        if let Some(device_id) = device_id {
            if !acquire(&self.devices, device_id, tenant_id, &limits, BucketKind::Device, now, data_points) {
                release(&self.tenants, &tenant_id, now, data_points);
                if let Some(gateway_id) = gateway_id {
                    release(&self.gateways, &gateway_id, now, data_points);
                }
                let scope = if gateway_id.is_some() {
                    RateLimitScope::GatewayDevice
                } else {
                    RateLimitScope::Device
                };
                return Err(self.rejected(tenant_id, scope, device_id.id()));
            }
        }

        Ok(())
    }

    /// Message tokens left for an entity, `None` when it has no message bucket
    pub fn available_tokens(&self, scope: RateLimitScope, key: Uuid) -> Option<u64> {
        let now = self.clock.now_millis();
        let available = |buckets: &mut EntityBuckets| buckets.messages.as_mut().map(|b| b.available(now));
        match scope {
            RateLimitScope::Tenant => self
                .tenants
                .get_mut(&TenantId::from_uuid(key))
                .and_then(|mut e| available(&mut e)),
            RateLimitScope::Gateway => self
                .gateways
                .get_mut(&DeviceId::from_uuid(key))
                .and_then(|mut e| available(&mut e)),
            RateLimitScope::Device | RateLimitScope::GatewayDevice => self
                .devices
                .get_mut(&DeviceId::from_uuid(key))
                .and_then(|mut e| available(&mut e)),
        }
    }

    /// Rebuild limits of a tenant whose profile changed
    pub fn update_tenant(&self, tenant_id: TenantId) {
        self.limits.remove(&tenant_id);
        self.tenants.remove(&tenant_id);
        self.gateways.retain(|_, b| b.tenant_id != tenant_id);
        self.devices.retain(|_, b| b.tenant_id != tenant_id);
        debug!(tenant_id = %tenant_id, "Rate limits refreshed");
    }

    pub fn update_tenants<'a>(&self, tenant_ids: impl IntoIterator<Item = &'a TenantId>) {
        for tenant_id in tenant_ids {
            self.update_tenant(*tenant_id);
        }
    }

    /// Apply the tenant's API usage state
    pub fn set_transport_enabled(&self, tenant_id: TenantId, enabled: bool) {
        if enabled {
            self.disabled_tenants.remove(&tenant_id);
        } else {
            self.disabled_tenants.insert(tenant_id);
        }
        debug!(tenant_id = %tenant_id, enabled, "Transport usage state updated");
    }

    pub fn is_transport_enabled(&self, tenant_id: TenantId) -> bool {
        !self.disabled_tenants.contains(&tenant_id)
    }

    /// Purge everything held for a deleted tenant
    pub fn remove_tenant(&self, tenant_id: TenantId) {
        self.update_tenant(tenant_id);
        self.disabled_tenants.remove(&tenant_id);
    }

    /// Purge buckets of a deleted device
    pub fn remove_device(&self, device_id: DeviceId) {
        self.devices.remove(&device_id);
        self.gateways.remove(&device_id);
    }

    /// Drop buckets untouched for longer than the idle TTL; returns how many went
    pub fn sweep_idle(&self) -> usize {
        let horizon = self.clock.now_millis() - self.idle_ttl_ms;
        let before = self.bucket_count();
        self.tenants.retain(|_, b| b.last_used > horizon);
        self.gateways.retain(|_, b| b.last_used > horizon);
        self.devices.retain(|_, b| b.last_used > horizon);
        let removed = before.saturating_sub(self.bucket_count());
        if removed > 0 {
            debug!(removed, "Idle rate limit buckets evicted");
        }
        removed
    }

    /// Entities currently holding buckets
    pub fn bucket_count(&self) -> usize {
        self.tenants.len() + self.gateways.len() + self.devices.len()
    }

    fn limits_for(&self, tenant_id: TenantId) -> Arc<TenantLimits> {
        if let Some(limits) = self.limits.get(&tenant_id) {
            return limits.clone();
        }
        let specs = self
            .host
            .tenant_limits(tenant_id)
            .unwrap_or_else(|| self.defaults.clone());
        let limits = Arc::new(TenantLimits::parse(tenant_id, &specs));
        self.limits.insert(tenant_id, limits.clone());
        limits
    }

    fn rejected(&self, tenant_id: TenantId, scope: RateLimitScope, entity: Uuid) -> RateLimitScope {
        metrics::record_rate_limited(scope.as_str());
        self.host.on_rate_limit_exceeded(tenant_id, scope, entity);
        scope
    }
}

fn acquire<K: Eq + Hash + Copy>(
    buckets: &DashMap<K, EntityBuckets>,
    key: K,
    tenant_id: TenantId,
    limits: &TenantLimits,
    kind: BucketKind,
    now: i64,
    data_points: u64,
) -> bool {
    let (messages, points) = limits.for_kind(kind);
    if messages.is_none() && points.is_none() {
        return true;
    }
    let mut entry = buckets
        .entry(key)
        .or_insert_with(|| EntityBuckets::new(tenant_id, messages, points, now));
    entry.try_acquire(now, data_points)
}

fn release<K: Eq + Hash>(buckets: &DashMap<K, EntityBuckets>, key: &K, now: i64, data_points: u64) {
    if let Some(mut entry) = buckets.get_mut(key) {
        entry.release(now, data_points);
    }
}
