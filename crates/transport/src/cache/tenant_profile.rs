use super::{fetch_entity_profile, lock, SingleFlight};
use crate::api::TransportApi;
use dashmap::DashMap;
use devgate_common::data::{decode, ApiUsageState, TenantId, TenantProfile, TenantProfileId};
use devgate_common::metrics;
use devgate_common::{Result, TransportError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Outcome of a broadcast tenant-profile update
#[derive(Debug, Clone)]
pub struct TenantProfileUpdateResult {
    pub profile: Arc<TenantProfile>,
    /// Tenants currently mapped to the profile
    pub affected_tenants: HashSet<TenantId>,
}

/// Result of `TenantProfileCache::get`
#[derive(Debug, Clone, Default)]
pub struct TenantProfileLookup {
    pub profile: Option<Arc<TenantProfile>>,
    /// Usage state returned alongside a fetched profile
    pub api_usage_state: Option<ApiUsageState>,
    /// Whether the backend was asked
    pub fetched: bool,
    /// Whether this call moved the tenant onto a different profile
    pub reassigned: bool,
}

/// Tenant profiles plus the tenant → profile assignment
pub struct TenantProfileCache {
    profiles: DashMap<TenantProfileId, Arc<TenantProfile>>,
    tenant_profiles: DashMap<TenantId, TenantProfileId>,
    profile_tenants: DashMap<TenantProfileId, HashSet<TenantId>>,
    flights: SingleFlight<TenantId, TenantProfileLookup>,
    epoch: AtomicU64,
    update_lock: Mutex<()>,
    api: Arc<dyn TransportApi>,
}

impl TenantProfileCache {
    pub fn new(api: Arc<dyn TransportApi>) -> Self {
        Self {
            profiles: DashMap::new(),
            tenant_profiles: DashMap::new(),
            profile_tenants: DashMap::new(),
            flights: SingleFlight::new(),
            epoch: AtomicU64::new(0),
            update_lock: Mutex::new(()),
            api,
        }
    }

    /// Profile of `tenant_id`, fetched from the backend on a miss
    pub async fn get(&self, tenant_id: TenantId) -> Result<TenantProfileLookup> {
        if let Some(profile) = self.peek_for_tenant(tenant_id) {
            metrics::record_cache(true, "tenant_profile");
            return Ok(TenantProfileLookup {
                profile: Some(profile),
                ..Default::default()
            });
        }
        metrics::record_cache(false, "tenant_profile");

        let epoch = self.epoch.load(Ordering::Acquire);
        let api = self.api.clone();
        let mut reassigned = false;
        let mut lookup = self
            .flights
            .run_and_publish(
                tenant_id,
                move || {
                    // a flight that finished after the miss above has published
                    let cached = self.peek_for_tenant(tenant_id);
                    async move {
                        if cached.is_some() {
                            return Ok(TenantProfileLookup {
                                profile: cached,
                                ..Default::default()
                            });
                        }
                        let response = fetch_entity_profile(api.as_ref(), tenant_id.entity_id()).await?;
                        let profile = response
                            .data
                            .map(|bytes| decode::<TenantProfile>(&bytes))
                            .transpose()?
                            .map(Arc::new);
                        Ok::<_, TransportError>(TenantProfileLookup {
                            profile,
                            api_usage_state: response.api_usage_state,
                            fetched: true,
                            reassigned: false,
                        })
                    }
                },
                |lookup| {
                    if let Some(profile) = &lookup.profile {
                        let _guard = lock(&self.update_lock);
                        if self.epoch.load(Ordering::Acquire) == epoch {
                            self.profiles.insert(profile.id, profile.clone());
                            reassigned = self.map_tenant(tenant_id, profile.id);
                        }
                    }
                },
            )
            .await?;
        lookup.reassigned = reassigned;
        Ok(lookup)
    }

    /// Cached profile of a tenant; never fetches
    pub fn peek_for_tenant(&self, tenant_id: TenantId) -> Option<Arc<TenantProfile>> {
        let profile_id = *self.tenant_profiles.get(&tenant_id)?;
        self.profiles.get(&profile_id).map(|p| p.value().clone())
    }

    /// Store a broadcast profile update
    pub fn put(&self, bytes: &[u8]) -> Result<TenantProfileUpdateResult> {
        let profile = Arc::new(decode::<TenantProfile>(bytes)?);
        let _guard = lock(&self.update_lock);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.profiles.insert(profile.id, profile.clone());
        let affected_tenants = self
            .profile_tenants
            .get(&profile.id)
            .map(|tenants| tenants.value().clone())
            .unwrap_or_default();
        debug!(profile_id = %profile.id, affected = affected_tenants.len(), "Tenant profile updated");
        Ok(TenantProfileUpdateResult {
            profile,
            affected_tenants,
        })
    }

    /// Assign a tenant to a profile; returns whether the assignment changed
    pub fn put_tenant(&self, tenant_id: TenantId, profile_id: TenantProfileId) -> bool {
        let _guard = lock(&self.update_lock);
        let changed = self.map_tenant(tenant_id, profile_id);
        if changed {
            self.epoch.fetch_add(1, Ordering::AcqRel);
            self.flights.forget(&tenant_id);
            debug!(tenant_id = %tenant_id, profile_id = %profile_id, "Tenant profile assignment changed");
        }
        changed
    }

    /// Drop a deleted profile; returns the tenants that were using it
    pub fn remove(&self, profile_id: &TenantProfileId) -> HashSet<TenantId> {
        let _guard = lock(&self.update_lock);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.profiles.remove(profile_id);
        let tenants = self
            .profile_tenants
            .remove(profile_id)
            .map(|(_, tenants)| tenants)
            .unwrap_or_default();
        for tenant_id in &tenants {
            self.tenant_profiles.remove_if(tenant_id, |_, assigned| assigned == profile_id);
            self.flights.forget(tenant_id);
        }
        tenants
    }

    /// Forget a deleted tenant
    pub fn remove_tenant(&self, tenant_id: &TenantId) {
        let _guard = lock(&self.update_lock);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some((_, profile_id)) = self.tenant_profiles.remove(tenant_id) {
            if let Some(mut tenants) = self.profile_tenants.get_mut(&profile_id) {
                tenants.remove(tenant_id);
            }
        }
        self.flights.forget(tenant_id);
    }

    // caller holds `update_lock`
    fn map_tenant(&self, tenant_id: TenantId, profile_id: TenantProfileId) -> bool {
        let previous = self.tenant_profiles.insert(tenant_id, profile_id);
        if previous == Some(profile_id) {
            return false;
        }
        if let Some(previous) = previous {
            if let Some(mut tenants) = self.profile_tenants.get_mut(&previous) {
                tenants.remove(&tenant_id);
            }
        }
        self.profile_tenants
            .entry(profile_id)
            .or_default()
            .insert(tenant_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MockTransportApi;
    use devgate_common::data::{encode, EntityType, RateLimitSpecs};
    use devgate_common::msg::{GetEntityProfileResponse, TransportApiResponse};
    use std::time::Duration;

    fn profile(limit: &str) -> TenantProfile {
        TenantProfile {
            id: TenantProfileId::random(),
            name: "default".to_string(),
            isolated_rule_engine: false,
            rate_limits: RateLimitSpecs {
                tenant_messages: Some(limit.to_string()),
                ..Default::default()
            },
        }
    }

    fn api_returning(profile: &TenantProfile, usage: Option<ApiUsageState>) -> Arc<MockTransportApi> {
        let data = encode(profile).unwrap();
        Arc::new(
            MockTransportApi::new(move |_| {
                Ok(TransportApiResponse::GetEntityProfile(GetEntityProfileResponse {
                    entity_type: EntityType::TenantProfile,
                    data: Some(data.clone()),
                    api_usage_state: usage.clone(),
                }))
            })
            .with_delay(Duration::from_millis(20)),
        )
    }

    #[tokio::test]
    async fn test_get_fetches_once_and_maps_tenant() {
        let p = profile("10:60");
        let tenant = TenantId::random();
        let usage = ApiUsageState {
            tenant_id: tenant,
            transport_enabled: false,
        };
        let api = api_returning(&p, Some(usage.clone()));
        let cache = TenantProfileCache::new(api.clone());

        let first = cache.get(tenant).await.unwrap();
        assert!(first.fetched);
        assert_eq!(first.profile.unwrap().id, p.id);
        assert_eq!(first.api_usage_state, Some(usage));

        assert!(first.reassigned);

        let second = cache.get(tenant).await.unwrap();
        assert!(!second.fetched);
        assert!(!second.reassigned);
        assert_eq!(api.calls(), 1);
        assert_eq!(cache.peek_for_tenant(tenant).unwrap().id, p.id);
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_fetch() {
        let p = profile("10:60");
        let api = api_returning(&p, None);
        let cache = Arc::new(TenantProfileCache::new(api.clone()));
        let tenant = TenantId::random();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get(tenant).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().profile.is_some());
        }
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn test_put_reports_affected_tenants() {
        let mut p = profile("10:60");
        let api = api_returning(&p, None);
        let cache = TenantProfileCache::new(api);
        let a = TenantId::random();
        let b = TenantId::random();
        assert!(cache.put_tenant(a, p.id));
        assert!(cache.put_tenant(b, p.id));
        assert!(!cache.put_tenant(b, p.id));

        p.rate_limits.tenant_messages = Some("1:60".to_string());
        let result = cache.put(&encode(&p).unwrap()).unwrap();
        assert_eq!(result.affected_tenants, HashSet::from([a, b]));
        assert_eq!(
            cache.peek_for_tenant(a).unwrap().rate_limits.tenant_messages.as_deref(),
            Some("1:60")
        );
    }

    #[tokio::test]
    async fn test_reassignment_moves_tenant() {
        let p1 = profile("10:60");
        let p2 = profile("20:60");
        let cache = TenantProfileCache::new(api_returning(&p1, None));
        let tenant = TenantId::random();

        cache.put_tenant(tenant, p1.id);
        assert!(cache.put_tenant(tenant, p2.id));
        cache.put(&encode(&p1).unwrap()).unwrap();
        let result = cache.put(&encode(&p2).unwrap()).unwrap();
        assert_eq!(result.affected_tenants, HashSet::from([tenant]));
        assert_eq!(cache.peek_for_tenant(tenant).unwrap().id, p2.id);
    }

    #[tokio::test]
    async fn test_remove_profile_returns_tenants() {
        let p = profile("10:60");
        let cache = TenantProfileCache::new(api_returning(&p, None));
        let tenant = TenantId::random();
        cache.put_tenant(tenant, p.id);
        cache.put(&encode(&p).unwrap()).unwrap();

        let affected = cache.remove(&p.id);
        assert_eq!(affected, HashSet::from([tenant]));
        assert!(cache.peek_for_tenant(tenant).is_none());
        assert!(cache.remove(&p.id).is_empty());
    }

    #[tokio::test]
    async fn test_remove_tenant() {
        let p = profile("10:60");
        let cache = TenantProfileCache::new(api_returning(&p, None));
        let tenant = TenantId::random();
        cache.get(tenant).await.unwrap();
        cache.remove_tenant(&tenant);
        assert!(cache.peek_for_tenant(tenant).is_none());
        let result = cache.put(&encode(&p).unwrap()).unwrap();
        assert!(result.affected_tenants.is_empty());
    }
}
