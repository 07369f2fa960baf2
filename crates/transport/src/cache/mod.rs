//! Profile and resource caches
//!
//! Provides:
//! - A loading cache with single-flight miss collapse
//! - Device profile cache (lazy fetch, piggy-backed profiles, broadcast updates)
//! - Tenant profile cache with tenant ↔ profile mappings
//! - Resource cache with system-tenant fallback and negative entries
//!
//! Stores are guarded by an epoch: a fetch that started before an `insert` or
//! `remove` of any key returns its value to its callers but does not store it.

mod device_profile;
mod resource;
mod single_flight;
mod tenant_profile;

pub use device_profile::DeviceProfileCache;
pub use resource::ResourceCache;
pub use single_flight::SingleFlight;
pub use tenant_profile::{TenantProfileCache, TenantProfileLookup, TenantProfileUpdateResult};

use crate::api::TransportApi;
use dashmap::DashMap;
use devgate_common::data::EntityId;
use devgate_common::metrics;
use devgate_common::msg::{
    GetEntityProfileRequest, GetEntityProfileResponse, TransportApiRequest, TransportApiResponse,
};
use devgate_common::{Result, TransportError};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Concurrent map that loads missing values through a shared fetch
pub struct LoadingCache<K, V> {
    name: &'static str,
    entries: DashMap<K, Arc<V>>,
    flights: SingleFlight<K, Option<Arc<V>>>,
    epoch: AtomicU64,
    update_lock: Mutex<()>,
}

impl<K, V> LoadingCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            flights: SingleFlight::new(),
            epoch: AtomicU64::new(0),
            update_lock: Mutex::new(()),
        }
    }

    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Cached value, or the result of `fetch` shared with concurrent callers
    ///
    /// `Ok(None)` (not found) is never cached.
    pub async fn get_with<F, Fut>(&self, key: K, fetch: F) -> Result<Option<Arc<V>>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<V>>> + Send + 'static,
    {
        if let Some(value) = self.peek(&key) {
            metrics::record_cache(true, self.name);
            return Ok(Some(value));
        }
        metrics::record_cache(false, self.name);

        let epoch = self.epoch.load(Ordering::Acquire);
        let recheck = key.clone();
        self.flights
            .run_and_publish(
                key.clone(),
                move || {
                    // a flight that finished after the miss above has published
                    let cached = self.peek(&recheck);
                    let pending = cached.is_none().then(fetch);
                    async move {
                        match pending {
                            Some(pending) => pending.await.map(|found| found.map(Arc::new)),
                            None => Ok(cached),
                        }
                    }
                },
                |fetched| {
                    if let Some(value) = fetched {
                        let _guard = lock(&self.update_lock);
                        if self.epoch.load(Ordering::Acquire) == epoch {
                            self.entries.insert(key, value.clone());
                        }
                    }
                },
            )
            .await
    }

    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let _guard = lock(&self.update_lock);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.flights.forget(&key);
        self.entries.insert(key, value.clone());
        value
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let _guard = lock(&self.update_lock);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.flights.forget(key);
        self.entries.remove(key).map(|(_, v)| v)
    }

    /// Changes on every insert or remove
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ask the backend for the encoded profile of an entity
pub(crate) async fn fetch_entity_profile(
    api: &dyn TransportApi,
    entity: EntityId,
) -> Result<GetEntityProfileResponse> {
    let request = TransportApiRequest::GetEntityProfile(GetEntityProfileRequest { entity });
    match api.request(request).await? {
        TransportApiResponse::GetEntityProfile(response) => Ok(response),
        _ => Err(unexpected_response("get_entity_profile")),
    }
}

pub(crate) fn unexpected_response(request: &str) -> TransportError {
    TransportError::internal(format!("unexpected response to {}", request))
}
