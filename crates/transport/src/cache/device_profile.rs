use super::{fetch_entity_profile, LoadingCache};
use crate::api::TransportApi;
use devgate_common::data::{decode, DeviceProfile, DeviceProfileId};
use devgate_common::Result;
use std::sync::Arc;
use tracing::debug;

/// Device profiles by id
pub struct DeviceProfileCache {
    cache: LoadingCache<DeviceProfileId, DeviceProfile>,
    api: Arc<dyn TransportApi>,
}

impl DeviceProfileCache {
    pub fn new(api: Arc<dyn TransportApi>) -> Self {
        Self {
            cache: LoadingCache::new("device_profile"),
            api,
        }
    }

    /// Cached profile, fetched from the backend on a miss
    pub async fn get(&self, id: DeviceProfileId) -> Result<Option<Arc<DeviceProfile>>> {
        let api = self.api.clone();
        self.cache
            .get_with(id, move || async move {
                let response = fetch_entity_profile(api.as_ref(), id.entity_id()).await?;
                response
                    .data
                    .map(|bytes| decode::<DeviceProfile>(&bytes))
                    .transpose()
            })
            .await
    }

    /// Cached profile, or decode the piggy-backed bytes without a backend call
    pub fn get_or_create(&self, id: DeviceProfileId, bytes: &[u8]) -> Result<Arc<DeviceProfile>> {
        if let Some(profile) = self.cache.peek(&id) {
            return Ok(profile);
        }
        let profile: DeviceProfile = decode(bytes)?;
        Ok(self.cache.insert(id, profile))
    }

    pub fn put(&self, profile: DeviceProfile) -> Arc<DeviceProfile> {
        debug!(profile_id = %profile.id, "Device profile updated");
        self.cache.insert(profile.id, profile)
    }

    /// Decode a broadcast update and store it
    pub fn put_bytes(&self, bytes: &[u8]) -> Result<Arc<DeviceProfile>> {
        let profile: DeviceProfile = decode(bytes)?;
        Ok(self.put(profile))
    }

    pub fn evict(&self, id: &DeviceProfileId) -> Option<Arc<DeviceProfile>> {
        debug!(profile_id = %id, "Device profile evicted");
        self.cache.remove(id)
    }

    pub fn peek(&self, id: &DeviceProfileId) -> Option<Arc<DeviceProfile>> {
        self.cache.peek(id)
    }
}
