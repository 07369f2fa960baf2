use super::{unexpected_response, LoadingCache};
use crate::api::TransportApi;
use dashmap::DashSet;
use devgate_common::data::{Resource, ResourceKey, ResourceType, TenantId};
use devgate_common::msg::{GetResourceRequest, TransportApiRequest, TransportApiResponse};
use devgate_common::Result;
use std::sync::Arc;

/// Tenant resources with fallback to the system tenant
pub struct ResourceCache {
    cache: LoadingCache<ResourceKey, Resource>,
    absent: DashSet<ResourceKey>,
    api: Arc<dyn TransportApi>,
}

impl ResourceCache {
    pub fn new(api: Arc<dyn TransportApi>) -> Self {
        Self {
            cache: LoadingCache::new("resource"),
            absent: DashSet::new(),
            api,
        }
    }

    /// Tenant resource, else the system tenant's resource with the same key
    pub async fn get(
        &self,
        tenant_id: TenantId,
        resource_type: ResourceType,
        resource_key: &str,
    ) -> Result<Option<Arc<Resource>>> {
        let key = ResourceKey::new(tenant_id, resource_type, resource_key);
        if let Some(resource) = self.lookup(key.clone()).await? {
            return Ok(Some(resource));
        }
        if key.tenant_id.is_system() {
            return Ok(None);
        }
        self.lookup(key.system_fallback()).await
    }

    async fn lookup(&self, key: ResourceKey) -> Result<Option<Arc<Resource>>> {
        if self.absent.contains(&key) {
            return Ok(None);
        }

        let epoch = self.cache.epoch();
        let api = self.api.clone();
        let request = TransportApiRequest::GetResource(GetResourceRequest { key: key.clone() });
        let found = self
            .cache
            .get_with(key.clone(), move || async move {
                match api.request(request).await? {
                    TransportApiResponse::GetResource(response) => Ok(response.resource),
                    _ => Err(unexpected_response("get_resource")),
                }
            })
            .await?;

        // known absent until the next update or delete of this key
        if found.is_none() && self.cache.epoch() == epoch {
            self.absent.insert(key);
        }
        Ok(found)
    }

    /// Forget a resource after an update or delete broadcast
    pub fn evict(&self, key: &ResourceKey) {
        self.cache.remove(key);
        self.absent.remove(key);
    }

    pub fn peek(&self, key: &ResourceKey) -> Option<Arc<Resource>> {
        self.cache.peek(key)
    }
}
