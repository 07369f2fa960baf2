//! Notifications consumed from this node's topic
//!
//! Unicast payloads go to one session's listener; broadcasts update caches
//! and limits, then fan out to the affected sessions.

use super::ServiceInner;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use devgate_common::data::{
    decode, ApiUsageState, Device, DeviceId, DeviceProfileId, EntityId, EntityType, ResourceKey, Tenant,
    TenantId, TenantProfileId,
};
use devgate_common::msg::{EntityUpdateMsg, SessionNotification, SessionType, ToTransportMsg};
use devgate_common::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl ServiceInner {
    /// Poll, dispatch and commit until cancelled
    pub(super) async fn run_notifications_consumer(self: Arc<Self>, cancel: CancellationToken) {
        let consumer = self.notifications.clone();
        let poll_interval = self.config.poll_interval();
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: None,
            ..Default::default()
        };
        info!(topic = %consumer.topic(), "Notifications consumer started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                polled = consumer.poll(poll_interval) => match polled {
                    Ok(batch) => {
                        backoff.reset();
                        if batch.is_empty() {
                            continue;
                        }
                        debug!(count = batch.len(), "Notifications received");
                        for msg in batch {
                            self.process_to_transport_msg(msg.value);
                        }
                        if let Err(e) = consumer.commit().await {
                            warn!(error = %e, "Failed to commit notifications");
                        }
                    }
                    Err(e) => {
                        let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                        warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Failed to poll notifications");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        }
        info!("Notifications consumer stopped");
    }

    pub(super) fn process_to_transport_msg(&self, msg: ToTransportMsg) {
        match msg {
            ToTransportMsg::Session {
                session_id,
                notification,
            } => self.deliver_to_session(session_id, notification),
            ToTransportMsg::EntityUpdate(update) => {
                if let Err(e) = self.on_entity_update(update) {
                    warn!(error = %e, "Failed to apply entity update");
                }
            }
            ToTransportMsg::EntityDelete(entity) => self.on_entity_delete(entity),
            ToTransportMsg::ResourceUpdate(key) => self.on_resource_change(key, false),
            ToTransportMsg::ResourceDelete(key) => self.on_resource_change(key, true),
        }
    }

    fn deliver_to_session(&self, session_id: Uuid, notification: SessionNotification) {
        let Some(session) = self.sessions.lookup(&session_id) else {
            debug!(session_id = %session_id, "Notification for unknown session dropped");
            return;
        };

        if let SessionNotification::ToServerRpcResponse(response) = &notification {
            self.clear_pending_rpc(session_id, response.request_id);
        }

        let listener = session.listener().clone();
        self.executor.execute(move || match notification {
            SessionNotification::GetAttributesResponse(msg) => listener.on_get_attributes_response(msg),
            SessionNotification::AttributeUpdate(msg) => listener.on_attribute_update(session_id, msg),
            SessionNotification::SessionClose(msg) => listener.on_remote_session_close_command(session_id, msg),
            SessionNotification::ToDeviceRpcRequest(msg) => listener.on_to_device_rpc_request(session_id, msg),
            SessionNotification::ToServerRpcResponse(msg) => listener.on_to_server_rpc_response(msg),
        });

        if session.session_type() == SessionType::Sync {
            self.sessions.deregister(&session_id);
        }
    }

    fn on_entity_update(&self, update: EntityUpdateMsg) -> Result<()> {
        match update {
            EntityUpdateMsg::DeviceProfile(bytes) => {
                let profile = self.device_profiles.put_bytes(&bytes)?;
                self.sessions.for_each(
                    |s| s.info().device_profile_id == profile.id,
                    |s| {
                        s.update_info(|info| info.device_type = profile.name.clone());
                        let info = s.info();
                        let listener = s.listener().clone();
                        let profile = profile.clone();
                        self.executor
                            .execute(move || listener.on_device_profile_update(info, profile));
                    },
                );
            }
            EntityUpdateMsg::TenantProfile(bytes) => {
                let result = self.tenant_profiles.put(&bytes)?;
                self.limiter.update_tenants(&result.affected_tenants);
                info!(
                    profile_id = %result.profile.id,
                    tenants = result.affected_tenants.len(),
                    "Tenant profile update applied"
                );
            }
            EntityUpdateMsg::Tenant(bytes) => {
                let tenant: Tenant = decode(&bytes)?;
                if self.tenant_profiles.put_tenant(tenant.id, tenant.tenant_profile_id) {
                    self.limiter.update_tenant(tenant.id);
                }
            }
            EntityUpdateMsg::ApiUsageState(bytes) => {
                let state: ApiUsageState = decode(&bytes)?;
                self.limiter.set_transport_enabled(state.tenant_id, state.transport_enabled);
            }
            EntityUpdateMsg::Device(bytes) => {
                let device: Device = decode(&bytes)?;
                let profile = self.device_profiles.peek(&device.device_profile_id);
                self.sessions.for_each(
                    |s| s.info().device_id == device.id,
                    |s| {
                        s.update_info(|info| {
                            info.device_name = device.name.clone();
                            info.device_type = device.device_type.clone();
                            info.device_profile_id = device.device_profile_id;
                            info.customer_id = device.customer_id;
                        });
                        let info = s.info();
                        let listener = s.listener().clone();
                        let device = device.clone();
                        let profile = profile.clone();
                        self.executor
                            .execute(move || listener.on_device_update(info, device, profile));
                    },
                );
            }
        }
        Ok(())
    }

    fn on_entity_delete(&self, entity: EntityId) {
        debug!(entity = %entity, "Entity deleted");
        match entity.entity_type {
            EntityType::DeviceProfile => {
                self.device_profiles.evict(&DeviceProfileId::from_uuid(entity.id));
            }
            EntityType::TenantProfile => {
                let tenants = self.tenant_profiles.remove(&TenantProfileId::from_uuid(entity.id));
                self.limiter.update_tenants(&tenants);
            }
            EntityType::Tenant => {
                let tenant_id = TenantId::from_uuid(entity.id);
                self.tenant_profiles.remove_tenant(&tenant_id);
                self.limiter.remove_tenant(tenant_id);
            }
            EntityType::Device => {
                let device_id = DeviceId::from_uuid(entity.id);
                self.sessions.for_each(
                    |s| s.info().device_id == device_id,
                    |s| {
                        let listener = s.listener().clone();
                        self.executor.execute(move || listener.on_device_deleted(device_id));
                    },
                );
                self.limiter.remove_device(device_id);
            }
            _ => {}
        }
    }

    fn on_resource_change(&self, key: ResourceKey, deleted: bool) {
        self.resources.evict(&key);
        self.sessions.for_each(
            |s| key.tenant_id.is_system() || s.info().tenant_id == key.tenant_id,
            |s| {
                let listener = s.listener().clone();
                let key = key.clone();
                self.executor.execute(move || {
                    if deleted {
                        listener.on_resource_delete(key);
                    } else {
                        listener.on_resource_update(key);
                    }
                });
            },
        );
    }
}
