//! Glue between the service and the limiter / activity tracker

use super::producer::StageProducer;
use crate::activity::{ActivityHost, ActivityReportCallback, ActivitySnapshot};
use crate::cache::TenantProfileCache;
use crate::executor::CallbackExecutor;
use crate::partition::PartitionService;
use crate::rate_limit::RateLimitHost;
use crate::session::SessionRegistry;
use devgate_common::data::{RateLimitSpecs, TenantId};
use devgate_common::metrics;
use devgate_common::msg::{SessionCloseNotification, SessionEvent, SessionInfo, SubscriptionInfo, ToCoreMsg};
use devgate_common::{RateLimitScope, Result, TransportError};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Activity of sessions, keyed by session id
pub struct SessionActivityHost {
    sessions: Arc<SessionRegistry>,
    core: Arc<StageProducer<ToCoreMsg>>,
    partitions: Arc<PartitionService>,
    executor: CallbackExecutor,
}

impl SessionActivityHost {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        core: Arc<StageProducer<ToCoreMsg>>,
        partitions: Arc<PartitionService>,
        executor: CallbackExecutor,
    ) -> Self {
        Self {
            sessions,
            core,
            partitions,
            executor,
        }
    }

    fn send_to_core(&self, session: &SessionInfo, msg: ToCoreMsg) -> JoinHandle<Result<()>> {
        let core = self.core.clone();
        let tpi = self.partitions.core_partition(session.tenant_id, session.device_id.id());
        let key = session.device_id.id();
        self.executor
            .handle()
            .spawn(async move { core.send(&tpi, key, msg).await })
    }
}

impl ActivityHost<Uuid, SessionInfo> for SessionActivityHost {
    fn create_metadata(&self, session_id: &Uuid) -> Option<SessionInfo> {
        self.sessions.lookup(session_id).map(|s| s.info())
    }

    fn update_state(
        &self,
        session_id: &Uuid,
        snapshot: &mut ActivitySnapshot<SessionInfo>,
        recorded: &dyn Fn(&Uuid) -> Option<i64>,
    ) -> bool {
        let Some(session) = self.sessions.lookup(session_id) else {
            return false;
        };
        let info = session.info();

        // devices behind a pinning gateway live as long as the gateway does
        if let Some(gateway_session_id) = info.gateway_session_id {
            let pinned = self
                .sessions
                .lookup(&gateway_session_id)
                .is_some_and(|gateway| gateway.overwrite_activity_time());
            if pinned {
                if let Some(gateway_time) = recorded(&gateway_session_id) {
                    snapshot.last_recorded_time = snapshot.last_recorded_time.max(gateway_time);
                }
            }
        }

        snapshot.metadata = Some(info);
        true
    }

    fn report_activity(
        &self,
        session_id: &Uuid,
        metadata: Option<&SessionInfo>,
        time: i64,
        callback: ActivityReportCallback<Uuid, SessionInfo>,
    ) {
        let session = self.sessions.lookup(session_id);
        let Some(info) = metadata.cloned().or_else(|| session.as_ref().map(|s| s.info())) else {
            callback.on_failure(&TransportError::SessionNotFound {
                id: session_id.to_string(),
            });
            return;
        };
        let subscription = session
            .map(|s| s.subscription_info(time))
            .unwrap_or(SubscriptionInfo {
                last_activity_time: time,
                ..Default::default()
            });

        let msg = ToCoreMsg::SubscriptionInfo {
            session: info.clone(),
            info: subscription,
        };
        let sent = self.send_to_core(&info, msg);
        self.executor.handle().spawn(async move {
            match sent.await {
                Ok(Ok(())) => callback.on_success(time),
                Ok(Err(e)) => callback.on_failure(&e),
                Err(e) => callback.on_failure(&TransportError::internal(e.to_string())),
            }
        });
    }

    fn on_expired(&self, session_id: &Uuid, metadata: Option<SessionInfo>) {
        let Some(session) = self.sessions.deregister(session_id) else {
            return;
        };
        let info = metadata.unwrap_or_else(|| session.info());
        info!(session_id = %session_id, device_id = %info.device_id, "Session closed after inactivity");
        metrics::record_session_expired("inactivity");

        self.send_to_core(
            &info,
            ToCoreMsg::SessionEvent {
                session: info.clone(),
                event: SessionEvent::Closed,
            },
        );

        let listener = session.listener().clone();
        let session_id = *session_id;
        self.executor.execute(move || {
            listener.on_remote_session_close_command(session_id, SessionCloseNotification::timeout());
        });
    }
}

/// Limits from cached tenant profiles, with throttled rejection logging
pub struct TenantLimitsHost {
    tenant_profiles: Arc<TenantProfileCache>,
    log_throttle: DefaultKeyedRateLimiter<(TenantId, RateLimitScope)>,
}

impl TenantLimitsHost {
    pub fn new(tenant_profiles: Arc<TenantProfileCache>, events_per_minute: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(events_per_minute).unwrap_or(NonZeroU32::MIN));
        Self {
            tenant_profiles,
            log_throttle: RateLimiter::keyed(quota),
        }
    }

    /// Forget throttle state of quiet tenants
    pub fn shrink(&self) {
        self.log_throttle.retain_recent();
    }
}

impl RateLimitHost for TenantLimitsHost {
    fn tenant_limits(&self, tenant_id: TenantId) -> Option<RateLimitSpecs> {
        self.tenant_profiles
            .peek_for_tenant(tenant_id)
            .map(|profile| profile.rate_limits.clone())
    }

    fn on_rate_limit_exceeded(&self, tenant_id: TenantId, scope: RateLimitScope, entity: Uuid) {
        if self.log_throttle.check_key(&(tenant_id, scope)).is_ok() {
            warn!(tenant_id = %tenant_id, scope = %scope, entity = %entity, "Rate limit exceeded");
        } else {
            debug!(tenant_id = %tenant_id, scope = %scope, entity = %entity, "Rate limit exceeded");
        }
    }
}
