//! Transport service
//!
//! Provides:
//! - Session registration and lifecycle events
//! - Device traffic admission, activity tracking and routing to core / rule engine
//! - Credential validation, provisioning and profile/resource lookups
//! - Consumption of unicast and broadcast notifications
//! - Periodic activity, idle-bucket and usage-stats tasks
//!
//! Every entry point returns immediately; outcomes are delivered through a
//! `TransportServiceCallback` on the callback executor.

mod callback;
mod hosts;
mod inbound;
mod producer;
mod usage;

pub use callback::{
    BatchCallback, GetOrCreateDeviceResult, NoopCallback, ResultCallback, ServiceCallback,
    TransportServiceCallback, ValidateDeviceCredentialsResult,
};
pub use hosts::{SessionActivityHost, TenantLimitsHost};
pub use producer::StageProducer;
pub use usage::{UsageCallback, UsageStatsAggregator};

use crate::activity::ActivityTracker;
use crate::api::TransportApi;
use crate::cache::{unexpected_response, DeviceProfileCache, ResourceCache, TenantProfileCache};
use crate::executor::CallbackExecutor;
use crate::partition::{PartitionService, ServiceType, MAIN_QUEUE_NAME};
use crate::rate_limit::RateLimiter;
use crate::session::{SessionMetaData, SessionMsgListener, SessionRegistry};
use dashmap::DashMap;
use devgate_common::data::{DeviceProfile, DeviceProfileId, DeviceTransportType, Resource, ResourceType, TenantId};
use devgate_common::metrics;
use devgate_common::msg::{
    ClaimDeviceMsg, GetAttributeRequestMsg, GetEntityProfileRequest, GetEntityProfileResponse,
    GetOrCreateDeviceRequest, KeyValue, MsgType, PostAttributeMsg, PostTelemetryMsg, ProvisionDeviceRequest,
    ProvisionDeviceResponse, RoutedMsg, SessionEvent, SessionInfo, SessionType, SubscribeToAttributeUpdatesMsg,
    SubscribeToRpcMsg, ToCoreMsg, ToDeviceRpcResponseMsg, ToRuleEngineMsg, ToServerRpcRequestMsg,
    ToServerRpcResponseMsg, ToTransportMsg, TransportApiRequest, TransportApiResponse, ValidateCredentialsRequest,
};
use devgate_common::queue::{QueueConsumer, QueueProducer, TopicPartitionInfo};
use devgate_common::{AppConfig, Result, SharedClock, TransportError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Queue endpoints the service talks to
pub struct TransportQueues {
    pub core: Arc<dyn QueueProducer<ToCoreMsg>>,
    pub rule_engine: Arc<dyn QueueProducer<ToRuleEngineMsg>>,
    pub notifications: Arc<dyn QueueConsumer<ToTransportMsg>>,
}

struct PendingRpc {
    session_id: Uuid,
    timeout: AbortHandle,
}

struct ServiceInner {
    config: Arc<AppConfig>,
    executor: CallbackExecutor,
    clock: SharedClock,
    api: Arc<dyn TransportApi>,
    sessions: Arc<SessionRegistry>,
    limiter: Arc<RateLimiter>,
    limits_host: Arc<TenantLimitsHost>,
    activity: ActivityTracker<Uuid, SessionInfo>,
    device_profiles: Arc<DeviceProfileCache>,
    tenant_profiles: Arc<TenantProfileCache>,
    resources: Arc<ResourceCache>,
    partitions: Arc<PartitionService>,
    core: Arc<StageProducer<ToCoreMsg>>,
    rule_engine: Arc<StageProducer<ToRuleEngineMsg>>,
    notifications: Arc<dyn QueueConsumer<ToTransportMsg>>,
    usage: Arc<UsageStatsAggregator>,
    pending_rpc: DashMap<String, PendingRpc>,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Session and traffic-control layer shared by all protocol adapters
#[derive(Clone)]
pub struct TransportService {
    inner: Arc<ServiceInner>,
}

impl TransportService {
    /// Wire the service; must be called inside a tokio runtime
    pub fn new(
        config: Arc<AppConfig>,
        api: Arc<dyn TransportApi>,
        queues: TransportQueues,
        clock: SharedClock,
    ) -> Result<Self> {
        let executor = CallbackExecutor::new(config.executor.callback_pool_size)?;
        let partitions = Arc::new(PartitionService::new(&config.queue, config.notifications_topic()));
        let sessions = Arc::new(SessionRegistry::new(executor.clone()));
        let core = Arc::new(StageProducer::new("core", queues.core));
        let rule_engine = Arc::new(StageProducer::new("rule_engine", queues.rule_engine));

        let device_profiles = Arc::new(DeviceProfileCache::new(api.clone()));
        let tenant_profiles = Arc::new(TenantProfileCache::new(api.clone()));
        let resources = Arc::new(ResourceCache::new(api.clone()));

        let limits_host = Arc::new(TenantLimitsHost::new(
            tenant_profiles.clone(),
            config.rate_limits.exceeded_events_per_minute,
        ));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limits, limits_host.clone(), clock.clone()));

        let activity_host = Arc::new(SessionActivityHost::new(
            sessions.clone(),
            core.clone(),
            partitions.clone(),
            executor.clone(),
        ));
        let activity = ActivityTracker::new(
            activity_host,
            config.sessions.activity_reporting_strategy,
            config.inactivity_timeout(),
            clock.clone(),
        );

        info!(
            service_id = %config.service.service_id,
            notifications = %config.notifications_topic(),
            strategy = ?config.sessions.activity_reporting_strategy,
            "Transport service created"
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                executor,
                clock,
                api,
                sessions,
                limiter,
                limits_host,
                activity,
                device_profiles,
                tenant_profiles,
                resources,
                partitions,
                core,
                rule_engine,
                notifications: queues.notifications,
                usage: Arc::new(UsageStatsAggregator::new()),
                pending_rpc: DashMap::new(),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Start the notification consumer and the periodic tasks
    pub fn init(&self) {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            warn!("Transport service already started");
            return;
        }

        let mut tasks = Vec::new();
        tasks.push(
            inner
                .executor
                .handle()
                .spawn(inner.clone().run_notifications_consumer(inner.cancel.clone())),
        );
        tasks.push(
            inner
                .activity
                .spawn_sweeper(inner.config.report_period(), inner.cancel.clone()),
        );

        let limiter = inner.limiter.clone();
        let limits_host = inner.limits_host.clone();
        tasks.push(self.spawn_periodic(
            "idle_bucket_sweep",
            Duration::from_millis(inner.config.rate_limits.sweep_interval_ms.max(1)),
            move || {
                limiter.sweep_idle();
                limits_host.shrink();
                async {}
            },
        ));

        let weak = Arc::downgrade(inner);
        tasks.push(self.spawn_periodic(
            "usage_stats",
            Duration::from_millis(inner.config.usage_stats.report_interval_ms.max(1)),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.report_stats().await;
                    }
                }
            },
        ));

        inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        info!(service_id = %inner.config.service.service_id, "Transport service started");
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.inner.cancel.clone();
        self.inner.executor.handle().spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            debug!(task = name, "Periodic task stopped");
        })
    }

    /// Stop background tasks, flush usage and drop every session
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task failed");
            }
        }

        let keys: Vec<String> = inner.pending_rpc.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, pending)) = inner.pending_rpc.remove(&key) {
                pending.timeout.abort();
            }
        }
        if inner.config.usage_stats.enabled {
            if let Err(e) = inner.flush_usage().await {
                warn!(error = %e, "Failed to flush usage stats on shutdown");
            }
        }
        inner.sessions.clear();
        info!("Transport service stopped");
    }

    // ---- sessions ----

    pub fn register_async_session(
        &self,
        info: SessionInfo,
        listener: Arc<dyn SessionMsgListener>,
    ) -> Arc<SessionMetaData> {
        self.inner.ensure_tenant_profile(info.tenant_id);
        self.inner.sessions.register_async(info, listener)
    }

    pub fn register_sync_session(
        &self,
        info: SessionInfo,
        listener: Arc<dyn SessionMsgListener>,
        timeout_ms: u64,
    ) -> Arc<SessionMetaData> {
        self.inner.ensure_tenant_profile(info.tenant_id);
        self.inner.sessions.register_sync(info, listener, timeout_ms)
    }

    /// Idempotent; pending activity is reported by the next sweep
    pub fn deregister_session(&self, session_id: &Uuid) {
        self.inner.sessions.deregister(session_id);
    }

    pub fn lookup_session(&self, session_id: &Uuid) -> Option<Arc<SessionMetaData>> {
        self.inner.sessions.lookup(session_id)
    }

    pub fn process_session_event(&self, info: &SessionInfo, event: SessionEvent, callback: ServiceCallback<()>) {
        if !self.inner.admit(info, 0, &callback) {
            return;
        }
        self.inner.record_activity(info);
        let msg = ToCoreMsg::SessionEvent {
            session: info.clone(),
            event,
        };
        self.inner.send_to_core(info, msg, callback);
    }

    // ---- device traffic ----

    /// One rule-engine message per timestamped batch
    pub fn process_post_telemetry(&self, info: &SessionInfo, msg: PostTelemetryMsg, callback: ServiceCallback<()>) {
        let data_points = msg.data_points();
        if !self.inner.admit(info, data_points, &callback) {
            return;
        }
        self.inner.record_activity(info);

        let callback = UsageCallback::wrap(
            self.inner.usage.clone(),
            info.tenant_id,
            info.customer_id,
            data_points,
            callback,
        );
        if msg.entries.is_empty() {
            self.inner.complete(callback, Ok(()));
            return;
        }

        let batch: ServiceCallback<()> = BatchCallback::new(msg.entries.len(), callback);
        for entry in msg.entries {
            let mut metadata = device_metadata(info);
            metadata.insert("ts".to_string(), entry.ts.to_string());
            self.inner.send_to_rule_engine(
                info,
                MsgType::PostTelemetryRequest,
                entry.ts,
                metadata,
                key_values_to_json(entry.values),
                batch.clone(),
            );
        }
    }

    pub fn process_post_attributes(&self, info: &SessionInfo, msg: PostAttributeMsg, callback: ServiceCallback<()>) {
        let data_points = msg.data_points();
        if !self.inner.admit(info, data_points, &callback) {
            return;
        }
        self.inner.record_activity(info);

        let callback = UsageCallback::wrap(
            self.inner.usage.clone(),
            info.tenant_id,
            info.customer_id,
            data_points,
            callback,
        );
        let mut metadata = device_metadata(info);
        metadata.insert("notifyDevice".to_string(), "false".to_string());
        self.inner.send_to_rule_engine(
            info,
            MsgType::PostAttributesRequest,
            self.inner.clock.now_millis(),
            metadata,
            key_values_to_json(msg.values),
            callback,
        );
    }

    pub fn process_get_attributes(&self, info: &SessionInfo, msg: GetAttributeRequestMsg, callback: ServiceCallback<()>) {
        if !self.inner.admit(info, 0, &callback) {
            return;
        }
        self.inner.record_activity(info);
        let msg = ToCoreMsg::GetAttributes {
            session: info.clone(),
            msg,
        };
        self.inner.send_to_core(info, msg, callback);
    }

    pub fn process_subscribe_to_attributes(
        &self,
        info: &SessionInfo,
        msg: SubscribeToAttributeUpdatesMsg,
        callback: ServiceCallback<()>,
    ) {
        if !self.inner.admit(info, 0, &callback) {
            return;
        }
        if let Some(session) = self.inner.sessions.lookup(&info.session_id) {
            session.set_subscribed_to_attributes(!msg.unsubscribe);
        }
        self.inner.record_activity(info);
        let msg = ToCoreMsg::SubscribeToAttributes {
            session: info.clone(),
            msg,
        };
        self.inner.send_to_core(info, msg, callback);
    }

    pub fn process_subscribe_to_rpc(&self, info: &SessionInfo, msg: SubscribeToRpcMsg, callback: ServiceCallback<()>) {
        if !self.inner.admit(info, 0, &callback) {
            return;
        }
        if let Some(session) = self.inner.sessions.lookup(&info.session_id) {
            session.set_subscribed_to_rpc(!msg.unsubscribe);
        }
        self.inner.record_activity(info);
        let msg = ToCoreMsg::SubscribeToRpc {
            session: info.clone(),
            msg,
        };
        self.inner.send_to_core(info, msg, callback);
    }

    pub fn process_to_device_rpc_response(
        &self,
        info: &SessionInfo,
        msg: ToDeviceRpcResponseMsg,
        callback: ServiceCallback<()>,
    ) {
        if !self.inner.admit(info, 0, &callback) {
            return;
        }
        self.inner.record_activity(info);
        let msg = ToCoreMsg::ToDeviceRpcResponse {
            session: info.clone(),
            msg,
        };
        self.inner.send_to_core(info, msg, callback);
    }

    /// Forward a device RPC to the rule engine and arm the client-side timeout
    pub fn process_to_server_rpc_request(
        &self,
        info: &SessionInfo,
        msg: ToServerRpcRequestMsg,
        callback: ServiceCallback<()>,
    ) {
        if !self.inner.admit(info, 0, &callback) {
            return;
        }
        self.inner.record_activity(info);
        self.inner.arm_rpc_timeout(info.session_id, msg.request_id);

        let mut metadata = device_metadata(info);
        metadata.insert("requestId".to_string(), msg.request_id.to_string());
        metadata.insert("serviceId".to_string(), self.inner.config.service.service_id.clone());
        metadata.insert("sessionId".to_string(), info.session_id.to_string());
        let params = serde_json::from_str(&msg.params).unwrap_or(Value::String(msg.params));
        let data = serde_json::json!({ "method": msg.method, "params": params });
        self.inner.send_to_rule_engine(
            info,
            MsgType::ToServerRpcRequest,
            self.inner.clock.now_millis(),
            metadata,
            data,
            callback,
        );
    }

    pub fn process_claim_device(&self, info: &SessionInfo, msg: ClaimDeviceMsg, callback: ServiceCallback<()>) {
        if !self.inner.admit(info, 0, &callback) {
            return;
        }
        self.inner.record_activity(info);
        let msg = ToCoreMsg::ClaimDevice {
            session: info.clone(),
            msg,
        };
        self.inner.send_to_core(info, msg, callback);
    }

    /// Record activity without sending anything (pings, keep-alives)
    pub fn record_activity(&self, info: &SessionInfo) {
        self.inner.record_activity(info);
    }

    // ---- backend requests ----

    pub fn process_validate_credentials(
        &self,
        transport_type: DeviceTransportType,
        request: ValidateCredentialsRequest,
        callback: ServiceCallback<ValidateDeviceCredentialsResult>,
    ) {
        let inner = self.inner.clone();
        self.inner.executor.handle().spawn(async move {
            let result = inner.validate_credentials(transport_type, request).await;
            inner.complete(callback, result);
        });
    }

    pub fn process_get_or_create_device(
        &self,
        request: GetOrCreateDeviceRequest,
        callback: ServiceCallback<GetOrCreateDeviceResult>,
    ) {
        let inner = self.inner.clone();
        self.inner.executor.handle().spawn(async move {
            let result = inner.get_or_create_device(request).await;
            inner.complete(callback, result);
        });
    }

    pub fn process_provision(&self, request: ProvisionDeviceRequest, callback: ServiceCallback<ProvisionDeviceResponse>) {
        let inner = self.inner.clone();
        self.inner.executor.handle().spawn(async move {
            let result = match inner.api.request(TransportApiRequest::Provision(request)).await {
                Ok(TransportApiResponse::Provision(response)) => Ok(response),
                Ok(_) => Err(unexpected_response("provision")),
                Err(e) => Err(e),
            };
            inner.complete(callback, result);
        });
    }

    pub fn get_entity_profile(
        &self,
        request: GetEntityProfileRequest,
        callback: ServiceCallback<GetEntityProfileResponse>,
    ) {
        let inner = self.inner.clone();
        self.inner.executor.handle().spawn(async move {
            let result = match inner.api.request(TransportApiRequest::GetEntityProfile(request)).await {
                Ok(TransportApiResponse::GetEntityProfile(response)) => Ok(response),
                Ok(_) => Err(unexpected_response("get_entity_profile")),
                Err(e) => Err(e),
            };
            inner.complete(callback, result);
        });
    }

    /// Tenant resource, falling back to the system tenant's copy
    pub fn get_resource(
        &self,
        tenant_id: TenantId,
        resource_type: ResourceType,
        resource_key: String,
        callback: ServiceCallback<Option<Arc<Resource>>>,
    ) {
        let inner = self.inner.clone();
        self.inner.executor.handle().spawn(async move {
            let result = inner.resources.get(tenant_id, resource_type, &resource_key).await;
            inner.complete(callback, result);
        });
    }

    // ---- queries ----

    pub fn resolve_partition(
        &self,
        service_type: ServiceType,
        queue_name: Option<&str>,
        tenant_id: TenantId,
        entity: Uuid,
    ) -> TopicPartitionInfo {
        self.inner.partitions.resolve(service_type, queue_name, tenant_id, entity)
    }

    /// Dispatch one notification as if it had been consumed from the topic
    pub fn process_to_transport_msg(&self, msg: ToTransportMsg) {
        self.inner.process_to_transport_msg(msg);
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn activity(&self) -> &ActivityTracker<Uuid, SessionInfo> {
        &self.inner.activity
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.sessions
    }

    pub fn device_profiles(&self) -> &Arc<DeviceProfileCache> {
        &self.inner.device_profiles
    }

    pub fn tenant_profiles(&self) -> &Arc<TenantProfileCache> {
        &self.inner.tenant_profiles
    }

    pub fn usage(&self) -> &Arc<UsageStatsAggregator> {
        &self.inner.usage
    }

    pub fn pending_rpc_count(&self) -> usize {
        self.inner.pending_rpc.len()
    }
}

impl ServiceInner {
    /// Rate-limit check; a rejection completes the callback
    fn admit(&self, info: &SessionInfo, data_points: u64, callback: &ServiceCallback<()>) -> bool {
        match self
            .limiter
            .check_limits(info.tenant_id, info.gateway_id, Some(info.device_id), data_points)
        {
            Ok(()) => true,
            Err(scope) => {
                self.complete(callback.clone(), Err(TransportError::RateLimited { scope }));
                false
            }
        }
    }

    fn record_activity(&self, info: &SessionInfo) {
        self.activity
            .record_activity(info.session_id, self.clock.now_millis());
    }

    fn complete<T: Send + 'static>(&self, callback: ServiceCallback<T>, result: Result<T>) {
        self.executor.execute(move || match result {
            Ok(value) => callback.on_success(value),
            Err(e) => callback.on_error(e),
        });
    }

    fn send_to_core(self: &Arc<Self>, info: &SessionInfo, msg: ToCoreMsg, callback: ServiceCallback<()>) {
        let inner = self.clone();
        let tpi = self.partitions.core_partition(info.tenant_id, info.device_id.id());
        let key = info.device_id.id();
        self.executor.handle().spawn(async move {
            let result = inner.core.send(&tpi, key, msg).await;
            inner.complete(callback, result);
        });
    }

    fn send_to_rule_engine(
        self: &Arc<Self>,
        info: &SessionInfo,
        msg_type: MsgType,
        ts: i64,
        metadata: HashMap<String, String>,
        data: Value,
        callback: ServiceCallback<()>,
    ) {
        let inner = self.clone();
        let info = info.clone();
        self.executor.handle().spawn(async move {
            let result = inner.route_to_rule_engine(&info, msg_type, ts, metadata, data).await;
            inner.complete(callback, result);
        });
    }

    /// Resolve the device profile, then send to its rule chain and queue
    ///
    /// Without a profile the message still goes to the default queue with no
    /// rule chain, and the caller gets `RoutingUnavailable`.
    async fn route_to_rule_engine(
        &self,
        info: &SessionInfo,
        msg_type: MsgType,
        ts: i64,
        metadata: HashMap<String, String>,
        data: Value,
    ) -> Result<()> {
        let profile = match self.device_profiles.get(info.device_profile_id).await {
            Ok(profile) => profile,
            Err(e) => {
                debug!(device_profile_id = %info.device_profile_id, error = %e, "Device profile lookup failed");
                None
            }
        };
        if profile.is_none() {
            warn!(
                device_id = %info.device_id,
                device_profile_id = %info.device_profile_id,
                "Device profile unavailable, using default queue"
            );
            metrics::record_routing_unavailable();
        }

        let rule_chain_id = profile.as_ref().and_then(|p| p.default_rule_chain_id);
        let queue_name = profile
            .as_ref()
            .and_then(|p| p.default_queue_name.clone())
            .unwrap_or_else(|| MAIN_QUEUE_NAME.to_string());
        let tpi = self
            .partitions
            .rule_engine_partition(Some(&queue_name), info.tenant_id, info.device_id.id());

        let msg = RoutedMsg {
            id: Uuid::new_v4(),
            ts,
            msg_type,
            originator: info.device_id.entity_id(),
            customer_id: info.customer_id,
            rule_chain_id,
            queue_name: Some(queue_name),
            metadata,
            data,
        };
        let key = info.device_id.id();
        self.rule_engine
            .send(
                &tpi,
                key,
                ToRuleEngineMsg {
                    tenant_id: info.tenant_id,
                    msg,
                },
            )
            .await?;

        match profile {
            Some(_) => Ok(()),
            None => Err(TransportError::RoutingUnavailable {
                message: format!("device profile {} not found", info.device_profile_id),
            }),
        }
    }

    fn arm_rpc_timeout(self: &Arc<Self>, session_id: Uuid, request_id: i32) {
        let key = rpc_key(session_id, request_id);
        let weak: Weak<Self> = Arc::downgrade(self);
        let timeout = self.config.client_side_rpc_timeout();
        let task_key = key.clone();
        let task = self.executor.handle().spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_rpc_timeout(&task_key, request_id);
            }
        });

        if let Some(previous) = self.pending_rpc.insert(
            key,
            PendingRpc {
                session_id,
                timeout: task.abort_handle(),
            },
        ) {
            previous.timeout.abort();
        }
    }

    fn on_rpc_timeout(&self, key: &str, request_id: i32) {
        let Some((_, pending)) = self.pending_rpc.remove(key) else {
            return;
        };
        metrics::record_rpc_timeout();
        let Some(session) = self.sessions.lookup(&pending.session_id) else {
            return;
        };
        debug!(session_id = %pending.session_id, request_id, "Client-side RPC timed out");

        let listener = session.listener().clone();
        self.executor.execute(move || {
            listener.on_to_server_rpc_response(ToServerRpcResponseMsg {
                request_id,
                payload: String::new(),
                error: Some("timeout".to_string()),
            });
        });
        if session.session_type() == SessionType::Sync {
            self.sessions.deregister(&pending.session_id);
        }
    }

    fn clear_pending_rpc(&self, session_id: Uuid, request_id: i32) {
        if let Some((_, pending)) = self.pending_rpc.remove(&rpc_key(session_id, request_id)) {
            pending.timeout.abort();
        }
    }

    /// Fetch the tenant profile in the background when it is not cached
    fn ensure_tenant_profile(self: &Arc<Self>, tenant_id: TenantId) {
        if self.tenant_profiles.peek_for_tenant(tenant_id).is_some() {
            return;
        }
        let inner = self.clone();
        self.executor.handle().spawn(async move {
            match inner.tenant_profiles.get(tenant_id).await {
                Ok(lookup) => {
                    // existing buckets survive unless the tenant changed profile
                    if lookup.profile.is_some() && lookup.reassigned {
                        inner.limiter.update_tenant(tenant_id);
                    }
                    if let Some(state) = lookup.api_usage_state {
                        inner.limiter.set_transport_enabled(tenant_id, state.transport_enabled);
                    }
                }
                Err(e) => warn!(tenant_id = %tenant_id, error = %e, "Failed to load tenant profile"),
            }
        });
    }

    async fn resolve_device_profile(
        &self,
        profile_id: DeviceProfileId,
        profile_bytes: Option<&[u8]>,
    ) -> Result<Option<Arc<DeviceProfile>>> {
        match profile_bytes {
            Some(bytes) => self.device_profiles.get_or_create(profile_id, bytes).map(Some),
            None => self.device_profiles.get(profile_id).await,
        }
    }

    async fn validate_credentials(
        self: &Arc<Self>,
        transport_type: DeviceTransportType,
        request: ValidateCredentialsRequest,
    ) -> Result<ValidateDeviceCredentialsResult> {
        let kind = request.kind();
        let response = match self.api.request(TransportApiRequest::ValidateCredentials(request)).await? {
            TransportApiResponse::ValidateCredentials(response) => response,
            _ => return Err(unexpected_response("validate_credentials")),
        };
        let Some(device_info) = response.device_info else {
            debug!(credentials = kind, "Device credentials not found");
            return Ok(ValidateDeviceCredentialsResult {
                credentials: response.credentials,
                ..Default::default()
            });
        };

        let profile = self
            .resolve_device_profile(device_info.device_profile_id, response.profile_bytes.as_deref())
            .await?;
        if let Some(profile) = &profile {
            if profile.transport_type != DeviceTransportType::Default && profile.transport_type != transport_type {
                debug!(
                    device_id = %device_info.device_id,
                    profile_transport = ?profile.transport_type,
                    transport = ?transport_type,
                    "Device profile bound to another transport"
                );
                return Err(TransportError::Unauthorized {
                    message: format!("device profile does not accept {:?} transport", transport_type),
                });
            }
        }

        self.ensure_tenant_profile(device_info.tenant_id);
        Ok(ValidateDeviceCredentialsResult {
            device_info: Some(device_info),
            device_profile: profile,
            credentials: response.credentials,
        })
    }

    async fn get_or_create_device(self: &Arc<Self>, request: GetOrCreateDeviceRequest) -> Result<GetOrCreateDeviceResult> {
        let response = match self.api.request(TransportApiRequest::GetOrCreateDevice(request)).await? {
            TransportApiResponse::GetOrCreateDevice(response) => response,
            _ => return Err(unexpected_response("get_or_create_device")),
        };
        let Some(device_info) = response.device_info else {
            return Ok(GetOrCreateDeviceResult::default());
        };
        let profile = self
            .resolve_device_profile(device_info.device_profile_id, response.profile_bytes.as_deref())
            .await?;
        self.ensure_tenant_profile(device_info.tenant_id);
        Ok(GetOrCreateDeviceResult {
            device_info: Some(device_info),
            device_profile: profile,
        })
    }

    async fn flush_usage(&self) -> Result<usize> {
        self.usage
            .flush(&self.config.service.service_id, &self.core, &self.partitions)
            .await
    }

    async fn report_stats(&self) {
        if self.config.usage_stats.enabled {
            if let Err(e) = self.flush_usage().await {
                warn!(error = %e, "Failed to report usage stats");
            }
        }
        for stats in [self.core.stats(), self.rule_engine.stats()] {
            if stats.total() > 0 {
                info!(
                    stage = stats.name(),
                    total = stats.total(),
                    successful = stats.successful(),
                    failed = stats.failed(),
                    "Queue producer stats"
                );
                stats.reset();
            }
        }
        debug!(
            sessions = self.sessions.len(),
            tracked = self.activity.len(),
            buckets = self.limiter.bucket_count(),
            pending_rpc = self.pending_rpc.len(),
            "Transport state"
        );
    }
}

fn rpc_key(session_id: Uuid, request_id: i32) -> String {
    format!("{}-{}", session_id, request_id)
}

fn device_metadata(info: &SessionInfo) -> HashMap<String, String> {
    HashMap::from([
        ("deviceName".to_string(), info.device_name.clone()),
        ("deviceType".to_string(), info.device_type.clone()),
    ])
}

fn key_values_to_json(values: Vec<KeyValue>) -> Value {
    Value::Object(values.into_iter().map(|kv| (kv.key, kv.value)).collect::<Map<String, Value>>())
}

#[cfg(test)]
mod tests;
