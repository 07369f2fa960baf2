//! Session registry
//!
//! Provides:
//! - Put-if-absent registration of sync and async sessions
//! - One-shot timeout for sync sessions
//! - Subscription flags kept per session
//! - Predicate fan-out over live sessions

mod listener;

pub use listener::SessionMsgListener;

#[cfg(test)]
pub(crate) use listener::testing;

use crate::executor::CallbackExecutor;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use devgate_common::metrics;
use devgate_common::msg::{SessionCloseNotification, SessionInfo, SessionType, SubscriptionInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

/// Live state of one registered session
pub struct SessionMetaData {
    info: RwLock<SessionInfo>,
    session_type: SessionType,
    listener: Arc<dyn SessionMsgListener>,
    subscribed_to_attributes: AtomicBool,
    subscribed_to_rpc: AtomicBool,
    overwrite_activity_time: AtomicBool,
    timeout: Mutex<Option<AbortHandle>>,
}

impl SessionMetaData {
    fn new(info: SessionInfo, session_type: SessionType, listener: Arc<dyn SessionMsgListener>) -> Self {
        Self {
            info: RwLock::new(info),
            session_type,
            listener,
            subscribed_to_attributes: AtomicBool::new(false),
            subscribed_to_rpc: AtomicBool::new(false),
            overwrite_activity_time: AtomicBool::new(false),
            timeout: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.info.read().unwrap_or_else(PoisonError::into_inner).session_id
    }

    pub fn info(&self) -> SessionInfo {
        self.info.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Edit the session identity in place (device rename, profile change)
    pub fn update_info(&self, update: impl FnOnce(&mut SessionInfo)) {
        update(&mut self.info.write().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn listener(&self) -> &Arc<dyn SessionMsgListener> {
        &self.listener
    }

    pub fn is_subscribed_to_attributes(&self) -> bool {
        self.subscribed_to_attributes.load(Ordering::Acquire)
    }

    pub fn set_subscribed_to_attributes(&self, subscribed: bool) {
        self.subscribed_to_attributes.store(subscribed, Ordering::Release);
    }

    pub fn is_subscribed_to_rpc(&self) -> bool {
        self.subscribed_to_rpc.load(Ordering::Acquire)
    }

    pub fn set_subscribed_to_rpc(&self, subscribed: bool) {
        self.subscribed_to_rpc.store(subscribed, Ordering::Release);
    }

    /// Gateway sessions with this flag pin the activity time of their devices
    pub fn overwrite_activity_time(&self) -> bool {
        self.overwrite_activity_time.load(Ordering::Acquire)
    }

    pub fn set_overwrite_activity_time(&self, overwrite: bool) {
        self.overwrite_activity_time.store(overwrite, Ordering::Release);
    }

    pub fn subscription_info(&self, last_activity_time: i64) -> SubscriptionInfo {
        SubscriptionInfo {
            attribute_subscription: self.is_subscribed_to_attributes(),
            rpc_subscription: self.is_subscribed_to_rpc(),
            last_activity_time,
        }
    }

    fn set_timeout(&self, handle: AbortHandle) {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn cancel_timeout(&self) {
        if let Some(handle) = self.timeout.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

/// Registered sessions of this node
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<SessionMetaData>>,
    executor: CallbackExecutor,
}

impl SessionRegistry {
    pub fn new(executor: CallbackExecutor) -> Self {
        Self {
            sessions: DashMap::new(),
            executor,
        }
    }

    /// Register a long-lived session; an existing registration is returned as is
    pub fn register_async(&self, info: SessionInfo, listener: Arc<dyn SessionMsgListener>) -> Arc<SessionMetaData> {
        self.register(info, SessionType::Async, listener).0
    }

    /// Register a request/response session closed after `timeout_ms`
    ///
    /// Re-registering a live session id returns the existing handle and does
    /// not restart its timer.
    pub fn register_sync(
        self: &Arc<Self>,
        info: SessionInfo,
        listener: Arc<dyn SessionMsgListener>,
        timeout_ms: u64,
    ) -> Arc<SessionMetaData> {
        let (session, created) = self.register(info, SessionType::Sync, listener);
        if created {
            let registry = Arc::downgrade(self);
            let timed = session.clone();
            let task = self.executor.handle().spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                if let Some(registry) = registry.upgrade() {
                    registry.expire_sync(&timed);
                }
            });
            session.set_timeout(task.abort_handle());
        }
        session
    }

    fn register(
        &self,
        info: SessionInfo,
        session_type: SessionType,
        listener: Arc<dyn SessionMsgListener>,
    ) -> (Arc<SessionMetaData>, bool) {
        let session_id = info.session_id;
        let registered = match self.sessions.entry(session_id) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(slot) => {
                let session = Arc::new(SessionMetaData::new(info, session_type, listener));
                slot.insert(session.clone());
                (session, true)
            }
        };
        if registered.1 {
            debug!(session_id = %session_id, session_type = ?session_type, "Session registered");
            metrics::record_sessions_active(self.len());
        }
        registered
    }

    fn expire_sync(&self, session: &Arc<SessionMetaData>) {
        let session_id = session.session_id();
        let removed = self
            .sessions
            .remove_if(&session_id, |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if !removed {
            return;
        }

        debug!(session_id = %session_id, "Sync session timed out");
        metrics::record_session_expired("sync_timeout");
        metrics::record_sessions_active(self.len());
        let listener = session.listener().clone();
        self.executor.execute(move || {
            listener.on_remote_session_close_command(session_id, SessionCloseNotification::timeout());
        });
    }

    /// Remove a session and cancel its timer; a no-op for unknown ids
    pub fn deregister(&self, session_id: &Uuid) -> Option<Arc<SessionMetaData>> {
        let (_, session) = self.sessions.remove(session_id)?;
        session.cancel_timeout();
        debug!(session_id = %session_id, "Session deregistered");
        metrics::record_sessions_active(self.len());
        Some(session)
    }

    pub fn lookup(&self, session_id: &Uuid) -> Option<Arc<SessionMetaData>> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    /// Run `action` for every session matching `predicate`
    ///
    /// Matches are collected first; `action` runs without any map guard held.
    pub fn for_each(
        &self,
        predicate: impl Fn(&SessionMetaData) -> bool,
        mut action: impl FnMut(&Arc<SessionMetaData>),
    ) {
        let matching: Vec<Arc<SessionMetaData>> = self
            .sessions
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        for session in &matching {
            action(session);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop every session, cancelling pending timers
    pub fn clear(&self) {
        let ids: Vec<Uuid> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.cancel_timeout();
            }
        }
        metrics::record_sessions_active(0);
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ListenerEvent, RecordingListener};
    use super::*;
    use devgate_common::data::{DeviceId, DeviceProfileId, TenantId};
    use devgate_common::msg::SessionCloseReason;

    fn session_info(session_id: Uuid) -> SessionInfo {
        SessionInfo {
            session_id,
            node_id: "node-1".to_string(),
            tenant_id: TenantId::random(),
            customer_id: None,
            device_id: DeviceId::random(),
            device_name: "sensor-1".to_string(),
            device_type: "default".to_string(),
            device_profile_id: DeviceProfileId::random(),
            gateway_id: None,
            gateway_session_id: None,
            is_gateway: false,
        }
    }

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(CallbackExecutor::new(4).unwrap()))
    }

    #[tokio::test]
    async fn test_register_is_put_if_absent() {
        let registry = registry();
        let (listener, _rx) = RecordingListener::new();
        let id = Uuid::new_v4();

        let first = registry.register_async(session_info(id), listener.clone());
        let second = registry.register_async(session_info(id), listener);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(first.session_type(), SessionType::Async);
    }

    #[tokio::test]
    async fn test_sync_session_times_out() {
        let registry = registry();
        let (listener, mut rx) = RecordingListener::new();
        let id = Uuid::new_v4();

        registry.register_sync(session_info(id), listener, 50);
        assert!(registry.lookup(&id).is_some());

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ListenerEvent::SessionClose(session_id, msg) => {
                assert_eq!(session_id, id);
                assert_eq!(msg.reason, SessionCloseReason::SessionTimeout);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(registry.lookup(&id).is_none());
    }

    #[tokio::test]
    async fn test_sync_reregister_keeps_single_timer() {
        let registry = registry();
        let (listener, mut rx) = RecordingListener::new();
        let id = Uuid::new_v4();

        let first = registry.register_sync(session_info(id), listener.clone(), 50);
        let second = registry.register_sync(session_info(id), listener, 50);
        assert!(Arc::ptr_eq(&first, &second));

        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deregister_cancels_timer_and_is_idempotent() {
        let registry = registry();
        let (listener, mut rx) = RecordingListener::new();
        let id = Uuid::new_v4();

        registry.register_sync(session_info(id), listener, 50);
        assert!(registry.deregister(&id).is_some());
        assert!(registry.deregister(&id).is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stale_timer_leaves_new_registration() {
        let registry = registry();
        let (listener, mut rx) = RecordingListener::new();
        let id = Uuid::new_v4();

        let stale = registry.register_sync(session_info(id), listener.clone(), 50);
        // bypass the abort so the old timer still fires
        stale.timeout.lock().unwrap().take();
        registry.sessions.remove(&id);
        registry.register_async(session_info(id), listener);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.lookup(&id).is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_for_each_matches_predicate() {
        let registry = registry();
        let (listener, _rx) = RecordingListener::new();
        let profile = DeviceProfileId::random();

        for i in 0..4 {
            let mut info = session_info(Uuid::new_v4());
            if i % 2 == 0 {
                info.device_profile_id = profile;
            }
            registry.register_async(info, listener.clone());
        }

        let mut matched = 0;
        registry.for_each(
            |s| s.info().device_profile_id == profile,
            |s| {
                s.update_info(|info| info.device_type = "thermostat".to_string());
                matched += 1;
            },
        );
        assert_eq!(matched, 2);

        let mut renamed = 0;
        registry.for_each(|s| s.info().device_type == "thermostat", |_| renamed += 1);
        assert_eq!(renamed, 2);
    }

    #[tokio::test]
    async fn test_subscription_flags() {
        let registry = registry();
        let (listener, _rx) = RecordingListener::new();
        let session = registry.register_async(session_info(Uuid::new_v4()), listener);

        session.set_subscribed_to_attributes(true);
        let info = session.subscription_info(42);
        assert!(info.attribute_subscription);
        assert!(!info.rpc_subscription);
        assert_eq!(info.last_activity_time, 42);
    }

    #[tokio::test]
    async fn test_clear() {
        let registry = registry();
        let (listener, mut rx) = RecordingListener::new();
        registry.register_sync(session_info(Uuid::new_v4()), listener.clone(), 50);
        registry.register_async(session_info(Uuid::new_v4()), listener);
        registry.clear();
        assert!(registry.is_empty());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(rx.try_recv().is_err());
    }
}
