use super::*;
use crate::api::testing::MockTransportApi;
use crate::session::testing::{ListenerEvent, RecordingListener};
use devgate_common::config::ActivityReportingStrategy;
use devgate_common::data::{
    encode, DeviceId, DeviceInfo, EntityType, RateLimitSpecs, Tenant, TenantProfile, TenantProfileId,
};
use devgate_common::msg::{
    AttributeUpdateNotificationMsg, EntityUpdateMsg, SessionCloseReason, SessionNotification, TsKvList,
    ValidateDeviceResponse,
};
use devgate_common::queue::{InMemoryQueue, QueueMsg};
use devgate_common::{ManualClock, RateLimitScope};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::{assert_err, assert_ok};

const RULE_ENGINE_MAIN: &str = "devgate.rule-engine.Main";
const CORE: &str = "devgate.core";

struct Harness {
    service: TransportService,
    core: InMemoryQueue<ToCoreMsg>,
    rule_engine: InMemoryQueue<ToRuleEngineMsg>,
    notifications: InMemoryQueue<ToTransportMsg>,
    api: Arc<MockTransportApi>,
    clock: ManualClock,
    profile: DeviceProfile,
    config: Arc<AppConfig>,
}

fn device_profile(transport_type: DeviceTransportType) -> DeviceProfile {
    DeviceProfile {
        id: DeviceProfileId::random(),
        tenant_id: TenantId::random(),
        name: "thermostat".to_string(),
        default_rule_chain_id: None,
        default_queue_name: None,
        transport_type,
    }
}

/// Backend knowing one device profile; tenants have no profile
fn api_for(profile: &DeviceProfile) -> Arc<MockTransportApi> {
    let profile_id = profile.id;
    let bytes = encode(profile).unwrap();
    Arc::new(MockTransportApi::new(move |request| match request {
        TransportApiRequest::GetEntityProfile(GetEntityProfileRequest { entity }) => {
            let data = (entity.entity_type == EntityType::DeviceProfile && entity.id == profile_id.id())
                .then(|| bytes.clone());
            Ok(TransportApiResponse::GetEntityProfile(GetEntityProfileResponse {
                entity_type: entity.entity_type,
                data,
                api_usage_state: None,
            }))
        }
        other => Err(TransportError::internal(format!("unexpected {}", other.kind()))),
    }))
}

fn harness_with(configure: impl FnOnce(&mut AppConfig), api: Option<Arc<MockTransportApi>>) -> Harness {
    let mut config = AppConfig::default();
    config.service.service_id = "node-1".to_string();
    configure(&mut config);
    let config = Arc::new(config);

    let profile = device_profile(DeviceTransportType::Default);
    let api = api.unwrap_or_else(|| api_for(&profile));
    let core = InMemoryQueue::new();
    let rule_engine = InMemoryQueue::new();
    let notifications = InMemoryQueue::new();
    let clock = ManualClock::new(1_700_000_000_000);

    let service = TransportService::new(
        config.clone(),
        api.clone(),
        TransportQueues {
            core: Arc::new(core.producer(CORE)),
            rule_engine: Arc::new(rule_engine.producer("devgate.rule-engine")),
            notifications: Arc::new(notifications.consumer(config.notifications_topic(), 100)),
        },
        Arc::new(clock.clone()),
    )
    .unwrap();

    Harness {
        service,
        core,
        rule_engine,
        notifications,
        api,
        clock,
        profile,
        config,
    }
}

fn harness(configure: impl FnOnce(&mut AppConfig)) -> Harness {
    harness_with(configure, None)
}

fn session_info(h: &Harness, tenant_id: TenantId) -> SessionInfo {
    SessionInfo {
        session_id: Uuid::new_v4(),
        node_id: "node-1".to_string(),
        tenant_id,
        customer_id: None,
        device_id: DeviceId::random(),
        device_name: "sensor-1".to_string(),
        device_type: "default".to_string(),
        device_profile_id: h.profile.id,
        gateway_id: None,
        gateway_session_id: None,
        is_gateway: false,
    }
}

fn telemetry(entries: usize) -> PostTelemetryMsg {
    PostTelemetryMsg {
        entries: (0..entries)
            .map(|i| TsKvList {
                ts: 1_000 + i as i64,
                values: vec![KeyValue::new("temperature", 21.5)],
            })
            .collect(),
    }
}

async fn post_telemetry(h: &Harness, info: &SessionInfo, msg: PostTelemetryMsg) -> Result<()> {
    let (callback, rx) = ResultCallback::channel();
    h.service.process_post_telemetry(info, msg, callback);
    tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap()
}

async fn next_event(rx: &mut UnboundedReceiver<ListenerEvent>) -> ListenerEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

/// Cache a tenant profile with `specs` and assign it to `tenant_id`
fn seed_tenant(h: &Harness, tenant_id: TenantId, specs: RateLimitSpecs) -> TenantProfile {
    let profile = TenantProfile {
        id: TenantProfileId::random(),
        name: "default".to_string(),
        isolated_rule_engine: false,
        rate_limits: specs,
    };
    h.service.process_to_transport_msg(ToTransportMsg::EntityUpdate(EntityUpdateMsg::TenantProfile(
        encode(&profile).unwrap(),
    )));
    let tenant = Tenant {
        id: tenant_id,
        name: "acme".to_string(),
        tenant_profile_id: profile.id,
    };
    h.service
        .process_to_transport_msg(ToTransportMsg::EntityUpdate(EntityUpdateMsg::Tenant(encode(&tenant).unwrap())));
    profile
}

#[tokio::test]
async fn test_device_limit_rejects_fourth_and_fifth_message() {
    let h = harness(|c| c.rate_limits.defaults.device_messages = Some("3:60".to_string()));
    let info = session_info(&h, TenantId::random());

    let mut results = Vec::new();
    for _ in 0..5 {
        results.push(post_telemetry(&h, &info, telemetry(1)).await);
    }
    let limited = Err(TransportError::RateLimited {
        scope: RateLimitScope::Device,
    });
    assert_eq!(results, vec![Ok(()), Ok(()), Ok(()), limited.clone(), limited]);
    // profile fetched once, then served from the cache
    assert_eq!(h.api.calls(), 1);

    let sent = h.rule_engine.drain(RULE_ENGINE_MAIN);
    assert_eq!(sent.len(), 3);
    let msg = &sent[0].value.msg;
    assert_eq!(msg.msg_type, MsgType::PostTelemetryRequest);
    assert_eq!(msg.metadata.get("deviceName").map(String::as_str), Some("sensor-1"));
    assert_eq!(msg.metadata.get("ts").map(String::as_str), Some("1000"));
    assert_eq!(msg.data, serde_json::json!({ "temperature": 21.5 }));
}

#[tokio::test]
async fn test_telemetry_batch_acks_after_every_part() {
    let h = harness(|_| {});
    let info = session_info(&h, TenantId::random());

    assert_eq!(post_telemetry(&h, &info, telemetry(3)).await, Ok(()));
    assert_eq!(h.rule_engine.drain(RULE_ENGINE_MAIN).len(), 3);

    let usage = h.service.usage().drain();
    let count = |key| usage.iter().filter(|i| i.key == key).map(|i| i.value).sum::<u64>();
    assert_eq!(count(devgate_common::msg::UsageRecordKey::TransportMsgCount), 1);
    assert_eq!(count(devgate_common::msg::UsageRecordKey::TransportDpCount), 3);

    // empty telemetry completes without sending
    assert_eq!(post_telemetry(&h, &info, telemetry(0)).await, Ok(()));
    assert!(h.rule_engine.is_empty(RULE_ENGINE_MAIN));
}

#[tokio::test]
async fn test_telemetry_batch_reports_send_failure_once() {
    let h = harness(|_| {});
    let info = session_info(&h, TenantId::random());
    h.rule_engine.set_failing(true);

    let result = post_telemetry(&h, &info, telemetry(3)).await;
    assert!(matches!(result, Err(TransportError::QueueSend { .. })));
    assert!(h.service.usage().drain().is_empty());
}

#[tokio::test]
async fn test_missing_profile_falls_back_to_default_queue() {
    let h = harness(|_| {});
    let mut info = session_info(&h, TenantId::random());
    info.device_profile_id = DeviceProfileId::random();

    let result = post_telemetry(&h, &info, telemetry(1)).await;
    assert!(matches!(result, Err(TransportError::RoutingUnavailable { .. })));

    let sent = h.rule_engine.drain(RULE_ENGINE_MAIN);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].value.msg.rule_chain_id, None);
    assert_eq!(sent[0].value.msg.queue_name.as_deref(), Some(MAIN_QUEUE_NAME));

    // a failed send wins over the routing error
    h.rule_engine.set_failing(true);
    let result = post_telemetry(&h, &info, telemetry(1)).await;
    assert!(matches!(result, Err(TransportError::QueueSend { .. })));
}

#[tokio::test]
async fn test_post_attributes_marks_no_device_notification() {
    let h = harness(|_| {});
    let info = session_info(&h, TenantId::random());
    let (callback, rx) = ResultCallback::channel();
    h.service.process_post_attributes(
        &info,
        PostAttributeMsg {
            values: vec![KeyValue::new("firmware", "1.2.0")],
        },
        callback,
    );
    assert_eq!(rx.await.unwrap(), Ok(()));

    let sent = h.rule_engine.drain(RULE_ENGINE_MAIN);
    assert_eq!(sent[0].value.msg.msg_type, MsgType::PostAttributesRequest);
    assert_eq!(
        sent[0].value.msg.metadata.get("notifyDevice").map(String::as_str),
        Some("false")
    );
}

#[tokio::test]
async fn test_sync_session_closed_after_timeout() {
    let h = harness(|_| {});
    let (listener, mut rx) = RecordingListener::new();
    let info = session_info(&h, TenantId::random());
    let session_id = info.session_id;

    h.service.register_sync_session(info, listener, 200);
    assert!(h.service.lookup_session(&session_id).is_some());

    match next_event(&mut rx).await {
        ListenerEvent::SessionClose(id, msg) => {
            assert_eq!(id, session_id);
            assert_eq!(msg.reason, SessionCloseReason::SessionTimeout);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(h.service.lookup_session(&session_id).is_none());
}

#[tokio::test]
async fn test_tenant_profile_update_tightens_limit() {
    let h = harness(|_| {});
    let tenant = TenantId::random();
    let mut profile = seed_tenant(
        &h,
        tenant,
        RateLimitSpecs {
            tenant_messages: Some("10:60".to_string()),
            ..Default::default()
        },
    );
    let info = session_info(&h, tenant);

    for _ in 0..2 {
        assert_eq!(post_telemetry(&h, &info, telemetry(1)).await, Ok(()));
    }

    profile.rate_limits.tenant_messages = Some("1:60".to_string());
    h.service.process_to_transport_msg(ToTransportMsg::EntityUpdate(EntityUpdateMsg::TenantProfile(
        encode(&profile).unwrap(),
    )));

    assert_eq!(post_telemetry(&h, &info, telemetry(1)).await, Ok(()));
    assert_eq!(
        post_telemetry(&h, &info, telemetry(1)).await,
        Err(TransportError::RateLimited {
            scope: RateLimitScope::Tenant
        })
    );
}

#[tokio::test]
async fn test_api_usage_state_disables_transport() {
    let h = harness(|_| {});
    let tenant = TenantId::random();
    let info = session_info(&h, tenant);
    let state = devgate_common::data::ApiUsageState {
        tenant_id: tenant,
        transport_enabled: false,
    };
    h.service.process_to_transport_msg(ToTransportMsg::EntityUpdate(EntityUpdateMsg::ApiUsageState(
        encode(&state).unwrap(),
    )));

    assert_eq!(
        post_telemetry(&h, &info, telemetry(1)).await,
        Err(TransportError::RateLimited {
            scope: RateLimitScope::Tenant
        })
    );
}

#[tokio::test]
async fn test_device_deleted_notifies_sessions_and_purges_bucket() {
    let h = harness(|_| {});
    let tenant = TenantId::random();
    seed_tenant(
        &h,
        tenant,
        RateLimitSpecs {
            device_messages: Some("1:60".to_string()),
            ..Default::default()
        },
    );
    let (listener, mut rx) = RecordingListener::new();
    let info = session_info(&h, tenant);
    h.service.register_async_session(info.clone(), listener);

    assert_eq!(post_telemetry(&h, &info, telemetry(1)).await, Ok(()));
    assert_err!(post_telemetry(&h, &info, telemetry(1)).await);
    assert_eq!(
        h.service
            .rate_limiter()
            .available_tokens(RateLimitScope::Device, info.device_id.id()),
        Some(0)
    );

    h.service
        .process_to_transport_msg(ToTransportMsg::EntityDelete(info.device_id.entity_id()));
    assert_eq!(next_event(&mut rx).await, ListenerEvent::DeviceDeleted(info.device_id));
    assert_eq!(
        h.service
            .rate_limiter()
            .available_tokens(RateLimitScope::Device, info.device_id.id()),
        None
    );
    assert_eq!(post_telemetry(&h, &info, telemetry(1)).await, Ok(()));
}

#[tokio::test]
async fn test_device_profile_update_reaches_sessions() {
    let h = harness(|_| {});
    let tenant = TenantId::random();
    seed_tenant(&h, tenant, RateLimitSpecs::default());
    let (listener, mut rx) = RecordingListener::new();
    let info = session_info(&h, tenant);
    h.service.register_async_session(info.clone(), listener.clone());
    let mut other = session_info(&h, tenant);
    other.device_profile_id = DeviceProfileId::random();
    h.service.register_async_session(other, listener);

    let mut profile = h.profile.clone();
    profile.name = "boiler".to_string();
    h.service.process_to_transport_msg(ToTransportMsg::EntityUpdate(EntityUpdateMsg::DeviceProfile(
        encode(&profile).unwrap(),
    )));

    assert_eq!(
        next_event(&mut rx).await,
        ListenerEvent::DeviceProfileUpdate(info.session_id, profile.id)
    );
    let session = h.service.lookup_session(&info.session_id).unwrap();
    assert_eq!(session.info().device_type, "boiler");
    assert_eq!(h.service.device_profiles().peek(&profile.id).unwrap().name, "boiler");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_client_side_rpc_timeout_closes_sync_session() {
    let h = harness(|c| c.rpc.client_side_timeout_ms = 100);
    let (listener, mut rx) = RecordingListener::new();
    let info = session_info(&h, TenantId::random());
    h.service.register_sync_session(info.clone(), listener, 10_000);

    let (callback, done) = ResultCallback::channel();
    h.service.process_to_server_rpc_request(
        &info,
        ToServerRpcRequestMsg {
            request_id: 7,
            method: "getTime".to_string(),
            params: "{}".to_string(),
        },
        callback,
    );
    assert_eq!(done.await.unwrap(), Ok(()));
    assert_eq!(h.service.pending_rpc_count(), 1);

    match next_event(&mut rx).await {
        ListenerEvent::ToServerRpcResponse(msg) => {
            assert_eq!(msg.request_id, 7);
            assert_eq!(msg.error.as_deref(), Some("timeout"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.service.pending_rpc_count(), 0);
    assert!(h.service.lookup_session(&info.session_id).is_none());

    let sent = h.rule_engine.drain(RULE_ENGINE_MAIN);
    let msg = &sent[0].value.msg;
    assert_eq!(msg.msg_type, MsgType::ToServerRpcRequest);
    assert_eq!(msg.metadata.get("requestId").map(String::as_str), Some("7"));
    assert_eq!(msg.data, serde_json::json!({ "method": "getTime", "params": {} }));
}

#[tokio::test]
async fn test_rpc_response_cancels_timeout() {
    let h = harness(|c| c.rpc.client_side_timeout_ms = 100);
    let (listener, mut rx) = RecordingListener::new();
    let info = session_info(&h, TenantId::random());
    h.service.register_async_session(info.clone(), listener);

    let (callback, done) = ResultCallback::channel();
    h.service.process_to_server_rpc_request(
        &info,
        ToServerRpcRequestMsg {
            request_id: 1,
            method: "getTime".to_string(),
            params: "now".to_string(),
        },
        callback,
    );
    assert_ok!(done.await.unwrap());

    let response = ToServerRpcResponseMsg {
        request_id: 1,
        payload: "12:00".to_string(),
        error: None,
    };
    h.service.process_to_transport_msg(ToTransportMsg::Session {
        session_id: info.session_id,
        notification: SessionNotification::ToServerRpcResponse(response.clone()),
    });
    assert_eq!(next_event(&mut rx).await, ListenerEvent::ToServerRpcResponse(response));
    assert_eq!(h.service.pending_rpc_count(), 0);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(rx.try_recv().is_err());
    assert!(h.service.lookup_session(&info.session_id).is_some());
}

#[tokio::test]
async fn test_subscribe_sets_flags_and_reaches_core() {
    let h = harness(|_| {});
    let (listener, _rx) = RecordingListener::new();
    let info = session_info(&h, TenantId::random());
    let session = h.service.register_async_session(info.clone(), listener);

    let (callback, done) = ResultCallback::channel();
    h.service
        .process_subscribe_to_attributes(&info, SubscribeToAttributeUpdatesMsg { unsubscribe: false }, callback);
    assert_ok!(done.await.unwrap());
    let (callback, done) = ResultCallback::channel();
    h.service
        .process_subscribe_to_rpc(&info, SubscribeToRpcMsg { unsubscribe: false }, callback);
    assert_ok!(done.await.unwrap());

    assert!(session.is_subscribed_to_attributes());
    assert!(session.is_subscribed_to_rpc());
    let sent = h.core.drain(CORE);
    assert!(sent
        .iter()
        .any(|m| matches!(m.value, ToCoreMsg::SubscribeToAttributes { .. })));
    assert!(sent.iter().any(|m| matches!(m.value, ToCoreMsg::SubscribeToRpc { .. })));

    let (callback, done) = ResultCallback::channel();
    h.service
        .process_subscribe_to_attributes(&info, SubscribeToAttributeUpdatesMsg { unsubscribe: true }, callback);
    assert_ok!(done.await.unwrap());
    assert!(!session.is_subscribed_to_attributes());
}

#[tokio::test]
async fn test_inactive_session_expires_on_sweep() {
    let h = harness(|c| {
        c.sessions.inactivity_timeout_ms = 1_000;
        c.sessions.activity_reporting_strategy = ActivityReportingStrategy::Last;
    });
    let tenant = TenantId::random();
    seed_tenant(&h, tenant, RateLimitSpecs::default());
    let (listener, mut rx) = RecordingListener::new();
    let info = session_info(&h, tenant);
    h.service.register_async_session(info.clone(), listener);

    h.service.record_activity(&info);
    h.clock.advance(1_001);
    h.service.activity().sweep();

    match next_event(&mut rx).await {
        ListenerEvent::SessionClose(id, msg) => {
            assert_eq!(id, info.session_id);
            assert_eq!(msg.reason, SessionCloseReason::SessionTimeout);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(h.service.lookup_session(&info.session_id).is_none());
    assert!(h.service.activity().is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let sent = h.core.drain(CORE);
    assert!(sent.iter().any(|m| matches!(
        &m.value,
        ToCoreMsg::SubscriptionInfo { info: sub, .. } if sub.last_activity_time == 1_700_000_000_000
    )));
    assert!(sent.iter().any(|m| matches!(
        m.value,
        ToCoreMsg::SessionEvent {
            event: SessionEvent::Closed,
            ..
        }
    )));
}

#[tokio::test]
async fn test_validate_credentials_checks_transport_type() {
    let coap_profile = device_profile(DeviceTransportType::Coap);
    let device_info = DeviceInfo {
        tenant_id: TenantId::random(),
        customer_id: None,
        device_id: DeviceId::random(),
        device_name: "meter-9".to_string(),
        device_type: "meter".to_string(),
        device_profile_id: coap_profile.id,
        is_gateway: false,
    };
    let profile_bytes = encode(&coap_profile).unwrap();
    let response_info = device_info.clone();
    let api = Arc::new(MockTransportApi::new(move |request| match request {
        TransportApiRequest::ValidateCredentials(ValidateCredentialsRequest::AccessToken { token }) => {
            let known = token == "secret";
            Ok(TransportApiResponse::ValidateCredentials(ValidateDeviceResponse {
                device_info: known.then(|| response_info.clone()),
                profile_bytes: known.then(|| profile_bytes.clone()),
                credentials: None,
            }))
        }
        TransportApiRequest::GetEntityProfile(GetEntityProfileRequest { entity }) => {
            Ok(TransportApiResponse::GetEntityProfile(GetEntityProfileResponse {
                entity_type: entity.entity_type,
                data: None,
                api_usage_state: None,
            }))
        }
        other => Err(TransportError::internal(format!("unexpected {}", other.kind()))),
    }));
    let h = harness_with(|_| {}, Some(api));

    let validate = |transport_type, token: &str| {
        let (callback, rx) = ResultCallback::channel();
        h.service.process_validate_credentials(
            transport_type,
            ValidateCredentialsRequest::AccessToken {
                token: token.to_string(),
            },
            callback,
        );
        rx
    };

    let accepted = validate(DeviceTransportType::Coap, "secret").await.unwrap().unwrap();
    assert_eq!(accepted.device_info, Some(device_info));
    assert_eq!(accepted.device_profile.unwrap().id, coap_profile.id);
    // profile came with the response, no extra fetch for it
    assert!(h.service.device_profiles().peek(&coap_profile.id).is_some());

    let rejected = assert_err!(validate(DeviceTransportType::Mqtt, "secret").await.unwrap());
    assert!(matches!(rejected, TransportError::Unauthorized { .. }));

    let unknown = validate(DeviceTransportType::Mqtt, "wrong").await.unwrap().unwrap();
    assert!(unknown.device_info.is_none());
}

#[tokio::test]
async fn test_notifications_consumed_after_init() {
    let h = harness(|c| c.queue.poll_interval_ms = 10);
    let (listener, mut rx) = RecordingListener::new();
    let info = session_info(&h, TenantId::random());
    h.service.register_async_session(info.clone(), listener);
    h.service.init();

    let update = AttributeUpdateNotificationMsg {
        shared_updated: vec![KeyValue::new("target", 22)],
        shared_deleted: Vec::new(),
    };
    let producer = h.notifications.producer(h.config.notifications_topic());
    producer
        .send(
            &TopicPartitionInfo::new(h.config.notifications_topic(), None),
            QueueMsg::new(
                Uuid::new_v4(),
                ToTransportMsg::Session {
                    session_id: info.session_id,
                    notification: SessionNotification::AttributeUpdate(update.clone()),
                },
            ),
        )
        .await
        .unwrap();

    assert_eq!(
        next_event(&mut rx).await,
        ListenerEvent::AttributeUpdate(info.session_id, update)
    );

    h.service.shutdown().await;
    assert!(h.service.sessions().is_empty());
}

#[tokio::test]
async fn test_resolve_partition() {
    let h = harness(|_| {});
    let tenant = TenantId::random();
    let tpi = h
        .service
        .resolve_partition(ServiceType::RuleEngine, Some("HighPriority"), tenant, Uuid::from_u128(3));
    assert_eq!(tpi.full_topic_name(), "devgate.rule-engine.HighPriority.3");
    let tpi = h
        .service
        .resolve_partition(ServiceType::Transport, None, tenant, Uuid::nil());
    assert_eq!(tpi.full_topic_name(), "devgate.transport.notifications.node-1");
}

#[tokio::test]
async fn test_reconnect_keeps_device_bucket() {
    let h = harness(|c| c.rate_limits.defaults.device_messages = Some("1:60".to_string()));
    let tenant = TenantId::random();
    let mut info = session_info(&h, tenant);
    let limited = Err(TransportError::RateLimited {
        scope: RateLimitScope::Device,
    });

    let mut results = Vec::new();
    for _ in 0..5 {
        // same device, fresh session each time; the tenant has no profile
        info.session_id = Uuid::new_v4();
        let (listener, _rx) = RecordingListener::new();
        h.service.register_sync_session(info.clone(), listener, 10_000);
        tokio::time::sleep(Duration::from_millis(20)).await;
        results.push(post_telemetry(&h, &info, telemetry(1)).await);
    }
    assert_eq!(
        results,
        vec![Ok(()), limited.clone(), limited.clone(), limited.clone(), limited]
    );
    assert_eq!(h.rule_engine.drain(RULE_ENGINE_MAIN).len(), 1);
}

#[tokio::test]
async fn test_loaded_tenant_profile_survives_reconnect() {
    let tenant_profile = TenantProfile {
        id: TenantProfileId::random(),
        name: "default".to_string(),
        isolated_rule_engine: false,
        rate_limits: RateLimitSpecs {
            device_messages: Some("2:60".to_string()),
            ..Default::default()
        },
    };
    let bytes = encode(&tenant_profile).unwrap();
    let api = Arc::new(MockTransportApi::new(move |request| match request {
        TransportApiRequest::GetEntityProfile(GetEntityProfileRequest { entity }) => {
            let data = (entity.entity_type == EntityType::Tenant).then(|| bytes.clone());
            Ok(TransportApiResponse::GetEntityProfile(GetEntityProfileResponse {
                entity_type: entity.entity_type,
                data,
                api_usage_state: None,
            }))
        }
        other => Err(TransportError::internal(format!("unexpected {}", other.kind()))),
    }));
    let h = harness_with(|_| {}, Some(api));
    let tenant = TenantId::random();
    let mut info = session_info(&h, tenant);

    let (listener, _rx) = RecordingListener::new();
    h.service.register_async_session(info.clone(), listener);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_ok!(post_telemetry(&h, &info, telemetry(1)).await);
    assert_ok!(post_telemetry(&h, &info, telemetry(1)).await);
    assert_err!(post_telemetry(&h, &info, telemetry(1)).await);

    h.service.deregister_session(&info.session_id);
    info.session_id = Uuid::new_v4();
    let (listener, _rx) = RecordingListener::new();
    h.service.register_async_session(info.clone(), listener);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        post_telemetry(&h, &info, telemetry(1)).await,
        Err(TransportError::RateLimited {
            scope: RateLimitScope::Device,
        })
    );
}

fn gateway_pair(h: &Harness, tenant_id: TenantId) -> (SessionInfo, SessionInfo) {
    let mut gateway = session_info(h, tenant_id);
    gateway.device_name = "gateway-1".to_string();
    gateway.is_gateway = true;
    let mut device = session_info(h, tenant_id);
    device.gateway_id = Some(gateway.device_id);
    device.gateway_session_id = Some(gateway.session_id);
    (gateway, device)
}

#[tokio::test]
async fn test_gateway_limit_applies_to_devices_behind_it() {
    let h = harness(|c| {
        c.rate_limits.defaults.gateway_messages = Some("3:60".to_string());
        c.rate_limits.defaults.device_messages = Some("1:60".to_string());
    });
    let tenant = TenantId::random();
    let (gateway, first) = gateway_pair(&h, tenant);
    let (listener, _rx) = RecordingListener::new();
    h.service.register_async_session(gateway.clone(), listener.clone());

    assert_ok!(post_telemetry(&h, &first, telemetry(1)).await);
    // device bucket empty; the gateway token is refunded
    assert_eq!(
        post_telemetry(&h, &first, telemetry(1)).await,
        Err(TransportError::RateLimited {
            scope: RateLimitScope::GatewayDevice,
        })
    );

    let mut behind = Vec::new();
    for _ in 0..3 {
        let mut device = session_info(&h, tenant);
        device.gateway_id = Some(gateway.device_id);
        device.gateway_session_id = Some(gateway.session_id);
        h.service.register_async_session(device.clone(), listener.clone());
        behind.push(post_telemetry(&h, &device, telemetry(1)).await);
    }
    let gateway_limited = Err(TransportError::RateLimited {
        scope: RateLimitScope::Gateway,
    });
    assert_eq!(behind, vec![Ok(()), Ok(()), gateway_limited]);
    assert_eq!(
        h.service
            .rate_limiter()
            .available_tokens(RateLimitScope::Gateway, gateway.device_id.id()),
        Some(0)
    );
    assert_eq!(h.rule_engine.drain(RULE_ENGINE_MAIN).len(), 3);
}

#[tokio::test]
async fn test_device_pinned_to_gateway_activity() {
    let h = harness(|c| {
        c.sessions.inactivity_timeout_ms = 1_000;
        c.sessions.activity_reporting_strategy = ActivityReportingStrategy::Last;
    });
    let tenant = TenantId::random();
    seed_tenant(&h, tenant, RateLimitSpecs::default());
    let (gateway, device) = gateway_pair(&h, tenant);
    let (listener, mut rx) = RecordingListener::new();
    let gateway_session = h.service.register_async_session(gateway.clone(), listener.clone());
    gateway_session.set_overwrite_activity_time(true);
    h.service.register_async_session(device.clone(), listener);

    h.service.record_activity(&gateway);
    h.service.record_activity(&device);
    h.clock.advance(800);
    h.service.record_activity(&gateway);
    h.clock.advance(400);
    h.service.activity().sweep();

    // the device is idle for 1200ms but follows the gateway
    assert!(h.service.lookup_session(&device.session_id).is_some());
    assert_eq!(
        h.service.activity().last_recorded_time(&device.session_id),
        Some(1_700_000_000_800)
    );

    h.clock.advance(1_000);
    h.service.activity().sweep();
    let mut closed = Vec::new();
    for _ in 0..2 {
        match next_event(&mut rx).await {
            ListenerEvent::SessionClose(id, msg) => {
                assert_eq!(msg.reason, SessionCloseReason::SessionTimeout);
                closed.push(id);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    closed.sort();
    let mut expected = vec![gateway.session_id, device.session_id];
    expected.sort();
    assert_eq!(closed, expected);
    assert!(h.service.activity().is_empty());
}
