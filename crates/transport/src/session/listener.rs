//! Adapter-facing callbacks for one session

use devgate_common::data::{Device, DeviceId, DeviceProfile, ResourceKey};
use devgate_common::msg::{
    AttributeUpdateNotificationMsg, GetAttributeResponseMsg, SessionCloseNotification, SessionInfo,
    ToDeviceRpcRequestMsg, ToServerRpcResponseMsg,
};
use std::sync::Arc;
use uuid::Uuid;

/// Implemented by protocol adapters; every call arrives on the callback executor
pub trait SessionMsgListener: Send + Sync + 'static {
    fn on_get_attributes_response(&self, msg: GetAttributeResponseMsg);

    fn on_attribute_update(&self, session_id: Uuid, msg: AttributeUpdateNotificationMsg);

    fn on_remote_session_close_command(&self, session_id: Uuid, msg: SessionCloseNotification);

    fn on_to_device_rpc_request(&self, session_id: Uuid, msg: ToDeviceRpcRequestMsg);

    fn on_to_server_rpc_response(&self, msg: ToServerRpcResponseMsg);

    fn on_device_profile_update(&self, _session: SessionInfo, _profile: Arc<DeviceProfile>) {}

    fn on_device_update(&self, _session: SessionInfo, _device: Device, _profile: Option<Arc<DeviceProfile>>) {}

    fn on_device_deleted(&self, _device_id: DeviceId) {}

    fn on_resource_update(&self, _key: ResourceKey) {}

    fn on_resource_delete(&self, _key: ResourceKey) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use devgate_common::data::DeviceProfileId;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    pub enum ListenerEvent {
        GetAttributesResponse(GetAttributeResponseMsg),
        AttributeUpdate(Uuid, AttributeUpdateNotificationMsg),
        SessionClose(Uuid, SessionCloseNotification),
        ToDeviceRpcRequest(Uuid, ToDeviceRpcRequestMsg),
        ToServerRpcResponse(ToServerRpcResponseMsg),
        DeviceProfileUpdate(Uuid, DeviceProfileId),
        DeviceUpdate(Uuid, String),
        DeviceDeleted(DeviceId),
        ResourceUpdate(ResourceKey),
        ResourceDelete(ResourceKey),
    }

    /// Forwards every callback to a channel
    pub struct RecordingListener {
        tx: mpsc::UnboundedSender<ListenerEvent>,
    }

    impl RecordingListener {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ListenerEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { tx }), rx)
        }

        fn emit(&self, event: ListenerEvent) {
            let _ = self.tx.send(event);
        }
    }

    impl SessionMsgListener for RecordingListener {
        fn on_get_attributes_response(&self, msg: GetAttributeResponseMsg) {
            self.emit(ListenerEvent::GetAttributesResponse(msg));
        }

        fn on_attribute_update(&self, session_id: Uuid, msg: AttributeUpdateNotificationMsg) {
            self.emit(ListenerEvent::AttributeUpdate(session_id, msg));
        }

        fn on_remote_session_close_command(&self, session_id: Uuid, msg: SessionCloseNotification) {
            self.emit(ListenerEvent::SessionClose(session_id, msg));
        }

        fn on_to_device_rpc_request(&self, session_id: Uuid, msg: ToDeviceRpcRequestMsg) {
            self.emit(ListenerEvent::ToDeviceRpcRequest(session_id, msg));
        }

        fn on_to_server_rpc_response(&self, msg: ToServerRpcResponseMsg) {
            self.emit(ListenerEvent::ToServerRpcResponse(msg));
        }

        fn on_device_profile_update(&self, session: SessionInfo, profile: Arc<DeviceProfile>) {
            self.emit(ListenerEvent::DeviceProfileUpdate(session.session_id, profile.id));
        }

        fn on_device_update(&self, session: SessionInfo, device: Device, _profile: Option<Arc<DeviceProfile>>) {
            self.emit(ListenerEvent::DeviceUpdate(session.session_id, device.name));
        }

        fn on_device_deleted(&self, device_id: DeviceId) {
            self.emit(ListenerEvent::DeviceDeleted(device_id));
        }

        fn on_resource_update(&self, key: ResourceKey) {
            self.emit(ListenerEvent::ResourceUpdate(key));
        }

        fn on_resource_delete(&self, key: ResourceKey) {
            self.emit(ListenerEvent::ResourceDelete(key));
        }
    }
}
