//! Mock SDK for testing.
//!
//! Records every call, serves a scripted device list and drives connection
//! transitions according to [`ConnectBehavior`]. Test hooks inject packets,
//! errors and transitions as if they came from native threads.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::traits::{
    ConnectionListener, DataListener, DiscoveryListener, ErrorListener, MuseSdk, NativeError,
    RawPacket,
};
use crate::device::DeviceDescriptor;
use crate::protocol::constants::PAYLOAD_LEN;
use crate::protocol::{PacketKind, Preset, VendorCode};
use crate::state::ConnectionState;

/// One captured SDK call.
#[derive(Debug, Clone, PartialEq)]
pub enum SdkCall {
    Initialize,
    SetDiscoveryListener(bool),
    StartScanning,
    StopScanning,
    DiscoveredDevices,
    Connect(String),
    Disconnect(String),
    SetPreset(String, Preset),
    SetDataTransmission(String, bool),
    RegisterConnectionListener(String),
    UnregisterConnectionListener(String),
    RegisterErrorListener(String),
    UnregisterErrorListener(String),
    RegisterDataListener(String, PacketKind),
    UnregisterDataListener(String, PacketKind),
    UnregisterAllListeners(String),
    ConnectionState(String),
}

/// How the mock reacts to `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    /// Report Connecting then Connected before `connect` returns.
    #[default]
    Accept,
    /// Report Connecting and never progress.
    Stall,
    /// Fail the call itself.
    Reject(VendorCode),
    /// Report Connecting then NeedsFirmwareUpdate.
    NeedsUpdate,
}

/// How the mock reacts to `disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectBehavior {
    #[default]
    Accept,
    /// Accept the request but never report Disconnected.
    Ignore,
}

#[derive(Default)]
struct MockState {
    calls: Vec<SdkCall>,
    devices: Vec<DeviceDescriptor>,
    scanning_error: Option<VendorCode>,
    device_list_error: Option<VendorCode>,
    connect_behavior: ConnectBehavior,
    disconnect_behavior: DisconnectBehavior,
    states: HashMap<String, ConnectionState>,
    transmitting: HashSet<String>,
    scanning: bool,
    connection_listeners: HashMap<String, Arc<dyn ConnectionListener>>,
    error_listeners: HashMap<String, Arc<dyn ErrorListener>>,
    data_listeners: HashMap<(String, PacketKind), Arc<dyn DataListener>>,
    discovery: Option<Arc<dyn DiscoveryListener>>,
}

/// Scripted [`MuseSdk`] for unit tests.
#[derive(Default)]
pub struct MockSdk {
    state: Mutex<MockState>,
}

fn vendor(operation: &'static str, code: VendorCode) -> NativeError {
    NativeError::Vendor {
        operation,
        code,
        message: format!("mock {} failure", operation),
    }
}

impl MockSdk {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: SdkCall) -> MutexGuard<'_, MockState> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }

    /// Set the list returned by `discovered_devices`.
    pub fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
        self.lock().devices = devices;
    }

    pub fn fail_scanning(&self, code: Option<VendorCode>) {
        self.lock().scanning_error = code;
    }

    pub fn fail_device_list(&self, code: Option<VendorCode>) {
        self.lock().device_list_error = code;
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.lock().connect_behavior = behavior;
    }

    pub fn set_disconnect_behavior(&self, behavior: DisconnectBehavior) {
        self.lock().disconnect_behavior = behavior;
    }

    /// All captured calls.
    pub fn calls(&self) -> Vec<SdkCall> {
        self.lock().calls.clone()
    }

    pub fn call_count<F: Fn(&SdkCall) -> bool>(&self, pred: F) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    pub fn is_transmitting(&self, address: &str) -> bool {
        self.lock().transmitting.contains(address)
    }

    pub fn native_state(&self, address: &str) -> ConnectionState {
        self.lock().states.get(address).copied().unwrap_or_default()
    }

    pub fn has_connection_listener(&self, address: &str) -> bool {
        self.lock().connection_listeners.contains_key(address)
    }

    pub fn has_data_listener(&self, address: &str, kind: PacketKind) -> bool {
        self.lock()
            .data_listeners
            .contains_key(&(address.to_string(), kind))
    }

    pub fn has_discovery_listener(&self) -> bool {
        self.lock().discovery.is_some()
    }

    /// Move the device to `current` and notify its connection listener.
    pub fn deliver_transition(&self, address: &str, current: ConnectionState) {
        let (previous, listener) = {
            let mut state = self.lock();
            let previous = state
                .states
                .insert(address.to_string(), current)
                .unwrap_or_default();
            (previous, state.connection_listeners.get(address).cloned())
        };
        if let Some(listener) = listener {
            listener.on_connection_changed(previous, current);
        }
    }

    /// Deliver a data packet. Returns whether a listener received it.
    pub fn emit_packet(
        &self,
        address: &str,
        kind: PacketKind,
        values: [f64; PAYLOAD_LEN],
        timestamp_us: i64,
    ) -> bool {
        let listener = {
            let state = self.lock();
            if !state.transmitting.contains(address) {
                return false;
            }
            state
                .data_listeners
                .get(&(address.to_string(), kind))
                .cloned()
        };
        match listener {
            Some(listener) => {
                listener.on_packet(RawPacket {
                    kind,
                    values,
                    timestamp_us,
                    source: address.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Deliver an asynchronous vendor error. Returns whether a listener
    /// received it.
    pub fn emit_error(&self, address: &str, code: VendorCode, message: &str) -> bool {
        let listener = self.lock().error_listeners.get(address).cloned();
        match listener {
            Some(listener) => {
                listener.on_error(NativeError::Vendor {
                    operation: "callback",
                    code,
                    message: message.to_string(),
                });
                true
            }
            None => false,
        }
    }

    pub fn notify_device_list_changed(&self) {
        let listener = self.lock().discovery.clone();
        if let Some(listener) = listener {
            listener.on_device_list_changed();
        }
    }
}

impl MuseSdk for MockSdk {
    fn initialize(&self) -> Result<(), NativeError> {
        self.record(SdkCall::Initialize);
        Ok(())
    }

    fn set_discovery_listener(
        &self,
        listener: Option<Arc<dyn DiscoveryListener>>,
    ) -> Result<(), NativeError> {
        let mut state = self.record(SdkCall::SetDiscoveryListener(listener.is_some()));
        state.discovery = listener;
        Ok(())
    }

    fn start_scanning(&self) -> Result<(), NativeError> {
        let mut state = self.record(SdkCall::StartScanning);
        if let Some(code) = state.scanning_error {
            return Err(vendor("start_scanning", code));
        }
        state.scanning = true;
        Ok(())
    }

    fn stop_scanning(&self) -> Result<(), NativeError> {
        let mut state = self.record(SdkCall::StopScanning);
        if let Some(code) = state.scanning_error {
            return Err(vendor("stop_scanning", code));
        }
        state.scanning = false;
        Ok(())
    }

    fn discovered_devices(&self) -> Result<Vec<DeviceDescriptor>, NativeError> {
        let state = self.record(SdkCall::DiscoveredDevices);
        if let Some(code) = state.device_list_error {
            return Err(vendor("get_devices", code));
        }
        Ok(state.devices.clone())
    }

    fn connect(&self, address: &str) -> Result<(), NativeError> {
        let behavior = {
            let state = self.record(SdkCall::Connect(address.to_string()));
            state.connect_behavior
        };
        match behavior {
            ConnectBehavior::Reject(code) => return Err(vendor("connect", code)),
            ConnectBehavior::Accept => {
                self.deliver_transition(address, ConnectionState::Connecting);
                self.deliver_transition(address, ConnectionState::Connected);
            }
            ConnectBehavior::Stall => {
                self.deliver_transition(address, ConnectionState::Connecting);
            }
            ConnectBehavior::NeedsUpdate => {
                self.deliver_transition(address, ConnectionState::Connecting);
                self.deliver_transition(address, ConnectionState::NeedsFirmwareUpdate);
            }
        }
        Ok(())
    }

    fn disconnect(&self, address: &str) -> Result<(), NativeError> {
        let (behavior, current) = {
            let state = self.record(SdkCall::Disconnect(address.to_string()));
            (
                state.disconnect_behavior,
                state.states.get(address).copied().unwrap_or_default(),
            )
        };
        if behavior == DisconnectBehavior::Accept && current != ConnectionState::Disconnected {
            self.deliver_transition(address, ConnectionState::Disconnected);
        }
        Ok(())
    }

    fn set_preset(&self, address: &str, preset: Preset) -> Result<(), NativeError> {
        self.record(SdkCall::SetPreset(address.to_string(), preset));
        Ok(())
    }

    fn set_data_transmission(&self, address: &str, enabled: bool) -> Result<(), NativeError> {
        let mut state = self.record(SdkCall::SetDataTransmission(address.to_string(), enabled));
        if enabled {
            state.transmitting.insert(address.to_string());
        } else {
            state.transmitting.remove(address);
        }
        Ok(())
    }

    fn register_connection_listener(
        &self,
        address: &str,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<(), NativeError> {
        let mut state = self.record(SdkCall::RegisterConnectionListener(address.to_string()));
        state
            .connection_listeners
            .insert(address.to_string(), listener);
        Ok(())
    }

    fn unregister_connection_listener(&self, address: &str) -> Result<(), NativeError> {
        let mut state = self.record(SdkCall::UnregisterConnectionListener(address.to_string()));
        state.connection_listeners.remove(address);
        Ok(())
    }

    fn register_error_listener(
        &self,
        address: &str,
        listener: Arc<dyn ErrorListener>,
    ) -> Result<(), NativeError> {
        let mut state = self.record(SdkCall::RegisterErrorListener(address.to_string()));
        state.error_listeners.insert(address.to_string(), listener);
        Ok(())
    }

    fn unregister_error_listener(&self, address: &str) -> Result<(), NativeError> {
        let mut state = self.record(SdkCall::UnregisterErrorListener(address.to_string()));
        state.error_listeners.remove(address);
        Ok(())
    }

    fn register_data_listener(
        &self,
        address: &str,
        kind: PacketKind,
        listener: Arc<dyn DataListener>,
    ) -> Result<(), NativeError> {
        let mut state = self.record(SdkCall::RegisterDataListener(address.to_string(), kind));
        state
            .data_listeners
            .insert((address.to_string(), kind), listener);
        Ok(())
    }

    fn unregister_data_listener(
        &self,
        address: &str,
        kind: PacketKind,
    ) -> Result<(), NativeError> {
        let mut state = self.record(SdkCall::UnregisterDataListener(address.to_string(), kind));
        state.data_listeners.remove(&(address.to_string(), kind));
        Ok(())
    }

    fn unregister_all_listeners(&self, address: &str) -> Result<(), NativeError> {
        let mut state = self.record(SdkCall::UnregisterAllListeners(address.to_string()));
        state.connection_listeners.remove(address);
        state.error_listeners.remove(address);
        state.data_listeners.retain(|(a, _), _| a != address);
        Ok(())
    }

    fn connection_state(&self, address: &str) -> Result<ConnectionState, NativeError> {
        let state = self.record(SdkCall::ConnectionState(address.to_string()));
        Ok(state.states.get(address).copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Transitions(Mutex<Vec<(ConnectionState, ConnectionState)>>);

    impl ConnectionListener for Transitions {
        fn on_connection_changed(&self, previous: ConnectionState, current: ConnectionState) {
            self.0.lock().unwrap().push((previous, current));
        }
    }

    struct Packets(Mutex<usize>);

    impl DataListener for Packets {
        fn on_packet(&self, _packet: RawPacket) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_accept_reports_connecting_then_connected() {
        let sdk = MockSdk::new();
        let listener = Arc::new(Transitions(Mutex::new(Vec::new())));
        sdk.register_connection_listener("mac1", listener.clone()).unwrap();
        sdk.connect("mac1").unwrap();

        assert_eq!(
            *listener.0.lock().unwrap(),
            vec![
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
            ]
        );
        assert_eq!(sdk.connection_state("mac1").unwrap(), ConnectionState::Connected);
    }

    #[test]
    fn test_reject_returns_vendor_error() {
        let sdk = MockSdk::new();
        sdk.set_connect_behavior(ConnectBehavior::Reject(VendorCode::Timeout));
        let err = sdk.connect("mac1").unwrap_err();
        assert!(matches!(
            err,
            NativeError::Vendor {
                code: VendorCode::Timeout,
                ..
            }
        ));
        assert_eq!(sdk.native_state("mac1"), ConnectionState::Disconnected);
    }

    #[test]
    fn test_packets_require_transmission_and_listener() {
        let sdk = MockSdk::new();
        let listener = Arc::new(Packets(Mutex::new(0)));
        sdk.register_data_listener("mac1", PacketKind::Eeg, listener.clone())
            .unwrap();
        assert!(!sdk.emit_packet("mac1", PacketKind::Eeg, [0.0; 6], 0));

        sdk.set_data_transmission("mac1", true).unwrap();
        assert!(sdk.emit_packet("mac1", PacketKind::Eeg, [0.0; 6], 0));
        assert!(!sdk.emit_packet("mac1", PacketKind::Battery, [0.0; 6], 0));

        sdk.unregister_all_listeners("mac1").unwrap();
        assert!(!sdk.emit_packet("mac1", PacketKind::Eeg, [0.0; 6], 0));
        assert_eq!(*listener.0.lock().unwrap(), 1);
    }

    #[test]
    fn test_call_log() {
        let sdk = MockSdk::new();
        sdk.initialize().unwrap();
        sdk.start_scanning().unwrap();
        assert!(sdk.is_scanning());
        assert_eq!(sdk.calls(), vec![SdkCall::Initialize, SdkCall::StartScanning]);
        assert_eq!(
            sdk.call_count(|c| matches!(c, SdkCall::StartScanning)),
            1
        );
    }
}
