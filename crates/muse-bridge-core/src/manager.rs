//! Device Manager - discovery, the current session and opportunistic reconnect.
//!
//! A manager owns one [`MuseSdk`], republishes the discovered device list,
//! and keeps at most one current [`DeviceSession`]. Every sequence that
//! mutates native state runs under one async guard per manager; independent
//! managers do not block each other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::device::{DeviceDescriptor, dedupe_descriptors};
use crate::dispatch::{NormalizationSnapshot, Normalizer};
use crate::error::{BridgeError, ErrorKind};
use crate::events::{
    BridgeEvent, BridgeObserver, Dispatcher, ErrorEvent, EventFilter, EventHub, SubscriptionId,
    callback_boundary,
};
use crate::native::{DiscoveryListener, MuseSdk};
use crate::session::{ConnectOutcome, DeviceSession, DisconnectOutcome, SessionConfig};
use crate::state::ConnectionState;
use crate::status::{DEFAULT_LOG_CAPACITY, StatusAggregator};

/// Bridge-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Path to the vendor SDK shared library.
    pub library_path: Option<String>,
    /// Reconnect to the last device when it reappears in a scan.
    pub auto_reconnect: bool,
    /// Connection log capacity.
    pub log_capacity: usize,
    /// Pause between dropping one device and connecting the next.
    pub switch_settle_ms: u64,
    pub session: SessionConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            library_path: None,
            auto_reconnect: true,
            log_capacity: DEFAULT_LOG_CAPACITY,
            switch_settle_ms: 500,
            session: SessionConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

/// Bluetooth permission as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
    BluetoothDisabled,
}

/// Platform permission check consulted before scanning.
pub trait PermissionProvider: Send + Sync {
    fn check(&self) -> Permission;

    /// Prompt the user. Defaults to re-checking.
    fn request(&self) -> Permission {
        self.check()
    }
}

/// For platforms without a Bluetooth permission model.
pub struct AlwaysGranted;

impl PermissionProvider for AlwaysGranted {
    fn check(&self) -> Permission {
        Permission::Granted
    }
}

/// Connect request that owns the manager until it finishes.
struct Pending<S: MuseSdk + 'static> {
    address: String,
    session: Option<Arc<DeviceSession<S>>>,
    cancelled: bool,
}

struct PendingGuard<'a, S: MuseSdk + 'static>(&'a Mutex<Option<Pending<S>>>);

impl<S: MuseSdk + 'static> Drop for PendingGuard<'_, S> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

struct ManagerInner<S: MuseSdk + 'static> {
    sdk: Arc<S>,
    config: BridgeConfig,
    hub: Arc<EventHub>,
    status: StatusAggregator,
    permissions: Arc<dyn PermissionProvider>,
    normalizer: Arc<Normalizer>,
    guard: tokio::sync::Mutex<()>,
    current: RwLock<Option<Arc<DeviceSession<S>>>>,
    pending: Mutex<Option<Pending<S>>>,
    devices: RwLock<Arc<[DeviceDescriptor]>>,
    remembered: Mutex<Option<String>>,
    scanning: AtomicBool,
    runtime: Option<Handle>,
}

/// Notified by the SDK when its device list changes.
struct DiscoveryHook<S: MuseSdk + 'static> {
    manager: Weak<ManagerInner<S>>,
}

impl<S: MuseSdk + 'static> DiscoveryListener for DiscoveryHook<S> {
    fn on_device_list_changed(&self) {
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        let hub = inner.hub.clone();
        // Reading the list re-enters the SDK; keep it off the notifying thread.
        callback_boundary(&hub, "discovery", move || match inner.runtime.clone() {
            Some(runtime) => {
                runtime.spawn_blocking(move || inner.refresh_devices());
            }
            None => {
                let spawned = std::thread::Builder::new()
                    .name("muse-discovery".into())
                    .spawn(move || inner.refresh_devices());
                if let Err(e) = spawned {
                    warn!(error = %e, "Could not start discovery refresh");
                }
            }
        });
    }
}

impl<S: MuseSdk + 'static> ManagerInner<S> {
    fn pending(&self) -> MutexGuard<'_, Option<Pending<S>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Arc<DeviceSession<S>>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_current(&self) -> Option<Arc<DeviceSession<S>>> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn remembered(&self) -> Option<String> {
        self.remembered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_remembered(&self, address: Option<String>) {
        *self.remembered.lock().unwrap_or_else(PoisonError::into_inner) = address;
    }

    /// Publish a caller-facing error and hand it back for returning.
    fn fail(&self, err: BridgeError) -> BridgeError {
        self.hub.publish(BridgeEvent::Error(ErrorEvent::from(&err)));
        self.status.report_error(None, &err.to_string());
        err
    }

    fn check_permission(&self) -> Result<(), BridgeError> {
        let permission = match self.permissions.check() {
            Permission::Denied => self.permissions.request(),
            other => other,
        };
        match permission {
            Permission::Granted => Ok(()),
            Permission::Denied => Err(self.fail(BridgeError::PermissionDenied)),
            Permission::BluetoothDisabled => Err(self.fail(BridgeError::BluetoothNotEnabled)),
        }
    }

    fn start_scanning_locked(&self) -> Result<(), BridgeError> {
        self.check_permission()?;
        self.sdk
            .start_scanning()
            .map_err(|e| self.fail(BridgeError::ScanningFailed(e)))?;
        self.scanning.store(true, Ordering::Release);
        info!("Scanning started");
        Ok(())
    }

    fn stop_scanning_locked(&self) -> Result<(), BridgeError> {
        self.check_permission()?;
        self.sdk
            .stop_scanning()
            .map_err(|e| self.fail(BridgeError::ScanningFailed(e)))?;
        self.scanning.store(false, Ordering::Release);
        info!("Scanning stopped");
        Ok(())
    }

    /// Re-read the native device list and republish it wholesale.
    fn refresh_devices(self: &Arc<Self>) {
        match self.sdk.discovered_devices() {
            Ok(raw) => {
                let total = raw.len();
                let list: Arc<[DeviceDescriptor]> = dedupe_descriptors(raw).into();
                debug!(total, published = list.len(), "Device list refreshed");
                *self.devices.write().unwrap_or_else(PoisonError::into_inner) = list.clone();
                self.hub.publish(BridgeEvent::DevicesDiscovered(list.clone()));
                self.maybe_reconnect(&list);
            }
            Err(e) => {
                warn!(error = %e, "Device list unavailable, keeping previous list");
                let mut event = ErrorEvent::from(&e);
                event.kind = ErrorKind::ScanningFailed;
                self.hub.publish(BridgeEvent::Warning(event));
            }
        }
    }

    fn maybe_reconnect(self: &Arc<Self>, devices: &[DeviceDescriptor]) {
        if !self.config.auto_reconnect {
            return;
        }
        let Some(address) = self.remembered() else {
            return;
        };
        if self.current().is_some() || self.pending().is_some() {
            return;
        }
        let Some(descriptor) = devices.iter().find(|d| d.address == address).cloned() else {
            return;
        };
        let Some(runtime) = self.runtime.as_ref() else {
            debug!(address = %address, "No runtime for background reconnect");
            return;
        };
        info!(name = %descriptor.name, address = %address, "Remembered device reappeared, reconnecting");
        let inner = self.clone();
        runtime.spawn(async move {
            if let Err(e) = inner.connect_to_device(&descriptor).await {
                debug!(error = %e, "Background reconnect failed");
            }
        });
    }

    fn retire(&self, session: &DeviceSession<S>, outcome: &Result<DisconnectOutcome, BridgeError>) {
        match outcome {
            Ok(DisconnectOutcome::Forced(reason)) => {
                self.status.report_warning(Some(session.descriptor()), reason);
            }
            Err(e) => self.status.report_warning(Some(session.descriptor()), &e.to_string()),
            Ok(_) => {}
        }
        self.status.unregister(session.address());
        self.status.report_disconnected(session.descriptor());
    }

    /// Retire the session when the device drops on its own, or reset it
    /// under the manager guard when an SDK error asks for it.
    fn watch_session(self: &Arc<Self>, session: Arc<DeviceSession<S>>) {
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        let manager = Arc::downgrade(self);
        let mut state_rx = session.subscribe_state();
        let mut reset_rx = session.subscribe_reset();
        runtime.spawn(async move {
            let reason = tokio::select! {
                dropped = async {
                    state_rx
                        .wait_for(|s| *s == ConnectionState::Disconnected)
                        .await
                        .is_ok()
                } => {
                    if !dropped {
                        return;
                    }
                    "Device dropped"
                }
                requested = reset_rx.changed() => {
                    if requested.is_err() {
                        return;
                    }
                    "Resetting after SDK error"
                }
            };
            let Some(inner) = manager.upgrade() else {
                return;
            };
            let _guard = inner.guard.lock().await;
            let still_current = {
                let mut current = inner.current.write().unwrap_or_else(PoisonError::into_inner);
                match current.as_ref() {
                    Some(c) if Arc::ptr_eq(c, &session) => current.take(),
                    _ => None,
                }
            };
            if let Some(session) = still_current {
                warn!(name = %session.descriptor().name, "{}", reason);
                let outcome = session.disconnect().await;
                if let Err(e) = &outcome {
                    debug!(error = %e, "Session cleanup failed");
                }
                inner.retire(&session, &outcome);
            }
        });
    }

    #[instrument(skip_all, fields(device = %descriptor.address))]
    async fn connect_to_device(
        self: &Arc<Self>,
        descriptor: &DeviceDescriptor,
    ) -> Result<ConnectOutcome, BridgeError> {
        {
            let mut pending = self.pending();
            if pending.is_some() {
                return Ok(ConnectOutcome::AlreadyConnecting);
            }
            if let Some(current) = self.current() {
                if current.address() == descriptor.address
                    && current.state() == ConnectionState::Connected
                {
                    return Ok(ConnectOutcome::AlreadyConnected);
                }
            }
            *pending = Some(Pending {
                address: descriptor.address.clone(),
                session: None,
                cancelled: false,
            });
        }
        let _pending = PendingGuard(&self.pending);
        let _guard = self.guard.lock().await;

        // Leaving a device means it should not come back on its own.
        if self
            .remembered()
            .is_some_and(|address| address != descriptor.address)
        {
            self.set_remembered(None);
        }

        if self.scanning.load(Ordering::Acquire) {
            if let Err(e) = self.stop_scanning_locked() {
                debug!(error = %e, "Could not stop scanning before connect");
            }
        }

        if let Some(previous) = self.take_current() {
            info!(from = %previous.descriptor().name, to = %descriptor.name, "Switching device");
            let outcome = previous.disconnect().await;
            if let Err(e) = &outcome {
                warn!(error = %e, "Disconnect of previous device failed");
            }
            self.retire(&previous, &outcome);
            sleep(Duration::from_millis(self.config.switch_settle_ms)).await;
        }

        let session = Arc::new(DeviceSession::with_normalizer(
            self.sdk.clone(),
            descriptor.clone(),
            self.config.session.clone(),
            self.hub.clone(),
            self.normalizer.clone(),
        ));
        let cancelled = {
            let mut pending = self.pending();
            match pending.as_mut() {
                Some(p) => {
                    p.session = Some(session.clone());
                    p.cancelled
                }
                None => false,
            }
        };
        if cancelled {
            let err = BridgeError::connection(&descriptor.address, "cancelled by disconnect request");
            self.hub.publish(BridgeEvent::Warning(ErrorEvent::from(&err)));
            self.status.report_warning(Some(descriptor), &err.to_string());
            return Err(err);
        }

        match session.connect().await {
            Ok(outcome) => {
                *self.current.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(session.clone());
                self.status.register(session.clone());
                self.status.report_connected(descriptor);
                self.set_remembered(Some(descriptor.address.clone()));
                self.watch_session(session);
                Ok(outcome)
            }
            Err(e) => {
                // The session already published the typed error.
                let cancelled = self.pending().as_ref().is_some_and(|p| p.cancelled);
                if cancelled {
                    self.status.report_warning(Some(descriptor), &e.to_string());
                } else {
                    self.status.report_error(Some(descriptor), &e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn disconnect_current(&self) -> Result<(), BridgeError> {
        let in_flight = {
            let mut pending = self.pending();
            match pending.as_mut() {
                Some(p) => {
                    debug!(address = %p.address, "Cancelling pending connect");
                    p.cancelled = true;
                    p.session.clone()
                }
                None => None,
            }
        };
        if let Some(session) = in_flight {
            session.disconnect().await?;
        }

        let _guard = self.guard.lock().await;
        self.set_remembered(None);
        if let Some(session) = self.take_current() {
            let result = session.disconnect().await;
            self.retire(&session, &result);
            result?;
        }
        Ok(())
    }
}

/// Builder for [`DeviceManager`].
pub struct ManagerBuilder<S: MuseSdk + 'static> {
    sdk: Arc<S>,
    config: BridgeConfig,
    permissions: Arc<dyn PermissionProvider>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl<S: MuseSdk + 'static> ManagerBuilder<S> {
    pub fn new(sdk: Arc<S>) -> Self {
        Self {
            sdk,
            config: BridgeConfig::default(),
            permissions: Arc::new(AlwaysGranted),
            dispatcher: None,
        }
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn permissions(mut self, permissions: Arc<dyn PermissionProvider>) -> Self {
        self.permissions = permissions;
        self
    }

    /// Marshal every published event and log mutation onto `dispatcher`.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Initialize the SDK and install the discovery hook.
    pub fn build(self) -> Result<DeviceManager<S>, BridgeError> {
        let hub = Arc::new(match self.dispatcher {
            Some(dispatcher) => EventHub::with_dispatcher(dispatcher),
            None => EventHub::new(),
        });

        if let Err(e) = self.sdk.initialize() {
            let err = BridgeError::Native(e);
            hub.publish(BridgeEvent::Error(ErrorEvent::from(&err)));
            return Err(err);
        }

        let status = StatusAggregator::new(hub.clone(), self.config.log_capacity);
        let inner = Arc::new(ManagerInner {
            sdk: self.sdk,
            config: self.config,
            hub,
            status,
            permissions: self.permissions,
            normalizer: Arc::new(Normalizer::new()),
            guard: tokio::sync::Mutex::new(()),
            current: RwLock::new(None),
            pending: Mutex::new(None),
            devices: RwLock::new(Arc::from(Vec::new())),
            remembered: Mutex::new(None),
            scanning: AtomicBool::new(false),
            runtime: Handle::try_current().ok(),
        });

        let hook: Arc<dyn DiscoveryListener> = Arc::new(DiscoveryHook {
            manager: Arc::downgrade(&inner),
        });
        inner.sdk.set_discovery_listener(Some(hook))?;

        Ok(DeviceManager { inner })
    }
}

/// Registry of discovered devices and owner of the current session.
pub struct DeviceManager<S: MuseSdk + 'static> {
    inner: Arc<ManagerInner<S>>,
}

impl<S: MuseSdk + 'static> Clone for DeviceManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: MuseSdk + 'static> DeviceManager<S> {
    pub fn builder(sdk: Arc<S>) -> ManagerBuilder<S> {
        ManagerBuilder::new(sdk)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.inner.hub
    }

    pub fn status(&self) -> &StatusAggregator {
        &self.inner.status
    }

    pub fn subscribe(
        &self,
        filter: EventFilter,
        observer: Arc<dyn BridgeObserver>,
    ) -> SubscriptionId {
        self.inner.hub.subscribe(filter, observer)
    }

    /// Subscribe an unbounded channel of events.
    pub fn events(
        &self,
        filter: EventFilter,
    ) -> (SubscriptionId, tokio::sync::mpsc::UnboundedReceiver<BridgeEvent>) {
        self.inner.hub.channel(filter)
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::Acquire)
    }

    /// Start discovery. Requires Bluetooth permission.
    pub async fn start_scanning(&self) -> Result<(), BridgeError> {
        let _guard = self.inner.guard.lock().await;
        self.inner.start_scanning_locked()
    }

    pub async fn stop_scanning(&self) -> Result<(), BridgeError> {
        let _guard = self.inner.guard.lock().await;
        self.inner.stop_scanning_locked()
    }

    /// Re-read the SDK device list now.
    pub fn refresh_devices(&self) {
        self.inner.refresh_devices();
    }

    /// Latest deduplicated device list.
    pub fn devices(&self) -> Arc<[DeviceDescriptor]> {
        self.inner
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Look up a discovered device by name or address.
    pub fn find_device(&self, name_or_address: &str) -> Option<DeviceDescriptor> {
        self.devices()
            .iter()
            .find(|d| d.matches(name_or_address))
            .cloned()
    }

    pub fn current_session(&self) -> Option<Arc<DeviceSession<S>>> {
        self.inner.current()
    }

    /// Connect to `descriptor`, replacing any current session.
    pub async fn connect_to_device(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<ConnectOutcome, BridgeError> {
        self.inner.connect_to_device(descriptor).await
    }

    /// Disconnect the current device and forget it for reconnects.
    pub async fn disconnect_current(&self) -> Result<(), BridgeError> {
        self.inner.disconnect_current().await
    }

    /// Disconnect, stop scanning and detach from the SDK.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        info!("Shutting down device manager");
        let result = self.inner.disconnect_current().await;
        {
            let _guard = self.inner.guard.lock().await;
            if self.is_scanning() {
                if let Err(e) = self.inner.stop_scanning_locked() {
                    debug!(error = %e, "Stop scanning during shutdown failed");
                }
            }
            if let Err(e) = self.inner.sdk.set_discovery_listener(None) {
                warn!(error = %e, "Failed to detach discovery listener");
            }
        }
        result
    }

    pub fn normalization_stats(&self) -> NormalizationSnapshot {
        self.inner.normalizer.stats()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::events::testing::RecordingObserver;
    use crate::events::{EventKind, StatusEvent};
    use crate::native::{ConnectBehavior, DisconnectBehavior, MockSdk, SdkCall};
    use crate::protocol::VendorCode;

    fn status_events(recorder: &RecordingObserver) -> Vec<StatusEvent> {
        recorder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::Status(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    struct FixedPermission(Permission);

    impl PermissionProvider for FixedPermission {
        fn check(&self) -> Permission {
            self.0
        }
    }

    fn muse(name: &str, address: &str, rssi: f64) -> DeviceDescriptor {
        DeviceDescriptor::new(name, address, rssi)
    }

    fn manager_with(
        sdk: &Arc<MockSdk>,
        permission: Permission,
    ) -> (DeviceManager<MockSdk>, Arc<RecordingObserver>) {
        let manager = DeviceManager::builder(sdk.clone())
            .permissions(Arc::new(FixedPermission(permission)))
            .build()
            .unwrap();
        let recorder = Arc::new(RecordingObserver::default());
        manager.subscribe(EventFilter::All, recorder.clone());
        (manager, recorder)
    }

    fn manager(sdk: &Arc<MockSdk>) -> (DeviceManager<MockSdk>, Arc<RecordingObserver>) {
        manager_with(sdk, Permission::Granted)
    }

    #[test]
    fn test_build_initializes_and_hooks_discovery() {
        let sdk = Arc::new(MockSdk::new());
        let _ = manager(&sdk);
        assert_eq!(sdk.calls()[0], SdkCall::Initialize);
        assert!(sdk.has_discovery_listener());
    }

    #[test]
    fn test_duplicate_addresses_collapse() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, recorder) = manager(&sdk);
        sdk.set_devices(vec![muse("A", "mac1", -40.0), muse("A", "mac1", -55.0)]);

        manager.refresh_devices();

        let devices = manager.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address, "mac1");
        let published = recorder
            .events()
            .into_iter()
            .find_map(|e| match e {
                BridgeEvent::DevicesDiscovered(list) => Some(list),
                _ => None,
            })
            .unwrap();
        assert_eq!(published.len(), 1);
    }

    /// Reports the thread each device list is published on.
    struct PublishThread(Mutex<mpsc::Sender<thread::ThreadId>>);

    impl BridgeObserver for PublishThread {
        fn on_event(&self, event: &BridgeEvent) {
            if let BridgeEvent::DevicesDiscovered(_) = event {
                let _ = self.0.lock().unwrap().send(thread::current().id());
            }
        }
    }

    #[test]
    fn test_native_notification_refreshes_off_thread() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, _) = manager(&sdk);
        let (tx, rx) = mpsc::channel();
        manager.subscribe(EventFilter::All, Arc::new(PublishThread(Mutex::new(tx))));
        sdk.set_devices(vec![
            muse("Muse-1", "mac1", -40.0),
            muse("", "mac2", -41.0),
            muse("Muse-3", "", -42.0),
        ]);

        // No runtime here; the refresh must still leave the notifying thread.
        sdk.notify_device_list_changed();

        let publisher = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(publisher, thread::current().id());
        let devices = manager.devices();
        assert_eq!(devices.len(), 1);
        assert!(devices.iter().all(|d| d.is_complete()));
    }

    #[test]
    fn test_discovery_failure_keeps_previous_list() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, recorder) = manager(&sdk);
        sdk.set_devices(vec![muse("Muse-1", "mac1", -40.0)]);
        manager.refresh_devices();

        sdk.fail_device_list(Some(VendorCode::Failure));
        manager.refresh_devices();

        assert_eq!(manager.devices().len(), 1);
        assert_eq!(recorder.count(EventKind::Warning), 1);
        assert_eq!(recorder.count(EventKind::Discovery), 1);
    }

    #[test]
    fn test_find_device_by_name_or_address() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, _) = manager(&sdk);
        sdk.set_devices(vec![muse("Muse-1A2B", "00:55:DA:B0:0B:61", -40.0)]);
        manager.refresh_devices();

        assert!(manager.find_device("Muse-1A2B").is_some());
        assert!(manager.find_device("00:55:da:b0:0b:61").is_some());
        assert!(manager.find_device("Muse-FFFF").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanning_requires_permission() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, recorder) = manager_with(&sdk, Permission::Denied);

        let err = manager.start_scanning().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(sdk.call_count(|c| matches!(c, SdkCall::StartScanning)), 0);
        assert_eq!(recorder.errors().len(), 1);
        assert!(!manager.is_scanning());

        let sdk = Arc::new(MockSdk::new());
        let (manager, _) = manager_with(&sdk, Permission::BluetoothDisabled);
        let err = manager.start_scanning().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BluetoothNotEnabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanning_failure() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, recorder) = manager(&sdk);
        sdk.fail_scanning(Some(VendorCode::Failure));

        let err = manager.start_scanning().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScanningFailed);
        assert!(!manager.is_scanning());
        assert_eq!(recorder.errors()[0].kind, ErrorKind::ScanningFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_installs_session() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, recorder) = manager(&sdk);
        manager.start_scanning().await.unwrap();
        let device = muse("Muse-1", "mac1", -40.0);

        let outcome = manager.connect_to_device(&device).await.unwrap();

        assert_eq!(outcome, ConnectOutcome::Connected);
        assert!(!manager.is_scanning());
        assert_eq!(sdk.call_count(|c| matches!(c, SdkCall::StopScanning)), 1);
        let session = manager.current_session().unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(manager.status().is_any_connected());
        assert_eq!(
            manager.status().representative_device_name().as_deref(),
            Some("Muse-1")
        );
        assert_eq!(manager.status().log_entries()[0].message, "Connected to Muse-1");
        assert_eq!(recorder.count(EventKind::Status), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_single_flight() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, _) = manager(&sdk);
        sdk.set_connect_behavior(ConnectBehavior::Stall);
        let device = muse("Muse-1", "mac1", -40.0);

        let task = tokio::spawn({
            let manager = manager.clone();
            let device = device.clone();
            async move { manager.connect_to_device(&device).await }
        });
        sleep(Duration::from_millis(100)).await;

        assert_eq!(
            manager.connect_to_device(&device).await.unwrap(),
            ConnectOutcome::AlreadyConnecting
        );
        assert_eq!(
            manager
                .connect_to_device(&muse("Muse-2", "mac2", -45.0))
                .await
                .unwrap(),
            ConnectOutcome::AlreadyConnecting
        );

        sdk.deliver_transition("mac1", ConnectionState::Connected);
        assert_eq!(task.await.unwrap().unwrap(), ConnectOutcome::Connected);
        assert_eq!(
            manager.connect_to_device(&device).await.unwrap(),
            ConnectOutcome::AlreadyConnected
        );
        assert_eq!(sdk.call_count(|c| matches!(c, SdkCall::Connect(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_devices_disconnects_previous() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, _) = manager(&sdk);

        manager.connect_to_device(&muse("Muse-A", "macA", -40.0)).await.unwrap();
        manager.connect_to_device(&muse("Muse-B", "macB", -42.0)).await.unwrap();

        assert_eq!(
            sdk.call_count(|c| *c == SdkCall::Disconnect("macA".into())),
            1
        );
        assert_eq!(manager.current_session().unwrap().address(), "macB");
        assert_eq!(sdk.native_state("macA"), ConnectionState::Disconnected);
        let messages: Vec<_> = manager
            .status()
            .log_entries()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(
            messages,
            vec!["Connected to Muse-A", "Disconnected from Muse-A", "Connected to Muse-B"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_leaves_slot_empty() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, recorder) = manager(&sdk);
        sdk.set_connect_behavior(ConnectBehavior::Stall);

        let err = manager
            .connect_to_device(&muse("Muse-1", "mac1", -40.0))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(manager.current_session().is_none());
        assert!(!manager.status().is_any_connected());
        assert_eq!(recorder.errors().len(), 1);
        assert!(manager.status().log_entries()[0].message.starts_with("Error:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_current_cancels_pending_connect() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, _) = manager(&sdk);
        sdk.set_connect_behavior(ConnectBehavior::Stall);

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect_to_device(&muse("Muse-1", "mac1", -40.0)).await }
        });
        sleep(Duration::from_millis(100)).await;

        manager.disconnect_current().await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert!(manager.current_session().is_none());
        assert_eq!(sdk.native_state("mac1"), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_connect_is_a_warning() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, recorder) = manager(&sdk);
        sdk.set_connect_behavior(ConnectBehavior::Stall);

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect_to_device(&muse("Muse-1", "mac1", -40.0)).await }
        });
        sleep(Duration::from_millis(100)).await;
        manager.disconnect_current().await.unwrap();
        task.await.unwrap().unwrap_err();

        let statuses = status_events(&recorder);
        assert_eq!(statuses.len(), 1);
        assert!(matches!(
            &statuses[0],
            StatusEvent::Warning { device: Some(name), message }
                if name == "Muse-1" && message.contains("cancelled")
        ));
        assert!(manager.status().log_entries()[0].message.starts_with("Warning:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_disconnect_is_a_warning() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, recorder) = manager(&sdk);
        manager.connect_to_device(&muse("Muse-1", "mac1", -40.0)).await.unwrap();
        sdk.set_disconnect_behavior(DisconnectBehavior::Ignore);

        manager.disconnect_current().await.unwrap();

        let statuses = status_events(&recorder);
        assert!(matches!(
            &statuses[1],
            StatusEvent::Warning { message, .. } if message.contains("5000ms")
        ));
        assert!(matches!(&statuses[2], StatusEvent::Disconnected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reset_holds_manager_guard() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, recorder) = manager(&sdk);
        manager.connect_to_device(&muse("Muse-1", "mac1", -40.0)).await.unwrap();
        let session = manager.current_session().unwrap();
        sdk.set_disconnect_behavior(DisconnectBehavior::Ignore);

        assert!(sdk.emit_error("mac1", VendorCode::Failure, "link lost"));
        sleep(Duration::from_millis(50)).await;

        assert!(session.is_busy());
        assert!(manager.inner.guard.try_lock().is_err());

        sleep(Duration::from_secs(6)).await;
        assert!(!session.is_busy());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(manager.current_session().is_none());
        assert!(manager.inner.guard.try_lock().is_ok());
        assert_eq!(recorder.errors().len(), 1);
        let messages: Vec<_> = manager
            .status()
            .log_entries()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages.last().map(String::as_str), Some("Disconnected from Muse-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_switch_does_not_revive_previous() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, _) = manager(&sdk);
        let first = muse("Muse-A", "macA", -40.0);
        manager.connect_to_device(&first).await.unwrap();

        sdk.set_connect_behavior(ConnectBehavior::Stall);
        manager
            .connect_to_device(&muse("Muse-B", "macB", -42.0))
            .await
            .unwrap_err();
        sdk.set_connect_behavior(ConnectBehavior::Accept);

        sdk.set_devices(vec![first]);
        manager.refresh_devices();
        sleep(Duration::from_secs(2)).await;

        assert!(manager.current_session().is_none());
        assert_eq!(sdk.call_count(|c| matches!(c, SdkCall::Connect(_))), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_current_forgets_device() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, _) = manager(&sdk);
        let device = muse("Muse-1", "mac1", -40.0);
        manager.connect_to_device(&device).await.unwrap();

        manager.disconnect_current().await.unwrap();
        assert!(manager.current_session().is_none());
        assert!(!manager.status().is_any_connected());

        sdk.set_devices(vec![device]);
        manager.refresh_devices();
        sleep(Duration::from_secs(1)).await;
        assert!(manager.current_session().is_none());
        assert_eq!(sdk.call_count(|c| matches!(c, SdkCall::Connect(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_device_reconnects_when_seen_again() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, recorder) = manager(&sdk);
        let device = muse("Muse-1", "mac1", -40.0);
        manager.connect_to_device(&device).await.unwrap();

        sdk.deliver_transition("mac1", ConnectionState::Disconnected);
        sleep(Duration::from_millis(500)).await;
        assert!(manager.current_session().is_none());
        assert_eq!(
            recorder
                .errors()
                .iter()
                .filter(|e| e.kind == ErrorKind::DeviceDisconnected)
                .count(),
            1
        );

        sdk.set_devices(vec![device]);
        manager.refresh_devices();
        sleep(Duration::from_secs(2)).await;

        let session = manager.current_session().unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(sdk.call_count(|c| matches!(c, SdkCall::Connect(_))), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_detaches() {
        let sdk = Arc::new(MockSdk::new());
        let (manager, _) = manager(&sdk);
        manager.start_scanning().await.unwrap();
        manager.connect_to_device(&muse("Muse-1", "mac1", -40.0)).await.unwrap();
        manager.start_scanning().await.unwrap();

        manager.shutdown().await.unwrap();
        assert!(manager.current_session().is_none());
        assert!(!manager.is_scanning());
        assert!(!sdk.has_discovery_listener());
    }

    #[test]
    fn test_bridge_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("muse-bridge.toml");
        let config = BridgeConfig {
            library_path: Some("/opt/muse/libmuse_sdk.so".into()),
            auto_reconnect: false,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(BridgeConfig::load_from_file(&path).unwrap(), config);
        assert!(BridgeConfig::load_from_file(dir.path().join("missing.toml")).is_err());
    }
}
