//! Connection status aggregation and the lifecycle log.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::device::{DeviceDescriptor, DeviceFamily};
use crate::events::{BridgeEvent, EventHub, StatusEvent};
use crate::state::ConnectionState;

/// Default number of retained log entries.
pub const DEFAULT_LOG_CAPACITY: usize = 100;

/// Read-only view of a session, as needed by the aggregator.
pub trait SessionStatus: Send + Sync {
    fn descriptor(&self) -> &DeviceDescriptor;
    fn state(&self) -> ConnectionState;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionLogEntry {
    pub device_name: String,
    pub address: String,
    pub family: DeviceFamily,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ConnectionLogEntry {
    fn new(device: Option<&DeviceDescriptor>, message: impl Into<String>) -> Self {
        Self {
            device_name: device.map(|d| d.name.clone()).unwrap_or_default(),
            address: device.map(|d| d.address.clone()).unwrap_or_default(),
            family: device.map(|d| d.family).unwrap_or(DeviceFamily::Unknown),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Append-only log that evicts its oldest entry when full.
#[derive(Debug)]
pub struct ConnectionLog {
    entries: VecDeque<ConnectionLogEntry>,
    capacity: usize,
}

impl ConnectionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: ConnectionLogEntry) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = &ConnectionLogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Tracks registered sessions and raises coarse status events.
///
/// When the hub carries a dispatcher, log mutations and status publishes run
/// on it in submission order; otherwise they run on the calling thread.
pub struct StatusAggregator {
    sessions: RwLock<HashMap<String, Arc<dyn SessionStatus>>>,
    log: Arc<Mutex<ConnectionLog>>,
    hub: Arc<EventHub>,
}

impl StatusAggregator {
    pub fn new(hub: Arc<EventHub>, log_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            log: Arc::new(Mutex::new(ConnectionLog::new(log_capacity))),
            hub,
        }
    }

    pub fn register(&self, session: Arc<dyn SessionStatus>) {
        let address = session.descriptor().address.clone();
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, session);
    }

    pub fn unregister(&self, address: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address)
            .is_some()
    }

    pub fn is_any_connected(&self) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|s| s.state() == ConnectionState::Connected)
    }

    /// Name of a connected device, preferring the lowest address for a
    /// stable answer.
    pub fn representative_device_name(&self) -> Option<String> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut connected: Vec<_> = sessions
            .values()
            .filter(|s| s.state() == ConnectionState::Connected)
            .map(|s| s.descriptor())
            .collect();
        connected.sort_by(|a, b| a.address.cmp(&b.address));
        connected.first().map(|d| d.name.clone())
    }

    pub fn report_connected(&self, device: &DeviceDescriptor) {
        let entry = ConnectionLogEntry::new(Some(device), format!("Connected to {}", device.name));
        self.route(
            entry,
            BridgeEvent::Status(StatusEvent::Connected {
                name: device.name.clone(),
                address: device.address.clone(),
            }),
        );
    }

    pub fn report_disconnected(&self, device: &DeviceDescriptor) {
        let entry =
            ConnectionLogEntry::new(Some(device), format!("Disconnected from {}", device.name));
        self.route(
            entry,
            BridgeEvent::Status(StatusEvent::Disconnected {
                name: device.name.clone(),
                address: device.address.clone(),
            }),
        );
    }

    pub fn report_error(&self, device: Option<&DeviceDescriptor>, message: &str) {
        let entry = ConnectionLogEntry::new(device, format!("Error: {}", message));
        self.route(
            entry,
            BridgeEvent::Status(StatusEvent::Error {
                device: device.map(|d| d.name.clone()),
                message: message.to_string(),
            }),
        );
    }

    pub fn report_warning(&self, device: Option<&DeviceDescriptor>, message: &str) {
        let entry = ConnectionLogEntry::new(device, format!("Warning: {}", message));
        self.route(
            entry,
            BridgeEvent::Status(StatusEvent::Warning {
                device: device.map(|d| d.name.clone()),
                message: message.to_string(),
            }),
        );
    }

    /// Snapshot of the log, oldest first.
    pub fn log_entries(&self) -> Vec<ConnectionLogEntry> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries()
            .cloned()
            .collect()
    }

    fn route(&self, entry: ConnectionLogEntry, event: BridgeEvent) {
        let log = self.log.clone();
        let hub = self.hub.clone();
        let job = move || {
            log.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
            hub.publish_inline(event);
        };
        match self.hub.dispatcher() {
            Some(dispatcher) => dispatcher.dispatch(Box::new(job)),
            None => job(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::events::testing::{RecordingObserver, recording_hub};
    use crate::events::{Dispatcher, EventFilter, EventKind, ThreadDispatcher};

    struct FakeSession {
        descriptor: DeviceDescriptor,
        state: Mutex<ConnectionState>,
    }

    impl FakeSession {
        fn new(name: &str, address: &str, state: ConnectionState) -> Arc<Self> {
            Arc::new(Self {
                descriptor: DeviceDescriptor::new(name, address, -50.0),
                state: Mutex::new(state),
            })
        }
    }

    impl SessionStatus for FakeSession {
        fn descriptor(&self) -> &DeviceDescriptor {
            &self.descriptor
        }

        fn state(&self) -> ConnectionState {
            *self.state.lock().unwrap()
        }
    }

    #[test]
    fn test_log_evicts_oldest() {
        let mut log = ConnectionLog::new(2);
        for i in 0..3 {
            log.push(ConnectionLogEntry::new(None, format!("m{}", i)));
        }
        let messages: Vec<_> = log.entries().map(|e| e.message.clone()).collect();
        assert_eq!(messages, vec!["m1", "m2"]);
        assert_eq!(ConnectionLog::new(0).capacity(), 1);
    }

    #[test]
    fn test_any_connected_and_representative_name() {
        let (hub, _) = recording_hub();
        let status = StatusAggregator::new(hub, DEFAULT_LOG_CAPACITY);
        assert!(!status.is_any_connected());
        assert_eq!(status.representative_device_name(), None);

        let a = FakeSession::new("Muse-B", "mac2", ConnectionState::Connected);
        let b = FakeSession::new("Muse-A", "mac1", ConnectionState::Connecting);
        status.register(a.clone());
        status.register(b.clone());
        assert!(status.is_any_connected());
        assert_eq!(status.representative_device_name().as_deref(), Some("Muse-B"));

        *b.state.lock().unwrap() = ConnectionState::Connected;
        assert_eq!(status.representative_device_name().as_deref(), Some("Muse-A"));

        assert!(status.unregister("mac1"));
        assert!(status.unregister("mac2"));
        assert!(!status.is_any_connected());
    }

    #[test]
    fn test_reports_log_and_publish() {
        let (hub, recorder) = recording_hub();
        let status = StatusAggregator::new(hub, DEFAULT_LOG_CAPACITY);
        let device = DeviceDescriptor::new("Muse-1A2B", "mac1", -50.0);

        status.report_connected(&device);
        status.report_warning(Some(&device), "weak signal");
        status.report_disconnected(&device);
        status.report_error(None, "scan failed");

        let log = status.log_entries();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0].message, "Connected to Muse-1A2B");
        assert_eq!(log[3].address, "");
        assert_eq!(recorder.count(EventKind::Status), 4);
    }

    #[test]
    fn test_reports_route_through_dispatcher() {
        let dispatcher = Arc::new(ThreadDispatcher::new("status-test").unwrap());
        let hub = Arc::new(EventHub::with_dispatcher(dispatcher.clone()));
        let recorder = Arc::new(RecordingObserver::default());
        hub.subscribe(EventFilter::All, recorder.clone());
        let status = StatusAggregator::new(hub, 10);

        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();
        dispatcher.dispatch(Box::new(move || {
            let _ = tx.send(thread::current().id());
        }));
        let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(worker, caller);

        status.report_connected(&DeviceDescriptor::new("Muse", "mac1", -50.0));

        let (tx, rx) = mpsc::channel();
        dispatcher.dispatch(Box::new(move || {
            let _ = tx.send(());
        }));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(status.log_entries().len(), 1);
        assert_eq!(recorder.count(EventKind::Status), 1);
    }
}
