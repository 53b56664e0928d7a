//! Event system for UI decoupling.
//!
//! Every discovery update, normalized data packet, state transition, status
//! change and error flows through an [`EventHub`]. Frontends subscribe with an
//! [`BridgeObserver`] or take a tokio channel, optionally filtered by
//! [`EventKind`].

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::device::DeviceDescriptor;
use crate::error::{BridgeError, ErrorKind};
use crate::native::NativeError;
use crate::protocol::WaveKind;
use crate::state::ConnectionState;

/// One brain-activity sample.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveSample {
    pub kind: WaveKind,
    pub channels: Vec<f64>,
    pub timestamp: DateTime<Utc>,
    /// Arithmetic mean of `channels`.
    pub average: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactEvent {
    pub blink: bool,
    pub jaw_clench: bool,
    pub headband_loose: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatteryReading {
    pub percent: f64,
    pub millivolts: f64,
    pub temperature_c: f64,
    pub timestamp: DateTime<Utc>,
}

/// Domain event produced from one raw packet or state change.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    WaveSample(WaveSample),
    Artifact(ArtifactEvent),
    Battery(BatteryReading),
    ConnectionTransition {
        previous: ConnectionState,
        current: ConnectionState,
    },
}

/// Typed error or warning surfaced to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<String>,
    pub hint: Option<&'static str>,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            hint: None,
        }
    }
}

impl From<&BridgeError> for ErrorEvent {
    fn from(err: &BridgeError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            cause: std::error::Error::source(err).map(|s| s.to_string()),
            hint: err.hint(),
        }
    }
}

impl From<&NativeError> for ErrorEvent {
    fn from(err: &NativeError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            cause: None,
            hint: err.hint(),
        }
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {})", cause)?;
        }
        Ok(())
    }
}

/// Coarse lifecycle status, distinct from fine-grained transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Connected { name: String, address: String },
    Disconnected { name: String, address: String },
    Error { device: Option<String>, message: String },
    Warning { device: Option<String>, message: String },
}

/// Events published by the bridge.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Full replacement of the discovered device list.
    DevicesDiscovered(Arc<[DeviceDescriptor]>),
    /// Data or a state transition from one device.
    Data {
        address: String,
        event: NormalizedEvent,
    },
    Status(StatusEvent),
    Error(ErrorEvent),
    Warning(ErrorEvent),
}

/// Discriminant used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Discovery,
    WaveSample,
    Artifact,
    Battery,
    ConnectionTransition,
    Status,
    Error,
    Warning,
}

impl BridgeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BridgeEvent::DevicesDiscovered(_) => EventKind::Discovery,
            BridgeEvent::Data { event, .. } => match event {
                NormalizedEvent::WaveSample(_) => EventKind::WaveSample,
                NormalizedEvent::Artifact(_) => EventKind::Artifact,
                NormalizedEvent::Battery(_) => EventKind::Battery,
                NormalizedEvent::ConnectionTransition { .. } => EventKind::ConnectionTransition,
            },
            BridgeEvent::Status(_) => EventKind::Status,
            BridgeEvent::Error(_) => EventKind::Error,
            BridgeEvent::Warning(_) => EventKind::Warning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventFilter {
    #[default]
    All,
    Kinds(Vec<EventKind>),
}

impl EventFilter {
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        EventFilter::Kinds(kinds.into_iter().collect())
    }

    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Kinds(kinds) => kinds.contains(&kind),
        }
    }
}

/// Observer trait for receiving bridge events.
///
/// Called from native callback threads; implementations must not block.
pub trait BridgeObserver: Send + Sync {
    fn on_event(&self, event: &BridgeEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl BridgeObserver for NullObserver {
    fn on_event(&self, _event: &BridgeEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl BridgeObserver for TracingObserver {
    fn on_event(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::DevicesDiscovered(devices) => {
                tracing::info!(count = devices.len(), "Device list updated");
            }
            BridgeEvent::Data { address, event } => match event {
                NormalizedEvent::ConnectionTransition { previous, current } => {
                    tracing::info!(device = %address, from = %previous, to = %current, "Connection transition");
                }
                NormalizedEvent::WaveSample(sample) => {
                    tracing::trace!(device = %address, wave = %sample.kind, avg = sample.average, "Wave sample");
                }
                NormalizedEvent::Artifact(a) => {
                    tracing::trace!(
                        device = %address,
                        blink = a.blink,
                        jaw = a.jaw_clench,
                        loose = a.headband_loose,
                        "Artifact"
                    );
                }
                NormalizedEvent::Battery(b) => {
                    tracing::debug!(device = %address, percent = b.percent, "Battery");
                }
            },
            BridgeEvent::Status(status) => match status {
                StatusEvent::Connected { name, address } => {
                    tracing::info!(name = %name, address = %address, "Device connected");
                }
                StatusEvent::Disconnected { name, address } => {
                    tracing::info!(name = %name, address = %address, "Device disconnected");
                }
                StatusEvent::Error { device, message } => {
                    tracing::error!(device = ?device, "{}", message);
                }
                StatusEvent::Warning { device, message } => {
                    tracing::warn!(device = ?device, "{}", message);
                }
            },
            BridgeEvent::Error(e) => {
                tracing::error!(kind = %e.kind, cause = ?e.cause, "Error: {}", e.message);
            }
            BridgeEvent::Warning(e) => {
                tracing::warn!(kind = %e.kind, "Warning: {}", e.message);
            }
        }
    }
}

/// Forwards events into an unbounded tokio channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<BridgeEvent>) -> Self {
        Self { tx }
    }
}

impl BridgeObserver for ChannelObserver {
    fn on_event(&self, event: &BridgeEvent) {
        // Receiver gone means the subscriber lost interest.
        let _ = self.tx.send(event.clone());
    }
}

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Execution context that publishes and log mutations are marshaled onto.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, job: Job);
}

/// Runs jobs in order on one dedicated thread.
pub struct ThreadDispatcher {
    tx: Option<std_mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadDispatcher {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = std_mpsc::channel::<Job>();
        let worker = thread::Builder::new().name(name.to_string()).spawn(move || {
            for job in rx {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("Dispatched job panicked");
                }
            }
        })?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }
}

impl Dispatcher for ThreadDispatcher {
    fn dispatch(&self, job: Job) {
        if let Some(tx) = &self.tx {
            if tx.send(job).is_err() {
                tracing::warn!("Dispatcher thread is gone, job dropped");
            }
        }
    }
}

impl Drop for ThreadDispatcher {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            // Joining from the worker itself would deadlock.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

/// Handle returned by [`EventHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    observer: Arc<dyn BridgeObserver>,
}

/// Fan-out point for every bridge event.
pub struct EventHub {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            dispatcher: None,
        }
    }

    /// Route every delivery through `dispatcher`.
    pub fn with_dispatcher(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            dispatcher: Some(dispatcher),
            ..Self::new()
        }
    }

    pub fn dispatcher(&self) -> Option<&Arc<dyn Dispatcher>> {
        self.dispatcher.as_ref()
    }

    pub fn subscribe(&self, filter: EventFilter, observer: Arc<dyn BridgeObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                filter,
                observer,
            });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Subscribe an unbounded channel.
    pub fn channel(
        &self,
        filter: EventFilter,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(filter, Arc::new(ChannelObserver::new(tx)));
        (id, rx)
    }

    /// Publish an event, through the dispatcher when one is installed.
    pub fn publish(&self, event: BridgeEvent) {
        let targets = self.targets(event.kind());
        if targets.is_empty() {
            return;
        }
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.dispatch(Box::new(move || deliver(&targets, &event))),
            None => deliver(&targets, &event),
        }
    }

    /// Publish on the calling thread, bypassing the dispatcher.
    pub(crate) fn publish_inline(&self, event: BridgeEvent) {
        let targets = self.targets(event.kind());
        deliver(&targets, &event);
    }

    fn targets(&self, kind: EventKind) -> Vec<Arc<dyn BridgeObserver>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.filter.matches(kind))
            .map(|s| s.observer.clone())
            .collect()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(targets: &[Arc<dyn BridgeObserver>], event: &BridgeEvent) {
    for observer in targets {
        if panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(event))).is_err() {
            tracing::error!(kind = ?event.kind(), "Observer panicked");
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a callback handler; a panic becomes an `Unknown` error event instead
/// of unwinding into native code.
pub fn callback_boundary<F: FnOnce()>(hub: &EventHub, context: &str, f: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = panic_message(payload.as_ref());
        tracing::error!(context = context, "Callback handler panicked: {}", message);
        hub.publish(BridgeEvent::Error(ErrorEvent::new(
            ErrorKind::Unknown,
            format!("{} handler failed: {}", context, message),
        )));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Captures every event it sees.
    #[derive(Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<BridgeEvent>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<BridgeEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn count(&self, kind: EventKind) -> usize {
            self.events().iter().filter(|e| e.kind() == kind).count()
        }

        pub fn transitions(&self) -> Vec<(ConnectionState, ConnectionState)> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    BridgeEvent::Data {
                        event: NormalizedEvent::ConnectionTransition { previous, current },
                        ..
                    } => Some((previous, current)),
                    _ => None,
                })
                .collect()
        }

        pub fn errors(&self) -> Vec<ErrorEvent> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    BridgeEvent::Error(err) => Some(err),
                    _ => None,
                })
                .collect()
        }
    }

    impl BridgeObserver for RecordingObserver {
        fn on_event(&self, event: &BridgeEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    pub fn recording_hub() -> (Arc<EventHub>, Arc<RecordingObserver>) {
        let hub = Arc::new(EventHub::new());
        let recorder = Arc::new(RecordingObserver::default());
        hub.subscribe(EventFilter::All, recorder.clone());
        (hub, recorder)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::testing::*;
    use super::*;

    struct PanickingObserver;

    impl BridgeObserver for PanickingObserver {
        fn on_event(&self, _event: &BridgeEvent) {
            panic!("observer bug");
        }
    }

    fn warning(message: &str) -> BridgeEvent {
        BridgeEvent::Warning(ErrorEvent::new(ErrorKind::Unknown, message))
    }

    #[test]
    fn test_filter_by_kind() {
        let hub = EventHub::new();
        let recorder = Arc::new(RecordingObserver::default());
        hub.subscribe(EventFilter::kinds([EventKind::Warning]), recorder.clone());

        hub.publish(BridgeEvent::Status(StatusEvent::Warning {
            device: None,
            message: "ignored".into(),
        }));
        hub.publish(warning("kept"));

        assert_eq!(recorder.events().len(), 1);
        assert_eq!(recorder.count(EventKind::Warning), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let (hub, recorder) = recording_hub();
        let extra = Arc::new(RecordingObserver::default());
        let id = hub.subscribe(EventFilter::All, extra.clone());
        hub.publish(warning("one"));
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.publish(warning("two"));
        assert_eq!(recorder.events().len(), 2);
        assert_eq!(extra.events().len(), 1);
    }

    #[test]
    fn test_panicking_observer_is_contained() {
        let (hub, recorder) = recording_hub();
        hub.subscribe(EventFilter::All, Arc::new(PanickingObserver));
        hub.publish(warning("still delivered"));
        hub.publish(warning("again"));
        assert_eq!(recorder.events().len(), 2);
    }

    #[test]
    fn test_callback_boundary_reports_panic() {
        let (hub, recorder) = recording_hub();
        callback_boundary(&hub, "data", || panic!("bad packet"));
        let errors = recorder.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Unknown);
        assert!(errors[0].message.contains("bad packet"));
    }

    #[test]
    fn test_error_event_from_bridge_error() {
        let err = BridgeError::ScanningFailed(NativeError::NotInitialized);
        let event = ErrorEvent::from(&err);
        assert_eq!(event.kind, ErrorKind::ScanningFailed);
        assert_eq!(event.cause.as_deref(), Some("SDK not initialized"));
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let hub = EventHub::new();
        let (_id, mut rx) = hub.channel(EventFilter::All);
        hub.publish(warning("hello"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::Warning);
    }

    #[test]
    fn test_thread_dispatcher_preserves_order() {
        let dispatcher = Arc::new(ThreadDispatcher::new("test-dispatch").unwrap());
        let hub = EventHub::with_dispatcher(dispatcher.clone());
        let recorder = Arc::new(RecordingObserver::default());
        hub.subscribe(EventFilter::All, recorder.clone());

        for i in 0..10 {
            hub.publish(warning(&i.to_string()));
        }

        let (done_tx, done_rx) = std_mpsc::channel();
        dispatcher.dispatch(Box::new(move || {
            let _ = done_tx.send(());
        }));
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let messages: Vec<String> = recorder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::Warning(w) => Some(w.message),
                _ => None,
            })
            .collect();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(messages, expected);
    }

    #[test]
    fn test_thread_dispatcher_survives_panicking_job() {
        let dispatcher = ThreadDispatcher::new("test-panic").unwrap();
        let seen = Arc::new(Mutex::new(false));
        let (done_tx, done_rx) = std_mpsc::channel();
        dispatcher.dispatch(Box::new(|| panic!("job failed")));
        let flag = seen.clone();
        dispatcher.dispatch(Box::new(move || {
            *flag.lock().unwrap() = true;
            let _ = done_tx.send(());
        }));
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(*seen.lock().unwrap());
    }
}
