//! Device Session - connection lifecycle of one headband.
//!
//! A session drives the native SDK through the connect protocol (listener
//! setup, preset, transmission, channel registration), waits for the device
//! to report `Connected`, and tears everything down again on disconnect or
//! failure. State only changes in response to native reports or a forced
//! reset, and every change is published as a `ConnectionTransition`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, info, instrument, trace, warn};

use crate::device::DeviceDescriptor;
use crate::dispatch::{NormalizationSnapshot, Normalizer};
use crate::error::{BridgeError, ErrorKind};
use crate::events::{BridgeEvent, ErrorEvent, EventHub, NormalizedEvent, callback_boundary};
use crate::native::{ConnectionListener, DataListener, ErrorListener, MuseSdk, NativeError, RawPacket};
use crate::protocol::{PacketKind, Preset};
use crate::state::{ConnectionState, StateCell, Transition};
use crate::status::SessionStatus;

/// Configuration for a device session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Channel layout applied before connecting.
    pub preset: Preset,
    /// Data channels registered on connect.
    pub channels: Vec<PacketKind>,
    /// Safety-net state poll while waiting for `Connected`.
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    /// Pause after disconnecting a device that was not idle.
    pub settle_ms: u64,
    /// Pause between stopping transmission and unregistering listeners.
    pub transmission_settle_ms: u64,
    /// Enable transmission and register channels again once connected.
    /// Some SDK builds drop registrations made before the link is up.
    pub resubscribe_after_connect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preset: Preset::default(),
            channels: vec![
                PacketKind::Eeg,
                PacketKind::AlphaAbsolute,
                PacketKind::BetaAbsolute,
                PacketKind::DeltaAbsolute,
                PacketKind::ThetaAbsolute,
                PacketKind::GammaAbsolute,
                PacketKind::Artifacts,
                PacketKind::Battery,
            ],
            poll_interval_ms: 500,
            connect_timeout_ms: 15_000,
            disconnect_timeout_ms: 5_000,
            settle_ms: 500,
            transmission_settle_ms: 100,
            resubscribe_after_connect: true,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Result of a connect request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// Another connect is in flight; no native call was made.
    AlreadyConnecting,
    /// The device is already connected; no native call was made.
    AlreadyConnected,
}

/// How a disconnect request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The device confirmed `Disconnected`.
    Disconnected,
    /// Nothing to do, or another disconnect finished the job.
    AlreadyDisconnected,
    /// An in-flight connect was cancelled instead.
    CancelledConnect,
    /// Torn down without confirmation from the device.
    Forced(String),
}

/// Caller operation currently owning the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flight {
    Idle,
    Connecting,
    Disconnecting,
}

/// Reason an in-flight connect must stop waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    Fault(String),
}

/// Returns the session to `Idle` however the owning operation ends.
struct FlightGuard<'a>(&'a watch::Sender<Flight>);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(Flight::Idle);
    }
}

/// Session state shared with the native SDK as its listener.
struct SessionInner<S: MuseSdk + 'static> {
    descriptor: DeviceDescriptor,
    config: SessionConfig,
    state: StateCell,
    channels: Mutex<BTreeSet<PacketKind>>,
    flight: watch::Sender<Flight>,
    interrupt: watch::Sender<Option<Interrupt>>,
    /// Bumped when an SDK error asks the owner to reset the session.
    reset: watch::Sender<u64>,
    /// Set while no listeners are registered; late callbacks are dropped.
    torn_down: AtomicBool,
    hub: Arc<EventHub>,
    normalizer: Arc<Normalizer>,
    sdk: Weak<S>,
    runtime: Option<Handle>,
    this: Weak<Self>,
}

impl<S: MuseSdk + 'static> SessionInner<S> {
    fn address(&self) -> &str {
        &self.descriptor.address
    }

    fn publish_transition(&self, t: Transition) {
        self.hub.publish(BridgeEvent::Data {
            address: self.descriptor.address.clone(),
            event: NormalizedEvent::ConnectionTransition {
                previous: t.previous,
                current: t.current,
            },
        });
    }

    fn force_reset(&self) {
        self.state.force_reset(|t| self.publish_transition(t));
    }

    fn flight(&self) -> Flight {
        *self.flight.borrow()
    }

    fn try_claim(&self, next: Flight) -> bool {
        self.flight.send_if_modified(|f| {
            if *f == Flight::Idle {
                *f = next;
                true
            } else {
                false
            }
        })
    }

    fn channel_snapshot(&self) -> Vec<PacketKind> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    fn register_channels(self: &Arc<Self>, sdk: &S) -> Result<(), NativeError> {
        for kind in self.channel_snapshot() {
            let listener: Arc<dyn DataListener> = self.clone();
            sdk.register_data_listener(self.address(), kind, listener)?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(device = %self.descriptor.address))]
    async fn connect(self: &Arc<Self>, sdk: &S) -> Result<ConnectOutcome, BridgeError> {
        let mut flight_rx = self.flight.subscribe();
        loop {
            let flight = *flight_rx.borrow_and_update();
            match flight {
                Flight::Connecting => {
                    debug!("Connect already in flight");
                    return Ok(ConnectOutcome::AlreadyConnecting);
                }
                Flight::Disconnecting => {
                    debug!("Waiting for disconnect to finish");
                    let _ = flight_rx.wait_for(|f| *f == Flight::Idle).await;
                }
                Flight::Idle => {
                    if self.try_claim(Flight::Connecting) {
                        break;
                    }
                }
            }
        }
        let _guard = FlightGuard(&self.flight);

        if self.state.current() == ConnectionState::Connected {
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        self.interrupt.send_replace(None);
        self.torn_down.store(false, Ordering::Release);

        match self.run_connect(sdk).await {
            Ok(()) => {
                info!(name = %self.descriptor.name, "Connected");
                Ok(ConnectOutcome::Connected)
            }
            Err(e) => {
                self.fail_connect(sdk, &e);
                Err(e)
            }
        }
    }

    async fn run_connect(self: &Arc<Self>, sdk: &S) -> Result<(), BridgeError> {
        let address = self.address();
        let step = |name: &'static str| move |e: NativeError| BridgeError::connection_step(address, name, e);

        sdk.unregister_all_listeners(address)
            .map_err(step("unregister listeners"))?;
        let native = sdk.connection_state(address).map_err(step("query state"))?;
        if native != ConnectionState::Disconnected {
            debug!(state = %native, "Device not idle, disconnecting first");
            sdk.disconnect(address).map_err(step("disconnect stale link"))?;
            sleep(Duration::from_millis(self.config.settle_ms)).await;
        }

        let connection: Arc<dyn ConnectionListener> = self.clone();
        sdk.register_connection_listener(address, connection)
            .map_err(step("register connection listener"))?;
        let errors: Arc<dyn ErrorListener> = self.clone();
        sdk.register_error_listener(address, errors)
            .map_err(step("register error listener"))?;

        sdk.set_preset(address, self.config.preset)
            .map_err(step("apply preset"))?;
        sdk.set_data_transmission(address, true)
            .map_err(step("enable transmission"))?;
        self.register_channels(sdk)
            .map_err(step("register data listeners"))?;

        sdk.connect(address).map_err(step("connect"))?;
        self.await_connected(sdk).await?;

        if self.config.resubscribe_after_connect {
            sdk.set_data_transmission(address, true)
                .map_err(step("re-enable transmission"))?;
            self.register_channels(sdk)
                .map_err(step("re-register data listeners"))?;
        }
        Ok(())
    }

    /// Wait for the first `Connected` report, polling as a safety net.
    async fn await_connected(&self, sdk: &S) -> Result<(), BridgeError> {
        let address = self.address();
        let mut state_rx = self.state.subscribe();
        let mut interrupt_rx = self.interrupt.subscribe();
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let deadline = Instant::now() + Duration::from_millis(self.config.connect_timeout_ms);
        let mut seen_connecting = false;

        loop {
            let current = *state_rx.borrow_and_update();
            if current.is_blocked() {
                return Err(BridgeError::connection(
                    address,
                    format!("device reported {}", current),
                ));
            }
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => seen_connecting = true,
                ConnectionState::Disconnected if seen_connecting => {
                    return Err(BridgeError::connection(
                        address,
                        "device fell back to DISCONNECTED while connecting",
                    ));
                }
                _ => {}
            }

            let interrupt = interrupt_rx.borrow_and_update().clone();
            match interrupt {
                Some(Interrupt::Cancelled) => {
                    return Err(BridgeError::connection(address, "cancelled by disconnect request"));
                }
                Some(Interrupt::Fault(message)) => {
                    return Err(BridgeError::connection(address, message));
                }
                None => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::ConnectionTimeout {
                    address: address.to_string(),
                    timeout_ms: self.config.connect_timeout_ms,
                });
            }

            tokio::select! {
                _ = state_rx.changed() => {}
                _ = interrupt_rx.changed() => {}
                _ = sleep_until((now + poll).min(deadline)) => {
                    match sdk.connection_state(address) {
                        Ok(ConnectionState::Connected) => {
                            debug!("Poll observed CONNECTED before the callback");
                            let previous = self.state.current();
                            self.state.apply_reported(previous, ConnectionState::Connected, |t| {
                                self.publish_transition(t)
                            });
                            return Ok(());
                        }
                        Ok(state) => trace!(state = %state, "Poll"),
                        Err(e) => debug!(error = %e, "State poll failed"),
                    }
                }
            }
        }
    }

    /// Best-effort cleanup after a failed or cancelled connect.
    fn fail_connect(&self, sdk: &S, err: &BridgeError) {
        let address = self.address();
        warn!(device = %address, error = %err, "Connect failed, resetting");

        if let Err(e) = sdk.disconnect(address) {
            debug!(error = %e, "Best-effort disconnect failed");
        }
        if let Err(e) = sdk.set_data_transmission(address, false) {
            debug!(error = %e, "Best-effort transmission stop failed");
        }
        if let Err(e) = sdk.unregister_all_listeners(address) {
            debug!(error = %e, "Best-effort listener release failed");
        }
        self.torn_down.store(true, Ordering::Release);
        self.force_reset();

        let cancelled = matches!(*self.interrupt.borrow(), Some(Interrupt::Cancelled));
        let event = ErrorEvent::from(err);
        if cancelled {
            self.hub.publish(BridgeEvent::Warning(event));
        } else {
            self.hub.publish(BridgeEvent::Error(event));
        }
    }

    #[instrument(skip_all, fields(device = %self.descriptor.address))]
    async fn disconnect(self: &Arc<Self>, sdk: &S) -> Result<DisconnectOutcome, BridgeError> {
        let mut flight_rx = self.flight.subscribe();
        loop {
            let flight = *flight_rx.borrow_and_update();
            match flight {
                Flight::Connecting => {
                    info!("Cancelling in-flight connect");
                    self.interrupt.send_replace(Some(Interrupt::Cancelled));
                    let _ = flight_rx.wait_for(|f| *f == Flight::Idle).await;
                    return Ok(DisconnectOutcome::CancelledConnect);
                }
                Flight::Disconnecting => {
                    let _ = flight_rx.wait_for(|f| *f == Flight::Idle).await;
                    return Ok(DisconnectOutcome::AlreadyDisconnected);
                }
                Flight::Idle => {
                    if self.try_claim(Flight::Disconnecting) {
                        break;
                    }
                }
            }
        }
        let _guard = FlightGuard(&self.flight);
        let address = self.address();

        if self.state.current() == ConnectionState::Disconnected {
            if !self.torn_down.swap(true, Ordering::AcqRel) {
                // Link dropped on its own; release what is still registered.
                if let Err(e) = sdk.set_data_transmission(address, false) {
                    debug!(error = %e, "Transmission stop failed");
                }
                if let Err(e) = sdk.unregister_all_listeners(address) {
                    debug!(error = %e, "Listener release failed");
                }
            }
            return Ok(DisconnectOutcome::AlreadyDisconnected);
        }

        if let Err(e) = sdk.set_data_transmission(address, false) {
            warn!(error = %e, "Failed to stop transmission");
        }
        sleep(Duration::from_millis(self.config.transmission_settle_ms)).await;
        if let Err(e) = sdk.unregister_all_listeners(address) {
            warn!(error = %e, "Failed to unregister listeners");
        }
        let connection: Arc<dyn ConnectionListener> = self.clone();
        if let Err(e) = sdk.register_connection_listener(address, connection) {
            warn!(error = %e, "Failed to re-register connection listener");
        }

        let mut state_rx = self.state.subscribe();
        let outcome = match sdk.disconnect(address) {
            Ok(()) => {
                let limit = Duration::from_millis(self.config.disconnect_timeout_ms);
                let reached = matches!(
                    timeout(limit, state_rx.wait_for(|s| *s == ConnectionState::Disconnected)).await,
                    Ok(Ok(_))
                );
                if reached {
                    DisconnectOutcome::Disconnected
                } else {
                    warn!(
                        timeout_ms = self.config.disconnect_timeout_ms,
                        "Device did not report DISCONNECTED in time"
                    );
                    DisconnectOutcome::Forced(format!(
                        "{} did not confirm disconnect within {}ms",
                        self.descriptor.name, self.config.disconnect_timeout_ms
                    ))
                }
            }
            Err(e) => {
                warn!(error = %e, "Native disconnect failed");
                self.hub.publish(BridgeEvent::Warning(ErrorEvent::from(&e)));
                DisconnectOutcome::Forced(format!("native disconnect failed: {}", e))
            }
        };

        self.teardown(sdk);
        info!("Disconnected");
        Ok(outcome)
    }

    fn teardown(&self, sdk: &S) {
        if let Err(e) = sdk.unregister_all_listeners(self.address()) {
            debug!(error = %e, "Listener release failed during teardown");
        }
        self.torn_down.store(true, Ordering::Release);
        self.force_reset();
    }

    /// Reset a connected session after an asynchronous vendor error.
    ///
    /// An owner watching [`DeviceSession::subscribe_reset`] runs the reset
    /// itself; otherwise the session disconnects on its own.
    fn schedule_reset(&self) {
        if self.reset.receiver_count() > 0 {
            debug!(device = %self.address(), "Reset handed to owner");
            self.reset.send_modify(|n| *n = n.wrapping_add(1));
            return;
        }
        let (Some(runtime), Some(this)) = (self.runtime.as_ref(), self.this.upgrade()) else {
            warn!(device = %self.address(), "No runtime available, reset skipped");
            return;
        };
        runtime.spawn(async move {
            let Some(sdk) = this.sdk.upgrade() else {
                return;
            };
            if let Err(e) = this.disconnect(&sdk).await {
                debug!(error = %e, "Reset after error failed");
            }
        });
    }
}

impl<S: MuseSdk + 'static> ConnectionListener for SessionInner<S> {
    fn on_connection_changed(&self, previous: ConnectionState, current: ConnectionState) {
        callback_boundary(&self.hub, "connection", || {
            if self.torn_down.load(Ordering::Acquire) {
                trace!(device = %self.address(), from = %previous, to = %current, "Late transition ignored");
                return;
            }
            let before = self.state.current();
            self.state
                .apply_reported(previous, current, |t| self.publish_transition(t));

            if before == ConnectionState::Connected
                && current == ConnectionState::Disconnected
                && self.flight() == Flight::Idle
            {
                let err = BridgeError::DeviceDisconnected(self.descriptor.name.clone());
                self.hub.publish(BridgeEvent::Error(ErrorEvent::from(&err)));
            }
        });
    }
}

impl<S: MuseSdk + 'static> ErrorListener for SessionInner<S> {
    fn on_error(&self, error: NativeError) {
        callback_boundary(&self.hub, "error", || {
            if self.torn_down.load(Ordering::Acquire) {
                trace!(device = %self.address(), error = %error, "Late error ignored");
                return;
            }
            warn!(device = %self.address(), error = %error, "SDK reported error");
            match self.flight() {
                Flight::Connecting => {
                    self.interrupt
                        .send_replace(Some(Interrupt::Fault(error.to_string())));
                }
                Flight::Disconnecting => {}
                Flight::Idle => {
                    let mut event = ErrorEvent::from(&error);
                    event.kind = ErrorKind::ConnectionFailed;
                    self.hub.publish(BridgeEvent::Error(event));
                    if self.state.current() != ConnectionState::Disconnected {
                        self.schedule_reset();
                    }
                }
            }
        });
    }
}

impl<S: MuseSdk + 'static> DataListener for SessionInner<S> {
    fn on_packet(&self, packet: RawPacket) {
        callback_boundary(&self.hub, "data", || {
            if self.torn_down.load(Ordering::Acquire) {
                return;
            }
            let subscribed = self
                .channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&packet.kind);
            if !subscribed {
                trace!(kind = %packet.kind, "Packet for unsubscribed channel dropped");
                return;
            }
            if let Some(event) = self.normalizer.normalize(&packet) {
                self.hub.publish(BridgeEvent::Data {
                    address: packet.source,
                    event,
                });
            }
        });
    }
}

/// One headband's connection, driven over a [`MuseSdk`].
pub struct DeviceSession<S: MuseSdk + 'static> {
    sdk: Arc<S>,
    inner: Arc<SessionInner<S>>,
}

impl<S: MuseSdk + 'static> DeviceSession<S> {
    pub fn new(
        sdk: Arc<S>,
        descriptor: DeviceDescriptor,
        config: SessionConfig,
        hub: Arc<EventHub>,
    ) -> Self {
        Self::with_normalizer(sdk, descriptor, config, hub, Arc::new(Normalizer::new()))
    }

    /// Create a session that shares repair counters with its owner.
    pub fn with_normalizer(
        sdk: Arc<S>,
        descriptor: DeviceDescriptor,
        config: SessionConfig,
        hub: Arc<EventHub>,
        normalizer: Arc<Normalizer>,
    ) -> Self {
        let (flight, _) = watch::channel(Flight::Idle);
        let (interrupt, _) = watch::channel(None);
        let (reset, _) = watch::channel(0);
        let channels = config.channels.iter().copied().collect();
        let inner = Arc::new_cyclic(|this| SessionInner {
            descriptor,
            config,
            state: StateCell::new(),
            channels: Mutex::new(channels),
            flight,
            interrupt,
            reset,
            torn_down: AtomicBool::new(true),
            hub,
            normalizer,
            sdk: Arc::downgrade(&sdk),
            runtime: Handle::try_current().ok(),
            this: this.clone(),
        });
        Self { sdk, inner }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.descriptor
    }

    pub fn address(&self) -> &str {
        self.inner.address()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Watch channel that follows every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Changes each time an SDK error asks for the session to be reset.
    ///
    /// While any receiver is alive the session leaves the reset to its owner,
    /// which is expected to call [`DeviceSession::disconnect`].
    pub fn subscribe_reset(&self) -> watch::Receiver<u64> {
        self.inner.reset.subscribe()
    }

    /// A connect or disconnect is in progress.
    pub fn is_busy(&self) -> bool {
        self.inner.flight() != Flight::Idle
    }

    pub fn channels(&self) -> Vec<PacketKind> {
        self.inner.channel_snapshot()
    }

    pub fn normalization_stats(&self) -> NormalizationSnapshot {
        self.inner.normalizer.stats()
    }

    /// Run the connect protocol until the device reports `Connected`.
    pub async fn connect(&self) -> Result<ConnectOutcome, BridgeError> {
        self.inner.connect(&self.sdk).await
    }

    /// Run the disconnect protocol. Cancels an in-flight connect.
    pub async fn disconnect(&self) -> Result<DisconnectOutcome, BridgeError> {
        self.inner.disconnect(&self.sdk).await
    }

    /// Start delivering events for `kind`.
    pub fn subscribe_channel(&self, kind: PacketKind) -> Result<(), BridgeError> {
        let added = self
            .inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind);
        if added && !self.inner.torn_down.load(Ordering::Acquire) {
            let listener: Arc<dyn DataListener> = self.inner.clone();
            self.sdk
                .register_data_listener(self.address(), kind, listener)?;
        }
        Ok(())
    }

    /// Stop delivering events for `kind`. Packets already in flight are dropped.
    pub fn unsubscribe_channel(&self, kind: PacketKind) -> Result<(), BridgeError> {
        let removed = self
            .inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind);
        if removed && !self.inner.torn_down.load(Ordering::Acquire) {
            self.sdk.unregister_data_listener(self.address(), kind)?;
        }
        Ok(())
    }
}

impl<S: MuseSdk + 'static> SessionStatus for DeviceSession<S> {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.descriptor
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }
}
