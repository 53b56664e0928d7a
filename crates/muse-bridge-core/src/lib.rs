//! Muse-Bridge-Core: connection lifecycle and event demultiplexing for Muse
//! EEG headbands over the vendor's native SDK.
//!
//! The vendor library is loaded at runtime and driven through the [`MuseSdk`]
//! trait, so everything above it runs unchanged against [`MockSdk`].
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Vendor constants, packet kinds, presets, result codes
//! - **Native**: SDK abstraction (libloading adapter, mock)
//! - **State**: Connection states and the per-device state cell
//! - **Session**: Connect/disconnect protocol for one headband
//! - **Dispatch**: Raw packet normalization
//! - **Events**: Event hub, observers and dispatchers
//! - **Status**: Connection summary and the lifecycle log
//! - **Manager**: Discovery, the current session and reconnects
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use muse_bridge_core::{DeviceManager, NativeSdk};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let sdk = Arc::new(NativeSdk::load("libmuse_sdk.so")?);
//! let manager = DeviceManager::builder(sdk).build()?;
//!
//! manager.start_scanning().await?;
//! manager.refresh_devices();
//! if let Some(device) = manager.find_device("Muse-1A2B") {
//!     manager.connect_to_device(&device).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod manager;
pub mod native;
pub mod protocol;
pub mod session;
pub mod state;
pub mod status;

// Re-exports for convenience
pub use device::{DeviceDescriptor, DeviceFamily};
pub use dispatch::{NormalizationSnapshot, Normalizer};
pub use error::{BridgeError, ErrorKind};
pub use events::{
    BridgeEvent, BridgeObserver, ChannelObserver, ErrorEvent, EventFilter, EventHub, EventKind,
    NormalizedEvent, NullObserver, StatusEvent, ThreadDispatcher, TracingObserver,
};
pub use manager::{AlwaysGranted, BridgeConfig, DeviceManager, Permission, PermissionProvider};
pub use native::{MockSdk, MuseSdk, NativeError, NativeSdk, RawPacket};
pub use protocol::{PacketKind, Preset, VendorCode};
pub use session::{ConnectOutcome, DeviceSession, DisconnectOutcome, SessionConfig};
pub use state::ConnectionState;
pub use status::{ConnectionLogEntry, StatusAggregator};
