//! Native SDK abstraction.
//!
//! Defines the `MuseSdk` trait for talking to the vendor library,
//! allowing different implementations (dynamic library, mock).

use std::sync::Arc;

use thiserror::Error;

use crate::device::DeviceDescriptor;
use crate::error::ErrorKind;
use crate::protocol::constants::PAYLOAD_LEN;
use crate::protocol::{PacketKind, Preset, VendorCode};
use crate::state::ConnectionState;

#[derive(Error, Debug, Clone)]
pub enum NativeError {
    #[error("Failed to load SDK library {path}: {message}")]
    LibraryLoad { path: String, message: String },

    #[error("SDK symbol not found: {0}")]
    MissingSymbol(String),

    #[error("SDK initialization failed: {message}")]
    InitFailed { message: String },

    #[error("{operation} failed ({code}): {message}")]
    Vendor {
        operation: &'static str,
        code: VendorCode,
        message: String,
    },

    #[error("SDK not initialized")]
    NotInitialized,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Malformed device list: {0}")]
    MalformedDeviceList(String),
}

impl NativeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NativeError::Vendor { code, .. } => code.kind(),
            NativeError::LibraryLoad { .. }
            | NativeError::MissingSymbol(_)
            | NativeError::InitFailed { .. }
            | NativeError::NotInitialized
            | NativeError::MalformedDeviceList(_) => ErrorKind::NativeLibraryError,
            NativeError::InvalidArgument(_) => ErrorKind::Unknown,
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            NativeError::Vendor { code, .. } => Some(code.hint()),
            NativeError::LibraryLoad { .. } | NativeError::MissingSymbol(_) => {
                Some("Check that the Muse SDK library is installed and matches this build.")
            }
            NativeError::InitFailed { .. } | NativeError::NotInitialized => {
                Some("Restart the application to reinitialize the SDK.")
            }
            NativeError::InvalidArgument(_) | NativeError::MalformedDeviceList(_) => None,
        }
    }
}

/// One data callback, copied out of native memory.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    pub kind: PacketKind,
    pub values: [f64; PAYLOAD_LEN],
    /// Microseconds since the Unix epoch, as reported by the device.
    pub timestamp_us: i64,
    /// Address of the emitting device.
    pub source: String,
}

/// Receives connection state transitions for one device.
pub trait ConnectionListener: Send + Sync {
    fn on_connection_changed(&self, previous: ConnectionState, current: ConnectionState);
}

/// Receives data packets of one kind for one device.
pub trait DataListener: Send + Sync {
    fn on_packet(&self, packet: RawPacket);
}

/// Receives asynchronous vendor errors for one device.
pub trait ErrorListener: Send + Sync {
    fn on_error(&self, error: NativeError);
}

/// Notified whenever the discovered device list changes.
pub trait DiscoveryListener: Send + Sync {
    fn on_device_list_changed(&self);
}

/// Abstract vendor SDK interface.
///
/// Devices are identified by their hardware address. Calls that start an
/// asynchronous native operation (`connect`, `disconnect`) return once the
/// request is accepted; completion arrives through a [`ConnectionListener`].
///
/// Implementations own every listener handed to them until it is
/// unregistered or replaced.
pub trait MuseSdk: Send + Sync {
    /// Load and initialize the vendor library. Idempotent.
    fn initialize(&self) -> Result<(), NativeError>;

    /// Install or clear the device-list-changed hook.
    fn set_discovery_listener(
        &self,
        listener: Option<Arc<dyn DiscoveryListener>>,
    ) -> Result<(), NativeError>;

    fn start_scanning(&self) -> Result<(), NativeError>;

    fn stop_scanning(&self) -> Result<(), NativeError>;

    /// Snapshot of every device the SDK currently knows about.
    fn discovered_devices(&self) -> Result<Vec<DeviceDescriptor>, NativeError>;

    fn connect(&self, address: &str) -> Result<(), NativeError>;

    fn disconnect(&self, address: &str) -> Result<(), NativeError>;

    fn set_preset(&self, address: &str, preset: Preset) -> Result<(), NativeError>;

    fn set_data_transmission(&self, address: &str, enabled: bool) -> Result<(), NativeError>;

    fn register_connection_listener(
        &self,
        address: &str,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<(), NativeError>;

    fn unregister_connection_listener(&self, address: &str) -> Result<(), NativeError>;

    fn register_error_listener(
        &self,
        address: &str,
        listener: Arc<dyn ErrorListener>,
    ) -> Result<(), NativeError>;

    fn unregister_error_listener(&self, address: &str) -> Result<(), NativeError>;

    fn register_data_listener(
        &self,
        address: &str,
        kind: PacketKind,
        listener: Arc<dyn DataListener>,
    ) -> Result<(), NativeError>;

    /// Unregistering a pair that was never registered is a no-op.
    fn unregister_data_listener(&self, address: &str, kind: PacketKind)
    -> Result<(), NativeError>;

    /// Drop every listener registered for `address`.
    fn unregister_all_listeners(&self, address: &str) -> Result<(), NativeError>;

    /// Synchronous state poll.
    fn connection_state(&self, address: &str) -> Result<ConnectionState, NativeError>;
}
