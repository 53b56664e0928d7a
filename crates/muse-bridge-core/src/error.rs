//! Bridge error taxonomy.

use std::fmt;

use thiserror::Error;

use crate::native::NativeError;

/// Coarse error category reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionFailed,
    ScanningFailed,
    DeviceDisconnected,
    PermissionDenied,
    BluetoothNotEnabled,
    DeviceNotSupported,
    NativeLibraryError,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ConnectionFailed => write!(f, "Connection Failed"),
            ErrorKind::ScanningFailed => write!(f, "Scanning Failed"),
            ErrorKind::DeviceDisconnected => write!(f, "Device Disconnected"),
            ErrorKind::PermissionDenied => write!(f, "Permission Denied"),
            ErrorKind::BluetoothNotEnabled => write!(f, "Bluetooth Not Enabled"),
            ErrorKind::DeviceNotSupported => write!(f, "Device Not Supported"),
            ErrorKind::NativeLibraryError => write!(f, "Native Library Error"),
            ErrorKind::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Errors returned by caller-initiated bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("connection to {address} failed: {message}")]
    ConnectionFailed {
        address: String,
        message: String,
        #[source]
        cause: Option<NativeError>,
    },

    /// The device never reported `Connected` before the deadline.
    #[error("connection to {address} timed out after {timeout_ms}ms")]
    ConnectionTimeout { address: String, timeout_ms: u64 },

    #[error("scanning failed: {0}")]
    ScanningFailed(#[source] NativeError),

    #[error("device {0} disconnected")]
    DeviceDisconnected(String),

    #[error("Bluetooth permission denied")]
    PermissionDenied,

    #[error("Bluetooth is not enabled")]
    BluetoothNotEnabled,

    #[error(transparent)]
    Native(#[from] NativeError),
}

impl BridgeError {
    pub(crate) fn connection(address: &str, message: impl Into<String>) -> Self {
        BridgeError::ConnectionFailed {
            address: address.to_string(),
            message: message.into(),
            cause: None,
        }
    }

    pub(crate) fn connection_step(address: &str, step: &str, cause: NativeError) -> Self {
        BridgeError::ConnectionFailed {
            address: address.to_string(),
            message: format!("{step}: {cause}"),
            cause: Some(cause),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::ConnectionFailed { .. } | BridgeError::ConnectionTimeout { .. } => {
                ErrorKind::ConnectionFailed
            }
            BridgeError::ScanningFailed(_) => ErrorKind::ScanningFailed,
            BridgeError::DeviceDisconnected(_) => ErrorKind::DeviceDisconnected,
            BridgeError::PermissionDenied => ErrorKind::PermissionDenied,
            BridgeError::BluetoothNotEnabled => ErrorKind::BluetoothNotEnabled,
            BridgeError::Native(e) => e.kind(),
        }
    }

    /// Human-readable recovery hint.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            BridgeError::ConnectionFailed { cause: Some(e), .. } => e.hint(),
            BridgeError::ConnectionFailed { cause: None, .. } => None,
            BridgeError::ConnectionTimeout { .. } => {
                Some("Make sure the headband is on, charged and within range, then retry.")
            }
            BridgeError::ScanningFailed(e) | BridgeError::Native(e) => e.hint(),
            BridgeError::DeviceDisconnected(_) => Some("Check the headband battery and range."),
            BridgeError::PermissionDenied => {
                Some("Grant Bluetooth access to this application in the system settings.")
            }
            BridgeError::BluetoothNotEnabled => Some("Turn Bluetooth on and scan again."),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::ConnectionTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VendorCode;

    #[test]
    fn test_timeout_folds_into_connection_failed() {
        let err = BridgeError::ConnectionTimeout {
            address: "00:55:DA:B0:0B:61".into(),
            timeout_ms: 15000,
        };
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "connection to 00:55:DA:B0:0B:61 timed out after 15000ms"
        );
    }

    #[test]
    fn test_native_kind_passthrough() {
        let err = BridgeError::from(NativeError::Vendor {
            operation: "connect",
            code: VendorCode::Unimplemented,
            message: "nope".into(),
        });
        assert_eq!(err.kind(), ErrorKind::DeviceNotSupported);
        assert!(err.hint().is_some());
    }

    #[test]
    fn test_scanning_failed_kind() {
        let err = BridgeError::ScanningFailed(NativeError::Vendor {
            operation: "start_scanning",
            code: VendorCode::Failure,
            message: "radio off".into(),
        });
        assert_eq!(err.kind(), ErrorKind::ScanningFailed);
    }
}
