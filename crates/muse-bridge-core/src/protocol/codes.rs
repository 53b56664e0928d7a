//! Vendor return-code parsing.
//!
//! Native calls return `0` on success and a negative vendor code on failure.
//! This module maps those codes onto the bridge error taxonomy and attaches a
//! recovery hint for the user.

use std::fmt;

use super::constants::*;
use crate::error::ErrorKind;

/// Vendor error code returned by a failed native call or error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorCode {
    Failure,
    Timeout,
    Overloaded,
    Unimplemented,
    Unrecognized(i32),
}

impl VendorCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            SDK_ERR_FAILURE => VendorCode::Failure,
            SDK_ERR_TIMEOUT => VendorCode::Timeout,
            SDK_ERR_OVERLOADED => VendorCode::Overloaded,
            SDK_ERR_UNIMPLEMENTED => VendorCode::Unimplemented,
            other => VendorCode::Unrecognized(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            VendorCode::Failure => SDK_ERR_FAILURE,
            VendorCode::Timeout => SDK_ERR_TIMEOUT,
            VendorCode::Overloaded => SDK_ERR_OVERLOADED,
            VendorCode::Unimplemented => SDK_ERR_UNIMPLEMENTED,
            VendorCode::Unrecognized(code) => code,
        }
    }

    pub fn kind(self) -> ErrorKind {
        match self {
            VendorCode::Failure | VendorCode::Timeout => ErrorKind::ConnectionFailed,
            VendorCode::Overloaded => ErrorKind::NativeLibraryError,
            VendorCode::Unimplemented => ErrorKind::DeviceNotSupported,
            VendorCode::Unrecognized(_) => ErrorKind::Unknown,
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            VendorCode::Failure => "Power-cycle the headband and make sure it is charged.",
            VendorCode::Timeout => {
                "Move the headband closer to the computer and check that it is switched on."
            }
            VendorCode::Overloaded => {
                "The SDK is busy; subscribe to fewer data channels or retry later."
            }
            VendorCode::Unimplemented => {
                "This headband firmware does not support the requested operation."
            }
            VendorCode::Unrecognized(_) => "Restart the application; if it persists, update the SDK.",
        }
    }
}

impl fmt::Display for VendorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VendorCode::Failure => write!(f, "FAILURE"),
            VendorCode::Timeout => write!(f, "TIMEOUT"),
            VendorCode::Overloaded => write!(f, "OVERLOADED"),
            VendorCode::Unimplemented => write!(f, "UNIMPLEMENTED"),
            VendorCode::Unrecognized(code) => write!(f, "UNRECOGNIZED({})", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_code_mapping() {
        assert_eq!(VendorCode::from_code(-1), VendorCode::Failure);
        assert_eq!(VendorCode::from_code(-2).kind(), ErrorKind::ConnectionFailed);
        assert_eq!(VendorCode::from_code(-3).kind(), ErrorKind::NativeLibraryError);
        assert_eq!(VendorCode::from_code(-4).kind(), ErrorKind::DeviceNotSupported);
    }

    #[test]
    fn test_unrecognized_code() {
        let code = VendorCode::from_code(-77);
        assert_eq!(code, VendorCode::Unrecognized(-77));
        assert_eq!(code.kind(), ErrorKind::Unknown);
        assert_eq!(code.code(), -77);
        assert_eq!(code.to_string(), "UNRECOGNIZED(-77)");
    }
}
