//! Constants shared with the vendor C ABI.
//!
//! Integer values follow the vendor headers: enums are passed across the
//! boundary as their ordinal `int`.

pub const MAX_ERR_MSG: usize = 512;
pub const INITIAL_DEVICE_LIST_LEN: usize = 1024;
/// Upper bound on "buffer too small" growth steps for one device-list read.
pub const MAX_DEVICE_LIST_GROWTHS: usize = 4;
/// Number of `f64` values carried by every data callback.
pub const PAYLOAD_LEN: usize = 6;

// Return codes
pub const SDK_OK: i32 = 0;
pub const SDK_ERR_FAILURE: i32 = -1;
pub const SDK_ERR_TIMEOUT: i32 = -2;
pub const SDK_ERR_OVERLOADED: i32 = -3;
pub const SDK_ERR_UNIMPLEMENTED: i32 = -4;

// Connection states
pub const CONNECTION_UNKNOWN: i32 = 0;
pub const CONNECTION_CONNECTED: i32 = 1;
pub const CONNECTION_CONNECTING: i32 = 2;
pub const CONNECTION_DISCONNECTED: i32 = 3;
pub const CONNECTION_NEEDS_UPDATE: i32 = 4;
pub const CONNECTION_NEEDS_LICENSE: i32 = 5;

// Data packet types
pub const PACKET_ACCELEROMETER: i32 = 0;
pub const PACKET_GYRO: i32 = 1;
pub const PACKET_EEG: i32 = 2;
pub const PACKET_QUANTIZATION: i32 = 3;
pub const PACKET_BATTERY: i32 = 4;
pub const PACKET_DRL_REF: i32 = 5;
pub const PACKET_ALPHA_ABSOLUTE: i32 = 6;
pub const PACKET_BETA_ABSOLUTE: i32 = 7;
pub const PACKET_DELTA_ABSOLUTE: i32 = 8;
pub const PACKET_THETA_ABSOLUTE: i32 = 9;
pub const PACKET_GAMMA_ABSOLUTE: i32 = 10;
pub const PACKET_ALPHA_RELATIVE: i32 = 11;
pub const PACKET_BETA_RELATIVE: i32 = 12;
pub const PACKET_DELTA_RELATIVE: i32 = 13;
pub const PACKET_THETA_RELATIVE: i32 = 14;
pub const PACKET_GAMMA_RELATIVE: i32 = 15;
pub const PACKET_ALPHA_SCORE: i32 = 16;
pub const PACKET_BETA_SCORE: i32 = 17;
pub const PACKET_DELTA_SCORE: i32 = 18;
pub const PACKET_THETA_SCORE: i32 = 19;
pub const PACKET_GAMMA_SCORE: i32 = 20;
pub const PACKET_IS_GOOD: i32 = 21;
pub const PACKET_HSI: i32 = 22;
pub const PACKET_HSI_PRECISION: i32 = 23;
pub const PACKET_ARTIFACTS: i32 = 24;

// Presets
pub const PRESET_20: i32 = 0;
pub const PRESET_21: i32 = 1;
pub const PRESET_22: i32 = 2;
pub const PRESET_23: i32 = 3;
pub const PRESET_50: i32 = 6;
pub const PRESET_51: i32 = 7;
pub const PRESET_52: i32 = 8;
pub const PRESET_53: i32 = 9;

// Hardware models
pub const MODEL_MU_01: u8 = 0; // Muse (2014)
pub const MODEL_MU_02: u8 = 1; // Muse (2016)
pub const MODEL_MU_03: u8 = 2; // Muse 2
pub const MODEL_MU_04: u8 = 3; // Muse S
