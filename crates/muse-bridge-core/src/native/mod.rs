//! Native SDK adapter.

pub mod library;
pub mod mock;
pub mod records;
pub mod traits;

pub use library::NativeSdk;
pub use mock::{ConnectBehavior, DisconnectBehavior, MockSdk, SdkCall};
pub use traits::{
    ConnectionListener, DataListener, DiscoveryListener, ErrorListener, MuseSdk, NativeError,
    RawPacket,
};
