//! Native SDK code tables.

pub mod codes;
pub mod constants;
pub mod packets;

pub use codes::VendorCode;
pub use packets::{DomainKind, PacketKind, Preset, WaveKind};
