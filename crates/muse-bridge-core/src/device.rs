//! Discovered device descriptors.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::constants::*;

/// Headband hardware generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceFamily {
    Muse2014,
    Muse2016,
    Muse2,
    MuseS,
    Unknown,
}

impl DeviceFamily {
    pub fn from_model(model: u8) -> Self {
        match model {
            MODEL_MU_01 => DeviceFamily::Muse2014,
            MODEL_MU_02 => DeviceFamily::Muse2016,
            MODEL_MU_03 => DeviceFamily::Muse2,
            MODEL_MU_04 => DeviceFamily::MuseS,
            _ => DeviceFamily::Unknown,
        }
    }

    pub fn model(self) -> u8 {
        match self {
            DeviceFamily::Muse2014 => MODEL_MU_01,
            DeviceFamily::Muse2016 => MODEL_MU_02,
            DeviceFamily::Muse2 => MODEL_MU_03,
            DeviceFamily::MuseS => MODEL_MU_04,
            DeviceFamily::Unknown => u8::MAX,
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFamily::Muse2014 => write!(f, "Muse (2014)"),
            DeviceFamily::Muse2016 => write!(f, "Muse (2016)"),
            DeviceFamily::Muse2 => write!(f, "Muse 2"),
            DeviceFamily::MuseS => write!(f, "Muse S"),
            DeviceFamily::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Immutable snapshot of one advertised headband. Identity is the address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub address: String,
    /// Signal strength in dBm.
    pub rssi: f64,
    pub family: DeviceFamily,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>, rssi: f64) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            rssi,
            family: DeviceFamily::Unknown,
        }
    }

    pub fn with_family(mut self, family: DeviceFamily) -> Self {
        self.family = family;
        self
    }

    /// Both name and address are present.
    pub fn is_complete(&self) -> bool {
        !self.name.trim().is_empty() && !self.address.trim().is_empty()
    }

    /// Case-insensitive match on name or address.
    pub fn matches(&self, name_or_address: &str) -> bool {
        self.address.eq_ignore_ascii_case(name_or_address)
            || self.name.eq_ignore_ascii_case(name_or_address)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {} {:.0} dBm",
            self.name, self.address, self.family, self.rssi
        )
    }
}

/// Drop incomplete entries and keep the first descriptor per address.
pub fn dedupe_descriptors(devices: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|d| d.is_complete())
        .filter(|d| seen.insert(d.address.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_keeps_first_per_address() {
        let devices = vec![
            DeviceDescriptor::new("A", "mac1", -40.0),
            DeviceDescriptor::new("A", "mac1", -55.0),
        ];
        let out = dedupe_descriptors(devices);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].address, "mac1");
        assert_eq!(out[0].rssi, -40.0);
    }

    #[test]
    fn test_dedupe_drops_partial_entries() {
        let devices = vec![
            DeviceDescriptor::new("", "mac1", -40.0),
            DeviceDescriptor::new("Muse-1234", "", -41.0),
            DeviceDescriptor::new("Muse-5678", "mac2", -42.0),
            DeviceDescriptor::new("   ", "mac3", -43.0),
        ];
        let out = dedupe_descriptors(devices);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "Muse-5678");
    }

    #[test]
    fn test_family_from_model() {
        assert_eq!(DeviceFamily::from_model(2), DeviceFamily::Muse2);
        assert_eq!(DeviceFamily::from_model(3), DeviceFamily::MuseS);
        assert_eq!(DeviceFamily::from_model(42), DeviceFamily::Unknown);
        assert_eq!(DeviceFamily::from_model(DeviceFamily::Muse2016.model()), DeviceFamily::Muse2016);
    }

    #[test]
    fn test_matches_name_or_address() {
        let d = DeviceDescriptor::new("Muse-1A2B", "00:55:DA:B0:0B:61", -60.0);
        assert!(d.matches("muse-1a2b"));
        assert!(d.matches("00:55:da:b0:0b:61"));
        assert!(!d.matches("Muse-0000"));
    }
}
