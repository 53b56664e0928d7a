//! Packet kinds, wave kinds and presets.
//!
//! The vendor SDK identifies data streams by an integer packet type. Every
//! type it can emit is listed in [`PacketKind`]; the mapping into domain
//! events is an exhaustive `match` so a new kind cannot fall through silently.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::constants::*;

/// Every data packet type the vendor SDK can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Accelerometer,
    Gyro,
    Eeg,
    Quantization,
    Battery,
    DrlRef,
    AlphaAbsolute,
    BetaAbsolute,
    DeltaAbsolute,
    ThetaAbsolute,
    GammaAbsolute,
    AlphaRelative,
    BetaRelative,
    DeltaRelative,
    ThetaRelative,
    GammaRelative,
    AlphaScore,
    BetaScore,
    DeltaScore,
    ThetaScore,
    GammaScore,
    IsGood,
    Hsi,
    HsiPrecision,
    Artifacts,
}

/// Domain category a packet kind normalizes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainKind {
    Wave(WaveKind),
    Artifact,
    Battery,
}

impl PacketKind {
    pub const ALL: [PacketKind; 25] = [
        PacketKind::Accelerometer,
        PacketKind::Gyro,
        PacketKind::Eeg,
        PacketKind::Quantization,
        PacketKind::Battery,
        PacketKind::DrlRef,
        PacketKind::AlphaAbsolute,
        PacketKind::BetaAbsolute,
        PacketKind::DeltaAbsolute,
        PacketKind::ThetaAbsolute,
        PacketKind::GammaAbsolute,
        PacketKind::AlphaRelative,
        PacketKind::BetaRelative,
        PacketKind::DeltaRelative,
        PacketKind::ThetaRelative,
        PacketKind::GammaRelative,
        PacketKind::AlphaScore,
        PacketKind::BetaScore,
        PacketKind::DeltaScore,
        PacketKind::ThetaScore,
        PacketKind::GammaScore,
        PacketKind::IsGood,
        PacketKind::Hsi,
        PacketKind::HsiPrecision,
        PacketKind::Artifacts,
    ];

    /// Native packet type code.
    pub const fn code(self) -> i32 {
        match self {
            PacketKind::Accelerometer => PACKET_ACCELEROMETER,
            PacketKind::Gyro => PACKET_GYRO,
            PacketKind::Eeg => PACKET_EEG,
            PacketKind::Quantization => PACKET_QUANTIZATION,
            PacketKind::Battery => PACKET_BATTERY,
            PacketKind::DrlRef => PACKET_DRL_REF,
            PacketKind::AlphaAbsolute => PACKET_ALPHA_ABSOLUTE,
            PacketKind::BetaAbsolute => PACKET_BETA_ABSOLUTE,
            PacketKind::DeltaAbsolute => PACKET_DELTA_ABSOLUTE,
            PacketKind::ThetaAbsolute => PACKET_THETA_ABSOLUTE,
            PacketKind::GammaAbsolute => PACKET_GAMMA_ABSOLUTE,
            PacketKind::AlphaRelative => PACKET_ALPHA_RELATIVE,
            PacketKind::BetaRelative => PACKET_BETA_RELATIVE,
            PacketKind::DeltaRelative => PACKET_DELTA_RELATIVE,
            PacketKind::ThetaRelative => PACKET_THETA_RELATIVE,
            PacketKind::GammaRelative => PACKET_GAMMA_RELATIVE,
            PacketKind::AlphaScore => PACKET_ALPHA_SCORE,
            PacketKind::BetaScore => PACKET_BETA_SCORE,
            PacketKind::DeltaScore => PACKET_DELTA_SCORE,
            PacketKind::ThetaScore => PACKET_THETA_SCORE,
            PacketKind::GammaScore => PACKET_GAMMA_SCORE,
            PacketKind::IsGood => PACKET_IS_GOOD,
            PacketKind::Hsi => PACKET_HSI,
            PacketKind::HsiPrecision => PACKET_HSI_PRECISION,
            PacketKind::Artifacts => PACKET_ARTIFACTS,
        }
    }

    /// Parse a native packet type code. Unknown codes yield `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.code() == code)
    }

    /// Number of meaningful values in the payload for this kind.
    pub const fn channel_count(self) -> usize {
        match self {
            PacketKind::Eeg => 6,
            PacketKind::Accelerometer | PacketKind::Gyro => 3,
            PacketKind::Battery | PacketKind::Artifacts => 3,
            PacketKind::DrlRef => 2,
            _ => 4,
        }
    }

    /// Domain category, or `None` for kinds this bridge does not publish.
    pub const fn domain(self) -> Option<DomainKind> {
        match self {
            PacketKind::Eeg => Some(DomainKind::Wave(WaveKind::Eeg)),
            PacketKind::AlphaAbsolute => Some(DomainKind::Wave(WaveKind::AlphaAbsolute)),
            PacketKind::BetaAbsolute => Some(DomainKind::Wave(WaveKind::BetaAbsolute)),
            PacketKind::DeltaAbsolute => Some(DomainKind::Wave(WaveKind::DeltaAbsolute)),
            PacketKind::ThetaAbsolute => Some(DomainKind::Wave(WaveKind::ThetaAbsolute)),
            PacketKind::GammaAbsolute => Some(DomainKind::Wave(WaveKind::GammaAbsolute)),
            PacketKind::AlphaRelative => Some(DomainKind::Wave(WaveKind::AlphaRelative)),
            PacketKind::BetaRelative => Some(DomainKind::Wave(WaveKind::BetaRelative)),
            PacketKind::DeltaRelative => Some(DomainKind::Wave(WaveKind::DeltaRelative)),
            PacketKind::ThetaRelative => Some(DomainKind::Wave(WaveKind::ThetaRelative)),
            PacketKind::GammaRelative => Some(DomainKind::Wave(WaveKind::GammaRelative)),
            PacketKind::Artifacts => Some(DomainKind::Artifact),
            PacketKind::Battery => Some(DomainKind::Battery),
            PacketKind::Accelerometer
            | PacketKind::Gyro
            | PacketKind::Quantization
            | PacketKind::DrlRef
            | PacketKind::AlphaScore
            | PacketKind::BetaScore
            | PacketKind::DeltaScore
            | PacketKind::ThetaScore
            | PacketKind::GammaScore
            | PacketKind::IsGood
            | PacketKind::Hsi
            | PacketKind::HsiPrecision => None,
        }
    }

    /// Wave kind carried by this packet, if any.
    pub const fn wave_kind(self) -> Option<WaveKind> {
        match self.domain() {
            Some(DomainKind::Wave(kind)) => Some(kind),
            _ => None,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Brain-activity streams: raw EEG or a frequency band power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveKind {
    Eeg,
    AlphaAbsolute,
    BetaAbsolute,
    DeltaAbsolute,
    ThetaAbsolute,
    GammaAbsolute,
    AlphaRelative,
    BetaRelative,
    DeltaRelative,
    ThetaRelative,
    GammaRelative,
}

impl WaveKind {
    pub const ALL: [WaveKind; 11] = [
        WaveKind::Eeg,
        WaveKind::AlphaAbsolute,
        WaveKind::BetaAbsolute,
        WaveKind::DeltaAbsolute,
        WaveKind::ThetaAbsolute,
        WaveKind::GammaAbsolute,
        WaveKind::AlphaRelative,
        WaveKind::BetaRelative,
        WaveKind::DeltaRelative,
        WaveKind::ThetaRelative,
        WaveKind::GammaRelative,
    ];

    /// Native packet kind that carries this wave.
    pub const fn packet_kind(self) -> PacketKind {
        match self {
            WaveKind::Eeg => PacketKind::Eeg,
            WaveKind::AlphaAbsolute => PacketKind::AlphaAbsolute,
            WaveKind::BetaAbsolute => PacketKind::BetaAbsolute,
            WaveKind::DeltaAbsolute => PacketKind::DeltaAbsolute,
            WaveKind::ThetaAbsolute => PacketKind::ThetaAbsolute,
            WaveKind::GammaAbsolute => PacketKind::GammaAbsolute,
            WaveKind::AlphaRelative => PacketKind::AlphaRelative,
            WaveKind::BetaRelative => PacketKind::BetaRelative,
            WaveKind::DeltaRelative => PacketKind::DeltaRelative,
            WaveKind::ThetaRelative => PacketKind::ThetaRelative,
            WaveKind::GammaRelative => PacketKind::GammaRelative,
        }
    }
}

impl fmt::Display for WaveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaveKind::Eeg => write!(f, "EEG"),
            WaveKind::AlphaAbsolute => write!(f, "Alpha (abs)"),
            WaveKind::BetaAbsolute => write!(f, "Beta (abs)"),
            WaveKind::DeltaAbsolute => write!(f, "Delta (abs)"),
            WaveKind::ThetaAbsolute => write!(f, "Theta (abs)"),
            WaveKind::GammaAbsolute => write!(f, "Gamma (abs)"),
            WaveKind::AlphaRelative => write!(f, "Alpha (rel)"),
            WaveKind::BetaRelative => write!(f, "Beta (rel)"),
            WaveKind::DeltaRelative => write!(f, "Delta (rel)"),
            WaveKind::ThetaRelative => write!(f, "Theta (rel)"),
            WaveKind::GammaRelative => write!(f, "Gamma (rel)"),
        }
    }
}

/// Vendor channel layout / sampling configuration.
///
/// | Preset | Layout |
/// |---|---|
/// | `p20` | EEG + AUX |
/// | `p21` | EEG only (default) |
/// | `p22` | EEG, no accelerometer |
/// | `p23` | EEG + AUX, no accelerometer |
/// | `p50`–`p53` | as above plus PPG (Muse 2 / Muse S) |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    P20,
    #[default]
    P21,
    P22,
    P23,
    P50,
    P51,
    P52,
    P53,
}

impl Preset {
    pub const fn code(self) -> i32 {
        match self {
            Preset::P20 => PRESET_20,
            Preset::P21 => PRESET_21,
            Preset::P22 => PRESET_22,
            Preset::P23 => PRESET_23,
            Preset::P50 => PRESET_50,
            Preset::P51 => PRESET_51,
            Preset::P52 => PRESET_52,
            Preset::P53 => PRESET_53,
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Preset::P20 => "p20",
            Preset::P21 => "p21",
            Preset::P22 => "p22",
            Preset::P23 => "p23",
            Preset::P50 => "p50",
            Preset::P51 => "p51",
            Preset::P52 => "p52",
            Preset::P53 => "p53",
        };
        f.write_str(name)
    }
}
