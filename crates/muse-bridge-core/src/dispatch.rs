//! Raw packet normalization.
//!
//! Converts a [`RawPacket`] copied out of the native callback into at most one
//! [`NormalizedEvent`]. Out-of-range timestamps and non-finite values are
//! repaired rather than rejected; every repair is counted.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Datelike, Utc};
use tracing::{trace, warn};

use crate::events::{ArtifactEvent, BatteryReading, NormalizedEvent, WaveSample};
use crate::native::RawPacket;
use crate::protocol::{DomainKind, WaveKind};

const MIN_YEAR: i32 = 1;
const MAX_YEAR: i32 = 9999;

/// Artifact flags are reported as 0.0 / 1.0.
const FLAG_THRESHOLD: f64 = 0.5;

/// Counters for repairs performed during normalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizationSnapshot {
    pub timestamps_replaced: u64,
    pub values_replaced: u64,
    pub unmapped_packets: u64,
}

#[derive(Debug, Default)]
pub struct Normalizer {
    timestamps_replaced: AtomicU64,
    values_replaced: AtomicU64,
    unmapped_packets: AtomicU64,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> NormalizationSnapshot {
        NormalizationSnapshot {
            timestamps_replaced: self.timestamps_replaced.load(Ordering::Relaxed),
            values_replaced: self.values_replaced.load(Ordering::Relaxed),
            unmapped_packets: self.unmapped_packets.load(Ordering::Relaxed),
        }
    }

    /// Map one packet to its domain event, or `None` for kinds the bridge
    /// does not publish.
    pub fn normalize(&self, packet: &RawPacket) -> Option<NormalizedEvent> {
        let Some(domain) = packet.kind.domain() else {
            self.unmapped_packets.fetch_add(1, Ordering::Relaxed);
            trace!(kind = %packet.kind, "Dropping unmapped packet");
            return None;
        };

        let timestamp = self.timestamp(packet);
        let values = self.sanitize(packet);

        let event = match domain {
            DomainKind::Wave(kind) => NormalizedEvent::WaveSample(wave_sample(kind, values, timestamp)),
            DomainKind::Artifact => NormalizedEvent::Artifact(ArtifactEvent {
                // Channel 0 reports "headband on".
                headband_loose: values[0] <= FLAG_THRESHOLD,
                blink: values[1] > FLAG_THRESHOLD,
                jaw_clench: values[2] > FLAG_THRESHOLD,
                timestamp,
            }),
            DomainKind::Battery => NormalizedEvent::Battery(BatteryReading {
                percent: values[0],
                millivolts: values[1],
                temperature_c: values[2],
                timestamp,
            }),
        };
        Some(event)
    }

    fn timestamp(&self, packet: &RawPacket) -> DateTime<Utc> {
        match DateTime::from_timestamp_micros(packet.timestamp_us) {
            Some(ts) if (MIN_YEAR..=MAX_YEAR).contains(&ts.year()) => ts,
            _ => {
                self.timestamps_replaced.fetch_add(1, Ordering::Relaxed);
                warn!(
                    device = %packet.source,
                    kind = %packet.kind,
                    timestamp_us = packet.timestamp_us,
                    "Timestamp out of range, using current time"
                );
                Utc::now()
            }
        }
    }

    /// Copy the meaningful channels, replacing NaN/Inf with 0.0.
    fn sanitize(&self, packet: &RawPacket) -> Vec<f64> {
        let count = packet.kind.channel_count().min(packet.values.len());
        packet.values[..count]
            .iter()
            .enumerate()
            .map(|(channel, &value)| {
                if value.is_finite() {
                    value
                } else {
                    self.values_replaced.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        device = %packet.source,
                        kind = %packet.kind,
                        channel = channel,
                        value = %value,
                        "Non-finite channel value replaced with 0.0"
                    );
                    0.0
                }
            })
            .collect()
    }
}

fn wave_sample(kind: WaveKind, channels: Vec<f64>, timestamp: DateTime<Utc>) -> WaveSample {
    let average = if channels.is_empty() {
        0.0
    } else {
        channels.iter().sum::<f64>() / channels.len() as f64
    };
    WaveSample {
        kind,
        channels,
        timestamp,
        average,
    }
}
