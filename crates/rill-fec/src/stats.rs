//! # Codec Statistics
//!
//! Plain counter structs for both codec halves, serializable for metrics
//! export.

use serde::Serialize;

// ─── Encoder Stats ──────────────────────────────────────────────────────────

/// Aggregate encoder-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EncoderStats {
    /// Originals accepted into the window.
    pub originals: u64,
    /// Original payload bytes accepted.
    pub bytes_in: u64,
    /// Recovery packets generated (all rows).
    pub recoveries: u64,
    /// Recovery packets generated on the XOR parity row.
    pub parity_recoveries: u64,
}

impl EncoderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redundancy ratio: recovery packets per original.
    pub fn redundancy_ratio(&self) -> f64 {
        if self.originals == 0 {
            0.0
        } else {
            self.recoveries as f64 / self.originals as f64
        }
    }
}

// ─── Decoder Stats ──────────────────────────────────────────────────────────

/// Aggregate decoder-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecoderStats {
    /// Original packets fed to intake (including duplicates and stale).
    pub originals_received: u64,
    /// Originals ignored as duplicate or behind the window.
    pub duplicates: u64,
    /// Recovery packets fed to intake.
    pub recoveries_received: u64,
    /// Recovery packets discarded because their span held no losses or their
    /// data had already left the window.
    pub recoveries_useless: u64,
    /// Packets delivered to the application (originals plus recovered).
    pub delivered: u64,
    /// Lost packets reconstructed by recovery.
    pub recovered: u64,
    /// Multi-loss solves that succeeded.
    pub large_recovery_successes: u64,
    /// Multi-loss solves that hit a rank-deficient matrix.
    pub large_recovery_failures: u64,
    /// Lowest sequence a failed solve could not recover.
    pub failure_sequence: u64,
    /// Window slides, in 64-sequence quanta.
    pub window_shifts: u64,
    /// Full window evacuations after out-of-window jumps.
    pub evacuations: u64,
}

impl DecoderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of delivered packets that required recovery.
    pub fn recovery_ratio(&self) -> f64 {
        if self.delivered == 0 {
            0.0
        } else {
            self.recovered as f64 / self.delivered as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redundancy_ratio_guards_division() {
        let mut stats = EncoderStats::new();
        assert_eq!(stats.redundancy_ratio(), 0.0);
        stats.originals = 100;
        stats.recoveries = 25;
        assert!((stats.redundancy_ratio() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn recovery_ratio_guards_division() {
        let mut stats = DecoderStats::new();
        assert_eq!(stats.recovery_ratio(), 0.0);
        stats.delivered = 50;
        stats.recovered = 5;
        assert!((stats.recovery_ratio() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn stats_serialize() {
        let json = serde_json::to_string(&DecoderStats::new());
        assert!(json.is_ok());
    }
}
