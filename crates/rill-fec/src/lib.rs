//! # rill-fec
//!
//! Sliding-window streaming erasure codec over GF(2^8) for low-latency
//! datagram flows (voice, video, telemetry).
//!
//! The sender emits its original packets unmodified and interleaves recovery
//! packets computed from a sliding window of recent originals. Each recovery
//! packet carries one row of a Cauchy generator matrix applied to a contiguous
//! sequence span; row 0 is a plain XOR parity over a disjoint window slice.
//! The receiver tracks losses in a fixed-width bitset and recovers missing
//! originals with a Gaussian-elimination solver, bounded by a fixed window of
//! memory.
//!
//! The 8-bit matrix coordinate space bounds the coding window to 256 packets
//! in flight, which comfortably covers interactive media rates (a few
//! thousand packets per second at sub-second windows). Up to roughly 30%
//! redundancy is practical. Reliable delivery, retransmission, congestion
//! control, and reordering are out of scope: recovered packets are delivered
//! once, out of order, and a dejitter buffer is expected upstream of the
//! application.
//!
//! ## Crate structure
//!
//! - [`gf256`] — finite-field arithmetic and the Cauchy generator element
//! - [`pool`] — fixed-capacity packet buffer pool
//! - [`loss`] — loss-tracking bitset aligned to the decoder window
//! - [`wire`] — packet types and truncated-sequence datagram codecs
//! - [`encoder`] — sliding-window recovery generation
//! - [`decoder`] — decoder window, intake, and the multi-loss solver
//! - [`stats`] — encoder/decoder counters

pub mod decoder;
pub mod encoder;
pub mod gf256;
pub mod loss;
pub mod pool;
mod solver;
pub mod stats;
pub mod wire;

pub use decoder::{Decoder, Delivery};
pub use encoder::Encoder;
pub use wire::{OriginalPacket, RecoveryPacket};

use thiserror::Error;

// ─── Compile-Time Wire Contract ─────────────────────────────────────────────

/// Decoder window capacity in packets. Must be a multiple of 64 — the loss
/// bitset slides in whole-word quanta.
pub const DECODER_WINDOW_SIZE: usize = 256;

/// Maximum encoder window capacity in packets. Bounded by the 8-bit matrix
/// column space, and must not exceed [`DECODER_WINDOW_SIZE`].
pub const MAX_ENCODER_WINDOW_SIZE: usize = 192;

/// Maximum sequence span one recovery packet may cover.
pub const MAX_RECOVERY_COLUMNS: usize = MAX_ENCODER_WINDOW_SIZE;

/// Maximum recovery packets retained by the decoder, bounding solver rows.
pub const MAX_RECOVERY_ROWS: usize = 128;

/// Maximum payload size of one original packet.
pub const MAX_PAYLOAD_BYTES: usize = u16::MAX as usize;

// ─── Settings ───────────────────────────────────────────────────────────────

/// Instance configuration, supplied at encoder/decoder creation.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Age cap on the recovery span in milliseconds: originals older than
    /// this are left out of new recovery packets. Zero disables the cap.
    pub window_msec: u64,
    /// Encoder window capacity, 2..=[`MAX_ENCODER_WINDOW_SIZE`].
    pub window_packets: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            window_msec: 100,
            window_packets: MAX_ENCODER_WINDOW_SIZE,
        }
    }
}

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Failures surfaced at the API boundary.
///
/// Internal progress states (a recovery packet that is not yet actionable, a
/// duplicate of an already-delivered sequence) are not errors: intake returns
/// `Ok(())` and the state is retained or the packet ignored as appropriate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Malformed caller input: empty payload, oversized payload, empty or
    /// oversized span, out-of-range settings.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// The packet buffer pool is exhausted. Fatal for the instance.
    #[error("packet buffer pool exhausted")]
    OutOfMemory,
}
