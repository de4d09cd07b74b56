//! # Wire Format
//!
//! Datagram codecs for the two packet kinds. One packet per datagram; the
//! transport's own framing supplies the payload boundary.
//!
//! ## Original packet
//!
//! ```text
//!  0                   1                   2
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Truncated Sequence (24, big endian)     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Payload ...                    |
//! ```
//!
//! ## Recovery packet
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Truncated Sequence Start (24, big endian)  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Span (8)     | Matrix Row (8)| Payload ...    |
//! ```
//!
//! Sequence numbers are 64-bit monotonic counters; only the low 24 bits
//! travel. The receiver expands a truncated value to the 64-bit sequence
//! closest to the top of its window, so the truncation window (±8M packets)
//! dwarfs any plausible reordering depth.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::MAX_RECOVERY_COLUMNS;

// ─── Truncated Sequences ────────────────────────────────────────────────────

/// Bytes of sequence number carried on the wire.
pub const TRUNCATED_SEQUENCE_BYTES: usize = 3;

const TRUNCATED_BITS: u32 = 8 * TRUNCATED_SEQUENCE_BYTES as u32;
const TRUNCATED_SPAN: u64 = 1 << TRUNCATED_BITS;
const TRUNCATED_MASK: u64 = TRUNCATED_SPAN - 1;

/// Expand a truncated sequence to the 64-bit value closest to `latest`.
pub fn expand_sequence(truncated: u32, latest: u64) -> u64 {
    let truncated = truncated as u64 & TRUNCATED_MASK;
    let candidate = (latest & !TRUNCATED_MASK) | truncated;

    let mut best = candidate;
    let mut best_dist = candidate.abs_diff(latest);
    if let Some(lo) = candidate.checked_sub(TRUNCATED_SPAN) {
        if lo.abs_diff(latest) < best_dist {
            best = lo;
            best_dist = lo.abs_diff(latest);
        }
    }
    if let Some(hi) = candidate.checked_add(TRUNCATED_SPAN) {
        if hi.abs_diff(latest) < best_dist {
            best = hi;
        }
    }
    best
}

// ─── Original Packet ────────────────────────────────────────────────────────

/// An original packet: one application datagram with its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalPacket {
    /// 64-bit monotonic sequence number.
    pub sequence: u64,
    /// Application payload.
    pub payload: Bytes,
}

impl OriginalPacket {
    pub fn new(sequence: u64, payload: Bytes) -> Self {
        OriginalPacket { sequence, payload }
    }

    /// Encode into a buffer: truncated sequence, then payload.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_uint(self.sequence & TRUNCATED_MASK, TRUNCATED_SEQUENCE_BYTES);
        buf.extend_from_slice(&self.payload);
    }

    /// Decode a whole datagram. `latest` is the receiver's highest window
    /// sequence, used to expand the truncated value. Returns `None` on a
    /// short or empty datagram.
    pub fn decode(buf: &mut impl Buf, latest: u64) -> Option<Self> {
        if buf.remaining() <= TRUNCATED_SEQUENCE_BYTES {
            return None;
        }
        let truncated = buf.get_uint(TRUNCATED_SEQUENCE_BYTES) as u32;
        let payload = buf.copy_to_bytes(buf.remaining());
        Some(OriginalPacket {
            sequence: expand_sequence(truncated, latest),
            payload,
        })
    }

    /// Total encoded size.
    pub fn encoded_len(&self) -> usize {
        TRUNCATED_SEQUENCE_BYTES + self.payload.len()
    }
}

// ─── Recovery Packet ────────────────────────────────────────────────────────

/// A recovery packet: one generator-matrix row applied to the originals in
/// `[sequence_start, sequence_end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPacket {
    /// First sequence covered.
    pub sequence_start: u64,
    /// One past the last sequence covered.
    pub sequence_end: u64,
    /// Generator matrix row: 0 is XOR parity, 1..=255 are Cauchy rows.
    pub matrix_row: u8,
    /// Coded payload, sized to the longest length-prefixed original in the
    /// span.
    pub payload: Bytes,
}

impl RecoveryPacket {
    /// Number of originals covered.
    pub fn span(&self) -> u64 {
        self.sequence_end - self.sequence_start
    }

    /// Encode into a buffer: truncated span start, span length, matrix row,
    /// then payload.
    pub fn encode(&self, buf: &mut BytesMut) {
        debug_assert!(self.sequence_start < self.sequence_end);
        debug_assert!(self.span() <= MAX_RECOVERY_COLUMNS as u64);
        buf.put_uint(self.sequence_start & TRUNCATED_MASK, TRUNCATED_SEQUENCE_BYTES);
        buf.put_u8(self.span() as u8);
        buf.put_u8(self.matrix_row);
        buf.extend_from_slice(&self.payload);
    }

    /// Decode a whole datagram. Returns `None` on a short datagram, a zero or
    /// oversized span, or an empty payload.
    pub fn decode(buf: &mut impl Buf, latest: u64) -> Option<Self> {
        if buf.remaining() <= TRUNCATED_SEQUENCE_BYTES + 2 {
            return None;
        }
        let truncated = buf.get_uint(TRUNCATED_SEQUENCE_BYTES) as u32;
        let span = buf.get_u8() as u64;
        let matrix_row = buf.get_u8();
        if span == 0 || span > MAX_RECOVERY_COLUMNS as u64 {
            return None;
        }
        let payload = buf.copy_to_bytes(buf.remaining());
        let sequence_start = expand_sequence(truncated, latest);
        Some(RecoveryPacket {
            sequence_start,
            sequence_end: sequence_start + span,
            matrix_row,
            payload,
        })
    }

    /// Total encoded size.
    pub fn encoded_len(&self) -> usize {
        TRUNCATED_SEQUENCE_BYTES + 2 + self.payload.len()
    }
}
