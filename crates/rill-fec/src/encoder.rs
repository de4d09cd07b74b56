//! # Encoder
//!
//! Sliding-window recovery generation. The encoder keeps the most recent
//! originals in a fixed ring, each stored length-prefixed and stamped with
//! its send time. A recovery packet covers the contiguous span from the
//! oldest live (and unexpired) original to the newest, combining the stored
//! buffers with one generator-matrix row:
//!
//! - **Row 0** — plain XOR parity, emitted whenever the span start has
//!   caught up with the parity cursor. Successive parity rows therefore
//!   cover disjoint slices of the stream.
//! - **Rows 1..=255** — Cauchy-coded rows, cycling per recovery packet. An
//!   original's matrix column is the low byte of its sequence number.
//!
//! Recovery payloads are sized to the longest length-prefixed original in
//! the span; shorter originals contribute as if zero-padded.

use bytes::Bytes;
use quanta::Instant;

use crate::gf256;
use crate::pool::prefix_buffer;
use crate::stats::EncoderStats;
use crate::wire::{OriginalPacket, RecoveryPacket};
use crate::{CodecError, Settings, MAX_ENCODER_WINDOW_SIZE, MAX_PAYLOAD_BYTES};

// ─── Window Slot ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct WindowSlot {
    /// Send time in microseconds since the encoder's epoch.
    send_usec: u64,
    /// Length-prefixed payload.
    data: Vec<u8>,
}

// ─── Encoder ────────────────────────────────────────────────────────────────

/// Sliding-window encoder.
pub struct Encoder {
    /// Ring of the most recent originals.
    window: Vec<WindowSlot>,
    /// Ring index the next original is written to.
    next_index: usize,
    /// Live originals in the ring.
    live: usize,
    /// Sequence number assigned to the next original.
    next_sequence: u64,
    /// Cauchy row used by the next non-parity recovery.
    next_row: u8,
    /// Sequence at which the next parity (row 0) span begins.
    parity_sequence: u64,
    /// `next_sequence` at the time of the last generated recovery. Recovery
    /// generation pauses until a new original arrives.
    recovery_watermark: u64,
    /// Age cap for span membership, microseconds. Zero disables.
    window_usec: u64,
    epoch: Instant,
    stats: EncoderStats,
}

impl Encoder {
    /// Create an encoder. Fails on an out-of-range window size.
    pub fn new(settings: Settings) -> Result<Self, CodecError> {
        if settings.window_packets < 2 || settings.window_packets > MAX_ENCODER_WINDOW_SIZE {
            return Err(CodecError::InvalidInput("encoder window size out of range"));
        }
        let mut window = Vec::with_capacity(settings.window_packets);
        window.resize_with(settings.window_packets, WindowSlot::default);
        Ok(Encoder {
            window,
            next_index: 0,
            live: 0,
            next_sequence: 0,
            next_row: 1,
            parity_sequence: 0,
            recovery_watermark: 0,
            window_usec: settings.window_msec.saturating_mul(1000),
            epoch: Instant::now(),
            stats: EncoderStats::new(),
        })
    }

    /// Accept the next original, assigning it a sequence number and storing a
    /// length-prefixed copy in the ring (overwriting the oldest slot when
    /// full). Returns the packet to transmit.
    pub fn push_original(&mut self, payload: Bytes) -> Result<OriginalPacket, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::InvalidInput("empty payload"));
        }
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(CodecError::InvalidInput("payload too large"));
        }

        let sequence = self.next_sequence;
        let send_usec = self.now_usec();
        let slot = &mut self.window[self.next_index];
        slot.data = prefix_buffer(&payload);
        slot.send_usec = send_usec;

        self.next_index = (self.next_index + 1) % self.window.len();
        self.live = (self.live + 1).min(self.window.len());
        self.next_sequence += 1;
        self.stats.originals += 1;
        self.stats.bytes_in += payload.len() as u64;

        Ok(OriginalPacket { sequence, payload })
    }

    /// Generate a recovery packet over the live span.
    ///
    /// Returns `None` when there is nothing useful to generate: fewer than
    /// two live, unexpired originals, or no original accepted since the
    /// previous recovery.
    pub fn encode_recovery(&mut self) -> Option<RecoveryPacket> {
        if self.live < 2 || self.next_sequence == self.recovery_watermark {
            return None;
        }

        let now = self.now_usec();
        let mut start = self.next_sequence - self.live as u64;
        if self.window_usec > 0 {
            while start < self.next_sequence {
                let slot = &self.window[self.slot_index(start)];
                if now.saturating_sub(slot.send_usec) <= self.window_usec {
                    break;
                }
                start += 1;
            }
        }
        if self.next_sequence - start < 2 {
            return None;
        }

        let mut max_len = 0;
        for seq in start..self.next_sequence {
            max_len = max_len.max(self.window[self.slot_index(seq)].data.len());
        }

        // Expiry can jump the span start past the parity cursor; `>=` keeps
        // successive parity slices disjoint either way.
        let parity = start >= self.parity_sequence;
        let matrix_row = if parity {
            0
        } else {
            let row = self.next_row;
            self.next_row = if row == 255 { 1 } else { row + 1 };
            row
        };

        let mut out = vec![0u8; max_len];
        for seq in start..self.next_sequence {
            let coeff = if parity {
                1
            } else {
                gf256::cauchy_element(matrix_row, (seq & 0xFF) as u8)
            };
            let slot = &self.window[self.slot_index(seq)];
            gf256::muladd_mem(&mut out, &slot.data, coeff);
        }

        if parity {
            self.parity_sequence = self.next_sequence;
            self.stats.parity_recoveries += 1;
        }
        self.recovery_watermark = self.next_sequence;
        self.stats.recoveries += 1;

        Some(RecoveryPacket {
            sequence_start: start,
            sequence_end: self.next_sequence,
            matrix_row,
            payload: out.into(),
        })
    }

    /// Live originals in the ring.
    pub fn window_len(&self) -> usize {
        self.live
    }

    /// Sequence number the next original will receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Encoder statistics.
    pub fn stats(&self) -> &EncoderStats {
        &self.stats
    }

    fn now_usec(&self) -> u64 {
        Instant::now().duration_since(self.epoch).as_micros() as u64
    }

    /// Ring index of a live sequence number.
    fn slot_index(&self, sequence: u64) -> usize {
        debug_assert!(sequence < self.next_sequence);
        debug_assert!(self.next_sequence - sequence <= self.live as u64);
        let back = (self.next_sequence - sequence) as usize;
        (self.next_index + self.window.len() - back) % self.window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::LEN_PREFIX;

    fn encoder_with_window(window_packets: usize) -> Encoder {
        Encoder::new(Settings {
            window_msec: 0, // age cap off: tests control spans by count
            window_packets,
        })
        .unwrap()
    }

    fn push(enc: &mut Encoder, payload: &[u8]) -> OriginalPacket {
        enc.push_original(Bytes::copy_from_slice(payload)).unwrap()
    }

    // ─── Original Intake ────────────────────────────────────────────────

    #[test]
    fn sequences_are_assigned_in_order() {
        let mut enc = encoder_with_window(8);
        for i in 0..5u64 {
            let pkt = push(&mut enc, b"x");
            assert_eq!(pkt.sequence, i);
        }
        assert_eq!(enc.next_sequence(), 5);
        assert_eq!(enc.window_len(), 5);
    }

    #[test]
    fn empty_payload_rejected() {
        let mut enc = encoder_with_window(8);
        assert_eq!(
            enc.push_original(Bytes::new()),
            Err(CodecError::InvalidInput("empty payload"))
        );
    }

    #[test]
    fn ring_caps_live_count() {
        let mut enc = encoder_with_window(4);
        for _ in 0..10 {
            push(&mut enc, b"x");
        }
        assert_eq!(enc.window_len(), 4);
    }

    // ─── Recovery Generation ────────────────────────────────────────────

    #[test]
    fn needs_two_originals() {
        let mut enc = encoder_with_window(8);
        assert!(enc.encode_recovery().is_none());
        push(&mut enc, b"a");
        assert!(enc.encode_recovery().is_none());
        push(&mut enc, b"b");
        assert!(enc.encode_recovery().is_some());
    }

    #[test]
    fn no_recovery_without_new_original() {
        let mut enc = encoder_with_window(8);
        push(&mut enc, b"a");
        push(&mut enc, b"b");
        assert!(enc.encode_recovery().is_some());
        assert!(enc.encode_recovery().is_none());

        push(&mut enc, b"c");
        assert!(enc.encode_recovery().is_some());
    }

    #[test]
    fn first_recovery_is_parity_over_full_span() {
        let mut enc = encoder_with_window(16);
        for i in 0..10u8 {
            push(&mut enc, &[b'A' + i]);
        }
        let rec = enc.encode_recovery().unwrap();
        assert_eq!(rec.matrix_row, 0);
        assert_eq!(rec.sequence_start, 0);
        assert_eq!(rec.sequence_end, 10);

        // Row 0 payload is the XOR of the length-prefixed originals.
        let mut expected = vec![0u8; LEN_PREFIX + 1];
        for i in 0..10u8 {
            for (d, s) in expected.iter_mut().zip(prefix_buffer(&[b'A' + i])) {
                *d ^= s;
            }
        }
        assert_eq!(&rec.payload[..], &expected[..]);
    }

    #[test]
    fn cauchy_rows_cycle_after_parity() {
        let mut enc = encoder_with_window(16);
        push(&mut enc, b"a");
        push(&mut enc, b"b");
        assert_eq!(enc.encode_recovery().unwrap().matrix_row, 0);

        for expected_row in 1..=4u8 {
            push(&mut enc, b"c");
            assert_eq!(enc.encode_recovery().unwrap().matrix_row, expected_row);
        }
    }

    #[test]
    fn parity_realigns_when_span_start_catches_up() {
        let mut enc = encoder_with_window(8);
        for _ in 0..8 {
            push(&mut enc, b"x");
        }
        let first = enc.encode_recovery().unwrap();
        assert_eq!(first.matrix_row, 0);
        assert_eq!((first.sequence_start, first.sequence_end), (0, 8));

        // Push until the ring start slides to the parity cursor at 8.
        let mut next_parity = None;
        for _ in 0..16 {
            push(&mut enc, b"x");
            let rec = enc.encode_recovery().unwrap();
            if rec.matrix_row == 0 {
                next_parity = Some(rec);
                break;
            }
        }
        let rec = next_parity.expect("parity row should realign");
        assert_eq!(rec.sequence_start, 8);
        assert_eq!(rec.sequence_end, enc.next_sequence());
    }

    #[test]
    fn row_counter_wraps_to_one() {
        // Parity rows interleave whenever the ring start catches the parity
        // cursor; the Cauchy subsequence itself must cycle 1..=255 then wrap
        // back to 1, never touching 0.
        let mut enc = encoder_with_window(8);
        push(&mut enc, b"c");
        let mut cauchy_rows = Vec::new();
        for _ in 0..320 {
            push(&mut enc, b"c");
            let row = enc.encode_recovery().unwrap().matrix_row;
            if row != 0 {
                cauchy_rows.push(row);
            }
        }
        assert!(cauchy_rows.len() > 256);
        for (i, &row) in cauchy_rows.iter().enumerate() {
            assert_eq!(row as usize, 1 + (i % 255), "cauchy row {i}");
        }
    }

    #[test]
    fn payload_sized_to_longest_original() {
        let mut enc = encoder_with_window(8);
        push(&mut enc, b"ab");
        push(&mut enc, b"abcdefgh");
        push(&mut enc, b"a");
        let rec = enc.encode_recovery().unwrap();
        assert_eq!(rec.payload.len(), LEN_PREFIX + 8);
    }

    #[test]
    fn expired_originals_leave_the_span() {
        let mut enc = Encoder::new(Settings {
            window_msec: 1,
            window_packets: 8,
        })
        .unwrap();
        push(&mut enc, b"old");
        push(&mut enc, b"old");
        std::thread::sleep(std::time::Duration::from_millis(5));
        push(&mut enc, b"new");
        push(&mut enc, b"new");

        let rec = enc.encode_recovery().unwrap();
        assert_eq!(rec.sequence_start, 2, "expired originals excluded");
        assert_eq!(rec.sequence_end, 4);
    }

    #[test]
    fn fully_expired_window_generates_nothing() {
        let mut enc = Encoder::new(Settings {
            window_msec: 1,
            window_packets: 8,
        })
        .unwrap();
        push(&mut enc, b"a");
        push(&mut enc, b"b");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(enc.encode_recovery().is_none());
    }

    #[test]
    fn stats_track_generation() {
        let mut enc = encoder_with_window(8);
        push(&mut enc, b"abc");
        push(&mut enc, b"de");
        enc.encode_recovery().unwrap();

        assert_eq!(enc.stats().originals, 2);
        assert_eq!(enc.stats().bytes_in, 5);
        assert_eq!(enc.stats().recoveries, 1);
        assert_eq!(enc.stats().parity_recoveries, 1);
        assert!((enc.stats().redundancy_ratio() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn invalid_window_size_rejected() {
        assert!(Encoder::new(Settings {
            window_msec: 0,
            window_packets: 1,
        })
        .is_err());
        assert!(Encoder::new(Settings {
            window_msec: 0,
            window_packets: MAX_ENCODER_WINDOW_SIZE + 1,
        })
        .is_err());
    }
}
