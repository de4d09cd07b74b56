//! # Decoder
//!
//! Window management and packet intake for the receiving side.
//!
//! Received originals live in a ring addressed by `(sequence - base)` plus a
//! rotation offset, aligned bit-for-bit with the loss window. The window
//! slides forward only in 64-sequence quanta (the bitset word width), so a
//! slide is a handful of word moves instead of a rewrite. Sequence jumps
//! larger than the window evacuate the ring entirely.
//!
//! Recovery packets that cannot be applied immediately wait in a sorted
//! doubly-linked list, arena-allocated in a slab. A recovery leaves the list
//! when a solve consumes it, when its span no longer covers any loss, or when
//! its span start slides behind the window base (at that point the originals
//! it would need have been freed, so it can never participate in a solve
//! again).
//!
//! Delivery is an event queue: intake pushes `Delivery` records and the
//! caller drains them. The loss bit guarantees at-most-once delivery per
//! sequence; order is not sequence-monotonic, since one solve can release
//! several older packets at once.

use bytes::Bytes;
use slab::Slab;
use tracing::{debug, trace};

use crate::gf256;
use crate::loss::LossWindow;
use crate::pool::{prefix_buffer, prefixed_payload, BufferHandle, BufferPool, LEN_PREFIX};
use crate::solver::SolveScratch;
use crate::stats::DecoderStats;
use crate::wire::{OriginalPacket, RecoveryPacket};
use crate::{
    CodecError, Settings, DECODER_WINDOW_SIZE, MAX_PAYLOAD_BYTES, MAX_RECOVERY_COLUMNS,
    MAX_RECOVERY_ROWS,
};

// ─── Delivery ───────────────────────────────────────────────────────────────

/// A packet released to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Sequence number of the original.
    pub sequence: u64,
    /// Original payload (length prefix already stripped).
    pub payload: Bytes,
    /// Whether the payload was reconstructed rather than received directly.
    pub recovered: bool,
}

// ─── Recovery List ──────────────────────────────────────────────────────────

/// A recovery packet parked in the decoder, payload in the buffer pool.
pub(crate) struct StoredRecovery {
    pub(crate) handle: BufferHandle,
    pub(crate) sequence_start: u64,
    pub(crate) sequence_end: u64,
    pub(crate) matrix_row: u8,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly-linked list of recovery packets sorted by `(sequence_start,
/// sequence_end)`, nodes arena-allocated in a slab so splicing is O(1) and
/// positions survive unrelated removals.
pub(crate) struct RecoveryList {
    nodes: Slab<StoredRecovery>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl RecoveryList {
    fn new() -> Self {
        RecoveryList {
            nodes: Slab::with_capacity(MAX_RECOVERY_ROWS),
            head: None,
            tail: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn head(&self) -> Option<usize> {
        self.head
    }

    pub(crate) fn tail(&self) -> Option<usize> {
        self.tail
    }

    pub(crate) fn get(&self, idx: usize) -> &StoredRecovery {
        &self.nodes[idx]
    }

    pub(crate) fn next_of(&self, idx: usize) -> Option<usize> {
        self.nodes[idx].next
    }

    pub(crate) fn prev_of(&self, idx: usize) -> Option<usize> {
        self.nodes[idx].prev
    }

    /// Insert keeping the list sorted. New packets usually carry the highest
    /// span, so the walk starts from the tail.
    fn insert_sorted(
        &mut self,
        handle: BufferHandle,
        sequence_start: u64,
        sequence_end: u64,
        matrix_row: u8,
    ) -> usize {
        let key = (sequence_start, sequence_end);
        let mut after = self.tail;
        while let Some(idx) = after {
            let node = &self.nodes[idx];
            if (node.sequence_start, node.sequence_end) <= key {
                break;
            }
            after = node.prev;
        }

        let idx = self.nodes.insert(StoredRecovery {
            handle,
            sequence_start,
            sequence_end,
            matrix_row,
            prev: after,
            next: None,
        });

        match after {
            Some(a) => {
                let next = self.nodes[a].next;
                self.nodes[idx].next = next;
                self.nodes[a].next = Some(idx);
                match next {
                    Some(n) => self.nodes[n].prev = Some(idx),
                    None => self.tail = Some(idx),
                }
            }
            None => {
                let old_head = self.head;
                self.nodes[idx].next = old_head;
                self.head = Some(idx);
                match old_head {
                    Some(h) => self.nodes[h].prev = Some(idx),
                    None => self.tail = Some(idx),
                }
            }
        }
        idx
    }

    /// Unlink and return a node.
    fn unlink(&mut self, idx: usize) -> StoredRecovery {
        let node = self.nodes.remove(idx);
        match node.prev {
            Some(p) => self.nodes[p].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.nodes[n].prev = node.prev,
            None => self.tail = node.prev,
        }
        node
    }
}

// ─── Window Expansion Outcome ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expand {
    /// Span already covered, or covered by advancing the end in place.
    InWindow,
    /// Window slid forward by a multiple of 64 sequences.
    Shifted,
    /// Slide so large the whole ring was discarded.
    Evacuated,
    /// Span lies past the window by more than the window size; full reset.
    OutOfWindow,
}

// ─── Decoder ────────────────────────────────────────────────────────────────

/// Receiving half of the codec.
pub struct Decoder {
    pub(crate) pool: BufferPool,
    pub(crate) lost: LossWindow,
    /// Ring of received/recovered originals; `None` slots align with set
    /// loss bits.
    pub(crate) slots: [Option<BufferHandle>; DECODER_WINDOW_SIZE],
    pub(crate) rotation: usize,
    /// First sequence in the window.
    pub(crate) sequence_base: u64,
    /// One past the highest sequence the window covers.
    pub(crate) sequence_end: u64,
    pub(crate) recoveries: RecoveryList,
    pub(crate) deliveries: Vec<Delivery>,
    pub(crate) stats: DecoderStats,
    pub(crate) scratch: SolveScratch,
}

impl Decoder {
    /// Create a decoder. Fails on out-of-range settings.
    pub fn new(settings: Settings) -> Result<Self, CodecError> {
        if settings.window_packets < 2 || settings.window_packets > DECODER_WINDOW_SIZE {
            return Err(CodecError::InvalidInput("decoder window size out of range"));
        }
        Ok(Decoder {
            pool: BufferPool::new(DECODER_WINDOW_SIZE + MAX_RECOVERY_ROWS),
            lost: LossWindow::new(),
            slots: [None; DECODER_WINDOW_SIZE],
            rotation: 0,
            sequence_base: 0,
            sequence_end: 0,
            recoveries: RecoveryList::new(),
            deliveries: Vec::new(),
            stats: DecoderStats::new(),
            scratch: SolveScratch::new(),
        })
    }

    // ─── Intake ─────────────────────────────────────────────────────────

    /// Accept an original packet.
    ///
    /// Duplicates and packets behind the window are counted and ignored. A
    /// new original can complete stored recovery spans, so intake may queue
    /// several deliveries at once.
    pub fn decode_original(&mut self, packet: OriginalPacket) -> Result<(), CodecError> {
        if packet.payload.is_empty() {
            return Err(CodecError::InvalidInput("empty payload"));
        }
        if packet.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(CodecError::InvalidInput("payload too large"));
        }

        self.stats.originals_received += 1;
        if packet.sequence < self.sequence_base {
            self.stats.duplicates += 1;
            return Ok(());
        }

        self.expand_window(packet.sequence, 1);

        let element = (packet.sequence - self.sequence_base) as usize;
        if !self.lost.is_lost(element) {
            self.stats.duplicates += 1;
            return Ok(());
        }

        let handle = self
            .pool
            .insert(prefix_buffer(&packet.payload))
            .ok_or(CodecError::OutOfMemory)?;
        let slot = self.slot_index(element);
        self.slots[slot] = Some(handle);
        self.lost.clear(element);
        self.stats.delivered += 1;
        self.deliveries.push(Delivery {
            sequence: packet.sequence,
            payload: packet.payload,
            recovered: false,
        });

        self.cleanup_recovery_list();
        self.find_solutions_containing(packet.sequence)
    }

    /// Accept a recovery packet.
    ///
    /// A span with no remaining losses is discarded; a span with exactly one
    /// is solved on the spot; anything else is parked in the sorted list and
    /// the multi-loss solver runs.
    pub fn decode_recovery(&mut self, packet: RecoveryPacket) -> Result<(), CodecError> {
        if packet.sequence_start >= packet.sequence_end {
            return Err(CodecError::InvalidInput("empty span"));
        }
        if packet.span() > MAX_RECOVERY_COLUMNS as u64 {
            return Err(CodecError::InvalidInput("span too large"));
        }
        if packet.payload.is_empty() {
            return Err(CodecError::InvalidInput("empty payload"));
        }
        if packet.payload.len() > LEN_PREFIX + MAX_PAYLOAD_BYTES {
            return Err(CodecError::InvalidInput("payload too large"));
        }

        self.stats.recoveries_received += 1;
        if packet.sequence_start < self.sequence_base {
            // Data at the front of the span has left the window.
            self.stats.recoveries_useless += 1;
            return Ok(());
        }

        self.expand_window(packet.sequence_start, packet.span());

        match self.lost_in(packet.sequence_start, packet.sequence_end) {
            0 => {
                self.stats.recoveries_useless += 1;
                Ok(())
            }
            1 => {
                if let Some(sequence) = self.solve_lost_one(
                    packet.sequence_start,
                    packet.sequence_end,
                    packet.matrix_row,
                    &packet.payload,
                )? {
                    self.find_solutions_containing(sequence)?;
                }
                Ok(())
            }
            _ => {
                self.store_recovery(&packet)?;
                self.find_solutions()
            }
        }
    }

    /// Drain queued deliveries.
    pub fn drain_deliveries(&mut self) -> impl Iterator<Item = Delivery> + '_ {
        self.deliveries.drain(..)
    }

    /// Deliveries waiting to be drained.
    pub fn pending_deliveries(&self) -> usize {
        self.deliveries.len()
    }

    /// Decoder statistics.
    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    /// Current window as `(base, end)` sequences.
    pub fn sequence_window(&self) -> (u64, u64) {
        (self.sequence_base, self.sequence_end)
    }

    /// Recovery packets currently parked.
    pub fn stored_recoveries(&self) -> usize {
        self.recoveries.len()
    }

    // ─── Window Management ──────────────────────────────────────────────

    /// Grow the window to cover `[start, start + count)`.
    fn expand_window(&mut self, start: u64, count: u64) -> Expand {
        debug_assert!(start >= self.sequence_base);
        let end = start + count;
        if end <= self.sequence_end {
            return Expand::InWindow;
        }

        if start >= self.sequence_end + DECODER_WINDOW_SIZE as u64 {
            debug!(
                base = self.sequence_base,
                start, "sequence jump beyond the window, evacuating"
            );
            self.evacuate(start, end);
            return Expand::OutOfWindow;
        }

        if end - self.sequence_base <= DECODER_WINDOW_SIZE as u64 {
            self.sequence_end = end;
            return Expand::InWindow;
        }

        // Slide in whole bitset words.
        let shift = end - self.sequence_base - DECODER_WINDOW_SIZE as u64;
        let shift_words = shift.div_ceil(64) as usize;
        if shift_words >= DECODER_WINDOW_SIZE / 64 {
            self.evacuate(start, end);
            return Expand::Evacuated;
        }

        let shift_amount = shift_words * 64;
        for element in 0..shift_amount {
            self.release_slot(element);
        }
        self.lost.shift_down(shift_words);
        self.rotation = (self.rotation + shift_amount) % DECODER_WINDOW_SIZE;
        self.sequence_base += shift_amount as u64;
        self.sequence_end = end;
        self.stats.window_shifts += 1;
        self.cleanup_recovery_list();
        trace!(base = self.sequence_base, shift_amount, "window shifted");
        Expand::Shifted
    }

    /// Discard the entire ring and restart the window at `start`.
    fn evacuate(&mut self, start: u64, end: u64) {
        for element in 0..DECODER_WINDOW_SIZE {
            self.release_slot(element);
        }
        self.lost.set_all();
        self.rotation = 0;
        self.sequence_base = start;
        self.sequence_end = end;
        self.stats.evacuations += 1;
        while let Some(head) = self.recoveries.head() {
            self.remove_recovery(head);
        }
    }

    /// Free the buffer behind one window element, if any.
    fn release_slot(&mut self, element: usize) {
        let idx = (element + self.rotation) % DECODER_WINDOW_SIZE;
        if let Some(handle) = self.slots[idx].take() {
            self.pool.remove(handle);
        }
    }

    /// Drop recovery packets whose span start has slid behind the base.
    fn cleanup_recovery_list(&mut self) {
        while let Some(head) = self.recoveries.head() {
            if self.recoveries.get(head).sequence_start >= self.sequence_base {
                break;
            }
            self.remove_recovery(head);
        }
    }

    // ─── Shared Lookups ─────────────────────────────────────────────────

    /// Ring index for a window element.
    pub(crate) fn slot_index(&self, element: usize) -> usize {
        debug_assert!(element < DECODER_WINDOW_SIZE);
        (element + self.rotation) % DECODER_WINDOW_SIZE
    }

    /// Stored (length-prefixed) buffer for a window element.
    pub(crate) fn slot_payload(&self, element: usize) -> Option<&[u8]> {
        self.slots[self.slot_index(element)].and_then(|h| self.pool.get(h))
    }

    /// Losses in the sequence range `[start, end)`.
    pub(crate) fn lost_in(&self, start: u64, end: u64) -> usize {
        debug_assert!(start >= self.sequence_base && end <= self.sequence_end);
        let s = (start - self.sequence_base) as usize;
        let e = (end - self.sequence_base) as usize;
        self.lost.range_popcount(s, e)
    }

    /// Unlink a recovery node and free its payload.
    pub(crate) fn remove_recovery(&mut self, idx: usize) {
        let node = self.recoveries.unlink(idx);
        self.pool.remove(node.handle);
    }

    /// Unlink a recovery node, returning its payload if the pool still
    /// holds it.
    pub(crate) fn take_recovery_payload(&mut self, idx: usize) -> Option<Vec<u8>> {
        let node = self.recoveries.unlink(idx);
        self.pool.remove(node.handle)
    }

    // ─── Recovery Application ───────────────────────────────────────────

    /// Park a recovery packet in the sorted list.
    fn store_recovery(&mut self, packet: &RecoveryPacket) -> Result<(), CodecError> {
        if self.recoveries.len() >= MAX_RECOVERY_ROWS {
            // Oldest spans hold the deepest losses and are the least likely
            // to become solvable; drop from the front.
            if let Some(head) = self.recoveries.head() {
                self.remove_recovery(head);
            }
        }
        let handle = self
            .pool
            .insert(packet.payload.to_vec())
            .ok_or(CodecError::OutOfMemory)?;
        self.recoveries.insert_sorted(
            handle,
            packet.sequence_start,
            packet.sequence_end,
            packet.matrix_row,
        );
        Ok(())
    }

    /// Recover the single missing original in `[start, end)`.
    ///
    /// XORs every received original's contribution out of the recovery
    /// payload, divides by the survivor's coefficient, and delivers. Returns
    /// the recovered sequence, or `None` when the span holds no loss after
    /// all, a slot lookup comes back empty, or the result fails validation.
    pub(crate) fn solve_lost_one(
        &mut self,
        start: u64,
        end: u64,
        matrix_row: u8,
        payload: &[u8],
    ) -> Result<Option<u64>, CodecError> {
        let first = (start - self.sequence_base) as usize;
        let last = (end - self.sequence_base) as usize;
        let Some(lost_element) = self.lost.first_lost_in(first, last) else {
            return Ok(None);
        };
        let lost_sequence = self.sequence_base + lost_element as u64;

        let mut working = payload.to_vec();
        for sequence in start..end {
            if sequence == lost_sequence {
                continue;
            }
            let element = (sequence - self.sequence_base) as usize;
            let coeff = if matrix_row == 0 {
                1
            } else {
                gf256::cauchy_element(matrix_row, (sequence & 0xFF) as u8)
            };
            let Some(original) = self.slot_payload(element) else {
                return Ok(None);
            };
            gf256::muladd_mem(&mut working, original, coeff);
        }

        let survivor_coeff = if matrix_row == 0 {
            1
        } else {
            gf256::cauchy_element(matrix_row, (lost_sequence & 0xFF) as u8)
        };
        let mut solved = vec![0u8; working.len()];
        gf256::mul_mem(&mut solved, &working, gf256::inv(survivor_coeff));

        // Originals are never empty, so a zero-length result is corrupt too.
        let Some(recovered) = prefixed_payload(&solved).filter(|p| !p.is_empty()) else {
            debug!(sequence = lost_sequence, "recovered buffer failed length validation");
            self.stats.recoveries_useless += 1;
            self.stats.failure_sequence = lost_sequence;
            return Ok(None);
        };
        let payload_out = Bytes::copy_from_slice(recovered);
        solved.truncate(LEN_PREFIX + payload_out.len());

        let handle = self.pool.insert(solved).ok_or(CodecError::OutOfMemory)?;
        let slot = self.slot_index(lost_element);
        self.slots[slot] = Some(handle);
        self.lost.clear(lost_element);
        self.stats.delivered += 1;
        self.stats.recovered += 1;
        self.deliveries.push(Delivery {
            sequence: lost_sequence,
            payload: payload_out,
            recovered: true,
        });
        Ok(Some(lost_sequence))
    }

    /// A newly known sequence can reduce stored spans to a single loss; chase
    /// those chains, then hand over to the multi-loss solver.
    pub(crate) fn find_solutions_containing(&mut self, sequence: u64) -> Result<(), CodecError> {
        let mut work = vec![sequence];
        while let Some(s) = work.pop() {
            let mut cur = self.recoveries.head();
            while let Some(idx) = cur {
                let node = self.recoveries.get(idx);
                if node.sequence_start > s {
                    break;
                }
                let next = self.recoveries.next_of(idx);
                let (start, end, row) = (node.sequence_start, node.sequence_end, node.matrix_row);
                cur = next;
                if end <= s {
                    continue;
                }
                match self.lost_in(start, end) {
                    0 => {
                        self.remove_recovery(idx);
                        self.stats.recoveries_useless += 1;
                    }
                    1 => {
                        if let Some(payload) = self.take_recovery_payload(idx) {
                            if let Some(recovered) =
                                self.solve_lost_one(start, end, row, &payload)?
                            {
                                work.push(recovered);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        self.find_solutions()
    }
}
