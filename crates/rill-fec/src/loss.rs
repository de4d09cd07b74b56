//! # Loss Window
//!
//! One bit per decoder window slot: set means the packet at that offset from
//! the window base has not been received (or lies beyond everything received
//! so far, which is the same thing). The bitset answers the two questions the
//! solver asks constantly — how many losses does a span cover, and where is
//! the next one — without scanning packet storage.
//!
//! The first word holds the lowest sequence offsets, the lowest bit of each
//! word the lowest offset within it. Window slides shift high bits down into
//! low bits, and only in whole 64-bit words: per-packet shifting would turn
//! every slide into a full-bitset rewrite, so the decoder slides its base in
//! 64-sequence quanta instead.

use crate::DECODER_WINDOW_SIZE;

/// Words in the bitset.
const WORDS: usize = DECODER_WINDOW_SIZE / 64;

/// Fixed-width loss bitset aligned to the decoder window.
#[derive(Debug, Clone)]
pub struct LossWindow {
    words: [u64; WORDS],
}

impl LossWindow {
    /// A fresh window: every slot lost.
    pub fn new() -> Self {
        LossWindow { words: [!0; WORDS] }
    }

    /// Mark every slot lost.
    pub fn set_all(&mut self) {
        self.words = [!0; WORDS];
    }

    /// Mark slot `i` lost.
    pub fn set(&mut self, i: usize) {
        debug_assert!(i < DECODER_WINDOW_SIZE);
        self.words[i / 64] |= 1u64 << (i % 64);
    }

    /// Mark slot `i` received.
    pub fn clear(&mut self, i: usize) {
        debug_assert!(i < DECODER_WINDOW_SIZE);
        self.words[i / 64] &= !(1u64 << (i % 64));
    }

    /// Whether slot `i` is still missing.
    pub fn is_lost(&self, i: usize) -> bool {
        debug_assert!(i < DECODER_WINDOW_SIZE);
        self.words[i / 64] & (1u64 << (i % 64)) != 0
    }

    /// Number of lost slots in `[start, end)`.
    pub fn range_popcount(&self, start: usize, end: usize) -> usize {
        debug_assert!(start <= end && end <= DECODER_WINDOW_SIZE);
        let mut count = 0usize;
        let mut w = start / 64;
        while w * 64 < end {
            let mut word = self.words[w];
            if w == start / 64 {
                word &= !0u64 << (start % 64);
            }
            if (w + 1) * 64 > end {
                word &= (1u64 << (end - w * 64)) - 1;
            }
            count += word.count_ones() as usize;
            w += 1;
        }
        count
    }

    /// Lowest lost slot in `[start, end)`, if any.
    pub fn first_lost_in(&self, start: usize, end: usize) -> Option<usize> {
        debug_assert!(start <= end && end <= DECODER_WINDOW_SIZE);
        let mut w = start / 64;
        while w * 64 < end {
            let mut word = self.words[w];
            if w == start / 64 {
                word &= !0u64 << (start % 64);
            }
            if (w + 1) * 64 > end {
                word &= (1u64 << (end - w * 64)) - 1;
            }
            if word != 0 {
                return Some(w * 64 + word.trailing_zeros() as usize);
            }
            w += 1;
        }
        None
    }

    /// Slide the window down by `words * 64` slots: the lowest words are
    /// discarded, higher bits shift toward offset zero, and the vacated top
    /// fills with ones (newly exposed slots start out lost).
    pub fn shift_down(&mut self, words: usize) {
        if words == 0 {
            return;
        }
        if words >= WORDS {
            self.set_all();
            return;
        }
        self.words.copy_within(words.., 0);
        for w in &mut self.words[WORDS - words..] {
            *w = !0;
        }
    }
}

impl Default for LossWindow {
    fn default() -> Self {
        Self::new()
    }
}
