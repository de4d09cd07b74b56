//! # Multi-Loss Solver
//!
//! Gaussian elimination over GF(256) for spans where a single recovery packet
//! is not enough. The pipeline is plan-first: the coefficient matrix is
//! factored before any payload bytes are touched, so a rank-deficient span
//! costs a few hundred byte operations instead of a window's worth of
//! mul-adds.
//!
//! 1. **Span extraction** — walk the recovery list newest to oldest, growing
//!    a candidate chain of overlapping spans. Newer spans resolve more often
//!    because their losses are shallower. A chain is attempted as soon as it
//!    has at least as many rows as it covers lost columns.
//! 2. **Array extraction** — enumerate the lost columns in the chain's union
//!    span and the per-row column ranges.
//! 3. **Plan** — build the coefficient matrix and reduce it with partial
//!    pivoting, recording the elimination multipliers in place (an LU
//!    factorization). Rank deficiency aborts here.
//! 4. **Eliminate originals** — copy each pivot row's payload into a working
//!    buffer and mul-add out every original that was actually received.
//! 5. **Execute** — replay the recorded forward elimination on the working
//!    buffers, back-substitute in reverse pivot order, and write each solved
//!    column into its ring slot.
//! 6. **Report** — queue deliveries in ascending sequence order and unlink
//!    the consumed (pivoted) rows.

use bytes::Bytes;
use tracing::debug;

use crate::decoder::{Decoder, Delivery};
use crate::gf256;
use crate::pool::{prefixed_payload, LEN_PREFIX};
use crate::{CodecError, MAX_RECOVERY_COLUMNS, MAX_RECOVERY_ROWS};

// ─── Solve Outcome ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SolveStatus {
    /// The span was solved; consumed rows left the list.
    Solved,
    /// The rows at hand cannot determine the losses yet.
    NeedsMoreData,
}

// ─── Scratch State ──────────────────────────────────────────────────────────

/// One lost original the solve will reconstruct.
struct SolveColumn {
    sequence: u64,
    element: usize,
}

/// One recovery packet participating in the solve.
struct SolveRow {
    /// Recovery list node.
    node: usize,
    matrix_row: u8,
    sequence_start: u64,
    sequence_end: u64,
    /// Range of solve columns this row covers.
    col_start: usize,
    col_end: usize,
    payload_len: usize,
}

/// Reusable solver state. Buffers persist across solves so the steady-state
/// hot path does not allocate.
pub(crate) struct SolveScratch {
    columns: Vec<SolveColumn>,
    rows: Vec<SolveRow>,
    /// Row-major coefficient matrix; below each pivot it holds the recorded
    /// elimination multiplier.
    matrix: Vec<u8>,
    /// Matrix row chosen as the pivot for each column.
    pivots: Vec<usize>,
    used: Vec<bool>,
    /// Working payload buffers, populated for pivot rows only.
    data: Vec<Vec<u8>>,
}

impl SolveScratch {
    pub(crate) fn new() -> Self {
        SolveScratch {
            columns: Vec::new(),
            rows: Vec::new(),
            matrix: Vec::new(),
            pivots: Vec::new(),
            used: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Build the coefficient matrix and factor it, recording multipliers.
    /// Returns false when the matrix is rank-deficient.
    fn plan_solution(&mut self) -> bool {
        let rows = self.rows.len();
        let cols = self.columns.len();
        debug_assert!(cols >= 2 && rows >= cols);

        self.matrix.clear();
        self.matrix.resize(rows * cols, 0);
        for (i, row) in self.rows.iter().enumerate() {
            for j in row.col_start..row.col_end {
                let col_byte = (self.columns[j].sequence & 0xFF) as u8;
                self.matrix[i * cols + j] = if row.matrix_row == 0 {
                    1
                } else {
                    gf256::cauchy_element(row.matrix_row, col_byte)
                };
            }
        }

        self.pivots.clear();
        self.used.clear();
        self.used.resize(rows, false);

        for j in 0..cols {
            let Some(p) = (0..rows).find(|&i| !self.used[i] && self.matrix[i * cols + j] != 0)
            else {
                return false;
            };
            self.used[p] = true;
            self.pivots.push(p);

            let inv_pivot = gf256::inv(self.matrix[p * cols + j]);
            let pivot_row = self.matrix[p * cols..(p + 1) * cols].to_vec();
            for k in 0..rows {
                if self.used[k] {
                    continue;
                }
                let coeff = self.matrix[k * cols + j];
                if coeff == 0 {
                    continue;
                }
                let factor = gf256::mul(coeff, inv_pivot);
                self.matrix[k * cols + j] = factor;
                for l in (j + 1)..cols {
                    self.matrix[k * cols + l] ^= gf256::mul(factor, pivot_row[l]);
                }
            }
        }
        true
    }
}

// ─── Solver ─────────────────────────────────────────────────────────────────

impl Decoder {
    /// Hunt for solvable spans in the recovery list.
    ///
    /// Restarts from the newest packet after every success, since recovered
    /// data can unlock previously stuck spans. Every restart removed at least
    /// one list node, so the walk terminates.
    pub(crate) fn find_solutions(&mut self) -> Result<(), CodecError> {
        'restart: loop {
            let mut end_idx = self.recoveries.tail();
            while let Some(e) = end_idx {
                let node = self.recoveries.get(e);
                let prev_e = self.recoveries.prev_of(e);
                let (e_start, e_end, e_row) =
                    (node.sequence_start, node.sequence_end, node.matrix_row);

                match self.lost_in(e_start, e_end) {
                    0 => {
                        self.remove_recovery(e);
                        self.stats.recoveries_useless += 1;
                        end_idx = prev_e;
                        continue;
                    }
                    1 => {
                        if let Some(payload) = self.take_recovery_payload(e) {
                            self.solve_lost_one(e_start, e_end, e_row, &payload)?;
                        }
                        continue 'restart;
                    }
                    _ => {}
                }

                // Grow a chain of overlapping spans toward older packets.
                let mut chain_start = e;
                let mut lo = e_start;
                let mut hi = e_end;
                let mut rows = 1usize;
                let solved = loop {
                    let cols = self.lost_in(lo, hi);
                    if cols > MAX_RECOVERY_COLUMNS {
                        break false;
                    }
                    if cols >= 2
                        && rows >= cols
                        && self.try_solve(chain_start, e, lo, hi)? == SolveStatus::Solved
                    {
                        break true;
                    }
                    let Some(p) = self.recoveries.prev_of(chain_start) else {
                        break false;
                    };
                    let p_node = self.recoveries.get(p);
                    if p_node.sequence_end <= lo {
                        // No shared columns with the chain; independent system.
                        break false;
                    }
                    lo = p_node.sequence_start;
                    hi = hi.max(p_node.sequence_end);
                    chain_start = p;
                    rows += 1;
                    if rows > MAX_RECOVERY_ROWS {
                        break false;
                    }
                };
                if solved {
                    continue 'restart;
                }
                end_idx = prev_e;
            }
            return Ok(());
        }
    }

    /// Run the solve pipeline over the chain `[first, last]`.
    fn try_solve(
        &mut self,
        first: usize,
        last: usize,
        lo: u64,
        hi: u64,
    ) -> Result<SolveStatus, CodecError> {
        if !self.arrays_from_spans(first, last, lo, hi) {
            return Ok(SolveStatus::NeedsMoreData);
        }
        if !self.scratch.plan_solution() {
            self.stats.large_recovery_failures += 1;
            self.stats.failure_sequence = self.scratch.columns[0].sequence;
            debug!(
                rows = self.scratch.rows.len(),
                cols = self.scratch.columns.len(),
                "solve plan rank-deficient"
            );
            return Ok(SolveStatus::NeedsMoreData);
        }
        if !self.eliminate_originals() {
            return Ok(SolveStatus::NeedsMoreData);
        }
        self.execute_plan()?;
        self.report_solution();
        Ok(SolveStatus::Solved)
    }

    /// Enumerate lost columns in `[lo, hi)` and row descriptors for the chain.
    /// Returns false when the attempt cannot possibly plan (dimension caps,
    /// or fewer effective rows than columns).
    fn arrays_from_spans(&mut self, first: usize, last: usize, lo: u64, hi: u64) -> bool {
        self.scratch.columns.clear();
        self.scratch.rows.clear();

        let base = self.sequence_base;
        let hi_element = (hi - base) as usize;
        let mut element = (lo - base) as usize;
        while let Some(found) = self.lost.first_lost_in(element, hi_element) {
            if self.scratch.columns.len() == MAX_RECOVERY_COLUMNS {
                return false;
            }
            self.scratch.columns.push(SolveColumn {
                sequence: base + found as u64,
                element: found,
            });
            element = found + 1;
        }
        if self.scratch.columns.len() < 2 {
            return false;
        }

        let mut cur = Some(first);
        while let Some(idx) = cur {
            let node = self.recoveries.get(idx);
            let col_start = self
                .scratch
                .columns
                .partition_point(|c| c.sequence < node.sequence_start);
            let col_end = self
                .scratch
                .columns
                .partition_point(|c| c.sequence < node.sequence_end);
            if col_end > col_start {
                if self.scratch.rows.len() == MAX_RECOVERY_ROWS {
                    return false;
                }
                let Some(payload) = self.pool.get(node.handle) else {
                    return false;
                };
                let payload_len = payload.len();
                self.scratch.rows.push(SolveRow {
                    node: idx,
                    matrix_row: node.matrix_row,
                    sequence_start: node.sequence_start,
                    sequence_end: node.sequence_end,
                    col_start,
                    col_end,
                    payload_len,
                });
            }
            if idx == last {
                break;
            }
            cur = self.recoveries.next_of(idx);
        }

        self.scratch.rows.len() >= self.scratch.columns.len()
    }

    /// Fill the pivot rows' working buffers: payload copy, minus every
    /// received original's contribution. What remains is a combination of
    /// only the lost columns. Returns false if a participating buffer has
    /// gone missing, leaving all decoder state untouched.
    fn eliminate_originals(&mut self) -> bool {
        let cols = self.scratch.columns.len();
        // Working width: the longest participating recovery payload, which
        // bounds every covered original's length-prefixed size.
        let solution_bytes = self
            .scratch
            .pivots
            .iter()
            .map(|&p| self.scratch.rows[p].payload_len)
            .max()
            .unwrap_or(0);

        let row_count = self.scratch.rows.len();
        if self.scratch.data.len() < row_count {
            self.scratch.data.resize_with(row_count, Vec::new);
        }

        for j in 0..cols {
            let p = self.scratch.pivots[j];
            let mut buf = std::mem::take(&mut self.scratch.data[p]);
            buf.clear();
            buf.resize(solution_bytes, 0);

            let row = &self.scratch.rows[p];
            let (start, end, matrix_row) = (row.sequence_start, row.sequence_end, row.matrix_row);
            let Some(payload) = self.pool.get(self.recoveries.get(row.node).handle) else {
                return false;
            };
            buf[..payload.len()].copy_from_slice(payload);

            for sequence in start..end {
                let element = (sequence - self.sequence_base) as usize;
                if self.lost.is_lost(element) {
                    continue;
                }
                let coeff = if matrix_row == 0 {
                    1
                } else {
                    gf256::cauchy_element(matrix_row, (sequence & 0xFF) as u8)
                };
                let Some(original) = self.slot_payload(element) else {
                    return false;
                };
                gf256::muladd_mem(&mut buf, original, coeff);
            }

            self.scratch.data[p] = buf;
        }
        true
    }

    /// Replay the recorded elimination on the working buffers, then
    /// back-substitute and write each solved column into its ring slot.
    fn execute_plan(&mut self) -> Result<(), CodecError> {
        let cols = self.scratch.columns.len();

        // Forward elimination, in the order the plan recorded it. Later
        // pivots were unpivoted rows at the earlier stages.
        for j in 0..cols {
            let p = self.scratch.pivots[j];
            let src = std::mem::take(&mut self.scratch.data[p]);
            for l in (j + 1)..cols {
                let q = self.scratch.pivots[l];
                let factor = self.scratch.matrix[q * cols + j];
                if factor != 0 {
                    gf256::muladd_mem(&mut self.scratch.data[q], &src, factor);
                }
            }
            self.scratch.data[p] = src;
        }

        // Back substitution in reverse pivot order.
        for j in (0..cols).rev() {
            let p = self.scratch.pivots[j];
            let mut buf = std::mem::take(&mut self.scratch.data[p]);
            for l in (j + 1)..cols {
                let factor = self.scratch.matrix[p * cols + l];
                if factor != 0 {
                    let solved = &self.scratch.data[self.scratch.pivots[l]];
                    gf256::muladd_mem(&mut buf, solved, factor);
                }
            }
            gf256::scale_mem(&mut buf, gf256::inv(self.scratch.matrix[p * cols + j]));
            self.scratch.data[p] = buf;
        }

        // Store the solved columns.
        for j in 0..cols {
            let p = self.scratch.pivots[j];
            let element = self.scratch.columns[j].element;
            let sequence = self.scratch.columns[j].sequence;
            let buf = &self.scratch.data[p];
            let Some(payload) = prefixed_payload(buf).filter(|data| !data.is_empty()) else {
                debug!(sequence, "solved buffer failed length validation");
                self.stats.large_recovery_failures += 1;
                self.stats.failure_sequence = sequence;
                continue;
            };
            let mut stored = buf.clone();
            stored.truncate(LEN_PREFIX + payload.len());

            let handle = self.pool.insert(stored).ok_or(CodecError::OutOfMemory)?;
            let slot = self.slot_index(element);
            self.slots[slot] = Some(handle);
            self.lost.clear(element);
        }
        Ok(())
    }

    /// Queue deliveries for the solved columns (ascending sequence) and
    /// unlink the pivoted rows.
    fn report_solution(&mut self) {
        for j in 0..self.scratch.columns.len() {
            let element = self.scratch.columns[j].element;
            let sequence = self.scratch.columns[j].sequence;
            if self.lost.is_lost(element) {
                continue; // failed validation above; left unrecovered
            }
            let payload = match self.slot_payload(element).and_then(prefixed_payload) {
                Some(data) => Bytes::copy_from_slice(data),
                None => continue,
            };
            self.stats.delivered += 1;
            self.stats.recovered += 1;
            self.deliveries.push(Delivery {
                sequence,
                payload,
                recovered: true,
            });
        }
        self.stats.large_recovery_successes += 1;

        let consumed: Vec<usize> = self
            .scratch
            .pivots
            .iter()
            .map(|&p| self.scratch.rows[p].node)
            .collect();
        for node in consumed {
            self.remove_recovery(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::prefix_buffer;
    use crate::wire::{OriginalPacket, RecoveryPacket};
    use crate::Settings;

    fn decoder() -> Decoder {
        Decoder::new(Settings::default()).unwrap()
    }

    /// Recovery packet combining the given originals with one matrix row, the
    /// same way the encoder does.
    fn make_recovery(matrix_row: u8, start: u64, payloads: &[&[u8]]) -> RecoveryPacket {
        let max = payloads.iter().map(|p| p.len()).max().unwrap() + LEN_PREFIX;
        let mut data = vec![0u8; max];
        for (i, payload) in payloads.iter().enumerate() {
            let sequence = start + i as u64;
            let coeff = if matrix_row == 0 {
                1
            } else {
                gf256::cauchy_element(matrix_row, (sequence & 0xFF) as u8)
            };
            gf256::muladd_mem(&mut data, &prefix_buffer(payload), coeff);
        }
        RecoveryPacket {
            sequence_start: start,
            sequence_end: start + payloads.len() as u64,
            matrix_row,
            payload: data.into(),
        }
    }

    fn feed_survivors(dec: &mut Decoder, payloads: &[&[u8]], lost: &[u64]) {
        for (i, payload) in payloads.iter().enumerate() {
            let seq = i as u64;
            if lost.contains(&seq) {
                continue;
            }
            dec.decode_original(OriginalPacket::new(seq, Bytes::copy_from_slice(payload)))
                .unwrap();
        }
        dec.drain_deliveries().for_each(drop);
    }

    fn recovered(dec: &mut Decoder) -> Vec<(u64, Bytes)> {
        dec.drain_deliveries()
            .filter(|d| d.recovered)
            .map(|d| (d.sequence, d.payload))
            .collect()
    }

    // ─── Two Losses ─────────────────────────────────────────────────────

    #[test]
    fn two_losses_two_rows() {
        let payloads: Vec<&[u8]> = vec![b"alpha", b"bravo", b"charlie", b"delta", b"echo"];
        let mut dec = decoder();
        feed_survivors(&mut dec, &payloads, &[1, 3]);

        dec.decode_recovery(make_recovery(0, 0, &payloads)).unwrap();
        assert!(recovered(&mut dec).is_empty(), "one row cannot solve two losses");
        assert_eq!(dec.stored_recoveries(), 1);

        dec.decode_recovery(make_recovery(1, 0, &payloads)).unwrap();
        let got = recovered(&mut dec);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], (1, Bytes::from_static(b"bravo")));
        assert_eq!(got[1], (3, Bytes::from_static(b"delta")));
        assert_eq!(dec.stored_recoveries(), 0, "both rows consumed");
        assert_eq!(dec.stats().large_recovery_successes, 1);
    }

    #[test]
    fn adjacent_losses_solve() {
        let payloads: Vec<&[u8]> = vec![b"aa", b"bb", b"cc", b"dd"];
        let mut dec = decoder();
        feed_survivors(&mut dec, &payloads, &[1, 2]);

        dec.decode_recovery(make_recovery(0, 0, &payloads)).unwrap();
        dec.decode_recovery(make_recovery(1, 0, &payloads)).unwrap();
        let got = recovered(&mut dec);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], (1, Bytes::from_static(b"bb")));
        assert_eq!(got[1], (2, Bytes::from_static(b"cc")));
    }

    // ─── Three Losses ───────────────────────────────────────────────────

    #[test]
    fn three_losses_three_rows() {
        let payloads: Vec<&[u8]> = vec![b"one", b"two", b"three", b"four", b"five", b"six"];
        let mut dec = decoder();
        feed_survivors(&mut dec, &payloads, &[0, 2, 5]);

        dec.decode_recovery(make_recovery(0, 0, &payloads)).unwrap();
        dec.decode_recovery(make_recovery(1, 0, &payloads)).unwrap();
        assert!(recovered(&mut dec).is_empty());

        dec.decode_recovery(make_recovery(2, 0, &payloads)).unwrap();
        let got = recovered(&mut dec);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], (0, Bytes::from_static(b"one")));
        assert_eq!(got[1], (2, Bytes::from_static(b"three")));
        assert_eq!(got[2], (5, Bytes::from_static(b"six")));
        assert_eq!(dec.stored_recoveries(), 0);
    }

    // ─── Rank Deficiency ────────────────────────────────────────────────

    #[test]
    fn duplicate_rows_are_rank_deficient() {
        let payloads: Vec<&[u8]> = vec![b"aa", b"bb", b"cc", b"dd"];
        let mut dec = decoder();
        feed_survivors(&mut dec, &payloads, &[1, 3]);

        let rec = make_recovery(5, 0, &payloads);
        dec.decode_recovery(rec.clone()).unwrap();
        dec.decode_recovery(rec).unwrap();

        assert!(recovered(&mut dec).is_empty(), "identical rows cannot solve");
        assert!(dec.stats().large_recovery_failures >= 1);
        assert_eq!(dec.stats().failure_sequence, 1);
        assert_eq!(dec.stored_recoveries(), 2, "rows wait for more data");

        // A distinct row still rescues the span.
        dec.decode_recovery(make_recovery(6, 0, &payloads)).unwrap();
        let got = recovered(&mut dec);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, 1);
        assert_eq!(got[1].0, 3);
    }

    // ─── Overlapping Spans ──────────────────────────────────────────────

    #[test]
    fn overlapping_spans_combine() {
        // Rows cover [0,4) and [2,6); both losses sit in the overlap, so
        // neither row can solve alone and the chain must combine them.
        let payloads: Vec<&[u8]> = vec![b"p0", b"p1", b"p2", b"p3", b"p4", b"p5"];
        let mut dec = decoder();
        feed_survivors(&mut dec, &payloads, &[2, 3]);

        dec.decode_recovery(make_recovery(1, 0, &payloads[..4])).unwrap();
        assert!(recovered(&mut dec).is_empty());
        dec.decode_recovery(make_recovery(2, 2, &payloads[2..])).unwrap();

        let got = recovered(&mut dec);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], (2, Bytes::from_static(b"p2")));
        assert_eq!(got[1], (3, Bytes::from_static(b"p3")));
    }

    #[test]
    fn recovered_sequence_cascades_through_stored_spans() {
        // Span [2,6) has one loss and solves on arrival; the recovered
        // packet then reduces the parked span [0,4) to one loss as well.
        let payloads: Vec<&[u8]> = vec![b"p0", b"p1", b"p2", b"p3", b"p4", b"p5"];
        let mut dec = decoder();
        feed_survivors(&mut dec, &payloads, &[1, 3]);

        dec.decode_recovery(make_recovery(1, 0, &payloads[..4])).unwrap();
        assert!(recovered(&mut dec).is_empty());
        assert_eq!(dec.stored_recoveries(), 1);

        dec.decode_recovery(make_recovery(2, 2, &payloads[2..])).unwrap();
        let mut got = recovered(&mut dec);
        got.sort_by_key(|(seq, _)| *seq);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], (1, Bytes::from_static(b"p1")));
        assert_eq!(got[1], (3, Bytes::from_static(b"p3")));
        assert_eq!(dec.stored_recoveries(), 0);
    }

    #[test]
    fn disjoint_spans_stay_independent() {
        let payloads: Vec<&[u8]> = vec![b"a", b"b", b"c", b"d", b"e", b"f"];
        let mut dec = decoder();
        // Losses 1 and 4 live in disjoint spans [0,3) and [3,6).
        feed_survivors(&mut dec, &payloads, &[1, 4]);

        dec.decode_recovery(make_recovery(1, 0, &payloads[..3])).unwrap();
        let got = recovered(&mut dec);
        assert_eq!(got.len(), 1, "single-loss span solves alone");
        assert_eq!(got[0].0, 1);

        dec.decode_recovery(make_recovery(2, 3, &payloads[3..])).unwrap();
        let got = recovered(&mut dec);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], (4, Bytes::from_static(b"e")));
    }

    // ─── Variable Lengths ───────────────────────────────────────────────

    #[test]
    fn variable_length_payloads_roundtrip() {
        let payloads: Vec<&[u8]> = vec![b"x", b"yyyyyyyyyyyy", b"zz", b"w", b"vvvvv"];
        let mut dec = decoder();
        feed_survivors(&mut dec, &payloads, &[1, 2]);

        dec.decode_recovery(make_recovery(0, 0, &payloads)).unwrap();
        dec.decode_recovery(make_recovery(9, 0, &payloads)).unwrap();

        let got = recovered(&mut dec);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], (1, Bytes::from_static(b"yyyyyyyyyyyy")));
        assert_eq!(got[1], (2, Bytes::from_static(b"zz")));
    }
}
