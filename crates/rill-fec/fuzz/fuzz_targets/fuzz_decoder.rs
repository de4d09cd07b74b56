#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use rill_fec::wire::{OriginalPacket, RecoveryPacket};
use rill_fec::{CodecError, Decoder, Settings};

/// Fuzz decoder intake with arbitrary packet streams.
///
/// Whatever arrives, the decoder must not panic, must not report
/// out-of-memory (its pool is sized for the worst case the window admits),
/// and must deliver each sequence number at most once.
fuzz_target!(|data: &[u8]| {
    let mut dec = Decoder::new(Settings::default()).unwrap();
    let mut seen = std::collections::HashSet::new();

    let mut input = data;
    while input.len() >= 8 {
        let (op, rest) = input.split_at(8);
        let kind = op[0] & 1;
        let seq_base = u16::from_le_bytes([op[1], op[2]]) as u64;
        let span = 1 + (op[3] % 32) as u64;
        let row = op[4];
        let len = 1 + (op[5] as usize % 40);
        let take = len.min(rest.len());
        let payload = if take == 0 {
            Bytes::from_static(b"p")
        } else {
            Bytes::copy_from_slice(&rest[..take])
        };
        input = &rest[take..];

        let result = if kind == 0 {
            dec.decode_original(OriginalPacket::new(seq_base, payload))
        } else {
            dec.decode_recovery(RecoveryPacket {
                sequence_start: seq_base,
                sequence_end: seq_base + span,
                matrix_row: row,
                payload,
            })
        };
        match result {
            Ok(()) | Err(CodecError::InvalidInput(_)) => {}
            Err(CodecError::OutOfMemory) => panic!("pool exhausted under window bounds"),
        }

        for delivery in dec.drain_deliveries() {
            assert!(
                seen.insert(delivery.sequence),
                "sequence {} delivered twice",
                delivery.sequence
            );
            assert!(!delivery.payload.is_empty());
        }
    }
});
