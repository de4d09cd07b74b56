#![no_main]

use libfuzzer_sys::fuzz_target;
use rill_fec::wire::{expand_sequence, OriginalPacket, RecoveryPacket};

/// Fuzz the wire parsing surface.
///
/// The parsers must never panic on any input — only return None for invalid
/// datagrams — and anything they do accept must re-encode to a decodable
/// form with the same fields.
fuzz_target!(|data: &[u8]| {
    // Derive a reference sequence from the input so epoch selection is
    // exercised too.
    let latest = if data.len() >= 8 {
        u64::from_le_bytes(data[..8].try_into().unwrap()) >> 1
    } else {
        0
    };

    // 1. Truncated-sequence expansion — must not panic anywhere in range.
    if data.len() >= 4 {
        let truncated = u32::from_le_bytes(data[..4].try_into().unwrap());
        let _ = expand_sequence(truncated, latest);
    }

    // 2. Original decode — must not panic.
    if let Some(pkt) = OriginalPacket::decode(&mut &data[..], latest) {
        let mut buf = bytes::BytesMut::new();
        pkt.encode(&mut buf);
        let re = OriginalPacket::decode(&mut buf.freeze(), latest)
            .expect("re-encode of an accepted original must decode");
        assert_eq!(re.sequence, pkt.sequence);
        assert_eq!(re.payload, pkt.payload);
    }

    // 3. Recovery decode — must not panic.
    if let Some(pkt) = RecoveryPacket::decode(&mut &data[..], latest) {
        assert!(pkt.sequence_start < pkt.sequence_end);
        let mut buf = bytes::BytesMut::new();
        pkt.encode(&mut buf);
        let re = RecoveryPacket::decode(&mut buf.freeze(), latest)
            .expect("re-encode of an accepted recovery must decode");
        assert_eq!(re.sequence_start, pkt.sequence_start);
        assert_eq!(re.sequence_end, pkt.sequence_end);
        assert_eq!(re.matrix_row, pkt.matrix_row);
        assert_eq!(re.payload, pkt.payload);
    }
});
