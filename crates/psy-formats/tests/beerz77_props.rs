//! Properties of the BEERZ77 codec on arbitrary input.

use proptest::prelude::*;
use psy_formats::{compress, decompress, BEERZ77_TYPE};

/// Pattern-like data: long blank runs broken by a few events.
fn pattern_bytes() -> impl Strategy<Value = Vec<u8>> {
    (4usize..64, prop::collection::vec((0usize..64 * 16, any::<[u8; 5]>()), 0..8)).prop_map(
        |(lines, events)| {
            let mut data = [255u8, 255, 255, 0, 0].repeat(lines * 16);
            for (cell, event) in events {
                let at = (cell % (lines * 16)) * 5;
                data[at..at + 5].copy_from_slice(&event);
            }
            data
        },
    )
}

proptest! {
    #[test]
    fn decompress_inverts_compress(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        let packed = compress(&data);
        prop_assert_eq!(packed[0], BEERZ77_TYPE);
        prop_assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn pattern_data_shrinks(data in pattern_bytes()) {
        let packed = compress(&data);
        prop_assert!(packed.len() < data.len());
        prop_assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = decompress(&data);
    }
}
