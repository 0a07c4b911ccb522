//! Range selection over an object's slab slices

use proptest::prelude::*;
use tessera_core::{HostKey, Sector, SectorRoot, Slab, SlabSlice};
use tessera_worker::slabs_for_download;

/// Slices tagged by their position through the sector root
fn object(spans: &[(u32, u32)]) -> Vec<SlabSlice> {
    spans
        .iter()
        .enumerate()
        .map(|(i, &(offset, length))| {
            let mut slab = Slab::new(1);
            slab.shards = vec![Sector {
                host: HostKey::from_bytes([1; 32]),
                root: SectorRoot::from_bytes([i as u8; 32]),
            }];
            SlabSlice::new(slab, offset, length).unwrap()
        })
        .collect()
}

fn source(piece: &SlabSlice) -> usize {
    piece.slab.shards[0].root.as_bytes()[0] as usize
}

fn spans() -> impl Strategy<Value = Vec<(u32, u32)>> {
    prop::collection::vec((0u32..4096, 0u32..4096), 0..12)
}

proptest! {
    #[test]
    fn prop_whole_object_is_returned(spans in spans()) {
        let slices = object(&spans);
        let total: u64 = slices.iter().map(|s| s.length as u64).sum();

        let out = slabs_for_download(&slices, 0, total);
        let expected: Vec<SlabSlice> = slices.iter().filter(|s| s.length > 0).cloned().collect();
        prop_assert_eq!(out, expected);
    }

    #[test]
    fn prop_pieces_cover_requested_range(
        spans in spans(),
        offset in 0u64..40_000,
        length in 0u64..40_000,
    ) {
        let slices = object(&spans);
        let before = slices.clone();
        let total: u64 = slices.iter().map(|s| s.length as u64).sum();

        let out = slabs_for_download(&slices, offset, length);

        let mut starts = Vec::with_capacity(slices.len());
        let mut acc = 0u64;
        for s in &slices {
            starts.push(acc);
            acc += s.length as u64;
        }

        let from = offset.min(total);
        let to = offset.saturating_add(length).min(total);
        let mut pos = from;
        for piece in &out {
            let i = source(piece);
            let original = &slices[i];
            prop_assert!(piece.length > 0);
            prop_assert!(piece.offset >= original.offset);
            prop_assert!(piece.offset + piece.length <= original.offset + original.length);
            prop_assert_eq!(&piece.slab, &original.slab);

            let start = starts[i] + (piece.offset - original.offset) as u64;
            prop_assert_eq!(start, pos);
            pos += piece.length as u64;
        }
        prop_assert_eq!(pos, to);

        // the caller's slices are never modified
        prop_assert_eq!(slices, before);
    }
}
