//! Property tests for scatter-gather normalization and copying

use bytes::{Bytes, BytesMut};
use disk_agent_core::sglist::{
    sglist_byte_count, sglist_copy, sglist_merge, sglist_normalize, sglist_normalize_mut,
};
use proptest::prelude::*;

const BLOCK_SIZE: u32 = 512;

/// Random partition of `total` bytes into nonempty regions
fn partition(total: usize) -> impl Strategy<Value = Vec<usize>> {
    proptest::collection::vec(1usize..=total, 1..16).prop_map(move |cuts| {
        let mut sizes = Vec::new();
        let mut left = total;
        for cut in cuts {
            if left == 0 {
                break;
            }
            let take = cut.min(left);
            sizes.push(take);
            left -= take;
        }
        if left > 0 {
            sizes.push(left);
        }
        sizes
    })
}

fn fill(sizes: &[usize]) -> Vec<Bytes> {
    let mut next = 0u8;
    sizes
        .iter()
        .map(|&n| {
            Bytes::from(
                (0..n)
                    .map(|_| {
                        next = next.wrapping_add(1);
                        next
                    })
                    .collect::<Vec<u8>>(),
            )
        })
        .collect()
}

fn flatten(sglist: &[Bytes]) -> Vec<u8> {
    sglist.iter().flat_map(|b| b.iter().copied()).collect()
}

proptest! {
    /// Normalization preserves content and produces uniform regions.
    #[test]
    fn normalize_preserves_bytes(
        sizes in (1usize..32).prop_flat_map(|b| partition(b * BLOCK_SIZE as usize)),
    ) {
        let sglist = fill(&sizes);
        let original = flatten(&sglist);

        let normalized = sglist_normalize(sglist, BLOCK_SIZE).unwrap();

        prop_assert!(normalized.iter().all(|b| b.len() == BLOCK_SIZE as usize));
        prop_assert_eq!(sglist_byte_count(&normalized), original.len());
        prop_assert_eq!(flatten(&normalized), original);
    }

    /// A total that is not a whole number of blocks is rejected.
    #[test]
    fn normalize_rejects_unaligned_totals(
        blocks in 0usize..8,
        extra in 1usize..BLOCK_SIZE as usize,
    ) {
        let total = blocks * BLOCK_SIZE as usize + extra;
        let sglist = fill(&[total]);
        prop_assert!(sglist_normalize(sglist, BLOCK_SIZE).is_err());
    }

    /// Splitting owned buffers and merging them back is lossless.
    #[test]
    fn normalize_mut_then_merge_roundtrips(blocks in 1usize..32) {
        let total = blocks * BLOCK_SIZE as usize;
        let mut buf = BytesMut::zeroed(total);
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let original = buf.clone();

        let chunks = sglist_normalize_mut(vec![buf], BLOCK_SIZE).unwrap();
        prop_assert_eq!(chunks.len(), blocks);
        prop_assert!(chunks.iter().all(|c| c.len() == BLOCK_SIZE as usize));

        let merged = sglist_merge(chunks);
        prop_assert_eq!(merged, original);
    }

    /// Copying between arbitrary region shapes moves min(src, dst) bytes
    /// in order.
    #[test]
    fn copy_moves_min_of_totals(
        src_sizes in (1usize..3000).prop_flat_map(partition),
        dst_sizes in (1usize..3000).prop_flat_map(partition),
    ) {
        let src = fill(&src_sizes);
        let expected = flatten(&src);
        let mut dst: Vec<BytesMut> = dst_sizes.iter().map(|&n| BytesMut::zeroed(n)).collect();

        let src_total: usize = src_sizes.iter().sum();
        let dst_total: usize = dst_sizes.iter().sum();

        let copied = sglist_copy(&src, &mut dst);
        prop_assert_eq!(copied, src_total.min(dst_total));

        let flat_dst: Vec<u8> = dst.iter().flat_map(|b| b.iter().copied()).collect();
        prop_assert_eq!(&flat_dst[..copied], &expected[..copied]);
    }
}
