//! Scatter-gather list utilities for block I/O
//!
//! An [`SgList`] is an ordered list of byte regions forming one logical
//! payload. Reads target an [`SgListMut`] handed to the storage engine
//! through a [`GuardedSgList`], which stays accessible to the submitter for
//! copy-back after the engine completes. Normalization reshapes a list so
//! that every region is exactly one storage block; `Bytes` slicing keeps
//! that zero-copy except where a block straddles two regions.

use crate::error::{AgentError, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Immutable payload scatter-gather list
pub type SgList = Vec<Bytes>;

/// Writable target scatter-gather list
pub type SgListMut = Vec<BytesMut>;

/// Total byte count of a payload list
pub fn sglist_byte_count(sglist: &[Bytes]) -> usize {
    sglist.iter().map(Bytes::len).sum()
}

/// Total byte count of a writable target list
pub fn sglist_mut_byte_count(sglist: &[BytesMut]) -> usize {
    sglist.iter().map(BytesMut::len).sum()
}

/// Reshape a payload list so that every region is exactly `block_size` bytes
///
/// Regions already aligned on block boundaries are re-sliced without
/// copying; a block that straddles two regions is assembled into a fresh
/// buffer. Fails with `InvalidArgument` when the total size is not a
/// multiple of `block_size`.
pub fn sglist_normalize(sglist: SgList, block_size: u32) -> Result<SgList> {
    let bs = block_size as usize;
    if bs == 0 {
        return Err(AgentError::invalid_argument("zero block size"));
    }

    let total = sglist_byte_count(&sglist);
    if total % bs != 0 {
        return Err(AgentError::invalid_argument(format!(
            "total size ({}) is not a multiple of block size ({})",
            total, bs
        )));
    }

    let mut out = Vec::with_capacity(total / bs);
    let mut pending: Option<BytesMut> = None;

    for mut region in sglist {
        while !region.is_empty() {
            match pending.take() {
                None => {
                    if region.len() >= bs {
                        out.push(region.split_to(bs));
                    } else {
                        let mut chunk = BytesMut::with_capacity(bs);
                        chunk.extend_from_slice(&region);
                        region.advance(region.remaining());
                        pending = Some(chunk);
                    }
                }
                Some(mut chunk) => {
                    let need = bs - chunk.len();
                    let take = need.min(region.len());
                    chunk.extend_from_slice(&region[..take]);
                    region.advance(take);
                    if chunk.len() == bs {
                        out.push(chunk.freeze());
                    } else {
                        pending = Some(chunk);
                    }
                }
            }
        }
    }

    debug_assert!(pending.is_none());
    Ok(out)
}

/// Reshape a writable target list to `block_size`-sized regions
///
/// Every input region must itself be a non-empty multiple of `block_size`:
/// splitting is the only lossless reshaping for owned mutable buffers.
/// The split regions of one input buffer stay contiguous in memory and can
/// be reassembled cheaply with [`sglist_merge`].
pub fn sglist_normalize_mut(sglist: SgListMut, block_size: u32) -> Result<SgListMut> {
    let bs = block_size as usize;
    if bs == 0 {
        return Err(AgentError::invalid_argument("zero block size"));
    }

    let total = sglist_mut_byte_count(&sglist);
    let mut out = Vec::with_capacity(total / bs.max(1));

    for mut region in sglist {
        if region.is_empty() || region.len() % bs != 0 {
            return Err(AgentError::invalid_argument(format!(
                "buffer size ({}) is not a multiple of block size ({})",
                region.len(),
                bs
            )));
        }
        while region.len() > bs {
            out.push(region.split_to(bs));
        }
        out.push(region);
    }

    Ok(out)
}

/// Copy bytes from `src` regions into `dst` regions in order
///
/// Returns the number of bytes copied, which is the smaller of the two
/// total sizes.
pub fn sglist_copy(src: &[Bytes], dst: &mut [BytesMut]) -> usize {
    let mut copied = 0;
    let mut di = 0;
    let mut doff = 0;

    for s in src {
        let mut soff = 0;
        while soff < s.len() && di < dst.len() {
            let d = &mut dst[di];
            let n = (s.len() - soff).min(d.len() - doff);
            d[doff..doff + n].copy_from_slice(&s[soff..soff + n]);
            soff += n;
            doff += n;
            copied += n;
            if doff == d.len() {
                di += 1;
                doff = 0;
            }
        }
    }

    copied
}

/// Reassemble target regions into one buffer
///
/// O(1) for regions produced by splitting one allocation; falls back to
/// copying otherwise.
pub fn sglist_merge(chunks: SgListMut) -> BytesMut {
    let mut iter = chunks.into_iter();
    let mut merged = match iter.next() {
        Some(first) => first,
        None => return BytesMut::new(),
    };
    for chunk in iter {
        merged.unsplit(chunk);
    }
    merged
}

/// Shared handle to a writable scatter-gather list
///
/// The submitter keeps one handle for copy-back while the storage engine
/// writes through another. `close` takes the list out; later acquires see
/// nothing, so a timed-out caller and a late engine completion cannot both
/// touch the buffers.
#[derive(Clone, Debug, Default)]
pub struct GuardedSgList {
    inner: Arc<Mutex<Option<SgListMut>>>,
}

impl GuardedSgList {
    pub fn new(sglist: SgListMut) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(sglist))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<SgListMut>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrow the list for reading or writing; `None` once closed
    pub fn acquire(&self) -> Option<SgListGuard<'_>> {
        let guard = self.lock();
        if guard.is_some() {
            Some(SgListGuard { guard })
        } else {
            None
        }
    }

    /// Take the list out, leaving the handle closed
    pub fn close(&self) -> Option<SgListMut> {
        self.lock().take()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }
}

/// Exclusive borrow of a guarded scatter-gather list
pub struct SgListGuard<'a> {
    guard: MutexGuard<'a, Option<SgListMut>>,
}

impl Deref for SgListGuard<'_> {
    type Target = SgListMut;

    fn deref(&self) -> &SgListMut {
        // acquire() only hands out a guard over a present list
        self.guard.as_ref().expect("sglist already closed")
    }
}

impl DerefMut for SgListGuard<'_> {
    fn deref_mut(&mut self) -> &mut SgListMut {
        self.guard.as_mut().expect("sglist already closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(sizes: &[usize], fill: u8) -> SgList {
        sizes
            .iter()
            .map(|&n| Bytes::from(vec![fill; n]))
            .collect()
    }

    #[test]
    fn test_normalize_zero_copy_split() {
        let sglist = payload(&[4096 * 4], b'X');
        let normalized = sglist_normalize(sglist, 4096).unwrap();

        assert_eq!(normalized.len(), 4);
        for chunk in &normalized {
            assert_eq!(chunk.len(), 4096);
            assert!(chunk.iter().all(|&b| b == b'X'));
        }
    }

    #[test]
    fn test_normalize_straddling_regions() {
        // 1000 + 3096 + 4096 bytes: first block straddles two regions
        let mut sglist = payload(&[1000], b'A');
        sglist.extend(payload(&[3096], b'B'));
        sglist.extend(payload(&[4096], b'C'));

        let normalized = sglist_normalize(sglist, 4096).unwrap();
        assert_eq!(normalized.len(), 2);
        assert_eq!(&normalized[0][..1000], vec![b'A'; 1000].as_slice());
        assert_eq!(&normalized[0][1000..], vec![b'B'; 3096].as_slice());
        assert!(normalized[1].iter().all(|&b| b == b'C'));
    }

    #[test]
    fn test_normalize_rejects_unaligned_total() {
        let sglist = payload(&[1000], b'A');
        let err = sglist_normalize(sglist, 4096).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_normalize_mut_split_and_merge() {
        let buf = BytesMut::zeroed(4096 * 3);
        let chunks = sglist_normalize_mut(vec![buf], 4096).unwrap();
        assert_eq!(chunks.len(), 3);

        let merged = sglist_merge(chunks);
        assert_eq!(merged.len(), 4096 * 3);
    }

    #[test]
    fn test_normalize_mut_rejects_partial_region() {
        let err = sglist_normalize_mut(vec![BytesMut::zeroed(100)], 4096).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_copy_across_region_shapes() {
        let src = payload(&[10, 20, 2], b'Z');
        let mut dst = vec![BytesMut::zeroed(16), BytesMut::zeroed(16)];

        let copied = sglist_copy(&src, &mut dst);
        assert_eq!(copied, 32);
        assert!(dst.iter().flat_map(|b| b.iter()).all(|&b| b == b'Z'));
    }

    #[test]
    fn test_guarded_sglist_close_wins_once() {
        let guarded = GuardedSgList::new(vec![BytesMut::zeroed(8)]);
        assert!(guarded.acquire().is_some());

        let taken = guarded.close();
        assert!(taken.is_some());
        assert!(guarded.close().is_none());
        assert!(guarded.acquire().is_none());
        assert!(guarded.is_closed());
    }

    #[test]
    fn test_guarded_sglist_write_through_guard() {
        let guarded = GuardedSgList::new(vec![BytesMut::zeroed(4)]);
        {
            let mut guard = guarded.acquire().unwrap();
            guard[0][..4].copy_from_slice(b"abcd");
        }
        let list = guarded.close().unwrap();
        assert_eq!(&list[0][..], b"abcd");
    }
}
