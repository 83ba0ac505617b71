//! Block-size adapting I/O layer
//!
//! Sits between client-domain requests, addressed in the caller's block
//! size, and a [`Storage`] engine that only understands its own (smaller or
//! equal) storage block size. Every submission converts addressing, picks a
//! buffer strategy, registers the operation with an inflight tracker and
//! hands back a future. Completion, timeout sweep and shutdown drain all
//! act through the tracker.

use crate::config::StorageAdapterConfig;
use crate::error::{AgentError, Result};
use crate::inflight::{InflightTracker, Promise, ResponseFuture};
use crate::models::{
    CallContext, EraseMethod, IoResponse, ReadBlocksLocalRequest, ReadBlocksRequest,
    ReadBlocksResponse, WriteBlocksLocalRequest, WriteBlocksRequest, WriteBlocksResponse,
    ZeroBlocksRequest, ZeroBlocksResponse,
};
use crate::sglist::{
    sglist_byte_count, sglist_merge, sglist_normalize, sglist_normalize_mut, GuardedSgList, SgList,
};
use crate::storage::{Storage, Timer};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Buffer strategy chosen at submission and carried until completion
///
/// `Pooled` is one contiguous engine-granted allocation; `Direct` works on
/// per-block owned buffers. Read completion reassembles client blocks
/// differently per variant, so the choice travels with the request instead
/// of being re-derived from buffer shapes.
enum ReadTarget {
    Pooled(GuardedSgList),
    Direct(GuardedSgList),
}

impl ReadTarget {
    fn guarded(&self) -> &GuardedSgList {
        match self {
            ReadTarget::Pooled(guarded) => guarded,
            ReadTarget::Direct(guarded) => guarded,
        }
    }

    /// Reclaim the engine-written buffers as client-sized blocks
    ///
    /// `None` when the list was already closed by another party.
    fn into_blocks(self, blocks_count: u32, request_block_size: u32) -> Option<SgList> {
        let rbs = request_block_size as usize;
        match self {
            // contiguous chunks, the merge is O(1)
            ReadTarget::Pooled(guarded) => {
                let merged = sglist_merge(guarded.close()?).freeze();
                Some(slice_into_blocks(merged, blocks_count, rbs))
            }
            ReadTarget::Direct(guarded) => {
                let sglist = guarded.close()?;
                if sglist.len() == blocks_count as usize
                    && sglist.iter().all(|b| b.len() == rbs)
                {
                    Some(sglist.into_iter().map(BytesMut::freeze).collect())
                } else {
                    let merged = sglist_merge(sglist).freeze();
                    Some(slice_into_blocks(merged, blocks_count, rbs))
                }
            }
        }
    }
}

/// Write payload staged for submission
enum WritePayload {
    Pooled(BytesMut),
    Direct(SgList),
}

struct AdapterInner {
    storage: Arc<dyn Storage>,
    storage_block_size: u32,
    normalize: bool,
    max_request_size: u64,
    read_tracker: InflightTracker<ReadBlocksResponse>,
    write_tracker: InflightTracker<WriteBlocksResponse>,
    zero_tracker: InflightTracker<ZeroBlocksResponse>,
}

/// Adapter translating client-block-size requests onto a storage engine
pub struct StorageAdapter {
    inner: Arc<AdapterInner>,
    shutdown_timeout: Duration,
}

impl StorageAdapter {
    pub fn new(storage: Arc<dyn Storage>, config: &StorageAdapterConfig) -> Self {
        let max_request_duration = config.max_request_duration();
        Self {
            inner: Arc::new(AdapterInner {
                storage,
                storage_block_size: config.storage_block_size,
                normalize: config.normalize,
                max_request_size: config.max_request_size,
                read_tracker: InflightTracker::new(max_request_duration),
                write_tracker: InflightTracker::new(max_request_duration),
                zero_tracker: InflightTracker::new(max_request_duration),
            }),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    /// Total operations currently registered across all trackers
    pub fn inflight_count(&self) -> usize {
        self.inner.read_tracker.size()
            + self.inner.write_tracker.size()
            + self.inner.zero_tracker.size()
    }

    /// Submit a read; the response carries one region per client block
    pub fn read_blocks(
        &self,
        now: Instant,
        ctx: CallContext,
        request: ReadBlocksRequest,
        request_block_size: u32,
    ) -> ResponseFuture<ReadBlocksResponse> {
        let inner = &self.inner;

        let factor = match inner.verify_block_size(request_block_size) {
            Ok(factor) => factor,
            Err(err) => return ResponseFuture::ready(ReadBlocksResponse::from_error(err)),
        };

        let local_blocks = request.blocks_count as u64 * factor as u64;
        let bytes_count = local_blocks * inner.storage_block_size as u64;
        if let Err(err) = inner.verify_request_size(bytes_count, local_blocks) {
            return ResponseFuture::ready(ReadBlocksResponse::from_error(err));
        }

        let target = match inner.allocate_read_target(bytes_count as usize, request_block_size) {
            Ok(target) => target,
            Err(err) => return ResponseFuture::ready(ReadBlocksResponse::from_error(err)),
        };

        let local_request = ReadBlocksLocalRequest {
            disk_id: request.disk_id,
            session_id: request.session_id,
            checkpoint_id: request.checkpoint_id,
            start_index: request.start_index * factor as u64,
            blocks_count: local_blocks as u32,
            block_size: inner.storage_block_size,
            flags: request.flags,
            sglist: target.guarded().clone(),
        };

        let (promise, future) = Promise::new();
        let id = inner.read_tracker.register_request(now, promise.clone());

        let inner = Arc::clone(inner);
        let blocks_count = request.blocks_count;
        tokio::spawn(async move {
            let local_response = inner.storage.read_blocks_local(ctx, local_request).await;
            inner.read_tracker.unregister_request(id);

            let response = match local_response.error {
                Some(err) => ReadBlocksResponse::from_error(err),
                None => match target.into_blocks(blocks_count, request_block_size) {
                    Some(blocks) => ReadBlocksResponse {
                        error: None,
                        blocks,
                    },
                    None => ReadBlocksResponse::from_error(AgentError::io(
                        "request buffers already reclaimed",
                    )),
                },
            };
            promise.try_set(response);
        });

        future
    }

    /// Submit a write; payload sizes come from the scatter-gather list
    pub fn write_blocks(
        &self,
        now: Instant,
        ctx: CallContext,
        request: WriteBlocksRequest,
        request_block_size: u32,
    ) -> ResponseFuture<WriteBlocksResponse> {
        let inner = &self.inner;

        let factor = match inner.verify_block_size(request_block_size) {
            Ok(factor) => factor,
            Err(err) => return ResponseFuture::ready(WriteBlocksResponse::from_error(err)),
        };

        // every payload buffer must be a whole number of storage blocks
        for region in &request.blocks {
            if region.is_empty() || region.len() % inner.storage_block_size as usize != 0 {
                return ResponseFuture::ready(WriteBlocksResponse::from_error(
                    AgentError::invalid_argument(format!(
                        "invalid buffer size: {} (storage block size = {})",
                        region.len(),
                        inner.storage_block_size
                    )),
                ));
            }
        }
        let bytes_count = sglist_byte_count(&request.blocks) as u64;
        if bytes_count == 0 {
            return ResponseFuture::ready(WriteBlocksResponse::from_error(
                AgentError::invalid_argument("empty request"),
            ));
        }
        let local_blocks = bytes_count / inner.storage_block_size as u64;
        if let Err(err) = inner.verify_request_size(bytes_count, local_blocks) {
            return ResponseFuture::ready(WriteBlocksResponse::from_error(err));
        }

        let payload = match inner.stage_write_payload(request.blocks, bytes_count as usize) {
            Ok(payload) => payload,
            Err(err) => return ResponseFuture::ready(WriteBlocksResponse::from_error(err)),
        };
        let sglist = match payload {
            WritePayload::Pooled(buffer) => vec![buffer.freeze()],
            WritePayload::Direct(blocks) => blocks,
        };
        let sglist = if inner.normalize && sglist.len() as u64 != local_blocks {
            match sglist_normalize(sglist, inner.storage_block_size) {
                Ok(sglist) => sglist,
                Err(err) => return ResponseFuture::ready(WriteBlocksResponse::from_error(err)),
            }
        } else {
            sglist
        };

        let local_request = WriteBlocksLocalRequest {
            disk_id: request.disk_id,
            session_id: request.session_id,
            start_index: request.start_index * factor as u64,
            blocks_count: local_blocks as u32,
            block_size: inner.storage_block_size,
            flags: request.flags,
            sglist,
        };

        let (promise, future) = Promise::new();
        let id = inner.write_tracker.register_request(now, promise.clone());

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let local_response = inner.storage.write_blocks_local(ctx, local_request).await;
            inner.write_tracker.unregister_request(id);

            let response = match local_response.error {
                Some(err) => WriteBlocksResponse::from_error(err),
                None => WriteBlocksResponse::default(),
            };
            promise.try_set(response);
        });

        future
    }

    /// Submit a zero-fill; equal block sizes pass through untouched
    pub fn zero_blocks(
        &self,
        now: Instant,
        ctx: CallContext,
        request: ZeroBlocksRequest,
        request_block_size: u32,
    ) -> ResponseFuture<ZeroBlocksResponse> {
        let inner = &self.inner;

        let factor = match inner.verify_block_size(request_block_size) {
            Ok(factor) => factor,
            Err(err) => return ResponseFuture::ready(ZeroBlocksResponse::from_error(err)),
        };

        let local_request = if factor == 1 {
            // same addressing on both sides; the engine bounds-checks ranges
            request
        } else {
            let local_blocks = request.blocks_count as u64 * factor as u64;
            let bytes_count = local_blocks * inner.storage_block_size as u64;
            if let Err(err) = inner.verify_request_size(bytes_count, local_blocks) {
                return ResponseFuture::ready(ZeroBlocksResponse::from_error(err));
            }
            ZeroBlocksRequest {
                start_index: request.start_index * factor as u64,
                blocks_count: local_blocks as u32,
                ..request
            }
        };

        let (promise, future) = Promise::new();
        let id = inner.zero_tracker.register_request(now, promise.clone());

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let response = inner.storage.zero_blocks(ctx, local_request).await;
            inner.zero_tracker.unregister_request(id);
            promise.try_set(response);
        });

        future
    }

    /// Erase the device; pass-through, neither size-bounded nor tracked
    pub async fn erase_device(&self, method: EraseMethod) -> Result<()> {
        self.inner.storage.erase_device(method).await
    }

    /// Fail every operation that outlived the configured request duration
    ///
    /// Returns the number of operations failed. Each one bumps the engine's
    /// I/O error counter and resolves with an `Io` error; a racing normal
    /// completion later finds the promise consumed and is dropped.
    pub fn check_io_timeouts(&self, now: Instant) -> usize {
        let inner = &self.inner;
        fail_timed_out(&inner.read_tracker, inner.storage.as_ref(), now)
            + fail_timed_out(&inner.write_tracker, inner.storage.as_ref(), now)
            + fail_timed_out(&inner.zero_tracker, inner.storage.as_ref(), now)
    }

    /// Wait for inflight operations to drain, up to the configured timeout
    ///
    /// Returns the number of operations still pending when the wait ended;
    /// zero means a clean drain.
    pub async fn shutdown(&self, timer: &dyn Timer) -> usize {
        self.shutdown_with_timeout(timer, self.shutdown_timeout).await
    }

    pub async fn shutdown_with_timeout(&self, timer: &dyn Timer, timeout: Duration) -> usize {
        let deadline = timer.now() + timeout;

        while timer.now() < deadline {
            let remaining = self.inflight_count();
            if remaining == 0 {
                info!("Shutdown: all inflight requests drained");
                return 0;
            }
            timer.sleep(timeout / 100).await;
        }

        let remaining = self.inflight_count();
        if remaining > 0 {
            warn!(
                "Shutdown: {} inflight requests still pending after {:?}",
                remaining, timeout
            );
        }
        remaining
    }
}

impl Drop for StorageAdapter {
    fn drop(&mut self) {
        let remaining = self.inflight_count();
        if remaining > 0 {
            warn!("StorageAdapter dropped with {} inflight requests", remaining);
        }
    }
}

impl AdapterInner {
    /// Check the client block size and return the blocks-per-block factor
    fn verify_block_size(&self, block_size: u32) -> Result<u32> {
        if block_size < self.storage_block_size || block_size % self.storage_block_size != 0 {
            return Err(AgentError::invalid_argument(format!(
                "invalid block size: {} (storage block size = {})",
                block_size, self.storage_block_size
            )));
        }
        Ok(block_size / self.storage_block_size)
    }

    fn verify_request_size(&self, bytes_count: u64, local_blocks: u64) -> Result<()> {
        if local_blocks > u32::MAX as u64
            || (self.max_request_size != 0 && bytes_count > self.max_request_size)
        {
            return Err(AgentError::invalid_argument(format!(
                "invalid request size: {} (max request size = {})",
                bytes_count, self.max_request_size
            )));
        }
        Ok(())
    }

    /// Pick read target buffers: one pooled allocation when the engine
    /// grants one, otherwise per-block owned buffers
    ///
    /// Reshaping to storage-block granularity happens only when the
    /// normalize flag is set; otherwise the engine sees the pooled region
    /// as-is, or client-block-sized buffers.
    fn allocate_read_target(
        &self,
        bytes_count: usize,
        request_block_size: u32,
    ) -> Result<ReadTarget> {
        match self.storage.allocate_buffer(bytes_count) {
            Some(buffer) => {
                let sglist = if self.normalize {
                    sglist_normalize_mut(vec![buffer], self.storage_block_size)?
                } else {
                    vec![buffer]
                };
                Ok(ReadTarget::Pooled(GuardedSgList::new(sglist)))
            }
            None => {
                let bs = if self.normalize {
                    self.storage_block_size as usize
                } else {
                    request_block_size as usize
                };
                let sglist = (0..bytes_count / bs).map(|_| BytesMut::zeroed(bs)).collect();
                Ok(ReadTarget::Direct(GuardedSgList::new(sglist)))
            }
        }
    }

    /// Stage a write payload, copying into a pooled buffer when granted
    fn stage_write_payload(
        &self,
        blocks: SgList,
        bytes_count: usize,
    ) -> Result<WritePayload> {
        match self.storage.allocate_buffer(bytes_count) {
            Some(mut buffer) => {
                let mut offset = 0;
                for region in &blocks {
                    buffer[offset..offset + region.len()].copy_from_slice(region);
                    offset += region.len();
                }
                if offset != bytes_count {
                    return Err(AgentError::io(format!(
                        "failed to copy request buffer: {} bytes copied, {} expected",
                        offset, bytes_count
                    )));
                }
                Ok(WritePayload::Pooled(buffer))
            }
            None => Ok(WritePayload::Direct(blocks)),
        }
    }
}

/// Slice one contiguous buffer into client-sized response regions
fn slice_into_blocks(merged: bytes::Bytes, blocks_count: u32, request_block_size: usize) -> SgList {
    (0..blocks_count as usize)
        .map(|i| merged.slice(i * request_block_size..(i + 1) * request_block_size))
        .collect()
}

fn fail_timed_out<R: IoResponse>(
    tracker: &InflightTracker<R>,
    storage: &dyn Storage,
    now: Instant,
) -> usize {
    let timed_out = tracker.extract_timed_out(now);
    let count = timed_out.len();
    for request in timed_out {
        storage.report_io_error();
        request.promise.try_set(R::from_error(AgentError::io("io timeout")));
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageAdapterConfig;
    use crate::storage::StorageStub;

    fn adapter(config: StorageAdapterConfig) -> StorageAdapter {
        StorageAdapter::new(Arc::new(StorageStub), &config)
    }

    #[tokio::test]
    async fn test_read_rejects_small_block_size() {
        let adapter = adapter(StorageAdapterConfig::default());
        let response = adapter
            .read_blocks(
                Instant::now(),
                CallContext::next(),
                ReadBlocksRequest {
                    blocks_count: 1,
                    ..Default::default()
                },
                512,
            )
            .await;
        assert_eq!(
            response.error.unwrap().code(),
            crate::error::ErrorCode::InvalidArgument
        );
    }

    #[tokio::test]
    async fn test_read_rejects_unaligned_block_size() {
        let adapter = adapter(StorageAdapterConfig::default());
        let response = adapter
            .read_blocks(
                Instant::now(),
                CallContext::next(),
                ReadBlocksRequest {
                    blocks_count: 1,
                    ..Default::default()
                },
                4096 + 512,
            )
            .await;
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_request() {
        let adapter = adapter(StorageAdapterConfig {
            max_request_size: 4096,
            ..Default::default()
        });
        let blocks = vec![bytes::Bytes::from(vec![0u8; 8192])];
        let response = adapter
            .write_blocks(
                Instant::now(),
                CallContext::next(),
                WriteBlocksRequest {
                    blocks,
                    ..Default::default()
                },
                4096,
            )
            .await;
        assert_eq!(
            response.error.unwrap().code(),
            crate::error::ErrorCode::InvalidArgument
        );
    }

    #[tokio::test]
    async fn test_write_rejects_empty_payload() {
        let adapter = adapter(StorageAdapterConfig::default());
        let response = adapter
            .write_blocks(
                Instant::now(),
                CallContext::next(),
                WriteBlocksRequest::default(),
                4096,
            )
            .await;
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn test_zero_fast_path_succeeds() {
        let adapter = adapter(StorageAdapterConfig::default());
        let response = adapter
            .zero_blocks(
                Instant::now(),
                CallContext::next(),
                ZeroBlocksRequest {
                    blocks_count: 8,
                    ..Default::default()
                },
                4096,
            )
            .await;
        assert!(response.error.is_none());
    }

    #[test]
    fn test_read_target_reassembly() {
        // matching direct shape freezes in place
        let sglist = vec![BytesMut::zeroed(4096), BytesMut::zeroed(4096)];
        let target = ReadTarget::Direct(GuardedSgList::new(sglist));
        let blocks = target.into_blocks(2, 4096).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.len() == 4096));

        // four storage blocks folded into two client blocks
        let sglist = (0..4).map(|_| BytesMut::zeroed(4096)).collect();
        let target = ReadTarget::Direct(GuardedSgList::new(sglist));
        let blocks = target.into_blocks(2, 8192).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.len() == 8192));

        // pooled chunks merge without copying and re-slice
        let chunks = sglist_normalize_mut(vec![BytesMut::zeroed(4096 * 4)], 4096).unwrap();
        let target = ReadTarget::Pooled(GuardedSgList::new(chunks));
        let blocks = target.into_blocks(2, 8192).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.len() == 8192));

        // a closed list yields nothing
        let guarded = GuardedSgList::new(vec![BytesMut::zeroed(4096)]);
        guarded.close();
        let target = ReadTarget::Pooled(guarded);
        assert!(target.into_blocks(1, 4096).is_none());
    }
}
