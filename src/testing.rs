//! Test doubles: programmable and in-memory storage engines, tick clock
//!
//! Public so integration tests and downstream consumers can exercise the
//! adapter and facade without real hardware.

use crate::error::Result;
use crate::models::{
    CallContext, EraseMethod, IoResponse, ReadBlocksLocalRequest, ReadBlocksLocalResponse,
    WriteBlocksLocalRequest, WriteBlocksLocalResponse, ZeroBlocksRequest, ZeroBlocksResponse,
};
use crate::storage::{Storage, Timer};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

type BoxFuture<R> = Pin<Box<dyn Future<Output = R> + Send>>;

type Handler<Req, Resp> = Box<dyn Fn(CallContext, Req) -> BoxFuture<Resp> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Storage engine with per-operation programmable handlers
///
/// Unset handlers complete immediately with an empty successful response.
/// `report_io_error` calls are counted for assertions.
#[derive(Default)]
pub struct TestStorage {
    read_handler: Mutex<Option<Handler<ReadBlocksLocalRequest, ReadBlocksLocalResponse>>>,
    write_handler: Mutex<Option<Handler<WriteBlocksLocalRequest, WriteBlocksLocalResponse>>>,
    zero_handler: Mutex<Option<Handler<ZeroBlocksRequest, ZeroBlocksResponse>>>,
    pooled: AtomicBool,
    error_count: AtomicUsize,
}

impl TestStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(CallContext, ReadBlocksLocalRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReadBlocksLocalResponse> + Send + 'static,
    {
        *lock(&self.read_handler) = Some(Box::new(move |ctx, req| Box::pin(handler(ctx, req))));
    }

    pub fn set_write_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(CallContext, WriteBlocksLocalRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WriteBlocksLocalResponse> + Send + 'static,
    {
        *lock(&self.write_handler) = Some(Box::new(move |ctx, req| Box::pin(handler(ctx, req))));
    }

    pub fn set_zero_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(CallContext, ZeroBlocksRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ZeroBlocksResponse> + Send + 'static,
    {
        *lock(&self.zero_handler) = Some(Box::new(move |ctx, req| Box::pin(handler(ctx, req))));
    }

    /// Grant pooled buffers from `allocate_buffer`
    pub fn enable_buffer_pool(&self) {
        self.pooled.store(true, Ordering::Relaxed);
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Storage for TestStorage {
    async fn read_blocks_local(
        &self,
        ctx: CallContext,
        request: ReadBlocksLocalRequest,
    ) -> ReadBlocksLocalResponse {
        let future = lock(&self.read_handler)
            .as_ref()
            .map(|handler| handler(ctx, request));
        match future {
            Some(future) => future.await,
            None => ReadBlocksLocalResponse::default(),
        }
    }

    async fn write_blocks_local(
        &self,
        ctx: CallContext,
        request: WriteBlocksLocalRequest,
    ) -> WriteBlocksLocalResponse {
        let future = lock(&self.write_handler)
            .as_ref()
            .map(|handler| handler(ctx, request));
        match future {
            Some(future) => future.await,
            None => WriteBlocksLocalResponse::default(),
        }
    }

    async fn zero_blocks(
        &self,
        ctx: CallContext,
        request: ZeroBlocksRequest,
    ) -> ZeroBlocksResponse {
        let future = lock(&self.zero_handler)
            .as_ref()
            .map(|handler| handler(ctx, request));
        match future {
            Some(future) => future.await,
            None => ZeroBlocksResponse::default(),
        }
    }

    async fn erase_device(&self, _method: EraseMethod) -> Result<()> {
        Ok(())
    }

    fn allocate_buffer(&self, bytes_count: usize) -> Option<BytesMut> {
        if self.pooled.load(Ordering::Relaxed) {
            Some(BytesMut::zeroed(bytes_count))
        } else {
            None
        }
    }

    fn report_io_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// In-memory block device for round-trip tests
pub struct MemoryStorage {
    block_size: u32,
    data: Mutex<Vec<u8>>,
    pooled: bool,
    error_count: AtomicUsize,
}

impl MemoryStorage {
    pub fn new(block_size: u32, blocks_count: u64, pooled: bool) -> Self {
        Self {
            block_size,
            data: Mutex::new(vec![0; (block_size as u64 * blocks_count) as usize]),
            pooled,
            error_count: AtomicUsize::new(0),
        }
    }

    fn range(&self, start_index: u64, bytes_count: usize) -> Result<std::ops::Range<usize>> {
        let offset = (start_index * self.block_size as u64) as usize;
        let end = offset + bytes_count;
        if end > lock(&self.data).len() {
            return Err(crate::error::AgentError::invalid_argument(format!(
                "request out of bounds: [{}, {})",
                offset, end
            )));
        }
        Ok(offset..end)
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read_blocks_local(
        &self,
        _ctx: CallContext,
        request: ReadBlocksLocalRequest,
    ) -> ReadBlocksLocalResponse {
        let mut guard = match request.sglist.acquire() {
            Some(guard) => guard,
            None => {
                return ReadBlocksLocalResponse::from_error(crate::error::AgentError::io(
                    "request buffers already reclaimed",
                ))
            }
        };

        let bytes_count = crate::sglist::sglist_mut_byte_count(&guard);
        let range = match self.range(request.start_index, bytes_count) {
            Ok(range) => range,
            Err(err) => return ReadBlocksLocalResponse::from_error(err),
        };

        let data = lock(&self.data);
        let mut offset = range.start;
        for region in guard.iter_mut() {
            let len = region.len();
            region.copy_from_slice(&data[offset..offset + len]);
            offset += len;
        }
        ReadBlocksLocalResponse::default()
    }

    async fn write_blocks_local(
        &self,
        _ctx: CallContext,
        request: WriteBlocksLocalRequest,
    ) -> WriteBlocksLocalResponse {
        let bytes_count = crate::sglist::sglist_byte_count(&request.sglist);
        let range = match self.range(request.start_index, bytes_count) {
            Ok(range) => range,
            Err(err) => return WriteBlocksLocalResponse::from_error(err),
        };

        let mut data = lock(&self.data);
        let mut offset = range.start;
        for region in &request.sglist {
            data[offset..offset + region.len()].copy_from_slice(region);
            offset += region.len();
        }
        WriteBlocksLocalResponse::default()
    }

    async fn zero_blocks(
        &self,
        _ctx: CallContext,
        request: ZeroBlocksRequest,
    ) -> ZeroBlocksResponse {
        let bytes_count = request.blocks_count as usize * self.block_size as usize;
        let range = match self.range(request.start_index, bytes_count) {
            Ok(range) => range,
            Err(err) => return ZeroBlocksResponse::from_error(err),
        };

        lock(&self.data)[range].fill(0);
        ZeroBlocksResponse::default()
    }

    async fn erase_device(&self, _method: EraseMethod) -> Result<()> {
        lock(&self.data).fill(0);
        Ok(())
    }

    fn allocate_buffer(&self, bytes_count: usize) -> Option<BytesMut> {
        if self.pooled {
            Some(BytesMut::zeroed(bytes_count))
        } else {
            None
        }
    }

    fn report_io_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Deterministic clock advancing a fixed step on every `now` call
///
/// Each call may also fire one queued callback, which lets tests complete
/// hanging operations at a chosen point inside a polling loop. `sleep`
/// yields once so spawned tasks get to run between polls.
pub struct TickTimer {
    current: Mutex<Instant>,
    step: Duration,
    callbacks: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
}

impl TickTimer {
    pub fn new(start: Instant, step: Duration) -> Self {
        Self {
            current: Mutex::new(start),
            step,
            callbacks: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a callback to run on an upcoming `now` call
    pub fn on_tick(&self, callback: impl FnOnce() + Send + 'static) {
        lock(&self.callbacks).push_back(Box::new(callback));
    }
}

#[async_trait]
impl Timer for TickTimer {
    fn now(&self) -> Instant {
        let now = {
            let mut current = lock(&self.current);
            *current += self.step;
            *current
        };
        let callback = lock(&self.callbacks).pop_front();
        if let Some(callback) = callback {
            callback();
        }
        now
    }

    async fn sleep(&self, _duration: Duration) {
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_timer_advances_per_call() {
        let start = Instant::now();
        let timer = TickTimer::new(start, Duration::from_secs(1));

        assert_eq!(timer.now(), start + Duration::from_secs(1));
        assert_eq!(timer.now(), start + Duration::from_secs(2));
    }

    #[test]
    fn test_tick_timer_runs_queued_callbacks() {
        let timer = TickTimer::new(Instant::now(), Duration::from_secs(1));
        let fired = std::sync::Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        timer.on_tick(move || flag.store(true, Ordering::Relaxed));

        assert!(!fired.load(Ordering::Relaxed));
        timer.now();
        assert!(fired.load(Ordering::Relaxed));
    }
}
