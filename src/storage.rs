//! External storage engine and clock interfaces
//!
//! The agent core never talks to hardware itself; it adapts requests onto a
//! [`Storage`] implementation provided by the surrounding process (AIO,
//! NVMe, SPDK backed). The engine is treated as opaque and already safe for
//! concurrent calls.

use crate::error::Result;
use crate::models::{
    CallContext, EraseMethod, ReadBlocksLocalRequest, ReadBlocksLocalResponse,
    WriteBlocksLocalRequest, WriteBlocksLocalResponse, ZeroBlocksRequest, ZeroBlocksResponse,
};
use async_trait::async_trait;
use bytes::BytesMut;
use std::time::{Duration, Instant};

/// Local storage engine consumed by the block I/O adapter
///
/// All I/O methods take a call-context token and a request and resolve to a
/// response carrying an embedded error. `report_io_error` is a
/// fire-and-forget operational counter bump.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read_blocks_local(
        &self,
        ctx: CallContext,
        request: ReadBlocksLocalRequest,
    ) -> ReadBlocksLocalResponse;

    async fn write_blocks_local(
        &self,
        ctx: CallContext,
        request: WriteBlocksLocalRequest,
    ) -> WriteBlocksLocalResponse;

    async fn zero_blocks(&self, ctx: CallContext, request: ZeroBlocksRequest)
        -> ZeroBlocksResponse;

    async fn erase_device(&self, method: EraseMethod) -> Result<()>;

    /// Request a pooled contiguous buffer of `bytes_count` zeroed bytes
    ///
    /// `None` means the pool declines and the caller falls back to its own
    /// scatter-gather buffers.
    fn allocate_buffer(&self, bytes_count: usize) -> Option<BytesMut>;

    fn report_io_error(&self);
}

/// No-op storage engine
///
/// Completes every call immediately with an empty successful response and
/// never grants pooled buffers.
pub struct StorageStub;

#[async_trait]
impl Storage for StorageStub {
    async fn read_blocks_local(
        &self,
        _ctx: CallContext,
        _request: ReadBlocksLocalRequest,
    ) -> ReadBlocksLocalResponse {
        ReadBlocksLocalResponse::default()
    }

    async fn write_blocks_local(
        &self,
        _ctx: CallContext,
        _request: WriteBlocksLocalRequest,
    ) -> WriteBlocksLocalResponse {
        WriteBlocksLocalResponse::default()
    }

    async fn zero_blocks(
        &self,
        _ctx: CallContext,
        _request: ZeroBlocksRequest,
    ) -> ZeroBlocksResponse {
        ZeroBlocksResponse::default()
    }

    async fn erase_device(&self, _method: EraseMethod) -> Result<()> {
        Ok(())
    }

    fn allocate_buffer(&self, _bytes_count: usize) -> Option<BytesMut> {
        None
    }

    fn report_io_error(&self) {}
}

/// Injected clock used by the shutdown polling loop
///
/// All other timestamps are supplied explicitly by callers, keeping time
/// fully controllable in tests.
#[async_trait]
pub trait Timer: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Timer backed by the system clock and the tokio runtime
#[derive(Debug, Default)]
pub struct WallClockTimer;

#[async_trait]
impl Timer for WallClockTimer {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
