//! Disk agent core facade
//!
//! Owns the device session store and one block I/O adapter per device, and
//! enforces the access policy on every data-path call: reads need a read
//! session, writes and zero-fills need a write session, and a disabled
//! device fails everything with an I/O error so callers treat it as broken
//! hardware rather than a policy decision.

use crate::config::AgentConfig;
use crate::device_client::{DeviceClient, SessionInfo};
use crate::error::{AgentError, Result};
use crate::models::{
    AccessMode, CallContext, EraseMethod, ReadBlocksRequest, WriteBlocksRequest, ZeroBlocksRequest,
};
use crate::sglist::SgList;
use crate::storage::{Storage, Timer};
use crate::storage_adapter::StorageAdapter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Read request addressed to one device
#[derive(Debug, Clone, Default)]
pub struct ReadDeviceBlocksRequest {
    pub device_uuid: String,
    pub client_id: String,
    pub start_index: u64,
    pub blocks_count: u32,
    pub block_size: u32,
}

/// Write request addressed to one device
#[derive(Debug, Clone, Default)]
pub struct WriteDeviceBlocksRequest {
    pub device_uuid: String,
    pub client_id: String,
    pub start_index: u64,
    pub block_size: u32,
    pub blocks: SgList,
}

/// Zero-fill request addressed to one device
#[derive(Debug, Clone, Default)]
pub struct ZeroDeviceBlocksRequest {
    pub device_uuid: String,
    pub client_id: String,
    pub start_index: u64,
    pub blocks_count: u32,
    pub block_size: u32,
}

struct DeviceBackend {
    adapter: StorageAdapter,
}

/// Top-level state of the agent data plane
pub struct DiskAgentState {
    device_client: DeviceClient,
    backends: HashMap<String, DeviceBackend>,
}

impl std::fmt::Debug for DiskAgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskAgentState")
            .field("devices", &self.backends.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl DiskAgentState {
    /// Build the agent state from configuration and per-device engines
    ///
    /// Every configured device uuid must come with a storage engine.
    pub fn new(config: AgentConfig, storages: HashMap<String, Arc<dyn Storage>>) -> Result<Self> {
        config.validate()?;

        let mut backends = HashMap::with_capacity(config.sessions.devices.len());
        for uuid in &config.sessions.devices {
            let storage = storages.get(uuid).cloned().ok_or_else(|| {
                AgentError::invalid_argument(format!(
                    "no storage engine for configured device {:?}",
                    uuid
                ))
            })?;
            backends.insert(
                uuid.clone(),
                DeviceBackend {
                    adapter: StorageAdapter::new(storage, &config.adapter),
                },
            );
        }

        let device_client = DeviceClient::new(
            config.sessions.release_inactive_sessions_timeout(),
            config.sessions.devices.clone(),
        );

        info!("Disk agent initialized with {} devices", backends.len());

        Ok(Self {
            device_client,
            backends,
        })
    }

    fn backend(&self, uuid: &str) -> Result<&DeviceBackend> {
        self.backends
            .get(uuid)
            .ok_or_else(|| AgentError::not_found(format!("Device \"{}\" not found", uuid)))
    }

    fn check_access(&self, uuid: &str, client_id: &str, mode: AccessMode) -> Result<()> {
        if self.device_client.is_device_disabled(uuid) {
            return Err(AgentError::io(format!("Device \"{}\" is disabled", uuid)));
        }
        let client_id = crate::models::ClientId::parse(client_id)?;
        self.device_client.access_device(uuid, &client_id, mode)
    }

    /// Read blocks from a device; needs at least a read session
    pub async fn read_device_blocks(
        &self,
        now: Instant,
        ctx: CallContext,
        request: ReadDeviceBlocksRequest,
    ) -> Result<SgList> {
        let backend = self.backend(&request.device_uuid)?;
        self.check_access(&request.device_uuid, &request.client_id, AccessMode::ReadOnly)?;

        let response = backend
            .adapter
            .read_blocks(
                now,
                ctx,
                ReadBlocksRequest {
                    start_index: request.start_index,
                    blocks_count: request.blocks_count,
                    ..Default::default()
                },
                request.block_size,
            )
            .await;

        match response.error {
            Some(err) => Err(err),
            None => Ok(response.blocks),
        }
    }

    /// Write blocks to a device; needs the write session
    pub async fn write_device_blocks(
        &self,
        now: Instant,
        ctx: CallContext,
        request: WriteDeviceBlocksRequest,
    ) -> Result<()> {
        let backend = self.backend(&request.device_uuid)?;
        self.check_access(
            &request.device_uuid,
            &request.client_id,
            AccessMode::ReadWrite,
        )?;

        let response = backend
            .adapter
            .write_blocks(
                now,
                ctx,
                WriteBlocksRequest {
                    start_index: request.start_index,
                    blocks: request.blocks,
                    ..Default::default()
                },
                request.block_size,
            )
            .await;

        match response.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Zero-fill a block range; needs the write session
    pub async fn zero_device_blocks(
        &self,
        now: Instant,
        ctx: CallContext,
        request: ZeroDeviceBlocksRequest,
    ) -> Result<()> {
        let backend = self.backend(&request.device_uuid)?;
        self.check_access(
            &request.device_uuid,
            &request.client_id,
            AccessMode::ReadWrite,
        )?;

        let response = backend
            .adapter
            .zero_blocks(
                now,
                ctx,
                ZeroBlocksRequest {
                    start_index: request.start_index,
                    blocks_count: request.blocks_count,
                    ..Default::default()
                },
                request.block_size,
            )
            .await;

        match response.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Erase a device; refused while any writer session is active
    pub async fn secure_erase_device(&self, uuid: &str, method: EraseMethod) -> Result<()> {
        let backend = self.backend(uuid)?;

        if let Some(writer) = self.device_client.get_writer_session(uuid) {
            return Err(AgentError::invalid_state(format!(
                "Device \"{}\" is acquired for writing by client {}",
                uuid, writer.client_id
            )));
        }

        info!("Secure erase of device {:?} ({:?})", uuid, method);
        backend.adapter.erase_device(method).await
    }

    /// Acquire device sessions for a client
    #[allow(clippy::too_many_arguments)]
    pub fn acquire_devices(
        &self,
        uuids: &[String],
        client_id: &str,
        now: Instant,
        access_mode: AccessMode,
        mount_seq_number: u64,
        disk_id: &str,
        volume_generation: u32,
    ) -> Result<()> {
        let client_id = crate::models::ClientId::parse(client_id)?;
        self.device_client.acquire_devices(
            uuids,
            &client_id,
            now,
            access_mode,
            mount_seq_number,
            disk_id,
            volume_generation,
        )
    }

    /// Release device sessions held by a client
    pub fn release_devices(
        &self,
        uuids: &[String],
        client_id: &str,
        disk_id: &str,
        volume_generation: u32,
    ) -> Result<()> {
        let client_id = crate::models::ClientId::parse(client_id)?;
        self.device_client
            .release_devices(uuids, &client_id, disk_id, volume_generation)
    }

    pub fn get_writer_session(&self, uuid: &str) -> Option<SessionInfo> {
        self.device_client.get_writer_session(uuid)
    }

    pub fn get_reader_sessions(&self, uuid: &str) -> Vec<SessionInfo> {
        self.device_client.get_reader_sessions(uuid)
    }

    pub fn disable_device(&self, uuid: &str) {
        self.device_client.disable_device(uuid);
    }

    pub fn enable_device(&self, uuid: &str) {
        self.device_client.enable_device(uuid);
    }

    pub fn is_device_disabled(&self, uuid: &str) -> bool {
        self.device_client.is_device_disabled(uuid)
    }

    /// Fail timed-out operations on every device, returning the total count
    pub fn check_io_timeouts(&self, now: Instant) -> usize {
        self.backends
            .values()
            .map(|backend| backend.adapter.check_io_timeouts(now))
            .sum()
    }

    /// Drain every adapter, returning the number of operations left pending
    pub async fn shutdown(&self, timer: &dyn Timer) -> usize {
        let mut remaining = 0;
        for backend in self.backends.values() {
            remaining += backend.adapter.shutdown(timer).await;
        }
        remaining
    }
}
