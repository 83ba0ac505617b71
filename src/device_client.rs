//! Device session store
//!
//! Arbitrates which client may read or write each physical device. Every
//! device carries at most one exclusive writer session and any number of
//! reader sessions, plus a disk/generation fencing tag that rejects
//! operations from stale controllers. Devices are created once at startup
//! from a fixed uuid list and live for the process lifetime; each is
//! guarded by its own reader-writer lock and there is no global lock, so
//! multi-device calls are only per-device atomic.

use crate::error::{AgentError, Result};
use crate::models::{AccessMode, ClientId};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Snapshot of one session on a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub client_id: ClientId,
    pub last_activity: Instant,
    pub mount_seq_number: u64,
}

#[derive(Debug, Default)]
struct DeviceState {
    /// Last disk this device was associated with; set on every
    /// acquire/release commit, even when a previous call was denied
    disk_id: String,
    /// Last-seen generation for `disk_id`; 0 is never compared
    volume_generation: u32,
    writer_session: Option<SessionInfo>,
    reader_sessions: Vec<SessionInfo>,
    disabled: bool,
}

impl DeviceState {
    /// Fencing check shared by acquire and release
    fn is_stale_generation(&self, disk_id: &str, volume_generation: u32) -> bool {
        self.disk_id == disk_id
            && self.volume_generation > volume_generation
            // backwards compat: generation 0 is never fenced
            && volume_generation != 0
    }

    fn find_reader(&self, client_id: &ClientId) -> Option<usize> {
        self.reader_sessions
            .iter()
            .position(|s| s.client_id == *client_id)
    }

    fn writer_id(&self) -> Option<&ClientId> {
        self.writer_session.as_ref().map(|s| &s.client_id)
    }
}

/// Per-device session registry with fencing-token arbitration
pub struct DeviceClient {
    release_inactive_sessions_timeout: Duration,
    devices: HashMap<String, RwLock<DeviceState>>,
}

impl DeviceClient {
    /// Build the registry from the fixed device uuid list
    pub fn new(release_inactive_sessions_timeout: Duration, uuids: Vec<String>) -> Self {
        let devices = uuids
            .into_iter()
            .map(|uuid| (uuid, RwLock::new(DeviceState::default())))
            .collect();
        Self {
            release_inactive_sessions_timeout,
            devices,
        }
    }

    fn device(&self, uuid: &str) -> Option<&RwLock<DeviceState>> {
        self.devices.get(uuid)
    }

    fn read_device(lock: &RwLock<DeviceState>) -> RwLockReadGuard<'_, DeviceState> {
        lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_device(lock: &RwLock<DeviceState>) -> RwLockWriteGuard<'_, DeviceState> {
        lock.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire sessions on a set of devices for one client
    ///
    /// Runs a validate pass (read lock per device) over all uuids first and
    /// aborts on the first failure, then a commit pass (write lock per
    /// device). The two passes do not hold a lock across the whole set:
    /// concurrent multi-device acquisitions over overlapping sets are only
    /// per-device atomic, not transactional.
    #[allow(clippy::too_many_arguments)]
    pub fn acquire_devices(
        &self,
        uuids: &[String],
        client_id: &ClientId,
        now: Instant,
        access_mode: AccessMode,
        mount_seq_number: u64,
        disk_id: &str,
        volume_generation: u32,
    ) -> Result<()> {
        client_id.validate()?;

        for uuid in uuids {
            let device = self
                .device(uuid)
                .ok_or_else(|| AgentError::not_found(format!("Device \"{}\" not found", uuid)))?;

            let state = Self::read_device(device);

            if state.is_stale_generation(disk_id, volume_generation) {
                warn!(
                    "AcquireDevices: outdated volume generation, DiskId={:?}, \
                     VolumeGeneration: {}, LastGeneration: {}",
                    disk_id, volume_generation, state.volume_generation
                );
                return Err(AgentError::invalid_session(format!(
                    "AcquireDevices: outdated volume generation, DiskId={:?}, \
                     VolumeGeneration: {}, LastGeneration: {}",
                    disk_id, volume_generation, state.volume_generation
                )));
            }

            if access_mode.is_read_write() {
                if let Some(writer) = &state.writer_session {
                    let still_active =
                        writer.last_activity + self.release_inactive_sessions_timeout > now;
                    if writer.client_id != *client_id
                        && writer.mount_seq_number >= mount_seq_number
                        && still_active
                    {
                        return Err(AgentError::invalid_session(format!(
                            "Device \"{}\" already acquired by another client: {}",
                            uuid, writer.client_id
                        )));
                    }
                }
            }
        }

        for uuid in uuids {
            // validated above; devices are never removed
            let device = match self.device(uuid) {
                Some(device) => device,
                None => continue,
            };

            let mut state = Self::write_device(device);

            state.disk_id = disk_id.to_string();
            state.volume_generation = volume_generation;

            if !access_mode.is_read_write() {
                if state.writer_id() == Some(client_id) {
                    state.writer_session = None;
                    info!(
                        "Device {:?} was released by client {} for writing.",
                        uuid, client_id
                    );
                }

                match state.find_reader(client_id) {
                    None => {
                        state.reader_sessions.push(SessionInfo {
                            client_id: client_id.clone(),
                            last_activity: now,
                            mount_seq_number: 0,
                        });
                        info!(
                            "Device {:?} was acquired by client {} for reading.",
                            uuid, client_id
                        );
                    }
                    Some(idx) => {
                        let reader = &mut state.reader_sessions[idx];
                        // activity only ever moves forward
                        if now > reader.last_activity {
                            reader.last_activity = now;
                        }
                    }
                }
            } else {
                if let Some(idx) = state.find_reader(client_id) {
                    state.reader_sessions.remove(idx);
                    info!(
                        "Device {:?} was released by client {} for reading.",
                        uuid, client_id
                    );
                }

                if state.writer_id() != Some(client_id) {
                    info!(
                        "Device {:?} was acquired by client {} for writing.",
                        uuid, client_id
                    );
                }

                let last_activity = state
                    .writer_session
                    .as_ref()
                    .map(|w| w.last_activity.max(now))
                    .unwrap_or(now);
                state.writer_session = Some(SessionInfo {
                    client_id: client_id.clone(),
                    last_activity,
                    mount_seq_number,
                });
            }
        }

        Ok(())
    }

    /// Release sessions on a set of devices
    ///
    /// Best-effort single pass: unknown devices are skipped. The first
    /// fencing failure returns immediately and devices later in the list
    /// are not processed, even though earlier devices already committed;
    /// this partial-application-then-abort matches the long-observed
    /// behavior and is deliberately preserved.
    pub fn release_devices(
        &self,
        uuids: &[String],
        client_id: &ClientId,
        disk_id: &str,
        volume_generation: u32,
    ) -> Result<()> {
        client_id.validate()?;

        for uuid in uuids {
            let device = match self.device(uuid) {
                Some(device) => device,
                None => {
                    warn!("ReleaseDevices: unknown device {:?}, skipping", uuid);
                    continue;
                }
            };

            let mut state = Self::write_device(device);

            if state.is_stale_generation(disk_id, volume_generation) {
                return Err(AgentError::invalid_state(format!(
                    "ReleaseDevices: outdated volume generation, DiskId={:?}, \
                     VolumeGeneration: {}, LastGeneration: {}",
                    disk_id, volume_generation, state.volume_generation
                )));
            }

            state.disk_id = disk_id.to_string();
            state.volume_generation = volume_generation;

            if let Some(idx) = state.find_reader(client_id) {
                state.reader_sessions.remove(idx);
                info!(
                    "Device {:?} was released by client {} for reading.",
                    uuid, client_id
                );
            } else if state.writer_id() == Some(client_id) || *client_id == ClientId::AnyWriter {
                if state.writer_session.take().is_some() {
                    info!(
                        "Device {:?} was released by client {} for writing.",
                        uuid, client_id
                    );
                }
            }
        }

        Ok(())
    }

    /// Check whether a client may access a device in the given mode
    pub fn access_device(
        &self,
        uuid: &str,
        client_id: &ClientId,
        access_mode: AccessMode,
    ) -> Result<()> {
        client_id.validate()?;

        let device = self
            .device(uuid)
            .ok_or_else(|| AgentError::not_found(format!("Device \"{}\" not found", uuid)))?;

        let state = Self::read_device(device);

        let acquired = match client_id {
            // migration writes are fine while the device is unacquired;
            // migration may be in progress even for an unmounted volume
            ClientId::BackgroundOps => {
                !access_mode.is_read_write() || state.writer_session.is_none()
            }
            ClientId::CheckHealth => access_mode == AccessMode::ReadOnly,
            other => {
                state.writer_id() == Some(other)
                    || (!access_mode.is_read_write() && state.find_reader(other).is_some())
            }
        };

        if !acquired {
            let writer = state
                .writer_id()
                .map(|id| id.to_string())
                .unwrap_or_default();
            return Err(AgentError::invalid_session(format!(
                "Device \"{}\" not acquired by client {}, current active writer: {}",
                uuid, client_id, writer
            )));
        }

        Ok(())
    }

    /// Snapshot of the writer session; `None` for unknown devices
    pub fn get_writer_session(&self, uuid: &str) -> Option<SessionInfo> {
        self.device(uuid)
            .and_then(|device| Self::read_device(device).writer_session.clone())
    }

    /// Snapshot of the reader sessions; empty for unknown devices
    pub fn get_reader_sessions(&self, uuid: &str) -> Vec<SessionInfo> {
        self.device(uuid)
            .map(|device| Self::read_device(device).reader_sessions.clone())
            .unwrap_or_default()
    }

    /// Administratively exclude a device; no-op on unknown uuids
    pub fn disable_device(&self, uuid: &str) {
        if let Some(device) = self.device(uuid) {
            Self::write_device(device).disabled = true;
            info!("Device {:?} disabled", uuid);
        }
    }

    pub fn enable_device(&self, uuid: &str) {
        if let Some(device) = self.device(uuid) {
            Self::write_device(device).disabled = false;
            info!("Device {:?} enabled", uuid);
        }
    }

    pub fn is_device_disabled(&self, uuid: &str) -> bool {
        self.device(uuid)
            .map(|device| Self::read_device(device).disabled)
            .unwrap_or(false)
    }

    /// Uuids known to this registry
    pub fn device_uuids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str) -> ClientId {
        ClientId::Regular(id.to_string())
    }

    fn new_client(uuids: &[&str]) -> DeviceClient {
        DeviceClient::new(
            Duration::from_secs(10),
            uuids.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_acquire_unknown_device() {
        let dc = new_client(&["d1"]);
        let err = dc
            .acquire_devices(
                &["nope".to_string()],
                &client("c1"),
                Instant::now(),
                AccessMode::ReadWrite,
                0,
                "vol0",
                1,
            )
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotFound);
    }

    #[test]
    fn test_empty_client_id_rejected() {
        let dc = new_client(&["d1"]);
        let err = dc
            .acquire_devices(
                &["d1".to_string()],
                &client(""),
                Instant::now(),
                AccessMode::ReadWrite,
                0,
                "vol0",
                1,
            )
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_reader_refresh_keeps_activity_monotonic() {
        let dc = new_client(&["d1"]);
        let uuids = vec!["d1".to_string()];
        let c = client("c1");
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(5);

        dc.acquire_devices(&uuids, &c, t1, AccessMode::ReadOnly, 0, "vol0", 1)
            .unwrap();
        // an older timestamp must not move activity backwards
        dc.acquire_devices(&uuids, &c, t0, AccessMode::ReadOnly, 0, "vol0", 1)
            .unwrap();

        let readers = dc.get_reader_sessions("d1");
        assert_eq!(readers.len(), 1);
        assert_eq!(readers[0].last_activity, t1);
    }

    #[test]
    fn test_write_acquire_drops_reader_entry() {
        let dc = new_client(&["d1"]);
        let uuids = vec!["d1".to_string()];
        let c = client("c1");
        let now = Instant::now();

        dc.acquire_devices(&uuids, &c, now, AccessMode::ReadOnly, 0, "vol0", 1)
            .unwrap();
        dc.acquire_devices(&uuids, &c, now, AccessMode::ReadWrite, 1, "vol0", 1)
            .unwrap();

        assert!(dc.get_reader_sessions("d1").is_empty());
        assert_eq!(dc.get_writer_session("d1").unwrap().client_id, c);
    }

    #[test]
    fn test_disable_enable_roundtrip() {
        let dc = new_client(&["d1"]);
        assert!(!dc.is_device_disabled("d1"));
        dc.disable_device("d1");
        assert!(dc.is_device_disabled("d1"));
        dc.enable_device("d1");
        assert!(!dc.is_device_disabled("d1"));

        // unknown uuids: mutators no-op, reader answers false
        dc.disable_device("nope");
        assert!(!dc.is_device_disabled("nope"));
    }
}
