//! Data-plane core for a disk agent serving physical devices to remote
//! volume controllers.
//!
//! Two cooperating halves:
//!
//! - the device session store ([`device_client`]) arbitrates which client
//!   may read or write each device, using volume-generation fencing so a
//!   stale controller can never displace a newer one;
//! - the block I/O adapter ([`storage_adapter`]) translates requests issued
//!   in a client's block size onto a storage engine with its own block
//!   size, tracks inflight operations, fails the ones that time out and
//!   drains them on shutdown.
//!
//! The [`agent`] facade wires both together and enforces the access policy
//! on every data-path call. Storage engines are supplied by the surrounding
//! process through the [`storage::Storage`] trait.
//!
//! # Example
//!
//! ```no_run
//! use disk_agent_core::agent::DiskAgentState;
//! use disk_agent_core::config::AgentConfig;
//! use disk_agent_core::storage::StorageStub;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # fn main() -> disk_agent_core::error::Result<()> {
//! let mut config = AgentConfig::default();
//! config.sessions.devices = vec!["uuid-1".to_string()];
//!
//! let mut storages: HashMap<String, Arc<dyn disk_agent_core::storage::Storage>> =
//!     HashMap::new();
//! storages.insert("uuid-1".to_string(), Arc::new(StorageStub));
//!
//! let agent = DiskAgentState::new(config, storages)?;
//! # let _ = agent;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod device_client;
pub mod error;
pub mod inflight;
pub mod models;
pub mod sglist;
pub mod storage;
pub mod storage_adapter;
pub mod testing;

pub use agent::DiskAgentState;
pub use config::{AgentConfig, DeviceClientConfig, StorageAdapterConfig};
pub use device_client::DeviceClient;
pub use error::{AgentError, ErrorCode, Result};
pub use models::{AccessMode, CallContext, ClientId, EraseMethod};
pub use storage::{Storage, StorageStub, Timer, WallClockTimer};
pub use storage_adapter::StorageAdapter;
