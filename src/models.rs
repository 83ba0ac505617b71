//! Request, response and identity types shared across the agent core

use crate::error::AgentError;
use crate::sglist::{GuardedSgList, SgList};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Wire name of the background-operations client (migration, scrubbing)
pub const BACKGROUND_OPS_CLIENT_ID: &str = "background-ops";

/// Wire name of the health-check client (read-only probing)
pub const CHECK_HEALTH_CLIENT_ID: &str = "health-check";

/// Wire name of the administrative wildcard that force-clears a writer
pub const ANY_WRITER_CLIENT_ID: &str = "any-writer";

/// Identity of a client holding or requesting device sessions
///
/// The reserved identities are a closed set distinguished from arbitrary
/// caller-supplied ids, so the privileged code paths in the session store
/// are exhaustive matches rather than string comparisons.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientId {
    /// Ordinary caller-supplied client id (never empty)
    Regular(String),
    /// Privileged writes to unacquired devices (migration, scrubbing)
    BackgroundOps,
    /// Read-only probing regardless of acquisition state
    CheckHealth,
    /// Wildcard accepted only by release to force-clear a writer session
    AnyWriter,
}

impl ClientId {
    /// Parse a wire-level client id, mapping reserved names to their variants
    ///
    /// An empty id is rejected with `InvalidArgument`.
    pub fn parse(id: &str) -> Result<ClientId, AgentError> {
        match id {
            "" => Err(AgentError::invalid_argument("empty client id")),
            BACKGROUND_OPS_CLIENT_ID => Ok(ClientId::BackgroundOps),
            CHECK_HEALTH_CLIENT_ID => Ok(ClientId::CheckHealth),
            ANY_WRITER_CLIENT_ID => Ok(ClientId::AnyWriter),
            other => Ok(ClientId::Regular(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ClientId::Regular(id) => id,
            ClientId::BackgroundOps => BACKGROUND_OPS_CLIENT_ID,
            ClientId::CheckHealth => CHECK_HEALTH_CLIENT_ID,
            ClientId::AnyWriter => ANY_WRITER_CLIENT_ID,
        }
    }

    /// Validate that the id is usable as a session owner
    pub fn validate(&self) -> Result<(), AgentError> {
        match self {
            ClientId::Regular(id) if id.is_empty() => {
                Err(AgentError::invalid_argument("empty client id"))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        match id {
            BACKGROUND_OPS_CLIENT_ID => ClientId::BackgroundOps,
            CHECK_HEALTH_CLIENT_ID => ClientId::CheckHealth,
            ANY_WRITER_CLIENT_ID => ClientId::AnyWriter,
            other => ClientId::Regular(other.to_string()),
        }
    }
}

/// Access mode requested for a device session or a single I/O call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn is_read_write(&self) -> bool {
        matches!(self, AccessMode::ReadWrite)
    }
}

/// Device erase method forwarded verbatim to the storage engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EraseMethod {
    ZeroFill,
    UserDataErase,
    CryptoErase,
}

/// Opaque per-call token passed through to the storage engine
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub request_id: u64,
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl CallContext {
    pub fn new(request_id: u64) -> Self {
        Self { request_id }
    }

    /// Allocate a context with a fresh process-unique request id
    pub fn next() -> Self {
        Self {
            request_id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// Client-domain read request (indices in `request_block_size` units)
#[derive(Debug, Clone, Default)]
pub struct ReadBlocksRequest {
    pub disk_id: String,
    pub session_id: String,
    pub checkpoint_id: String,
    pub start_index: u64,
    pub blocks_count: u32,
    pub flags: u32,
}

/// Client-domain write request carrying the payload scatter-gather list
#[derive(Debug, Clone, Default)]
pub struct WriteBlocksRequest {
    pub disk_id: String,
    pub session_id: String,
    pub start_index: u64,
    pub blocks: SgList,
    pub flags: u32,
}

/// Client-domain zero request (no payload)
#[derive(Debug, Clone, Default)]
pub struct ZeroBlocksRequest {
    pub disk_id: String,
    pub session_id: String,
    pub start_index: u64,
    pub blocks_count: u32,
    pub flags: u32,
}

/// Storage-domain read request; the engine writes into `sglist`
#[derive(Debug, Clone, Default)]
pub struct ReadBlocksLocalRequest {
    pub disk_id: String,
    pub session_id: String,
    pub checkpoint_id: String,
    pub start_index: u64,
    pub blocks_count: u32,
    pub block_size: u32,
    pub flags: u32,
    pub sglist: GuardedSgList,
}

/// Storage-domain write request; `sglist` carries the payload
#[derive(Debug, Clone, Default)]
pub struct WriteBlocksLocalRequest {
    pub disk_id: String,
    pub session_id: String,
    pub start_index: u64,
    pub blocks_count: u32,
    pub block_size: u32,
    pub flags: u32,
    pub sglist: SgList,
}

/// Response to a client-domain read; `blocks` holds one entry per logical block
#[derive(Debug, Clone, Default)]
pub struct ReadBlocksResponse {
    pub error: Option<AgentError>,
    pub blocks: SgList,
}

#[derive(Debug, Clone, Default)]
pub struct WriteBlocksResponse {
    pub error: Option<AgentError>,
}

#[derive(Debug, Clone, Default)]
pub struct ZeroBlocksResponse {
    pub error: Option<AgentError>,
}

/// Storage-domain read response; data travels through the request's sglist
#[derive(Debug, Clone, Default)]
pub struct ReadBlocksLocalResponse {
    pub error: Option<AgentError>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteBlocksLocalResponse {
    pub error: Option<AgentError>,
}

/// Common view over I/O responses, used by generic timeout handling
pub trait IoResponse: Send + 'static {
    fn from_error(error: AgentError) -> Self;

    fn error(&self) -> Option<&AgentError>;

    fn has_error(&self) -> bool {
        self.error().is_some()
    }
}

impl IoResponse for ReadBlocksResponse {
    fn from_error(error: AgentError) -> Self {
        Self {
            error: Some(error),
            blocks: SgList::new(),
        }
    }

    fn error(&self) -> Option<&AgentError> {
        self.error.as_ref()
    }
}

impl IoResponse for WriteBlocksResponse {
    fn from_error(error: AgentError) -> Self {
        Self { error: Some(error) }
    }

    fn error(&self) -> Option<&AgentError> {
        self.error.as_ref()
    }
}

impl IoResponse for ReadBlocksLocalResponse {
    fn from_error(error: AgentError) -> Self {
        Self { error: Some(error) }
    }

    fn error(&self) -> Option<&AgentError> {
        self.error.as_ref()
    }
}

impl IoResponse for WriteBlocksLocalResponse {
    fn from_error(error: AgentError) -> Self {
        Self { error: Some(error) }
    }

    fn error(&self) -> Option<&AgentError> {
        self.error.as_ref()
    }
}

impl IoResponse for ZeroBlocksResponse {
    fn from_error(error: AgentError) -> Self {
        Self { error: Some(error) }
    }

    fn error(&self) -> Option<&AgentError> {
        self.error.as_ref()
    }
}
