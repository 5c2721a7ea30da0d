//! Delegating a build to another process.
//!
//! The requesting side serializes its [`BuildSettings`] into a
//! [`RemoteBuildRequest`] and hands it to a [`RemoteBuildPeer`]; the peer
//! runs the build and answers with a [`RemoteBuildResponse`] naming the
//! database it resolved. Both payloads carry [`REMOTE_PAYLOAD_VERSION`], and
//! a mismatch on either side is rejected rather than interpreted.

use serde::{Deserialize, Serialize};

use super::orchestrator::ResolvedDatabase;
use super::BuildSettings;

/// Version of the request/response payload format.
pub const REMOTE_PAYLOAD_VERSION: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    /// The channel to the peer failed.
    #[error("remote build transport failed: {0}")]
    Transport(String),

    #[error("remote build payload version {found} is not compatible with {expected}")]
    IncompatibleVersion { expected: u32, found: u32 },

    #[error("malformed remote build payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The peer ran the build and it failed.
    #[error("remote build failed: {0}")]
    Failed(String),
}

/// Request/response channel to a process that can build databases.
pub trait RemoteBuildPeer {
    fn send(&self, payload: &str) -> Result<String, RemoteError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBuildRequest {
    pub version: u32,
    pub settings: BuildSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBuildResponse {
    pub version: u32,
    pub result: Result<ResolvedDatabase, String>,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

/// Check the payload version before interpreting the rest of it.
fn check_version(payload: &str) -> Result<(), RemoteError> {
    let header: VersionHeader = serde_json::from_str(payload)?;
    if header.version != REMOTE_PAYLOAD_VERSION {
        return Err(RemoteError::IncompatibleVersion {
            expected: REMOTE_PAYLOAD_VERSION,
            found: header.version,
        });
    }
    Ok(())
}

impl RemoteBuildRequest {
    #[must_use]
    pub fn new(settings: BuildSettings) -> Self {
        Self {
            version: REMOTE_PAYLOAD_VERSION,
            settings,
        }
    }

    pub fn encode(&self) -> Result<String, RemoteError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self, RemoteError> {
        check_version(payload)?;
        Ok(serde_json::from_str(payload)?)
    }
}

impl RemoteBuildResponse {
    #[must_use]
    pub fn new(result: Result<ResolvedDatabase, String>) -> Self {
        Self {
            version: REMOTE_PAYLOAD_VERSION,
            result,
        }
    }

    pub fn encode(&self) -> Result<String, RemoteError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self, RemoteError> {
        check_version(payload)?;
        Ok(serde_json::from_str(payload)?)
    }

    pub fn into_resolved(self) -> Result<ResolvedDatabase, RemoteError> {
        self.result.map_err(RemoteError::Failed)
    }
}

/// Send `settings` to `peer` and return the database it resolved.
pub fn request_build(
    peer: &dyn RemoteBuildPeer,
    settings: &BuildSettings,
) -> Result<ResolvedDatabase, RemoteError> {
    let payload = RemoteBuildRequest::new(settings.clone()).encode()?;
    let reply = peer.send(&payload)?;
    RemoteBuildResponse::decode(&reply)?.into_resolved()
}
