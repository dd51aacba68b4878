// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Driver gateway: the attach/detach contract with the CSI driver.
//!
//! Only the contract matters to the reconcilers; the transport is a
//! deployment detail. [`UdsCsiClient`] provides a JSON-envelope client for
//! drivers reachable over a Unix domain socket; tests use
//! [`crate::testing::FakeCsi`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Errors returned by the driver gateway.
///
/// The display form is recorded verbatim in the attachment status, so
/// messages must be stable across retries of the same failure.
#[derive(Error, Debug)]
pub enum CsiError {
    /// The driver rejected or failed the operation.
    #[error("{0}")]
    Operation(String),

    /// The driver could not be reached.
    #[error("transport error: {0}")]
    Transport(String),
}

/// The attach/detach protocol boundary to the storage driver.
///
/// Both operations carry at-least-once semantics: the controller may
/// repeat a call after a partial failure, and the driver must treat a
/// repeated call for an already-completed operation as success.
#[async_trait]
pub trait CsiConnection: Send + Sync {
    /// Attaches a volume to a node.
    ///
    /// `existing_metadata` carries attachment metadata from a previous
    /// attempt as a hint; the driver may ignore it. Returns the metadata
    /// to persist in the attachment status.
    async fn attach(
        &self,
        volume_handle: &str,
        node_id: &str,
        read_only: bool,
        existing_metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<BTreeMap<String, String>, CsiError>;

    /// Detaches a volume from a node. Detaching an already-detached volume
    /// must succeed.
    async fn detach(&self, volume_handle: &str, node_id: &str) -> Result<(), CsiError>;
}

/// Request envelope for the UDS transport.
#[derive(Debug, Serialize, Deserialize)]
enum CsiRequest {
    Attach {
        volume_handle: String,
        node_id: String,
        read_only: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<BTreeMap<String, String>>,
    },
    Detach {
        volume_handle: String,
        node_id: String,
    },
}

/// Response envelope for the UDS transport.
#[derive(Debug, Serialize, Deserialize)]
enum CsiResponse {
    Attached {
        #[serde(default)]
        metadata: BTreeMap<String, String>,
    },
    Detached,
    Error {
        message: String,
    },
}

/// CSI client speaking a JSON envelope over a Unix domain socket.
///
/// Each call opens a fresh connection, writes one serialized request,
/// half-closes the stream, and reads the full response. The driver-side
/// endpoint is expected at a well-known socket path (conventionally
/// `/csi/csi.sock`).
pub struct UdsCsiClient {
    socket_path: PathBuf,
}

impl UdsCsiClient {
    /// Creates a client for the driver socket at the given path.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn request(&self, request: &CsiRequest) -> Result<CsiResponse, CsiError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| CsiError::Transport(e.to_string()))?;

        let payload = serde_json::to_vec(request)
            .map_err(|e| CsiError::Transport(format!("encoding request: {}", e)))?;
        stream
            .write_all(&payload)
            .await
            .map_err(|e| CsiError::Transport(e.to_string()))?;
        stream
            .shutdown()
            .await
            .map_err(|e| CsiError::Transport(e.to_string()))?;

        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .await
            .map_err(|e| CsiError::Transport(e.to_string()))?;

        serde_json::from_slice(&buf)
            .map_err(|e| CsiError::Transport(format!("decoding response: {}", e)))
    }
}

#[async_trait]
impl CsiConnection for UdsCsiClient {
    async fn attach(
        &self,
        volume_handle: &str,
        node_id: &str,
        read_only: bool,
        existing_metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<BTreeMap<String, String>, CsiError> {
        let request = CsiRequest::Attach {
            volume_handle: volume_handle.to_string(),
            node_id: node_id.to_string(),
            read_only,
            metadata: existing_metadata.cloned(),
        };
        match self.request(&request).await? {
            CsiResponse::Attached { metadata } => Ok(metadata),
            CsiResponse::Error { message } => Err(CsiError::Operation(message)),
            CsiResponse::Detached => Err(CsiError::Transport(
                "unexpected detach response to attach request".to_string(),
            )),
        }
    }

    async fn detach(&self, volume_handle: &str, node_id: &str) -> Result<(), CsiError> {
        let request = CsiRequest::Detach {
            volume_handle: volume_handle.to_string(),
            node_id: node_id.to_string(),
        };
        match self.request(&request).await? {
            CsiResponse::Detached => Ok(()),
            CsiResponse::Error { message } => Err(CsiError::Operation(message)),
            CsiResponse::Attached { .. } => Err(CsiError::Transport(
                "unexpected attach response to detach request".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope_roundtrip() {
        let request = CsiRequest::Attach {
            volume_handle: "vol-1".to_string(),
            node_id: "MyNodeID".to_string(),
            read_only: false,
            metadata: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        let decoded: CsiRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(decoded, CsiRequest::Attach { .. }));
    }

    #[test]
    fn test_error_message_is_verbatim() {
        let err = CsiError::Operation("mock error".to_string());
        assert_eq!(err.to_string(), "mock error");
    }

    #[tokio::test]
    async fn test_uds_client_against_stub_server() {
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("csi.sock");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            let request: CsiRequest = serde_json::from_slice(&buf).unwrap();
            let response = match request {
                CsiRequest::Attach { .. } => CsiResponse::Attached {
                    metadata: BTreeMap::new(),
                },
                CsiRequest::Detach { .. } => CsiResponse::Detached,
            };
            let payload = serde_json::to_vec(&response).unwrap();
            stream.write_all(&payload).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let client = UdsCsiClient::new(&path);
        let metadata = client.attach("vol-1", "MyNodeID", false, None).await.unwrap();
        assert!(metadata.is_empty());
    }
}
