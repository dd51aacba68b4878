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

//! Object store boundary.
//!
//! The reconciliation core reads volumes and nodes and conditionally
//! updates `VolumeAttachment` and `PersistentVolume` objects through this
//! trait. The production implementation talks to the apiserver
//! ([`crate::api_store::ApiStore`]); tests use an in-memory store
//! ([`crate::testing::FakeStore`]).

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use thiserror::Error;

/// Errors returned by an [`ObjectStore`].
///
/// `NotFound` is deliberately distinct from `Transient`: a missing object
/// is an input-resolution error recorded on the object status, while a
/// transient failure is retried.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The named object does not exist.
    #[error("{kind} \"{name}\" not found")]
    NotFound {
        /// Lowercase resource kind, e.g. `persistentvolume`.
        kind: &'static str,
        /// Object name.
        name: String,
    },

    /// A conditional update lost against a concurrent writer.
    #[error("conflict updating {kind} \"{name}\"")]
    Conflict {
        /// Lowercase resource kind.
        kind: &'static str,
        /// Object name.
        name: String,
    },

    /// Any other failure talking to the store.
    #[error("{0}")]
    Transient(String),
}

impl StoreError {
    /// Returns true if a write that failed with this error may be retried
    /// within the same reconciliation invocation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Transient(_))
    }
}

/// Read and conditional-update access to the control-plane objects the
/// attacher cares about.
///
/// Updates are conditional on the object's `resourceVersion`; a lost race
/// surfaces as [`StoreError::Conflict`] and must be retried by re-reading,
/// never overwritten blindly.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches a `VolumeAttachment` by name.
    async fn volume_attachment(&self, name: &str) -> Result<Option<VolumeAttachment>, StoreError>;

    /// Lists all `VolumeAttachment` objects.
    async fn list_volume_attachments(&self) -> Result<Vec<VolumeAttachment>, StoreError>;

    /// Fetches a `PersistentVolume` by name.
    async fn persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>, StoreError>;

    /// Fetches a `Node` by name.
    async fn node(&self, name: &str) -> Result<Option<Node>, StoreError>;

    /// Conditionally replaces a `VolumeAttachment`, returning the stored
    /// object.
    async fn update_volume_attachment(
        &self,
        va: &VolumeAttachment,
    ) -> Result<VolumeAttachment, StoreError>;

    /// Conditionally replaces a `PersistentVolume`, returning the stored
    /// object.
    async fn update_persistent_volume(
        &self,
        pv: &PersistentVolume,
    ) -> Result<PersistentVolume, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = StoreError::NotFound {
            kind: "persistentvolume",
            name: "pv1".to_string(),
        };
        assert_eq!(err.to_string(), "persistentvolume \"pv1\" not found");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::Conflict {
            kind: "volumeattachments",
            name: "va1".to_string()
        }
        .is_retryable());
        assert!(StoreError::Transient("connection reset".to_string()).is_retryable());
    }
}
