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

//! Driver-specific naming contracts and the node-ID resolver.
//!
//! A CSI driver identifies a compute node by an opaque string published as
//! a node annotation. This module resolves that identifier and builds the
//! finalizer and annotation names that are namespaced by driver.

use k8s_openapi::api::core::v1::Node;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Prefix of the annotation that carries the driver's node ID.
pub const NODE_ID_ANNOTATION_BASE: &str = "nodeid.csi.volume.kubernetes.io";

/// Prefix of the finalizer this controller places on `VolumeAttachment`
/// and `PersistentVolume` objects.
pub const FINALIZER_PREFIX: &str = "attacher-csi";

/// Errors resolving a node's driver-specific identity.
#[derive(Error, Debug)]
pub enum IdentityError {
    /// The node does not carry the driver's node-ID annotation, so the
    /// driver cannot address it. Terminal for this attempt; retried when
    /// the node is re-registered.
    #[error("node \"{0}\" has no NodeID annotation")]
    MissingNodeId(String),
}

/// Replaces any character that is not allowed in an annotation name suffix
/// with `_`. Driver names may contain `/` or `.` which would otherwise
/// produce an invalid annotation key.
pub fn sanitize_driver_name(driver: &str) -> String {
    driver
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Returns the annotation key under which the given driver publishes its
/// node ID.
pub fn node_id_annotation(driver: &str) -> String {
    format!("{}/{}", NODE_ID_ANNOTATION_BASE, sanitize_driver_name(driver))
}

/// Returns the finalizer string this controller uses for the given driver,
/// applied identically to `VolumeAttachment` and `PersistentVolume`
/// objects.
pub fn finalizer_name(driver: &str) -> String {
    format!("{}/{}", FINALIZER_PREFIX, driver)
}

/// Resolves the driver-specific node ID from a node's annotations.
pub fn node_id_from_node(node: &Node, driver: &str) -> Result<String, IdentityError> {
    let key = node_id_annotation(driver);
    node.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(&key))
        .map(|id| id.to_string())
        .ok_or_else(|| {
            IdentityError::MissingNodeId(node.metadata.name.clone().unwrap_or_default())
        })
}

/// Derives the deterministic `VolumeAttachment` name for a driver, volume
/// handle and node. The name is a SHA-256 over the triple so it stays
/// within the 253-character object name limit regardless of input length.
pub fn attachment_name(driver: &str, volume_handle: &str, node: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(driver.as_bytes());
    hasher.update(volume_handle.as_bytes());
    hasher.update(node.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("csi-{}", hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn node_with_annotations(name: &str, annotations: BTreeMap<String, String>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_sanitize_driver_name() {
        assert_eq!(sanitize_driver_name("foo/bar"), "foo_bar");
        assert_eq!(sanitize_driver_name("io.kubernetes.csi"), "io_kubernetes_csi");
        assert_eq!(sanitize_driver_name("plain-driver"), "plain-driver");
    }

    #[test]
    fn test_node_id_resolution() {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "nodeid.csi.volume.kubernetes.io/foo_bar".to_string(),
            "MyNodeID".to_string(),
        );
        let node = node_with_annotations("node1", annotations);

        assert_eq!(node_id_from_node(&node, "foo/bar").unwrap(), "MyNodeID");
    }

    #[test]
    fn test_missing_node_id_annotation() {
        let node = node_with_annotations("node1", BTreeMap::new());
        let err = node_id_from_node(&node, "foo/bar").unwrap_err();
        assert_eq!(err.to_string(), "node \"node1\" has no NodeID annotation");
    }

    #[test]
    fn test_finalizer_name() {
        assert_eq!(finalizer_name("test"), "attacher-csi/test");
    }

    #[test]
    fn test_attachment_name_is_deterministic() {
        let a = attachment_name("driver", "vol-1", "node1");
        let b = attachment_name("driver", "vol-1", "node1");
        let c = attachment_name("driver", "vol-2", "node1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("csi-"));
        assert_eq!(a.len(), 4 + 64);
    }
}
