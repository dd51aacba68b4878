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

//! Apiserver-backed [`ObjectStore`].
//!
//! Maps HTTP 409 to [`StoreError::Conflict`] and 404 to
//! [`StoreError::NotFound`] so the retry combinator and the reconcilers can
//! tell a lost write race from a genuinely missing object.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;

use crate::store::{ObjectStore, StoreError};

/// [`ObjectStore`] implementation backed by the Kubernetes apiserver.
pub struct ApiStore {
    attachments: Api<VolumeAttachment>,
    volumes: Api<PersistentVolume>,
    nodes: Api<Node>,
}

impl ApiStore {
    /// Creates a store from a Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self {
            attachments: Api::all(client.clone()),
            volumes: Api::all(client.clone()),
            nodes: Api::all(client),
        }
    }

    fn map_error(kind: &'static str, name: &str, err: kube::Error) -> StoreError {
        if let kube::Error::Api(ref response) = err {
            match response.code {
                404 => {
                    return StoreError::NotFound {
                        kind,
                        name: name.to_string(),
                    }
                }
                409 => {
                    return StoreError::Conflict {
                        kind,
                        name: name.to_string(),
                    }
                }
                _ => {}
            }
        }
        StoreError::Transient(err.to_string())
    }

    fn object_name(meta_name: &Option<String>, kind: &'static str) -> Result<String, StoreError> {
        meta_name
            .clone()
            .ok_or_else(|| StoreError::Transient(format!("{} object has no name", kind)))
    }
}

#[async_trait]
impl ObjectStore for ApiStore {
    async fn volume_attachment(&self, name: &str) -> Result<Option<VolumeAttachment>, StoreError> {
        self.attachments
            .get_opt(name)
            .await
            .map_err(|e| Self::map_error("volumeattachments", name, e))
    }

    async fn list_volume_attachments(&self) -> Result<Vec<VolumeAttachment>, StoreError> {
        let list = self
            .attachments
            .list(&ListParams::default())
            .await
            .map_err(|e| Self::map_error("volumeattachments", "", e))?;
        Ok(list.items)
    }

    async fn persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>, StoreError> {
        self.volumes
            .get_opt(name)
            .await
            .map_err(|e| Self::map_error("persistentvolume", name, e))
    }

    async fn node(&self, name: &str) -> Result<Option<Node>, StoreError> {
        self.nodes
            .get_opt(name)
            .await
            .map_err(|e| Self::map_error("node", name, e))
    }

    async fn update_volume_attachment(
        &self,
        va: &VolumeAttachment,
    ) -> Result<VolumeAttachment, StoreError> {
        let name = Self::object_name(&va.metadata.name, "volumeattachments")?;
        self.attachments
            .replace(&name, &PostParams::default(), va)
            .await
            .map_err(|e| Self::map_error("volumeattachments", &name, e))
    }

    async fn update_persistent_volume(
        &self,
        pv: &PersistentVolume,
    ) -> Result<PersistentVolume, StoreError> {
        let name = Self::object_name(&pv.metadata.name, "persistentvolume")?;
        self.volumes
            .replace(&name, &PostParams::default(), pv)
            .await
            .map_err(|e| Self::map_error("persistentvolume", &name, e))
    }
}
