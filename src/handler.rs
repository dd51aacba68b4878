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

//! The attach and detach state machines and the volume finalizer
//! reclaimer.
//!
//! Every step here is idempotent: a sync that fails part-way is retried
//! from the top by the work queue, and writes happen in a fixed order
//! (attachment finalizer, then volume finalizer, then status) so that a
//! crash between steps always leaves a safely-retryable state.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::{VolumeAttachment, VolumeError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::csi::CsiConnection;
use crate::finalizer::{add_finalizer, has_finalizer, remove_finalizer};
use crate::identity::{finalizer_name, node_id_from_node};
use crate::retry::{update_with_retry, RetryPolicy};
use crate::store::{ObjectStore, StoreError};

/// Errors surfaced from a reconciliation sync. The work queue requeues the
/// key with backoff on any error.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Attach could not complete; the message is also recorded in the
    /// attachment status where applicable.
    #[error("{0}")]
    Attach(String),

    /// Detach could not complete.
    #[error("{0}")]
    Detach(String),

    /// A store read or write failed before any status could be recorded.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reconciles `VolumeAttachment` objects against the CSI driver and
/// reclaims `PersistentVolume` finalizers.
pub struct CsiHandler {
    driver: String,
    finalizer: String,
    store: Arc<dyn ObjectStore>,
    csi: Arc<dyn CsiConnection>,
    retry: RetryPolicy,
}

fn is_attached(va: &VolumeAttachment) -> bool {
    va.status.as_ref().map(|s| s.attached).unwrap_or(false)
}

fn va_name(va: &VolumeAttachment) -> String {
    va.metadata.name.clone().unwrap_or_default()
}

fn volume_error(message: &str) -> VolumeError {
    VolumeError {
        message: Some(message.to_string()),
        time: Some(Time(Utc::now())),
    }
}

impl CsiHandler {
    /// Creates a handler for the given driver name.
    pub fn new(
        driver: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        csi: Arc<dyn CsiConnection>,
        retry: RetryPolicy,
    ) -> Self {
        let driver = driver.into();
        let finalizer = finalizer_name(&driver);
        Self {
            driver,
            finalizer,
            store,
            csi,
            retry,
        }
    }

    /// Returns the driver this handler serves.
    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Returns the finalizer string this handler manages.
    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }

    /// Drives a `VolumeAttachment` toward its desired state: attach when
    /// the object is live, detach when it is marked for deletion.
    pub async fn sync_attachment(&self, va: &VolumeAttachment) -> Result<(), HandlerError> {
        if va.metadata.deletion_timestamp.is_none() {
            self.attach(va).await
        } else {
            self.detach(va).await
        }
    }

    async fn attach(&self, va: &VolumeAttachment) -> Result<(), HandlerError> {
        let name = va_name(va);
        if is_attached(va) {
            debug!(attachment = %name, "already attached");
            return Ok(());
        }

        // The attachment finalizer is saved before anything else so that a
        // crash later never leaves an attached volume without a finalizer
        // blocking object deletion.
        if let Err(err) = self.ensure_attachment_finalizer(&name, va).await {
            let message = format!("could not add VolumeAttachment finalizer: {}", err);
            self.record_attach_error(&name, &message).await;
            return Err(HandlerError::Attach(message));
        }

        let pv_name = match va
            .spec
            .source
            .persistent_volume_name
            .clone()
            .filter(|n| !n.is_empty())
        {
            Some(pv_name) => pv_name,
            None => {
                let message = "VolumeAttachment.spec.persistentVolumeName is empty".to_string();
                self.record_attach_error(&name, &message).await;
                return Err(HandlerError::Attach(message));
            }
        };

        let pv = match self.store.persistent_volume(&pv_name).await? {
            Some(pv) => pv,
            None => {
                let message = format!("persistentvolume \"{}\" not found", pv_name);
                self.record_attach_error(&name, &message).await;
                return Err(HandlerError::Attach(message));
            }
        };

        if pv.metadata.deletion_timestamp.is_some() {
            let message = format!("PersistentVolume \"{}\" is marked for deletion", pv_name);
            self.record_attach_error(&name, &message).await;
            return Err(HandlerError::Attach(message));
        }

        // Volume finalizer is added strictly after the attachment
        // finalizer.
        if let Err(err) = self.ensure_volume_finalizer(&pv_name, &pv).await {
            let message = format!("could not add PersistentVolume finalizer: {}", err);
            self.record_attach_error(&name, &message).await;
            return Err(HandlerError::Attach(message));
        }

        let source = match pv.spec.as_ref().and_then(|spec| spec.csi.as_ref()) {
            Some(source) => source.clone(),
            None => {
                let message = format!("persistentvolume \"{}\" is not a CSI volume", pv_name);
                self.record_attach_error(&name, &message).await;
                return Err(HandlerError::Attach(message));
            }
        };

        let node = match self.store.node(&va.spec.node_name).await? {
            Some(node) => node,
            None => {
                let message = format!("node \"{}\" not found", va.spec.node_name);
                self.record_attach_error(&name, &message).await;
                return Err(HandlerError::Attach(message));
            }
        };

        let node_id = match node_id_from_node(&node, &self.driver) {
            Ok(node_id) => node_id,
            Err(err) => {
                let message = err.to_string();
                self.record_attach_error(&name, &message).await;
                return Err(HandlerError::Attach(message));
            }
        };

        let metadata_hint = va.status.as_ref().and_then(|s| s.attachment_metadata.clone());
        let read_only = source.read_only.unwrap_or(false);

        match self
            .csi
            .attach(&source.volume_handle, &node_id, read_only, metadata_hint.as_ref())
            .await
        {
            Ok(metadata) => {
                if let Err(err) = self.mark_attached(&name, metadata).await {
                    // No status write for this failure: the whole sync is
                    // retried from the top and the driver call repeated,
                    // which attach must tolerate.
                    let message = format!("could not mark as attached: {}", err);
                    return Err(HandlerError::Attach(message));
                }
                info!(attachment = %name, volume = %pv_name, node = %va.spec.node_name, "attached");
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                self.record_attach_error(&name, &message).await;
                Err(HandlerError::Attach(message))
            }
        }
    }

    async fn detach(&self, va: &VolumeAttachment) -> Result<(), HandlerError> {
        let name = va_name(va);
        if !is_attached(va) {
            // Terminal detach state; the object is left for its owner to
            // garbage-collect.
            debug!(attachment = %name, "already detached");
            return Ok(());
        }

        let pv_name = match va
            .spec
            .source
            .persistent_volume_name
            .clone()
            .filter(|n| !n.is_empty())
        {
            Some(pv_name) => pv_name,
            None => {
                let message = "VolumeAttachment.spec.persistentVolumeName is empty".to_string();
                self.record_detach_error(&name, &message).await;
                return Err(HandlerError::Detach(message));
            }
        };

        let pv = match self.store.persistent_volume(&pv_name).await? {
            Some(pv) => pv,
            None => {
                let message = format!("persistentvolume \"{}\" not found", pv_name);
                self.record_detach_error(&name, &message).await;
                return Err(HandlerError::Detach(message));
            }
        };

        let source = match pv.spec.as_ref().and_then(|spec| spec.csi.as_ref()) {
            Some(source) => source.clone(),
            None => {
                let message = format!("persistentvolume \"{}\" is not a CSI volume", pv_name);
                self.record_detach_error(&name, &message).await;
                return Err(HandlerError::Detach(message));
            }
        };

        let node = match self.store.node(&va.spec.node_name).await? {
            Some(node) => node,
            None => {
                let message = format!("node \"{}\" not found", va.spec.node_name);
                self.record_detach_error(&name, &message).await;
                return Err(HandlerError::Detach(message));
            }
        };

        let node_id = match node_id_from_node(&node, &self.driver) {
            Ok(node_id) => node_id,
            Err(err) => {
                let message = err.to_string();
                self.record_detach_error(&name, &message).await;
                return Err(HandlerError::Detach(message));
            }
        };

        if let Err(err) = self.csi.detach(&source.volume_handle, &node_id).await {
            let message = err.to_string();
            self.record_detach_error(&name, &message).await;
            return Err(HandlerError::Detach(message));
        }

        if let Err(err) = self.mark_detached(&name).await {
            let message = format!("could not mark as detached: {}", err);
            self.record_detach_error(&name, &message).await;
            return Err(HandlerError::Detach(message));
        }
        info!(attachment = %name, volume = %pv_name, node = %va.spec.node_name, "detached");
        Ok(())
    }

    /// Removes this controller's finalizer from a `PersistentVolume` once
    /// the volume is marked for deletion and no attachment of this driver
    /// references it any more.
    pub async fn sync_persistent_volume(&self, name: &str) -> Result<(), HandlerError> {
        let Some(pv) = self.store.persistent_volume(name).await? else {
            return Ok(());
        };
        if !has_finalizer(&pv.metadata, &self.finalizer) {
            return Ok(());
        }
        if pv.metadata.deletion_timestamp.is_none() {
            return Ok(());
        }

        let attachments = self.store.list_volume_attachments().await?;
        let referenced = attachments.iter().any(|va| {
            va.spec.attacher == self.driver
                && va.spec.source.persistent_volume_name.as_deref() == Some(name)
        });
        if referenced {
            debug!(volume = %name, "still referenced by a VolumeAttachment, keeping finalizer");
            return Ok(());
        }

        match self
            .update_volume(name, |pv| remove_finalizer(&mut pv.metadata, &self.finalizer))
            .await
        {
            Ok(_) => {
                info!(volume = %name, "removed finalizer");
                Ok(())
            }
            // The volume disappeared under us; nothing left to reclaim.
            Err(StoreError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn ensure_attachment_finalizer(
        &self,
        name: &str,
        va: &VolumeAttachment,
    ) -> Result<(), StoreError> {
        if has_finalizer(&va.metadata, &self.finalizer) {
            return Ok(());
        }
        self.update_attachment(name, |va| add_finalizer(&mut va.metadata, &self.finalizer))
            .await
            .map(|_| ())
    }

    async fn ensure_volume_finalizer(
        &self,
        name: &str,
        pv: &PersistentVolume,
    ) -> Result<(), StoreError> {
        if has_finalizer(&pv.metadata, &self.finalizer) {
            return Ok(());
        }
        self.update_volume(name, |pv| add_finalizer(&mut pv.metadata, &self.finalizer))
            .await
            .map(|_| ())
    }

    async fn mark_attached(
        &self,
        name: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let desired_metadata = if metadata.is_empty() {
            None
        } else {
            Some(metadata)
        };
        self.update_attachment(name, |va| {
            let status = va.status.get_or_insert_with(Default::default);
            let changed = !status.attached
                || status.attach_error.is_some()
                || status.attachment_metadata != desired_metadata;
            status.attached = true;
            status.attach_error = None;
            status.attachment_metadata = desired_metadata.clone();
            changed
        })
        .await
        .map(|_| ())
    }

    async fn mark_detached(&self, name: &str) -> Result<(), StoreError> {
        // One combined write: once detach succeeded the finalizer must go
        // in the same update that records attached=false, so there is no
        // window where the object is detached but still undeletable.
        let result = self
            .update_attachment(name, |va| {
                let mut changed = remove_finalizer(&mut va.metadata, &self.finalizer);
                let status = va.status.get_or_insert_with(Default::default);
                if status.attached {
                    status.attached = false;
                    changed = true;
                }
                if status.detach_error.is_some() {
                    status.detach_error = None;
                    changed = true;
                }
                changed
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            // Deleted out from under us; detach already reached its goal.
            Err(StoreError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn write_attach_error(&self, name: &str, message: &str) -> Result<(), StoreError> {
        self.update_attachment(name, |va| {
            let status = va.status.get_or_insert_with(Default::default);
            // Duplicate error states collapse into no write.
            if status.attach_error.as_ref().and_then(|e| e.message.as_deref()) == Some(message) {
                return false;
            }
            status.attach_error = Some(volume_error(message));
            true
        })
        .await
        .map(|_| ())
    }

    async fn write_detach_error(&self, name: &str, message: &str) -> Result<(), StoreError> {
        self.update_attachment(name, |va| {
            let status = va.status.get_or_insert_with(Default::default);
            if status.detach_error.as_ref().and_then(|e| e.message.as_deref()) == Some(message) {
                return false;
            }
            status.detach_error = Some(volume_error(message));
            true
        })
        .await
        .map(|_| ())
    }

    async fn record_attach_error(&self, name: &str, message: &str) {
        if let Err(err) = self.write_attach_error(name, message).await {
            warn!(attachment = %name, error = %err, "failed to persist attach error");
        }
    }

    async fn record_detach_error(&self, name: &str, message: &str) {
        if let Err(err) = self.write_detach_error(name, message).await {
            warn!(attachment = %name, error = %err, "failed to persist detach error");
        }
    }

    async fn update_attachment<F>(
        &self,
        name: &str,
        apply: F,
    ) -> Result<Option<VolumeAttachment>, StoreError>
    where
        F: Fn(&mut VolumeAttachment) -> bool,
    {
        let store = &self.store;
        update_with_retry(
            &self.retry,
            || async {
                store.volume_attachment(name).await?.ok_or_else(|| StoreError::NotFound {
                    kind: "volumeattachments",
                    name: name.to_string(),
                })
            },
            apply,
            |va| async move { store.update_volume_attachment(&va).await },
        )
        .await
    }

    async fn update_volume<F>(
        &self,
        name: &str,
        apply: F,
    ) -> Result<Option<PersistentVolume>, StoreError>
    where
        F: Fn(&mut PersistentVolume) -> bool,
    {
        let store = &self.store;
        update_with_retry(
            &self.retry,
            || async {
                store.persistent_volume(name).await?.ok_or_else(|| StoreError::NotFound {
                    kind: "persistentvolume",
                    name: name.to_string(),
                })
            },
            apply,
            |pv| async move { store.update_persistent_volume(&pv).await },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, FakeCsi, FakeStore};

    fn handler(store: Arc<FakeStore>, csi: Arc<FakeCsi>) -> CsiHandler {
        CsiHandler::new(
            "test",
            store,
            csi,
            RetryPolicy {
                max_attempts: 3,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(2),
            },
        )
    }

    #[tokio::test]
    async fn test_attach_is_noop_when_already_attached() {
        let store = Arc::new(FakeStore::new());
        store.put_persistent_volume(fixtures::pv_with_finalizer());
        store.put_node(fixtures::node());
        let csi = Arc::new(FakeCsi::new());
        let h = handler(store.clone(), csi.clone());

        let va = fixtures::va(true, Some("attacher-csi/test"));
        store.put_volume_attachment(va.clone());
        h.sync_attachment(&va).await.unwrap();

        assert!(csi.calls().is_empty());
        assert!(store.actions().is_empty());
    }

    #[tokio::test]
    async fn test_missing_node_writes_error_without_driver_call() {
        let store = Arc::new(FakeStore::new());
        store.put_persistent_volume(fixtures::pv_with_finalizer());
        let csi = Arc::new(FakeCsi::new());
        let h = handler(store.clone(), csi.clone());

        let va = fixtures::va(false, Some("attacher-csi/test"));
        store.put_volume_attachment(va.clone());
        let err = h.sync_attachment(&va).await.unwrap_err();

        assert_eq!(err.to_string(), "node \"node1\" not found");
        assert!(csi.calls().is_empty());
        let stored = store.volume_attachment("pv1-node1").await.unwrap().unwrap();
        assert_eq!(
            stored
                .status
                .unwrap()
                .attach_error
                .unwrap()
                .message
                .as_deref(),
            Some("node \"node1\" not found")
        );
    }

    #[tokio::test]
    async fn test_duplicate_error_collapses_to_no_write() {
        let store = Arc::new(FakeStore::new());
        let csi = Arc::new(FakeCsi::new());
        let h = handler(store.clone(), csi.clone());

        let va = fixtures::va(false, Some("attacher-csi/test"));
        store.put_volume_attachment(va.clone());

        // PV is missing: both syncs resolve to the same error message.
        let _ = h.sync_attachment(&va).await;
        let writes_after_first = store.actions().len();
        let stored = store.volume_attachment("pv1-node1").await.unwrap().unwrap();
        let _ = h.sync_attachment(&stored).await;

        assert_eq!(store.actions().len(), writes_after_first);
    }
}
