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

//! In-memory fakes for tests.
//!
//! [`FakeStore`] records every write attempt and can be scripted to fail
//! specific updates, mirroring the fake-client reactor pattern used to
//! test the partial-failure paths. [`FakeCsi`] scripts driver responses
//! and records every call.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume};
use k8s_openapi::api::storage::v1::VolumeAttachment;

use crate::csi::{CsiConnection, CsiError};
use crate::store::{ObjectStore, StoreError};

/// A recorded write attempt against the fake store, in order. Failed
/// attempts are recorded too, matching apiserver action traces.
#[derive(Debug, Clone)]
pub enum Action {
    /// An update of a `VolumeAttachment`, with the object as written.
    UpdateAttachment(VolumeAttachment),
    /// An update of a `PersistentVolume`, with the object as written.
    UpdateVolume(PersistentVolume),
}

impl Action {
    /// Lowercase resource of this action.
    pub fn resource(&self) -> &'static str {
        match self {
            Action::UpdateAttachment(_) => "volumeattachments",
            Action::UpdateVolume(_) => "persistentvolumes",
        }
    }
}

#[derive(Default)]
struct StoreState {
    attachments: HashMap<String, VolumeAttachment>,
    volumes: HashMap<String, PersistentVolume>,
    nodes: HashMap<String, Node>,
    actions: Vec<Action>,
    update_errors: HashMap<&'static str, VecDeque<StoreError>>,
    version_counter: u64,
}

/// In-memory [`ObjectStore`] with scripted write failures.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().expect("fake store mutex poisoned")
    }

    /// Seeds a `VolumeAttachment` without recording an action.
    pub fn put_volume_attachment(&self, va: VolumeAttachment) {
        let name = va.metadata.name.clone().unwrap_or_default();
        self.lock().attachments.insert(name, va);
    }

    /// Seeds a `PersistentVolume` without recording an action.
    pub fn put_persistent_volume(&self, pv: PersistentVolume) {
        let name = pv.metadata.name.clone().unwrap_or_default();
        self.lock().volumes.insert(name, pv);
    }

    /// Seeds a `Node` without recording an action.
    pub fn put_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.lock().nodes.insert(name, node);
    }

    /// Removes a `VolumeAttachment`, simulating external deletion.
    pub fn remove_volume_attachment(&self, name: &str) {
        self.lock().attachments.remove(name);
    }

    /// Scripts the next update of the given resource
    /// (`"volumeattachments"` or `"persistentvolumes"`) to fail with the
    /// error. Errors queue up; each failing update consumes one.
    pub fn push_update_error(&self, resource: &'static str, error: StoreError) {
        self.lock()
            .update_errors
            .entry(resource)
            .or_default()
            .push_back(error);
    }

    /// All recorded write attempts in order.
    pub fn actions(&self) -> Vec<Action> {
        self.lock().actions.clone()
    }

    fn take_update_error(state: &mut StoreState, resource: &'static str) -> Option<StoreError> {
        state
            .update_errors
            .get_mut(resource)
            .and_then(|queue| queue.pop_front())
    }

    fn next_version(state: &mut StoreState) -> String {
        state.version_counter += 1;
        state.version_counter.to_string()
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn volume_attachment(&self, name: &str) -> Result<Option<VolumeAttachment>, StoreError> {
        Ok(self.lock().attachments.get(name).cloned())
    }

    async fn list_volume_attachments(&self) -> Result<Vec<VolumeAttachment>, StoreError> {
        Ok(self.lock().attachments.values().cloned().collect())
    }

    async fn persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>, StoreError> {
        Ok(self.lock().volumes.get(name).cloned())
    }

    async fn node(&self, name: &str) -> Result<Option<Node>, StoreError> {
        Ok(self.lock().nodes.get(name).cloned())
    }

    async fn update_volume_attachment(
        &self,
        va: &VolumeAttachment,
    ) -> Result<VolumeAttachment, StoreError> {
        let mut state = self.lock();
        state.actions.push(Action::UpdateAttachment(va.clone()));
        if let Some(err) = Self::take_update_error(&mut state, "volumeattachments") {
            return Err(err);
        }
        let name = va.metadata.name.clone().unwrap_or_default();
        let mut stored = va.clone();
        stored.metadata.resource_version = Some(Self::next_version(&mut state));
        state.attachments.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update_persistent_volume(
        &self,
        pv: &PersistentVolume,
    ) -> Result<PersistentVolume, StoreError> {
        let mut state = self.lock();
        state.actions.push(Action::UpdateVolume(pv.clone()));
        if let Some(err) = Self::take_update_error(&mut state, "persistentvolumes") {
            return Err(err);
        }
        let name = pv.metadata.name.clone().unwrap_or_default();
        let mut stored = pv.clone();
        stored.metadata.resource_version = Some(Self::next_version(&mut state));
        state.volumes.insert(name, stored.clone());
        Ok(stored)
    }
}

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiCall {
    /// `"attach"` or `"detach"`.
    pub operation: &'static str,
    /// Volume handle passed to the driver.
    pub volume_handle: String,
    /// Node ID passed to the driver.
    pub node_id: String,
    /// Read-only flag (always false for detach).
    pub read_only: bool,
}

#[derive(Default)]
struct CsiState {
    attach_results: VecDeque<Result<BTreeMap<String, String>, CsiError>>,
    detach_results: VecDeque<Result<(), CsiError>>,
    calls: Vec<CsiCall>,
}

/// Scripted in-memory CSI driver. Unscripted calls succeed; attach
/// returns empty metadata.
#[derive(Default)]
pub struct FakeCsi {
    state: Mutex<CsiState>,
}

impl FakeCsi {
    /// Creates a driver where every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CsiState> {
        self.state.lock().expect("fake csi mutex poisoned")
    }

    /// Scripts the next attach call to fail with the given message.
    pub fn queue_attach_error(&self, message: &str) {
        self.lock()
            .attach_results
            .push_back(Err(CsiError::Operation(message.to_string())));
    }

    /// Scripts the next attach call to succeed with the given metadata.
    pub fn queue_attach_metadata(&self, metadata: BTreeMap<String, String>) {
        self.lock().attach_results.push_back(Ok(metadata));
    }

    /// Scripts the next detach call to fail with the given message.
    pub fn queue_detach_error(&self, message: &str) {
        self.lock()
            .detach_results
            .push_back(Err(CsiError::Operation(message.to_string())));
    }

    /// All driver calls in order.
    pub fn calls(&self) -> Vec<CsiCall> {
        self.lock().calls.clone()
    }
}

#[async_trait]
impl CsiConnection for FakeCsi {
    async fn attach(
        &self,
        volume_handle: &str,
        node_id: &str,
        read_only: bool,
        _existing_metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<BTreeMap<String, String>, CsiError> {
        let mut state = self.lock();
        state.calls.push(CsiCall {
            operation: "attach",
            volume_handle: volume_handle.to_string(),
            node_id: node_id.to_string(),
            read_only,
        });
        state
            .attach_results
            .pop_front()
            .unwrap_or_else(|| Ok(BTreeMap::new()))
    }

    async fn detach(&self, volume_handle: &str, node_id: &str) -> Result<(), CsiError> {
        let mut state = self.lock();
        state.calls.push(CsiCall {
            operation: "detach",
            volume_handle: volume_handle.to_string(),
            node_id: node_id.to_string(),
            read_only: false,
        });
        state.detach_results.pop_front().unwrap_or(Ok(()))
    }
}

/// Object builders shared by the attach/detach test suites.
pub mod fixtures {
    use k8s_openapi::api::core::v1::{
        CSIPersistentVolumeSource, Node, PersistentVolume, PersistentVolumeSpec,
    };
    use k8s_openapi::api::storage::v1::{
        VolumeAttachment, VolumeAttachmentSource, VolumeAttachmentSpec, VolumeAttachmentStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use k8s_openapi::chrono::Utc;
    use std::collections::BTreeMap;

    /// Driver name used across fixtures.
    pub const TEST_DRIVER: &str = "test";
    /// Volume name used across fixtures.
    pub const TEST_PV_NAME: &str = "pv1";
    /// Node name used across fixtures.
    pub const TEST_NODE_NAME: &str = "node1";
    /// Driver-opaque volume handle used across fixtures.
    pub const TEST_VOLUME_HANDLE: &str = "vol1";
    /// Attachment name used across fixtures.
    pub const TEST_VA_NAME: &str = "pv1-node1";
    /// Driver node ID published on the fixture node.
    pub const TEST_NODE_ID: &str = "MyNodeID";

    /// A CSI `PersistentVolume` of the test driver.
    pub fn pv() -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(TEST_PV_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                csi: Some(CSIPersistentVolumeSource {
                    driver: TEST_DRIVER.to_string(),
                    volume_handle: TEST_VOLUME_HANDLE.to_string(),
                    read_only: Some(false),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// The fixture volume carrying the controller finalizer.
    pub fn pv_with_finalizer() -> PersistentVolume {
        let mut pv = pv();
        pv.metadata.finalizers = Some(vec!["attacher-csi/test".to_string()]);
        pv
    }

    /// Appends extra finalizers to a volume.
    pub fn pv_with_finalizers(mut pv: PersistentVolume, extra: &[&str]) -> PersistentVolume {
        pv.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .extend(extra.iter().map(|f| f.to_string()));
        pv
    }

    /// Marks a volume for deletion.
    pub fn pv_deleted(mut pv: PersistentVolume) -> PersistentVolume {
        pv.metadata.deletion_timestamp = Some(Time(Utc::now()));
        pv
    }

    /// A node annotated with the test driver's node ID.
    pub fn node() -> Node {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "nodeid.csi.volume.kubernetes.io/test".to_string(),
            TEST_NODE_ID.to_string(),
        );
        Node {
            metadata: ObjectMeta {
                name: Some(TEST_NODE_NAME.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// A `VolumeAttachment` binding the fixture volume to the fixture
    /// node.
    pub fn va(attached: bool, finalizer: Option<&str>) -> VolumeAttachment {
        VolumeAttachment {
            metadata: ObjectMeta {
                name: Some(TEST_VA_NAME.to_string()),
                finalizers: finalizer.map(|f| vec![f.to_string()]),
                ..Default::default()
            },
            spec: VolumeAttachmentSpec {
                attacher: TEST_DRIVER.to_string(),
                node_name: TEST_NODE_NAME.to_string(),
                source: VolumeAttachmentSource {
                    persistent_volume_name: Some(TEST_PV_NAME.to_string()),
                    ..Default::default()
                },
            },
            status: Some(VolumeAttachmentStatus {
                attached,
                ..Default::default()
            }),
        }
    }

    /// Clears the volume reference of an attachment.
    pub fn va_with_no_pv_reference(mut va: VolumeAttachment) -> VolumeAttachment {
        va.spec.source.persistent_volume_name = Some(String::new());
        va
    }

    /// Points an attachment at an unknown driver.
    pub fn va_with_other_driver(mut va: VolumeAttachment) -> VolumeAttachment {
        va.spec.attacher = "unknown.driver".to_string();
        va
    }

    /// Marks an attachment for deletion.
    pub fn deleted(mut va: VolumeAttachment) -> VolumeAttachment {
        va.metadata.deletion_timestamp = Some(Time(Utc::now()));
        va
    }
}
