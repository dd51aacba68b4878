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

//! The attach/detach controller: event dispatch, worker pools and the
//! periodic resync loop.
//!
//! Watch events are reduced to object names and pushed through two
//! [`WorkQueue`]s, one for `VolumeAttachment` keys and one for
//! `PersistentVolume` keys. Workers re-fetch the object by name before
//! syncing, so a stale event can never roll back state written by a newer
//! one.

use std::sync::Arc;

use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::runtime::watcher::Event;
use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AttacherConfig;
use crate::finalizer::has_finalizer;
use crate::handler::CsiHandler;
use crate::store::ObjectStore;
use crate::workqueue::WorkQueue;

/// Watches attachment and volume events and drives them through the
/// [`CsiHandler`] with a pool of workers per queue.
pub struct AttachDetachController {
    config: AttacherConfig,
    store: Arc<dyn ObjectStore>,
    handler: Arc<CsiHandler>,
    va_queue: WorkQueue<String>,
    pv_queue: WorkQueue<String>,
}

impl AttachDetachController {
    /// Creates a controller around an object store and handler.
    pub fn new(
        config: AttacherConfig,
        store: Arc<dyn ObjectStore>,
        handler: Arc<CsiHandler>,
    ) -> Self {
        Self {
            config,
            store,
            handler,
            va_queue: WorkQueue::new(),
            pv_queue: WorkQueue::new(),
        }
    }

    /// Handles a `VolumeAttachment` add or update event.
    pub fn attachment_changed(&self, va: &VolumeAttachment) {
        if va.spec.attacher != self.config.driver {
            return;
        }
        if let Some(name) = va.metadata.name.as_deref() {
            debug!(attachment = %name, "enqueueing attachment");
            self.va_queue.add(name.to_string());
        }
    }

    /// Handles a `VolumeAttachment` delete event. The referenced volume is
    /// re-evaluated because the deleted attachment may have been the last
    /// one pinning its finalizer.
    pub fn attachment_deleted(&self, va: &VolumeAttachment) {
        if va.spec.attacher != self.config.driver {
            return;
        }
        if let Some(pv_name) = va
            .spec
            .source
            .persistent_volume_name
            .as_deref()
            .filter(|n| !n.is_empty())
        {
            debug!(volume = %pv_name, "attachment deleted, re-evaluating volume finalizer");
            self.pv_queue.add(pv_name.to_string());
        }
    }

    /// Handles a `PersistentVolume` add or update event. Only volumes
    /// carrying this controller's finalizer are of interest.
    pub fn volume_changed(&self, pv: &PersistentVolume) {
        if !has_finalizer(&pv.metadata, self.handler.finalizer()) {
            return;
        }
        if let Some(name) = pv.metadata.name.as_deref() {
            debug!(volume = %name, "enqueueing volume");
            self.pv_queue.add(name.to_string());
        }
    }

    /// Routes one `VolumeAttachment` watch event. Initial-listing pages
    /// are treated like regular updates. Returns true when the initial
    /// listing has been fully delivered, so the caller can flip
    /// readiness.
    pub fn handle_attachment_event(&self, event: Event<VolumeAttachment>) -> bool {
        match event {
            Event::Apply(va) | Event::InitApply(va) => {
                self.attachment_changed(&va);
                false
            }
            Event::Delete(va) => {
                self.attachment_deleted(&va);
                false
            }
            Event::Init => false,
            Event::InitDone => true,
        }
    }

    /// Routes one `PersistentVolume` watch event. Deletes need no
    /// handling: a deleted volume has no finalizer left to reclaim.
    pub fn handle_volume_event(&self, event: Event<PersistentVolume>) {
        match event {
            Event::Apply(pv) | Event::InitApply(pv) => self.volume_changed(&pv),
            Event::Delete(_) | Event::Init | Event::InitDone => {}
        }
    }

    /// Syncs one attachment key: re-fetches the object and runs the
    /// attach or detach state machine. A key whose object is gone is a
    /// successful no-op.
    pub async fn sync_attachment_key(&self, key: &str) -> bool {
        let va = match self.store.volume_attachment(key).await {
            Ok(Some(va)) => va,
            Ok(None) => {
                debug!(attachment = %key, "attachment no longer exists");
                return true;
            }
            Err(err) => {
                warn!(attachment = %key, error = %err, "failed to fetch attachment");
                return false;
            }
        };
        if va.spec.attacher != self.config.driver {
            return true;
        }
        match self.handler.sync_attachment(&va).await {
            Ok(()) => true,
            Err(err) => {
                warn!(attachment = %key, error = %err, "attachment sync failed");
                false
            }
        }
    }

    /// Syncs one volume key through the finalizer reclaimer.
    pub async fn sync_volume_key(&self, key: &str) -> bool {
        match self.handler.sync_persistent_volume(key).await {
            Ok(()) => true,
            Err(err) => {
                warn!(volume = %key, error = %err, "volume sync failed");
                false
            }
        }
    }

    async fn va_worker(self: Arc<Self>) {
        while let Some(key) = self.va_queue.next().await {
            if self.sync_attachment_key(&key).await {
                self.va_queue.forget(&key);
            } else {
                self.va_queue.add_rate_limited(key.clone());
            }
            self.va_queue.done(&key);
        }
    }

    async fn pv_worker(self: Arc<Self>) {
        while let Some(key) = self.pv_queue.next().await {
            if self.sync_volume_key(&key).await {
                self.pv_queue.forget(&key);
            } else {
                self.pv_queue.add_rate_limited(key.clone());
            }
            self.pv_queue.done(&key);
        }
    }

    /// Re-enqueues every attachment of this driver. Run periodically so
    /// that missed watch events self-heal.
    pub async fn resync(&self) {
        match self.store.list_volume_attachments().await {
            Ok(attachments) => {
                let mut enqueued = 0usize;
                for va in &attachments {
                    if va.spec.attacher != self.config.driver {
                        continue;
                    }
                    if let Some(name) = va.metadata.name.as_deref() {
                        self.va_queue.add(name.to_string());
                        enqueued += 1;
                    }
                }
                debug!(attachments = enqueued, "resync complete");
            }
            Err(err) => {
                warn!(error = %err, "resync listing failed");
            }
        }
    }

    async fn resync_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            // Jitter spreads resync load across replicas restarted at the
            // same time.
            let jitter = {
                let mut rng = rand::thread_rng();
                rng.gen_range(0.0..0.1)
            };
            let interval = self.config.resync_interval.mul_f64(1.0 + jitter);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            self.resync().await;
        }
    }

    /// Runs the worker pools and the resync loop until the token is
    /// cancelled, then drains the queues and waits for workers to finish.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            driver = %self.config.driver,
            workers = self.config.worker_count,
            "starting attach/detach controller"
        );

        let mut tasks = JoinSet::new();
        for _ in 0..self.config.worker_count {
            tasks.spawn(Arc::clone(&self).va_worker());
            tasks.spawn(Arc::clone(&self).pv_worker());
        }
        tasks.spawn(Arc::clone(&self).resync_loop(cancel.clone()));

        cancel.cancelled().await;
        info!("shutting down attach/detach controller");
        self.va_queue.shut_down();
        self.pv_queue.shut_down();

        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                if !err.is_cancelled() {
                    error!(error = %err, "controller task panicked");
                }
            }
        }
        info!("attach/detach controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::testing::{fixtures, FakeCsi, FakeStore};

    fn controller(store: Arc<FakeStore>, csi: Arc<FakeCsi>) -> AttachDetachController {
        let config = AttacherConfig {
            driver: "test".to_string(),
            ..Default::default()
        };
        let handler = Arc::new(CsiHandler::new(
            "test",
            store.clone() as Arc<dyn ObjectStore>,
            csi,
            RetryPolicy::default(),
        ));
        AttachDetachController::new(config, store, handler)
    }

    #[tokio::test]
    async fn test_foreign_attacher_is_ignored() {
        let store = Arc::new(FakeStore::new());
        let csi = Arc::new(FakeCsi::new());
        let ctrl = controller(store, csi);

        let va = fixtures::va_with_other_driver(fixtures::va(false, None));
        ctrl.attachment_changed(&va);
        assert!(ctrl.va_queue.is_empty());

        ctrl.attachment_deleted(&va);
        assert!(ctrl.pv_queue.is_empty());
    }

    #[tokio::test]
    async fn test_attachment_event_enqueues_key() {
        let store = Arc::new(FakeStore::new());
        let csi = Arc::new(FakeCsi::new());
        let ctrl = controller(store, csi);

        ctrl.attachment_changed(&fixtures::va(false, None));
        assert_eq!(ctrl.va_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_attachment_requeues_volume() {
        let store = Arc::new(FakeStore::new());
        let csi = Arc::new(FakeCsi::new());
        let ctrl = controller(store, csi);

        ctrl.attachment_deleted(&fixtures::va(true, None));
        assert_eq!(ctrl.pv_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_volume_without_finalizer_is_ignored() {
        let store = Arc::new(FakeStore::new());
        let csi = Arc::new(FakeCsi::new());
        let ctrl = controller(store, csi);

        ctrl.volume_changed(&fixtures::pv());
        assert!(ctrl.pv_queue.is_empty());

        ctrl.volume_changed(&fixtures::pv_with_finalizer());
        assert_eq!(ctrl.pv_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_key_for_missing_attachment_succeeds() {
        let store = Arc::new(FakeStore::new());
        let csi = Arc::new(FakeCsi::new());
        let ctrl = controller(store.clone(), csi.clone());

        assert!(ctrl.sync_attachment_key("gone").await);
        assert!(csi.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sync_key_attaches_fresh_object() {
        let store = Arc::new(FakeStore::new());
        store.put_persistent_volume(fixtures::pv_with_finalizer());
        store.put_node(fixtures::node());
        store.put_volume_attachment(fixtures::va(false, Some("attacher-csi/test")));
        let csi = Arc::new(FakeCsi::new());
        let ctrl = controller(store.clone(), csi.clone());

        assert!(ctrl.sync_attachment_key(fixtures::TEST_VA_NAME).await);
        assert_eq!(csi.calls().len(), 1);
        let stored = store
            .volume_attachment(fixtures::TEST_VA_NAME)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.status.unwrap().attached);
    }

    #[tokio::test]
    async fn test_watch_events_route_to_queues() {
        let store = Arc::new(FakeStore::new());
        let csi = Arc::new(FakeCsi::new());
        let ctrl = controller(store, csi);

        assert!(!ctrl.handle_attachment_event(Event::Init));
        assert!(!ctrl.handle_attachment_event(Event::InitApply(fixtures::va(false, None))));
        assert_eq!(ctrl.va_queue.len(), 1);

        let mut updated = fixtures::va(false, None);
        updated.metadata.name = Some("va2".to_string());
        assert!(!ctrl.handle_attachment_event(Event::Apply(updated)));
        assert_eq!(ctrl.va_queue.len(), 2);

        // End of the initial listing flips readiness at the call site.
        assert!(ctrl.handle_attachment_event(Event::InitDone));

        assert!(!ctrl.handle_attachment_event(Event::Delete(fixtures::va(true, None))));
        assert_eq!(ctrl.pv_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_volume_watch_events_route_to_queue() {
        let store = Arc::new(FakeStore::new());
        let csi = Arc::new(FakeCsi::new());
        let ctrl = controller(store, csi);

        ctrl.handle_volume_event(Event::Init);
        ctrl.handle_volume_event(Event::InitApply(fixtures::pv_with_finalizer()));
        assert_eq!(ctrl.pv_queue.len(), 1);

        // Deletes and unfinalized volumes are ignored.
        ctrl.handle_volume_event(Event::Delete(fixtures::pv_with_finalizer()));
        ctrl.handle_volume_event(Event::Apply(fixtures::pv()));
        ctrl.handle_volume_event(Event::InitDone);
        assert_eq!(ctrl.pv_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_resync_enqueues_only_own_driver() {
        let store = Arc::new(FakeStore::new());
        store.put_volume_attachment(fixtures::va(false, None));
        let mut other = fixtures::va_with_other_driver(fixtures::va(false, None));
        other.metadata.name = Some("other-va".to_string());
        store.put_volume_attachment(other);
        let csi = Arc::new(FakeCsi::new());
        let ctrl = controller(store, csi);

        ctrl.resync().await;
        assert_eq!(ctrl.va_queue.len(), 1);
    }
}
