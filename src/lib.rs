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

//! csi-attacher - CSI external attacher controller in Rust
//!
//! This library implements the reconciliation core of a CSI volume
//! attachment controller. It watches `VolumeAttachment` objects and drives
//! them to the attached or detached state by calling the CSI driver's
//! attach/detach operations, while managing finalizers on both the
//! `VolumeAttachment` and the `PersistentVolume` it references.
//!
//! The main building blocks are:
//! - Object store and CSI driver seams ([`store`], [`csi`])
//! - The attach/detach state machines and the volume finalizer
//!   reclaimer ([`handler`])
//! - A key-deduplicating, rate-limited work queue ([`workqueue`])
//! - The dispatcher and worker pool ([`controller`])

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod api_store;
pub mod config;
pub mod controller;
pub mod csi;
pub mod finalizer;
pub mod handler;
pub mod health;
pub mod identity;
pub mod retry;
pub mod store;
pub mod testing;
pub mod workqueue;

// Re-export commonly used types
pub use config::AttacherConfig;
pub use controller::AttachDetachController;
pub use csi::{CsiConnection, CsiError};
pub use handler::CsiHandler;
pub use store::{ObjectStore, StoreError};

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default name for the attacher controller.
pub const ATTACHER_NAME: &str = "csi-attacher";
