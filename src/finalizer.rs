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

//! Idempotent finalizer edits on object metadata.
//!
//! These helpers only mutate the in-memory metadata; persisting the change
//! goes through the bounded-retry update in [`crate::retry`] so that a
//! concurrent writer cannot clobber unrelated finalizers.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Returns true if the metadata carries the given finalizer.
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .map(|finalizers| finalizers.iter().any(|f| f == finalizer))
        .unwrap_or(false)
}

/// Appends the finalizer if absent. Returns true if the metadata changed.
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Removes exactly the given finalizer, preserving all others and their
/// order. Returns true if the metadata changed.
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    let changed = finalizers.len() != before;
    if finalizers.is_empty() {
        meta.finalizers = None;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with(finalizers: &[&str]) -> ObjectMeta {
        ObjectMeta {
            finalizers: if finalizers.is_empty() {
                None
            } else {
                Some(finalizers.iter().map(|f| f.to_string()).collect())
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut meta = meta_with(&[]);
        assert!(add_finalizer(&mut meta, "attacher-csi/test"));
        assert!(!add_finalizer(&mut meta, "attacher-csi/test"));
        assert_eq!(meta.finalizers, Some(vec!["attacher-csi/test".to_string()]));
    }

    #[test]
    fn test_remove_preserves_others() {
        let mut meta = meta_with(&["foo/bar", "attacher-csi/test", "bar/baz"]);
        assert!(remove_finalizer(&mut meta, "attacher-csi/test"));
        assert_eq!(
            meta.finalizers,
            Some(vec!["foo/bar".to_string(), "bar/baz".to_string()])
        );
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut meta = meta_with(&["foo/bar"]);
        assert!(!remove_finalizer(&mut meta, "attacher-csi/test"));
        assert_eq!(meta.finalizers, Some(vec!["foo/bar".to_string()]));
    }

    #[test]
    fn test_remove_last_clears_list() {
        let mut meta = meta_with(&["attacher-csi/test"]);
        assert!(remove_finalizer(&mut meta, "attacher-csi/test"));
        assert_eq!(meta.finalizers, None);
    }
}
