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

//! Bounded-retry conditional updates.
//!
//! Every write the attacher makes is a read-modify-write against an
//! optimistic-concurrency store. [`update_with_retry`] centralizes the
//! retry discipline: refetch, reapply, rewrite, up to a finite ceiling.
//! Exhaustion surfaces the last error to the caller; it is never
//! swallowed, so the work queue's backoff takes over.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Retry ceiling and backoff for conditional updates within a single
/// reconciliation invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total update attempts before the error is surfaced.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles per attempt.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound on the per-attempt delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(10)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(1)
}

impl RetryPolicy {
    /// Returns the delay to sleep after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Effective attempt ceiling; at least one attempt is always made.
    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Performs a conditional update with bounded retry.
///
/// Each attempt reads the current object, applies the mutation, and writes
/// it back. `apply` returns false when the object is already in the desired
/// state; the write (and its retry cost) is then skipped and `Ok(None)` is
/// returned. Conflicts and transient write failures are retried up to the
/// policy's ceiling; any other error, or exhaustion, is returned to the
/// caller.
pub async fn update_with_retry<T, R, RFut, A, U, UFut>(
    policy: &RetryPolicy,
    read: R,
    apply: A,
    update: U,
) -> Result<Option<T>, StoreError>
where
    R: Fn() -> RFut,
    RFut: Future<Output = Result<T, StoreError>>,
    A: Fn(&mut T) -> bool,
    U: Fn(T) -> UFut,
    UFut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut object = read().await?;
        if !apply(&mut object) {
            return Ok(None);
        }
        match update(object).await {
            Ok(updated) => return Ok(Some(updated)),
            Err(err) if err.is_retryable() && attempt < policy.attempts() => {
                tracing::debug!(
                    attempt,
                    error = %err,
                    "conditional update failed, retrying"
                );
                tokio::time::sleep(policy.delay(attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_succeeds_first_attempt() {
        let writes = AtomicU32::new(0);
        let result = update_with_retry(
            &fast_policy(),
            || async { Ok(0u32) },
            |value| {
                *value += 1;
                true
            },
            |value| {
                writes.fetch_add(1, Ordering::SeqCst);
                async move { Ok(value) }
            },
        )
        .await
        .unwrap();

        assert_eq!(result, Some(1));
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_noop_skips_write() {
        let writes = AtomicU32::new(0);
        let result = update_with_retry(
            &fast_policy(),
            || async { Ok(7u32) },
            |_| false,
            |value| {
                writes.fetch_add(1, Ordering::SeqCst);
                async move { Ok(value) }
            },
        )
        .await
        .unwrap();

        assert_eq!(result, None);
        assert_eq!(writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retries_conflicts_then_succeeds() {
        let writes = AtomicU32::new(0);
        let result = update_with_retry(
            &fast_policy(),
            || async { Ok(0u32) },
            |value| {
                *value = 42;
                true
            },
            |value| {
                let attempt = writes.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt < 3 {
                        Err(StoreError::Conflict {
                            kind: "volumeattachments",
                            name: "va1".to_string(),
                        })
                    } else {
                        Ok(value)
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result, Some(42));
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_error() {
        let writes = AtomicU32::new(0);
        let result: Result<Option<u32>, _> = update_with_retry(
            &fast_policy(),
            || async { Ok(0u32) },
            |_| true,
            |_| {
                writes.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(StoreError::Conflict {
                        kind: "volumeattachments",
                        name: "va1".to_string(),
                    })
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(writes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let writes = AtomicU32::new(0);
        let result: Result<Option<u32>, _> = update_with_retry(
            &fast_policy(),
            || async { Ok(0u32) },
            |_| true,
            |_| {
                writes.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(StoreError::NotFound {
                        kind: "volumeattachments",
                        name: "va1".to_string(),
                    })
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(25),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(20));
        assert_eq!(policy.delay(3), Duration::from_millis(25));
    }
}
