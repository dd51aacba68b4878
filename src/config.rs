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

//! Configuration structures for the attacher.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Main configuration for the csi-attacher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttacherConfig {
    /// Name of the CSI driver this attacher serves. Attachments naming a
    /// different attacher are ignored.
    #[serde(default)]
    pub driver: String,

    /// Kubeconfig file for talking to the apiserver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Path of the CSI driver's Unix domain socket.
    #[serde(default = "default_csi_address")]
    pub csi_address: PathBuf,

    /// Number of concurrent attachment workers.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Interval between full re-syncs of all attachments of this driver.
    #[serde(default = "default_resync_interval", with = "humantime_serde")]
    pub resync_interval: Duration,

    /// Bounded-retry policy for conditional status and finalizer writes.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// The address to serve health checks.
    #[serde(default = "default_healthz_bind_address")]
    pub healthz_bind_address: String,

    /// The port to serve health checks.
    #[serde(default = "default_healthz_bind_port")]
    pub healthz_bind_port: u16,
}

impl Default for AttacherConfig {
    fn default() -> Self {
        Self {
            driver: String::new(),
            kubeconfig: None,
            master: None,
            csi_address: default_csi_address(),
            worker_count: default_worker_count(),
            resync_interval: default_resync_interval(),
            retry: RetryPolicy::default(),
            healthz_bind_address: default_healthz_bind_address(),
            healthz_bind_port: default_healthz_bind_port(),
        }
    }
}

impl AttacherConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.driver.is_empty() {
            return Err("driver name must not be empty".to_string());
        }
        if self.worker_count == 0 {
            return Err("workerCount must be at least 1".to_string());
        }
        Ok(())
    }
}

fn default_csi_address() -> PathBuf {
    PathBuf::from("/csi/csi.sock")
}

fn default_worker_count() -> usize {
    10
}

fn default_resync_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_healthz_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_healthz_bind_port() -> u16 {
    10260
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AttacherConfig::default();
        assert_eq!(config.worker_count, 10);
        assert_eq!(config.resync_interval, Duration::from_secs(600));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.healthz_bind_port, 10260);
    }

    #[test]
    fn test_validate_rejects_empty_driver() {
        let config = AttacherConfig::default();
        assert!(config.validate().is_err());

        let config = AttacherConfig {
            driver: "test".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
driver: "io.example.csi"
workerCount: 4
resyncInterval: "5m"
retry:
  maxAttempts: 5
  baseDelay: "20ms"
"#;
        let config: AttacherConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.driver, "io.example.csi");
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(20));
    }
}
