//! Harness configuration.
//!
//! Every value the local volume scenario depends on (names, label keys, disk
//! layout, poll budgets) lives in [`HarnessConfig`]. The YAML form is
//! camelCase and every field has a default, so an empty file is valid.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::Toleration;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::disks::Disk;
use crate::error::Error;
use crate::poll::PollSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HarnessConfig {
    pub namespace: String,
    pub local_volume_name: String,
    pub storage_class_name: String,
    /// Daemon set running the per-node disk agent.
    pub agent_daemon_set: String,
    /// Nodes the agent must report ready on; the local volume targets one node.
    pub expected_ready_agents: i32,
    pub min_nodes: usize,
    pub tolerations: Vec<Toleration>,
    pub labels: LabelKeys,
    /// Instance types backed by NVMe devices, matched against the instance-type label.
    pub nvme_instance_pattern: String,
    pub disk_layout: DiskLayout,
    /// Pre-attached disks served by the static provisioner.
    pub static_disks: Vec<StaticDisk>,
    pub consumer: ConsumerConfig,
    /// Prefix of the provisioned-by annotation value, followed by the node UID.
    pub provisioner_name: String,
    /// Host directory where the agent creates device symlinks.
    pub symlink_root: String,
    /// Job start times are truncated to this before comparing pod creation times.
    #[serde(with = "duration_format")]
    pub timestamp_granularity: Duration,
    pub polling: Polling,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            namespace: "local-storage".to_string(),
            local_volume_name: "test-local-disk".to_string(),
            storage_class_name: "test-local-sc".to_string(),
            agent_daemon_set: "diskmaker-manager".to_string(),
            expected_ready_agents: 1,
            min_nodes: 3,
            tolerations: vec![Toleration {
                key: Some("localstorage".to_string()),
                value: Some("testvalue".to_string()),
                operator: Some("Equal".to_string()),
                ..Default::default()
            }],
            labels: LabelKeys::default(),
            nvme_instance_pattern: "^[cmr]5.*|t3|z1d".to_string(),
            disk_layout: DiskLayout::default(),
            static_disks: Vec::new(),
            consumer: ConsumerConfig::default(),
            provisioner_name: "local-volume-provisioner".to_string(),
            symlink_root: "/mnt/local-storage".to_string(),
            timestamp_granularity: Duration::from_secs(60),
            polling: Polling::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LabelKeys {
    pub hostname: String,
    pub instance_type: String,
    pub worker_role: String,
    pub app: String,
    pub volume_name: String,
    pub provisioned_by: String,
}

impl Default for LabelKeys {
    fn default() -> Self {
        Self {
            hostname: "kubernetes.io/hostname".to_string(),
            instance_type: "beta.kubernetes.io/instance-type".to_string(),
            worker_role: "node-role.kubernetes.io/worker".to_string(),
            app: "app".to_string(),
            volume_name: "pv-name".to_string(),
            provisioned_by: "pv.kubernetes.io/provisioned-by".to_string(),
        }
    }
}

/// Disk sizes (GiB) attached to each of the first `nodes` worker nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiskLayout {
    pub nodes: usize,
    pub sizes_gib: Vec<u32>,
}

impl Default for DiskLayout {
    fn default() -> Self {
        Self {
            nodes: 2,
            sizes_gib: vec![10, 20],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticDisk {
    pub node: String,
    #[serde(flatten)]
    pub disk: Disk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsumerConfig {
    pub image: String,
    /// Value of the app label shared by every consumer job and pod.
    pub app_label: String,
    pub mount_path: String,
    /// Device path inside the container for block-mode volumes.
    pub device_path: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            image: "gcr.io/google_containers/busybox".to_string(),
            app_label: "pv-consumer".to_string(),
            mount_path: "/data".to_string(),
            device_path: "/dev/xvda".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Polling {
    pub create: PollSpec,
    pub ready: PollSpec,
    pub find_volumes: PollSpec,
    pub delete: PollSpec,
    pub job_complete: PollSpec,
    pub consumer_pod: PollSpec,
    pub bound: PollSpec,
    pub reclaim: PollSpec,
    pub request_delete: PollSpec,
    pub finalizer_window: PollSpec,
    pub terminal: PollSpec,
}

impl Default for Polling {
    fn default() -> Self {
        Self {
            create: PollSpec::secs(2, 60),
            ready: PollSpec::secs(5, 300),
            find_volumes: PollSpec::secs(2, 300),
            delete: PollSpec::secs(2, 180),
            job_complete: PollSpec::secs(2, 300),
            consumer_pod: PollSpec::secs(2, 600),
            bound: PollSpec::secs(2, 120),
            reclaim: PollSpec::secs(5, 300),
            request_delete: PollSpec::secs(5, 300),
            finalizer_window: PollSpec::secs(5, 30),
            terminal: PollSpec::secs(2, 600),
        }
    }
}

impl HarnessConfig {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: HarnessConfig = if yaml.trim().is_empty() {
            HarnessConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.nvme_regex()?;
        if self.disk_layout.nodes == 0 || self.disk_layout.sizes_gib.is_empty() {
            return Err(Error::Config(
                "disk layout needs at least one node and one disk".to_string(),
            ));
        }
        if self.min_nodes < self.disk_layout.nodes {
            return Err(Error::Config(format!(
                "minNodes ({}) is smaller than the disk layout ({} nodes)",
                self.min_nodes, self.disk_layout.nodes
            )));
        }
        if self.timestamp_granularity.is_zero() {
            return Err(Error::Config(
                "timestampGranularity must be non-zero".to_string(),
            ));
        }
        let polling = &self.polling;
        for (name, spec) in [
            ("create", polling.create),
            ("ready", polling.ready),
            ("findVolumes", polling.find_volumes),
            ("delete", polling.delete),
            ("jobComplete", polling.job_complete),
            ("consumerPod", polling.consumer_pod),
            ("bound", polling.bound),
            ("reclaim", polling.reclaim),
            ("requestDelete", polling.request_delete),
            ("finalizerWindow", polling.finalizer_window),
            ("terminal", polling.terminal),
        ] {
            if spec.interval.is_zero() || spec.timeout < spec.interval {
                return Err(Error::Config(format!(
                    "polling.{} needs a non-zero interval no longer than its timeout",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn nvme_regex(&self) -> Result<Regex, Error> {
        Regex::new(&self.nvme_instance_pattern).map_err(|e| {
            Error::Config(format!(
                "invalid nvmeInstancePattern {:?}: {}",
                self.nvme_instance_pattern, e
            ))
        })
    }
}

/// Durations as human-readable strings such as `"5s"` or `"2m 30s"`.
pub(crate) mod duration_format {
    use std::time::Duration;

    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = HarnessConfig::from_yaml("").unwrap();
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.polling.finalizer_window, PollSpec::secs(5, 30));
        assert_eq!(config.disk_layout.sizes_gib, vec![10, 20]);
    }

    #[test]
    fn partial_yaml_overrides_only_given_fields() {
        let config = HarnessConfig::from_yaml(
            r#"
            namespace: e2e
            timestampGranularity: 1s
            polling:
              reclaim:
                interval: 10s
                timeout: 10m
            staticDisks:
              - node: worker-0
                sizeGib: 10
                path: /dev/nvme1n1
                id: nvme-Amazon_EBS_vol0a1
            "#,
        )
        .unwrap();
        assert_eq!(config.namespace, "e2e");
        assert_eq!(config.timestamp_granularity, Duration::from_secs(1));
        assert_eq!(config.polling.reclaim, PollSpec::secs(10, 600));
        assert_eq!(config.polling.terminal, Polling::default().terminal);
        assert_eq!(config.static_disks.len(), 1);
        assert_eq!(config.static_disks[0].disk.id, "nvme-Amazon_EBS_vol0a1");
        assert_eq!(config.static_disks[0].disk.name, "");
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = HarnessConfig::from_yaml("nvmeInstancePattern: '[unclosed'").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = HarnessConfig::from_yaml(
            "polling:\n  terminal:\n    interval: 0s\n    timeout: 1m\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("polling.terminal"));
    }

    #[test]
    fn nvme_pattern_matches_nitro_families() {
        let re = HarnessConfig::default().nvme_regex().unwrap();
        assert!(re.is_match("m5.xlarge"));
        assert!(re.is_match("t3.medium"));
        assert!(!re.is_match("m4.large"));
    }
}
