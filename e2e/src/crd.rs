use k8s_openapi::api::core::v1::{NodeSelector, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const LOCAL_VOLUME_CRD: &str = "localvolumes.local.storage.openshift.io";
pub const CONDITION_AVAILABLE: &str = "Available";

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(group = "local.storage.openshift.io", version = "v1", kind = "LocalVolume")]
#[kube(namespaced, status = "LocalVolumeStatus")]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<NodeSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    pub storage_class_devices: Vec<StorageClassDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassDevice {
    pub storage_class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    pub device_paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeStatus {
    #[serde(default)]
    pub conditions: Vec<OperatorCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// How far a local volume is from reporting itself available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    NoConditions,
    NotAvailable(String),
    /// Status says true but the condition never actually transitioned.
    NeverTransitioned,
}

impl LocalVolume {
    pub fn availability(&self) -> Availability {
        let conditions = match &self.status {
            Some(status) if !status.conditions.is_empty() => &status.conditions,
            _ => return Availability::NoConditions,
        };
        let Some(available) = conditions.iter().find(|c| c.type_ == CONDITION_AVAILABLE) else {
            let kinds: Vec<&str> = conditions.iter().map(|c| c.type_.as_str()).collect();
            return Availability::NotAvailable(format!(
                "no {} condition in {:?}",
                CONDITION_AVAILABLE, kinds
            ));
        };
        if available.status != "True" {
            return Availability::NotAvailable(format!(
                "{} is {} ({})",
                CONDITION_AVAILABLE,
                available.status,
                available.message.as_deref().unwrap_or("no message")
            ));
        }
        match &available.last_transition_time {
            // Go's zero time serializes as year 1, before the epoch.
            Some(time) if time.0.timestamp() > 0 => Availability::Available,
            _ => Availability::NeverTransitioned,
        }
    }

    pub fn finalizers(&self) -> &[String] {
        self.metadata.finalizers.as_deref().unwrap_or_default()
    }

    pub fn storage_class_names(&self) -> Vec<&str> {
        self.spec
            .storage_class_devices
            .iter()
            .map(|d| d.storage_class_name.as_str())
            .collect()
    }
}
