//! External disks attached to worker nodes for the duration of a run.
//!
//! Disk provisioning itself belongs to the environment: the harness only talks
//! to a [`DiskProvisioner`]. The bundled [`StaticDiskProvisioner`] hands out
//! disks that were attached before the run and listed in the configuration.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cleanup::CleanupRegistry;
use crate::config::{DiskLayout, StaticDisk};
use crate::error::Error;

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub size_gib: u32,
    /// Device path on the node, as listed in the local volume.
    pub path: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl Disk {
    /// The name the agent uses for the volume's symlink. The id survives
    /// re-attachment, the display name does not, so the id wins when known.
    pub fn stable_name(&self) -> &str {
        if self.id.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRequest {
    pub node: String,
    pub size_gib: u32,
    pub instance_type: Option<String>,
    /// Whether the instance type matches the configured NVMe pattern.
    pub nvme_instance: bool,
}

/// Create, attach, detach and delete disks. Every call must be idempotent for
/// the same logical disk; cleanup may run after the scenario already tore a
/// disk down.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiskProvisioner {
    async fn create(&self, request: &DiskRequest) -> Result<Disk, Error>;
    async fn attach(&self, node: &str, disk: &Disk) -> Result<(), Error>;
    async fn detach(&self, node: &str, disk: &Disk) -> Result<(), Error>;
    async fn delete(&self, disk: &Disk) -> Result<(), Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeDisks {
    pub node: Node,
    pub disks: Vec<Disk>,
}

impl NodeDisks {
    pub fn node_name(&self) -> String {
        self.node.name_any()
    }
}

pub fn instance_type<'a>(node: &'a Node, label: &str) -> Option<&'a str> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(label))
        .map(String::as_str)
}

/// Creates and attaches the configured disks on the first `layout.nodes`
/// nodes. A detach-and-delete action is registered for every disk as soon as
/// it exists.
pub async fn provision_layout<P>(
    provisioner: &Arc<P>,
    nodes: &[Node],
    layout: &DiskLayout,
    instance_type_label: &str,
    nvme: &Regex,
    cleanup: &mut CleanupRegistry,
) -> Result<Vec<NodeDisks>, Error>
where
    P: DiskProvisioner + Send + Sync + 'static,
{
    if nodes.len() < layout.nodes {
        return Err(Error::assertion(
            "disk layout",
            format!("needs {} nodes, found {}", layout.nodes, nodes.len()),
        ));
    }
    let mut provisioned = Vec::with_capacity(layout.nodes);
    for node in &nodes[..layout.nodes] {
        let node_name = node.name_any();
        let instance = instance_type(node, instance_type_label).map(str::to_string);
        let nvme_instance = instance.as_deref().is_some_and(|t| nvme.is_match(t));
        let mut disks = Vec::with_capacity(layout.sizes_gib.len());
        for &size_gib in &layout.sizes_gib {
            let request = DiskRequest {
                node: node_name.clone(),
                size_gib,
                instance_type: instance.clone(),
                nvme_instance,
            };
            let disk = provisioner.create(&request).await?;
            info!(node = %node_name, size_gib, path = %disk.path, id = %disk.id, "Created disk.");

            let owner = Arc::clone(provisioner);
            let (cleanup_node, cleanup_disk) = (node_name.clone(), disk.clone());
            cleanup.register(format!("detach-and-delete-disk {}", disk.path), move || async move {
                owner.detach(&cleanup_node, &cleanup_disk).await?;
                owner.delete(&cleanup_disk).await
            });

            provisioner.attach(&node_name, &disk).await?;
            if disk.path.is_empty() {
                return Err(Error::disk(&node_name, "attached disk has no device path"));
            }
            disks.push(disk);
        }
        provisioned.push(NodeDisks {
            node: node.clone(),
            disks,
        });
    }
    Ok(provisioned)
}

/// Serves disks that are already attached, as listed in the configuration.
pub struct StaticDiskProvisioner {
    inventory: Vec<StaticDisk>,
    claimed: Mutex<HashSet<usize>>,
}

impl StaticDiskProvisioner {
    pub fn new(inventory: Vec<StaticDisk>) -> Self {
        Self {
            inventory,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    fn claimed(&self) -> std::sync::MutexGuard<'_, HashSet<usize>> {
        self.claimed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DiskProvisioner for StaticDiskProvisioner {
    async fn create(&self, request: &DiskRequest) -> Result<Disk, Error> {
        let mut claimed = self.claimed();
        let found = self.inventory.iter().enumerate().find(|(index, entry)| {
            entry.node == request.node
                && entry.disk.size_gib == request.size_gib
                && !claimed.contains(index)
        });
        match found {
            Some((index, entry)) => {
                claimed.insert(index);
                Ok(entry.disk.clone())
            }
            None => Err(Error::disk(
                &request.node,
                format!("no unclaimed pre-attached disk of {} GiB", request.size_gib),
            )),
        }
    }

    async fn attach(&self, node: &str, disk: &Disk) -> Result<(), Error> {
        debug!(node, path = %disk.path, "Disk is pre-attached.");
        Ok(())
    }

    async fn detach(&self, node: &str, disk: &Disk) -> Result<(), Error> {
        debug!(node, path = %disk.path, "Pre-attached disk stays attached.");
        Ok(())
    }

    async fn delete(&self, disk: &Disk) -> Result<(), Error> {
        let mut claimed = self.claimed();
        if let Some(index) = self.inventory.iter().position(|entry| entry.disk == *disk) {
            claimed.remove(&index);
        }
        Ok(())
    }
}
