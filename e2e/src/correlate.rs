//! Re-associating persistent volumes with the disks, nodes and consumer pods
//! they came from. Everything here is rediscovered from the API; nothing
//! observed by an earlier poll is assumed to still hold.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, DurationRound, Utc};
use k8s_openapi::api::core::v1::{Node, PersistentVolume, Pod};
use kube::{
    api::{Api, ListParams},
    Client, ResourceExt,
};
use tracing::{debug, info};

use crate::assertions::{eventually, Probe};
use crate::config::LabelKeys;
use crate::disks::Disk;
use crate::error::Error;
use crate::objects::TrackedObject;
use crate::poll::PollSpec;

pub const PHASE_AVAILABLE: &str = "Available";
pub const PHASE_BOUND: &str = "Bound";

pub fn storage_class(pv: &PersistentVolume) -> Option<&str> {
    pv.spec.as_ref().and_then(|s| s.storage_class_name.as_deref())
}

pub fn phase(pv: &PersistentVolume) -> Option<&str> {
    pv.status.as_ref().and_then(|s| s.phase.as_deref())
}

pub fn volumes_of_class(pvs: Vec<PersistentVolume>, class: &str) -> Vec<PersistentVolume> {
    pvs.into_iter().filter(|pv| storage_class(pv) == Some(class)).collect()
}

/// Last segment of the volume's local path, i.e. the symlink the agent created.
pub fn local_path_basename(pv: &PersistentVolume) -> Option<&str> {
    let path = pv.spec.as_ref()?.local.as_ref()?.path.as_str();
    Path::new(path).file_name()?.to_str()
}

/// Every volume must point at one of `disks`, named by the disk's stable name.
pub fn verify_device_paths(pvs: &[PersistentVolume], disks: &[Disk]) -> Result<(), Error> {
    for pv in pvs {
        let what = format!("local path of {}", pv.name_any());
        let basename = local_path_basename(pv)
            .ok_or_else(|| Error::assertion(&what, "volume has no local path"))?;
        if !disks.iter().any(|d| d.stable_name() == basename) {
            let expected: Vec<&str> = disks.iter().map(Disk::stable_name).collect();
            return Err(Error::assertion(
                what,
                format!("basename {:?} matches none of {:?}", basename, expected),
            ));
        }
        debug!(volume = %pv.name_any(), basename, "Volume matches its disk.");
    }
    Ok(())
}

pub fn provisioned_by_value(provisioner: &str, node: &Node) -> String {
    format!("{}-{}", provisioner, node.uid().unwrap_or_default())
}

fn label<'a, K: ResourceExt>(obj: &'a K, key: &str) -> Option<&'a str> {
    obj.labels().get(key).map(String::as_str)
}

/// Each volume's provenance annotation must name the node sharing its
/// hostname label. A missing label, node or annotation fails outright.
pub fn verify_provenance(
    pvs: &[PersistentVolume],
    nodes: &[Node],
    labels: &LabelKeys,
    provisioner: &str,
) -> Result<(), Error> {
    for pv in pvs {
        let what = format!("provenance of {}", pv.name_any());
        let hostname = label(pv, &labels.hostname)
            .ok_or_else(|| Error::assertion(&what, format!("no {} label", labels.hostname)))?;
        let node = nodes
            .iter()
            .find(|n| label(*n, &labels.hostname) == Some(hostname))
            .ok_or_else(|| {
                Error::assertion(&what, format!("no node with {}={}", labels.hostname, hostname))
            })?;
        let expected = provisioned_by_value(provisioner, node);
        match pv.annotations().get(&labels.provisioned_by) {
            None => {
                return Err(Error::assertion(
                    what,
                    format!("no {} annotation", labels.provisioned_by),
                ))
            }
            Some(actual) if *actual != expected => {
                return Err(Error::assertion(
                    what,
                    format!("{} is {:?}, expected {:?}", labels.provisioned_by, actual, expected),
                ))
            }
            Some(_) => {
                debug!(volume = %pv.name_any(), node = %node.name_any(), "Provenance holds.")
            }
        }
    }
    Ok(())
}

/// Truncates `now` to the granularity of API creation timestamps.
pub fn timestamp_floor(now: DateTime<Utc>, granularity: Duration) -> Result<DateTime<Utc>, Error> {
    let step = chrono::Duration::from_std(granularity)
        .map_err(|e| Error::Config(format!("timestamp granularity {:?}: {}", granularity, e)))?;
    now.duration_trunc(step)
        .map_err(|e| Error::Config(format!("truncating {} to {:?}: {}", now, granularity, e)))
}

/// The first pod created strictly after `started`. Leftovers from earlier runs
/// are skipped.
pub fn elect_consumer_pod(pods: &[Pod], started: DateTime<Utc>) -> Option<&Pod> {
    pods.iter().find(|pod| match &pod.metadata.creation_timestamp {
        Some(created) if created.0 > started => true,
        created => {
            info!(
                pod = %pod.name_any(),
                created = ?created.as_ref().map(|t| t.0),
                %started,
                "Pod is older than this consumer, skipping."
            );
            false
        }
    })
}

pub fn consumer_selector(labels: &LabelKeys, app: &str, volume: &str) -> String {
    format!("{}={},{}={}", labels.app, app, labels.volume_name, volume)
}

/// Volumes named in `names` that are not currently listed in `phase`, with
/// what was seen for each.
pub fn volumes_not_in_phase(
    names: &[String],
    current: &[PersistentVolume],
    wanted: &str,
) -> Vec<String> {
    names
        .iter()
        .filter_map(|name| match current.iter().find(|pv| pv.name_any() == *name) {
            None => Some(format!("{} missing", name)),
            Some(pv) if phase(pv) == Some(wanted) => None,
            Some(pv) => Some(format!("{} in phase {}", name, phase(pv).unwrap_or("unknown"))),
        })
        .collect()
}

/// Polling side of correlation.
pub struct VolumeCorrelator {
    client: Client,
    namespace: String,
    labels: LabelKeys,
}

impl VolumeCorrelator {
    pub fn new(client: Client, namespace: impl Into<String>, labels: LabelKeys) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            labels,
        }
    }

    async fn list_class(&self, class: &str) -> Result<Vec<PersistentVolume>, Error> {
        let pv_api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(volumes_of_class(pv_api.list(&ListParams::default()).await?.items, class))
    }

    /// Volumes of `class` as listed by the first list call that succeeds.
    pub async fn list_volumes(
        &self,
        class: &str,
        spec: PollSpec,
    ) -> Result<Vec<PersistentVolume>, Error> {
        let what = format!("listing volumes of class {}", class);
        eventually(&what, spec, || async { Ok(Probe::Ready(self.list_class(class).await?)) }).await
    }

    /// Waits until exactly `expected` volumes of `class` exist.
    pub async fn find_volumes(
        &self,
        class: &str,
        expected: usize,
        spec: PollSpec,
    ) -> Result<Vec<PersistentVolume>, Error> {
        let what = format!("{} volumes of class {}", expected, class);
        let pvs = eventually(&what, spec, || async {
            let pvs = self.list_class(class).await?;
            if pvs.len() == expected {
                Ok(Probe::Ready(pvs))
            } else {
                let names: Vec<String> = pvs.iter().map(|pv| pv.name_any()).collect();
                let observed = format!("found {} of {}: {:?}", pvs.len(), expected, names);
                Ok(Probe::Pending(observed))
            }
        })
        .await?;
        info!(class, count = pvs.len(), "Found volumes.");
        Ok(pvs)
    }

    /// Waits until every volume in `names` is listed again in phase `wanted`.
    /// Volumes are matched by name, so a replacement counts.
    pub async fn await_phase(
        &self,
        class: &str,
        names: &[String],
        wanted: &str,
        spec: PollSpec,
    ) -> Result<(), Error> {
        let what = format!("volumes {:?} to be {}", names, wanted);
        eventually(&what, spec, || async {
            let current = self.list_class(class).await?;
            let waiting = volumes_not_in_phase(names, &current, wanted);
            if waiting.is_empty() {
                Ok(Probe::Ready(()))
            } else {
                Ok(Probe::pending(waiting.join(", ")))
            }
        })
        .await
    }

    /// Deletes each volume and waits until it is gone or has been recreated
    /// under a new UID, then expects the same number of volumes back.
    pub async fn replace_volumes(
        &self,
        class: &str,
        pvs: &[PersistentVolume],
        delete: PollSpec,
        find: PollSpec,
    ) -> Result<Vec<PersistentVolume>, Error> {
        let pv_api: Api<PersistentVolume> = Api::all(self.client.clone());
        for pv in pvs {
            let object = TrackedObject::persistent_volume(pv);
            let (name, old_uid) = (pv.name_any(), pv.uid());
            eventually(&format!("deleting volume {}", name), delete, || async {
                object.delete(&self.client).await?;
                Ok(Probe::Ready(()))
            })
            .await?;
            eventually(&format!("volume {} to be replaced", name), delete, || async {
                match pv_api.get_opt(&name).await? {
                    None => Ok(Probe::Ready(())),
                    Some(current) if current.uid() != old_uid => Ok(Probe::Ready(())),
                    Some(_) => Ok(Probe::pending(format!("{} still present", name))),
                }
            })
            .await?;
            info!(volume = %name, "Volume deleted.");
        }
        self.find_volumes(class, pvs.len(), find).await
    }

    /// Waits for a consumer pod of `volume` created after `started`.
    pub async fn find_consumer_pod(
        &self,
        app: &str,
        volume: &str,
        started: DateTime<Utc>,
        spec: PollSpec,
    ) -> Result<Pod, Error> {
        let pod_api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default().labels(&consumer_selector(&self.labels, app, volume));
        let what = format!("consumer pod of {}", volume);
        eventually(&what, spec, || async {
            let pods = pod_api.list(&params).await?.items;
            match elect_consumer_pod(&pods, started) {
                Some(pod) => Ok(Probe::Ready(pod.clone())),
                None => {
                    let names: Vec<String> = pods.iter().map(|p| p.name_any()).collect();
                    Ok(Probe::pending(format!("no pod newer than {} in {:?}", started, names)))
                }
            }
        })
        .await
    }
}
