//! Objects the scenario creates: the local volume under test, the claims and
//! jobs that consume its volumes, and the host cleanup jobs.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::ResourceExt;
use serde_json::json;

use crate::config::HarnessConfig;
use crate::crd::LocalVolume;
use crate::error::Error;

pub const BLOCK_MODE: &str = "Block";

/// A local volume pinned to `node_name` by field selector, listing
/// `device_paths` under the configured storage class.
pub fn local_volume(
    cfg: &HarnessConfig,
    node_name: &str,
    device_paths: &[String],
) -> Result<LocalVolume, Error> {
    Ok(serde_json::from_value(json!({
        "apiVersion": "local.storage.openshift.io/v1",
        "kind": "LocalVolume",
        "metadata": {
            "name": cfg.local_volume_name,
            "namespace": cfg.namespace,
        },
        "spec": {
            "nodeSelector": {
                "nodeSelectorTerms": [{
                    "matchFields": [{
                        "key": "metadata.name",
                        "operator": "In",
                        "values": [node_name],
                    }],
                }],
            },
            "tolerations": cfg.tolerations,
            "storageClassDevices": [{
                "storageClassName": cfg.storage_class_name,
                "devicePaths": device_paths,
            }],
        },
    }))?)
}

pub fn consumer_name(pv: &PersistentVolume) -> String {
    format!("{}-consumer", pv.name_any())
}

fn volume_mode(pv: &PersistentVolume) -> Option<&str> {
    pv.spec.as_ref().and_then(|s| s.volume_mode.as_deref())
}

/// A read-write-once claim on exactly the volume's class, mode and capacity.
pub fn consumer_claim(
    cfg: &HarnessConfig,
    pv: &PersistentVolume,
) -> Result<PersistentVolumeClaim, Error> {
    let spec = pv.spec.clone().unwrap_or_default();
    let storage = spec
        .capacity
        .as_ref()
        .and_then(|c| c.get("storage"))
        .ok_or_else(|| {
            Error::assertion(format!("capacity of {}", pv.name_any()), "no storage capacity")
        })?;
    Ok(serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": consumer_name(pv),
            "namespace": cfg.namespace,
        },
        "spec": {
            "volumeMode": spec.volume_mode,
            "storageClassName": spec.storage_class_name,
            "accessModes": ["ReadWriteOnce"],
            "resources": {"requests": {"storage": storage}},
        },
    }))?)
}

/// Shell run by the consumer: write a random block through the volume, read it
/// back and exit non-zero when the checksums differ.
pub fn checksum_script(target: &str, block: bool) -> String {
    let copy = if block {
        format!(
            "dd if=/tmp/random.img of={target} bs=512 count=1 && \
             dd if={target} of=/tmp/readback.img bs=512 count=1"
        )
    } else {
        format!(
            "cp /tmp/random.img {target}/random.img && \
             cp {target}/random.img /tmp/readback.img"
        )
    };
    [
        "set -e".to_string(),
        "dd if=/dev/random of=/tmp/random.img bs=512 count=1".to_string(),
        "md5VAR1=$(md5sum /tmp/random.img | awk '{ print $1 }')".to_string(),
        copy,
        "md5VAR2=$(md5sum /tmp/readback.img | awk '{ print $1 }')".to_string(),
        "if [ \"$md5VAR1\" != \"$md5VAR2\" ]; then exit 1; fi".to_string(),
    ]
    .join("\n")
}

/// A single-run job that mounts `claim` and verifies a write/read cycle. Job
/// and pod carry the app and volume-name labels used to find the pod later.
pub fn consumer_job(
    cfg: &HarnessConfig,
    pv: &PersistentVolume,
    claim: &PersistentVolumeClaim,
) -> Result<Job, Error> {
    let labels = json!({
        cfg.labels.app.clone(): cfg.consumer.app_label,
        cfg.labels.volume_name.clone(): pv.name_any(),
    });
    let block = volume_mode(pv) == Some(BLOCK_MODE);
    let mut container = json!({
        "name": "busybox",
        "image": cfg.consumer.image,
        "command": ["/bin/sh", "-c"],
    });
    if block {
        container["args"] = json!([checksum_script(&cfg.consumer.device_path, true)]);
        container["volumeDevices"] = json!([{
            "name": "volume-to-debug",
            "devicePath": cfg.consumer.device_path,
        }]);
    } else {
        container["args"] = json!([checksum_script(&cfg.consumer.mount_path, false)]);
        container["volumeMounts"] = json!([{
            "name": "volume-to-debug",
            "mountPath": cfg.consumer.mount_path,
        }]);
    }
    Ok(serde_json::from_value(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": consumer_name(pv),
            "namespace": cfg.namespace,
            "labels": labels,
        },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": {"labels": labels},
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [container],
                    "volumes": [{
                        "name": "volume-to-debug",
                        "persistentVolumeClaim": {"claimName": claim.name_any()},
                    }],
                },
            },
        },
    }))?)
}

pub fn symlink_cleanup_job_name(node: &str) -> String {
    format!("cleanup-symlinks-{}", node.replace('.', "-"))
}

/// Job pinned to `node` that removes the agent's symlink directory for the
/// storage class from the host.
pub fn symlink_cleanup_job(cfg: &HarnessConfig, node: &str) -> Result<Job, Error> {
    let root = cfg.symlink_root.trim_end_matches('/');
    let class_dir = format!("{}/{}", root, cfg.storage_class_name);
    Ok(serde_json::from_value(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": symlink_cleanup_job_name(node),
            "namespace": cfg.namespace,
        },
        "spec": {
            "backoffLimit": 2,
            "template": {
                "spec": {
                    "restartPolicy": "Never",
                    "nodeSelector": {cfg.labels.hostname.clone(): node},
                    "tolerations": cfg.tolerations,
                    "containers": [{
                        "name": "cleanup",
                        "image": cfg.consumer.image,
                        "command": ["/bin/sh", "-c"],
                        "args": [format!("rm -rf {}", class_dir)],
                        "securityContext": {"privileged": true},
                        "volumeMounts": [{"name": "symlinks", "mountPath": cfg.symlink_root}],
                    }],
                    "volumes": [{
                        "name": "symlinks",
                        "hostPath": {"path": cfg.symlink_root},
                    }],
                },
            },
        },
    }))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolumeSpec;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pv(name: &str, mode: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                capacity: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity("10Gi".to_string()),
                )])),
                storage_class_name: Some("test-local-sc".to_string()),
                volume_mode: Some(mode.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn local_volume_targets_one_node() {
        let cfg = HarnessConfig::default();
        let lv = local_volume(&cfg, "worker-0", &["/dev/xvdf".to_string()]).unwrap();
        assert_eq!(lv.name_any(), "test-local-disk");
        assert_eq!(lv.namespace().as_deref(), Some("local-storage"));
        let term = &lv.spec.node_selector.as_ref().unwrap().node_selector_terms[0];
        let field = &term.match_fields.as_ref().unwrap()[0];
        assert_eq!(field.key, "metadata.name");
        assert_eq!(field.values.as_deref(), Some(&["worker-0".to_string()][..]));
        assert_eq!(lv.spec.tolerations, cfg.tolerations);
        assert_eq!(lv.storage_class_names(), vec!["test-local-sc"]);
        assert_eq!(lv.spec.storage_class_devices[0].device_paths, vec!["/dev/xvdf"]);
    }

    #[test]
    fn claim_matches_volume() {
        let cfg = HarnessConfig::default();
        let claim = consumer_claim(&cfg, &pv("local-pv-1", "Filesystem")).unwrap();
        assert_eq!(claim.name_any(), "local-pv-1-consumer");
        let spec = claim.spec.unwrap();
        assert_eq!(spec.volume_mode.as_deref(), Some("Filesystem"));
        assert_eq!(spec.storage_class_name.as_deref(), Some("test-local-sc"));
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"], Quantity("10Gi".to_string()));
    }

    #[test]
    fn claim_without_capacity_is_rejected() {
        let mut volume = pv("local-pv-1", "Filesystem");
        volume.spec.as_mut().unwrap().capacity = None;
        assert!(consumer_claim(&HarnessConfig::default(), &volume).is_err());
    }

    #[test]
    fn filesystem_job_mounts_claim() {
        let cfg = HarnessConfig::default();
        let volume = pv("local-pv-1", "Filesystem");
        let claim = consumer_claim(&cfg, &volume).unwrap();
        let job = consumer_job(&cfg, &volume, &claim).unwrap();
        assert_eq!(job.labels()["app"], "pv-consumer");
        assert_eq!(job.labels()["pv-name"], "local-pv-1");

        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let container = &pod.containers[0];
        assert_eq!(container.volume_mounts.as_ref().unwrap()[0].mount_path, "/data");
        assert!(container.volume_devices.is_none());
        let script = &container.args.as_ref().unwrap()[0];
        assert!(script.contains("cp /tmp/random.img /data/random.img"));
        assert!(script.ends_with("then exit 1; fi"));
        let source = pod.volumes.unwrap()[0].persistent_volume_claim.clone().unwrap();
        assert_eq!(source.claim_name, "local-pv-1-consumer");
    }

    #[test]
    fn block_job_uses_raw_device() {
        let cfg = HarnessConfig::default();
        let volume = pv("local-pv-2", BLOCK_MODE);
        let claim = consumer_claim(&cfg, &volume).unwrap();
        let pod = consumer_job(&cfg, &volume, &claim).unwrap().spec.unwrap().template.spec.unwrap();
        let container = &pod.containers[0];
        assert!(container.volume_mounts.is_none());
        assert_eq!(container.volume_devices.as_ref().unwrap()[0].device_path, "/dev/xvda");
        assert!(container.args.as_ref().unwrap()[0].contains("of=/dev/xvda"));
    }

    #[test]
    fn symlink_job_removes_class_directory_on_node() {
        let cfg = HarnessConfig::default();
        let job = symlink_cleanup_job(&cfg, "ip-10-0-1-2.ec2.internal").unwrap();
        assert_eq!(job.name_any(), "cleanup-symlinks-ip-10-0-1-2-ec2-internal");
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod.node_selector.unwrap()["kubernetes.io/hostname"],
            "ip-10-0-1-2.ec2.internal"
        );
        assert_eq!(
            pod.containers[0].args.as_ref().unwrap()[0],
            "rm -rf /mnt/local-storage/test-local-sc"
        );
        assert_eq!(
            pod.volumes.unwrap()[0].host_path.as_ref().unwrap().path,
            "/mnt/local-storage"
        );
    }
}
