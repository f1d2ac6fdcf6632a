//! The closed set of objects the scenario creates and later tears down.

use std::fmt::{self, Debug};

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{
    api::{Api, DeleteParams},
    Client, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tracing::info;

use crate::assertions::{eventually, Probe};
use crate::crd::LocalVolume;
use crate::error::{is_gone, Error};
use crate::poll::PollSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackedObject {
    LocalVolume { namespace: String, name: String },
    StorageClass { name: String },
    PersistentVolume { name: String },
    PersistentVolumeClaim { namespace: String, name: String },
    Job { namespace: String, name: String },
    Pod { namespace: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub kind: &'static str,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

fn namespace_of<K: Resource>(obj: &K) -> String {
    obj.namespace().unwrap_or_default()
}

impl TrackedObject {
    pub fn local_volume(lv: &LocalVolume) -> Self {
        TrackedObject::LocalVolume {
            namespace: namespace_of(lv),
            name: lv.name_any(),
        }
    }

    pub fn persistent_volume(pv: &PersistentVolume) -> Self {
        TrackedObject::PersistentVolume { name: pv.name_any() }
    }

    pub fn claim(pvc: &PersistentVolumeClaim) -> Self {
        TrackedObject::PersistentVolumeClaim {
            namespace: namespace_of(pvc),
            name: pvc.name_any(),
        }
    }

    pub fn job(job: &Job) -> Self {
        TrackedObject::Job {
            namespace: namespace_of(job),
            name: job.name_any(),
        }
    }

    pub fn pod(pod: &Pod) -> Self {
        TrackedObject::Pod {
            namespace: namespace_of(pod),
            name: pod.name_any(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        let (kind, namespace, name) = match self {
            TrackedObject::LocalVolume { namespace, name } => {
                ("LocalVolume", Some(namespace), name)
            }
            TrackedObject::StorageClass { name } => ("StorageClass", None, name),
            TrackedObject::PersistentVolume { name } => ("PersistentVolume", None, name),
            TrackedObject::PersistentVolumeClaim { namespace, name } => {
                ("PersistentVolumeClaim", Some(namespace), name)
            }
            TrackedObject::Job { namespace, name } => ("Job", Some(namespace), name),
            TrackedObject::Pod { namespace, name } => ("Pod", Some(namespace), name),
        };
        ObjectKey {
            kind,
            namespace: namespace.cloned(),
            name: name.clone(),
        }
    }

    /// Whether the object is still visible; not-found and gone both mean no.
    pub async fn exists(&self, client: &Client) -> Result<bool, Error> {
        let c = client.clone();
        match self {
            TrackedObject::LocalVolume { namespace, name } => {
                exists_in(Api::<LocalVolume>::namespaced(c, namespace), name).await
            }
            TrackedObject::StorageClass { name } => {
                exists_in(Api::<StorageClass>::all(c), name).await
            }
            TrackedObject::PersistentVolume { name } => {
                exists_in(Api::<PersistentVolume>::all(c), name).await
            }
            TrackedObject::PersistentVolumeClaim { namespace, name } => {
                exists_in(Api::<PersistentVolumeClaim>::namespaced(c, namespace), name).await
            }
            TrackedObject::Job { namespace, name } => {
                exists_in(Api::<Job>::namespaced(c, namespace), name).await
            }
            TrackedObject::Pod { namespace, name } => {
                exists_in(Api::<Pod>::namespaced(c, namespace), name).await
            }
        }
    }

    /// Requests deletion with background propagation. Deleting something that
    /// is already gone succeeds.
    pub async fn delete(&self, client: &Client) -> Result<(), Error> {
        let c = client.clone();
        match self {
            TrackedObject::LocalVolume { namespace, name } => {
                delete_in(Api::<LocalVolume>::namespaced(c, namespace), name).await
            }
            TrackedObject::StorageClass { name } => {
                delete_in(Api::<StorageClass>::all(c), name).await
            }
            TrackedObject::PersistentVolume { name } => {
                delete_in(Api::<PersistentVolume>::all(c), name).await
            }
            TrackedObject::PersistentVolumeClaim { namespace, name } => {
                delete_in(Api::<PersistentVolumeClaim>::namespaced(c, namespace), name).await
            }
            TrackedObject::Job { namespace, name } => {
                delete_in(Api::<Job>::namespaced(c, namespace), name).await
            }
            TrackedObject::Pod { namespace, name } => {
                delete_in(Api::<Pod>::namespaced(c, namespace), name).await
            }
        }
    }
}

async fn exists_in<K>(api: Api<K>, name: &str) -> Result<bool, Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.get(name).await {
        Ok(_) => Ok(true),
        Err(e) if is_gone(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn delete_in<K>(api: Api<K>, name: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(e) if is_gone(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Deletes each object in order and waits for it to disappear before moving
/// on to the next one.
pub async fn eventually_delete(
    client: &Client,
    objects: &[TrackedObject],
    spec: PollSpec,
) -> Result<(), Error> {
    for object in objects {
        let key = object.key();
        eventually(&format!("deleting {}", key), spec, || async {
            object.delete(client).await?;
            Ok(Probe::Ready(()))
        })
        .await?;
        eventually(&format!("{} to disappear", key), spec, || async {
            if object.exists(client).await? {
                Ok(Probe::pending(format!("{} still present", key)))
            } else {
                Ok(Probe::Ready(()))
            }
        })
        .await?;
        info!(object = %key, "Deleted");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::LocalVolumeSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn keys_carry_kind_and_namespace() {
        let mut lv = LocalVolume::new("test-local-disk", LocalVolumeSpec::default());
        lv.metadata.namespace = Some("local-storage".into());
        let key = TrackedObject::local_volume(&lv).key();
        assert_eq!(key.kind, "LocalVolume");
        assert_eq!(key.to_string(), "LocalVolume local-storage/test-local-disk");

        let pv = PersistentVolume {
            metadata: ObjectMeta {
                name: Some("local-pv-1a2b".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let key = TrackedObject::persistent_volume(&pv).key();
        assert_eq!(key.namespace, None);
        assert_eq!(key.to_string(), "PersistentVolume local-pv-1a2b");
    }

    #[test]
    fn storage_class_is_cluster_scoped() {
        let key = TrackedObject::StorageClass {
            name: "test-local-sc".into(),
        }
        .key();
        assert_eq!(key.to_string(), "StorageClass test-local-sc");
    }
}
