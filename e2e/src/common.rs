use std::cell::RefCell;
use std::fmt::Debug;

use chrono::Utc;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Toleration};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, ListParams, PostParams},
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::*;

use crate::assertions::{eventually, Probe};
use crate::error::{is_already_exists, is_gone, Error};
use crate::poll::{poll_immediate_until, PollSpec};

/// Annotation stamped on every object the harness creates, naming the run
/// that created it.
pub const RUN_ANNOTATION: &str = "local-volume-e2e/run-id";

pub async fn ensure_crd_registered(client: &Client, crd_name: &str) -> Result<(), Error> {
    let crd_api: Api<CustomResourceDefinition> = Api::all(client.clone());
    match crd_api.get(crd_name).await {
        Err(e) if is_gone(&e) => {
            error!(crd = crd_name, "No CRD found, create one before running the e2e test.");
            Err(Error::CrdMissing {
                name: crd_name.to_string(),
                source: e,
            })
        }
        Err(e) => {
            error!(crd = crd_name, error = %e, "Failed to get CRD.");
            Err(e.into())
        }
        Ok(_) => {
            info!(crd = crd_name, "CRD found, continue to run the e2e test.");
            Ok(())
        }
    }
}

/// Identifies one harness run in the objects it creates.
pub fn new_run_id() -> String {
    format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S%3f"), std::process::id())
}

/// Why `existing` cannot be taken as the object this run created, or `None`
/// when it carries `run_id` and is not being deleted.
pub fn foreign_object_reason<K: Resource>(existing: &K, run_id: &str) -> Option<String> {
    let meta = existing.meta();
    if let Some(since) = &meta.deletion_timestamp {
        return Some(format!("is being deleted since {}", since.0));
    }
    match meta.annotations.as_ref().and_then(|a| a.get(RUN_ANNOTATION)) {
        Some(owner) if owner == run_id => None,
        Some(owner) => Some(format!("is left over from run {}", owner)),
        None => Some(format!("has no {} annotation", RUN_ANNOTATION)),
    }
}

/// Creates `obj` stamped with `run_id`, retrying any failure until `spec`
/// runs out. On a conflict the existing object is fetched: it is returned
/// when this run created it (an earlier attempt went through but the
/// response was lost), otherwise creation is retried until it goes away.
pub async fn eventually_create<K>(
    api: &Api<K>,
    obj: &K,
    run_id: &str,
    spec: PollSpec,
) -> Result<K, Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    K::DynamicType: Default,
{
    let name = obj.name_any();
    let what = format!("creating {} {}", K::kind(&Default::default()), name);
    let mut stamped = obj.clone();
    stamped
        .annotations_mut()
        .insert(RUN_ANNOTATION.to_string(), run_id.to_string());
    eventually(&what, spec, || async {
        match api.create(&PostParams::default(), &stamped).await {
            Ok(created) => {
                info!(name = %created.name_any(), "Created object.");
                Ok(Probe::Ready(created))
            }
            Err(e) if is_already_exists(&e) => match api.get_opt(&name).await? {
                None => Ok(Probe::pending(format!("{} vanished after a conflict", name))),
                Some(existing) => match foreign_object_reason(&existing, run_id) {
                    None => {
                        info!(name = %name, "Adopted object created by an earlier attempt.");
                        Ok(Probe::Ready(existing))
                    }
                    Some(reason) => Ok(Probe::pending(format!("existing {} {}", name, reason))),
                },
            },
            Err(e) => Err(e.into()),
        }
    })
    .await
}

/// Ready count of the agent daemon set, or `None` while it does not exist.
pub async fn agent_ready_count(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<Option<i32>, Error> {
    let ds_api: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    match ds_api.get(name).await {
        Err(e) if is_gone(&e) => Ok(None),
        Err(e) => Err(e.into()),
        Ok(ds) => Ok(Some(ds.status.map(|s| s.number_ready).unwrap_or(0))),
    }
}

/// Waits until exactly `expected` agents report ready. A missing daemon set is
/// waited for; any other error is classified by the poller.
pub async fn wait_for_agents(
    client: &Client,
    namespace: &str,
    name: &str,
    expected: i32,
    spec: PollSpec,
) -> Result<(), Error> {
    let what = format!("daemon set {}/{} to have {} ready pods", namespace, name, expected);
    poll_immediate_until(spec, &what, || async {
        match agent_ready_count(client, namespace, name).await? {
            None => {
                info!(daemon_set = name, "Waiting for availability of daemon set.");
                Ok(false)
            }
            Some(ready) if ready == expected => Ok(true),
            Some(ready) => {
                info!(
                    daemon_set = name,
                    ready,
                    expected,
                    "Waiting for full availability of daemon set."
                );
                Ok(false)
            }
        }
    })
    .await?;
    info!(daemon_set = name, ready = expected, "Daemon set available.");
    Ok(())
}

/// Tolerations from `wanted` that the daemon set's pod template lacks.
pub fn missing_tolerations<'a>(ds: &DaemonSet, wanted: &'a [Toleration]) -> Vec<&'a Toleration> {
    let present: &[Toleration] = ds
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|pod| pod.tolerations.as_deref())
        .unwrap_or_default();
    wanted.iter().filter(|t| !present.contains(t)).collect()
}

pub async fn verify_agent_tolerations(
    client: &Client,
    namespace: &str,
    name: &str,
    wanted: &[Toleration],
    spec: PollSpec,
) -> Result<(), Error> {
    let ds_api: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    let what = format!("daemon set {}/{}", namespace, name);
    let ds = eventually(&what, spec, || async { Ok(Probe::Ready(ds_api.get(name).await?)) }).await?;
    let missing = missing_tolerations(&ds, wanted);
    if !missing.is_empty() {
        return Err(Error::assertion(
            format!("tolerations of {}", what),
            format!("missing {:?} from the local volume", missing),
        ));
    }
    info!(daemon_set = name, "Daemon set carries the local volume tolerations.");
    Ok(())
}

/// Waits until the job reports at least one successful completion.
pub async fn wait_for_job_success(
    client: &Client,
    namespace: &str,
    name: &str,
    spec: PollSpec,
) -> Result<Job, Error> {
    let job_api: Api<Job> = Api::namespaced(client.clone(), namespace);
    let what = format!("job {}/{} to complete", namespace, name);
    let job = eventually(&what, spec, || async {
        let job = job_api.get(name).await?;
        let (succeeded, failed) = job
            .status
            .as_ref()
            .map(|s| (s.succeeded.unwrap_or(0), s.failed.unwrap_or(0)))
            .unwrap_or((0, 0));
        if succeeded >= 1 {
            Ok(Probe::Ready(job))
        } else {
            Ok(Probe::pending(format!("succeeded={}, failed={}", succeeded, failed)))
        }
    })
    .await?;
    info!(job = name, "Job completed.");
    Ok(job)
}

/// Worker nodes, falling back to every schedulable node when none carry the
/// worker role label.
pub async fn worker_nodes(
    client: &Client,
    worker_label: &str,
    spec: PollSpec,
) -> Result<Vec<Node>, Error> {
    let node_api: Api<Node> = Api::all(client.clone());
    let labelled = ListParams::default().labels(worker_label);
    let schedulable = ListParams::default().fields("spec.unschedulable=false");
    let nodes = RefCell::new(Vec::new());
    poll_immediate_until(spec, "listing worker nodes", || async {
        let mut listed = node_api.list(&labelled).await?.items;
        if listed.is_empty() {
            warn!(label = worker_label, "No labelled worker nodes, listing schedulable nodes.");
            listed = node_api.list(&schedulable).await?.items;
        }
        *nodes.borrow_mut() = listed;
        Ok(true)
    })
    .await?;
    Ok(nodes.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DaemonSetSpec;
    use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    use crate::testing::{list, scripted_client, status};

    const JOBS: &str = "/apis/batch/v1/namespaces/local-storage/jobs";
    const JOB: &str = "/apis/batch/v1/namespaces/local-storage/jobs/consumer";
    const CRD: &str = concat!(
        "/apis/apiextensions.k8s.io/v1/customresourcedefinitions/",
        "localvolumes.local.storage.openshift.io"
    );

    fn job_json(uid: &str, run: &str, deleting: bool) -> Value {
        let mut job = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": "consumer",
                "namespace": "local-storage",
                "uid": uid,
                "annotations": {RUN_ANNOTATION: run},
            },
        });
        if deleting {
            job["metadata"]["deletionTimestamp"] = json!("2024-05-01T12:00:00Z");
        }
        job
    }

    fn wanted_job() -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some("consumer".to_string()),
                namespace: Some("local-storage".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn node_json(name: &str) -> Value {
        json!({"apiVersion": "v1", "kind": "Node", "metadata": {"name": name}})
    }

    fn toleration(key: &str) -> Toleration {
        Toleration {
            key: Some(key.to_string()),
            value: Some("testvalue".to_string()),
            operator: Some("Equal".to_string()),
            ..Default::default()
        }
    }

    fn daemon_set(tolerations: Vec<Toleration>) -> DaemonSet {
        DaemonSet {
            spec: Some(DaemonSetSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        tolerations: Some(tolerations),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn tolerations_are_passed_through() {
        let ds = daemon_set(vec![
            toleration("localstorage"),
            toleration("node.kubernetes.io/disk"),
        ]);
        assert!(missing_tolerations(&ds, &[toleration("localstorage")]).is_empty());
    }

    #[test]
    fn missing_tolerations_are_reported() {
        let ds = daemon_set(vec![toleration("other")]);
        let wanted = [toleration("localstorage")];
        assert_eq!(missing_tolerations(&ds, &wanted), vec![&wanted[0]]);
        assert_eq!(missing_tolerations(&DaemonSet::default(), &wanted).len(), 1);
    }

    fn annotated(run: Option<&str>) -> Job {
        let mut job = wanted_job();
        job.metadata.annotations =
            run.map(|r| BTreeMap::from([(RUN_ANNOTATION.to_string(), r.to_string())]));
        job
    }

    #[test]
    fn only_live_objects_of_this_run_are_owned() {
        assert_eq!(foreign_object_reason(&annotated(Some("run-a")), "run-a"), None);
        let stale = foreign_object_reason(&annotated(Some("run-old")), "run-a").unwrap();
        assert!(stale.contains("run-old"));
        assert!(foreign_object_reason(&annotated(None), "run-a").is_some());

        let mut deleting = annotated(Some("run-a"));
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert!(foreign_object_reason(&deleting, "run-a").unwrap().contains("being deleted"));
    }

    #[test]
    fn run_id_names_the_process() {
        let id = new_run_id();
        assert!(id.ends_with(&format!("-{}", std::process::id())));
    }

    #[tokio::test(start_paused = true)]
    async fn create_waits_out_an_object_being_deleted() {
        let mut posts = 0;
        let (client, calls) = scripted_client(move |method, path| match (method.as_str(), path) {
            ("POST", JOBS) => {
                posts += 1;
                if posts == 1 {
                    status(409, "AlreadyExists")
                } else {
                    (201, job_json("fresh", "run-a", false))
                }
            }
            ("GET", JOB) => (200, job_json("stale", "run-old", true)),
            _ => status(404, "NotFound"),
        });
        let api: Api<Job> = Api::namespaced(client, "local-storage");
        let created = eventually_create(&api, &wanted_job(), "run-a", PollSpec::secs(2, 60))
            .await
            .unwrap();
        assert_eq!(created.uid().as_deref(), Some("fresh"));
        assert_eq!(calls.count("POST", JOBS), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn create_adopts_its_own_object_after_a_lost_response() {
        let (client, calls) = scripted_client(|method, path| match (method.as_str(), path) {
            ("POST", JOBS) => status(409, "AlreadyExists"),
            ("GET", JOB) => (200, job_json("mine", "run-a", false)),
            _ => status(404, "NotFound"),
        });
        let api: Api<Job> = Api::namespaced(client, "local-storage");
        let adopted = eventually_create(&api, &wanted_job(), "run-a", PollSpec::secs(2, 60))
            .await
            .unwrap();
        assert_eq!(adopted.uid().as_deref(), Some("mine"));
        assert_eq!(calls.count("POST", JOBS), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn create_refuses_a_leftover_from_another_run() {
        let (client, _calls) = scripted_client(|method, path| match (method.as_str(), path) {
            ("POST", JOBS) => status(409, "AlreadyExists"),
            ("GET", JOB) => (200, job_json("stale", "run-old", false)),
            _ => status(404, "NotFound"),
        });
        let api: Api<Job> = Api::namespaced(client, "local-storage");
        match eventually_create(&api, &wanted_job(), "run-a", PollSpec::secs(2, 10)).await {
            Err(Error::Timeout { last_observed, .. }) => assert!(last_observed.contains("run-old")),
            other => panic!("expected a timeout, got {:?}", other.map(|j| j.uid())),
        }
    }

    #[tokio::test]
    async fn missing_crd_is_reported_as_missing() {
        let (client, _calls) = scripted_client(|_, _| status(404, "NotFound"));
        let err = ensure_crd_registered(&client, "localvolumes.local.storage.openshift.io")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CrdMissing { .. }));
    }

    #[tokio::test]
    async fn crd_lookup_failure_is_not_reported_as_missing() {
        let (client, calls) = scripted_client(|_, _| status(403, "Forbidden"));
        let err = ensure_crd_registered(&client, "localvolumes.local.storage.openshift.io")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Kube(_)), "got {}", err);
        assert_eq!(calls.count("GET", CRD), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_listing_retries_transient_failures() {
        let mut lists = 0;
        let (client, calls) = scripted_client(move |_, _| {
            lists += 1;
            match lists {
                1 => status(503, "ServiceUnavailable"),
                2 => list("NodeList", vec![]),
                _ => list("NodeList", vec![node_json("worker-0"), node_json("worker-1")]),
            }
        });
        let nodes = worker_nodes(&client, "node-role.kubernetes.io/worker", PollSpec::secs(2, 30))
            .await
            .unwrap();
        let names: Vec<String> = nodes.iter().map(|n| n.name_any()).collect();
        assert_eq!(names, vec!["worker-0", "worker-1"]);
        assert_eq!(calls.count("GET", "/api/v1/nodes"), 3);
    }
}
