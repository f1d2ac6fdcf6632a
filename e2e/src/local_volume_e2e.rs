//! The local volume lifecycle scenario.
//!
//! Stages run strictly in order; the first failure aborts the run. Whatever
//! was created before that point is torn down by the cleanup registry, which
//! is drained exactly once whether or not the stages passed.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::{
    api::{Api, ListParams},
    Client, ResourceExt,
};
use tokio::time::Instant;
use tracing::*;

use crate::assertions::{consistently, eventually, Probe};
use crate::cleanup::CleanupRegistry;
use crate::common::{
    ensure_crd_registered, eventually_create, new_run_id, verify_agent_tolerations, wait_for_agents,
    wait_for_job_success, worker_nodes,
};
use crate::config::HarnessConfig;
use crate::correlate::{
    timestamp_floor, verify_device_paths, verify_provenance, volumes_of_class, VolumeCorrelator,
    PHASE_AVAILABLE, PHASE_BOUND,
};
use crate::crd::{Availability, LocalVolume, LOCAL_VOLUME_CRD};
use crate::disks::{provision_layout, Disk, DiskProvisioner, NodeDisks, StaticDiskProvisioner};
use crate::error::{is_gone, Error};
use crate::fixtures;
use crate::objects::{eventually_delete, TrackedObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    ProvisionExternal,
    CreateManaged,
    AwaitReady,
    Correlate,
    ConsumeAll,
    VerifyBound,
    ReleaseAll,
    VerifyReclaimed,
    ConsumePartial,
    RequestDelete,
    VerifyFinalizerHeld,
    ReleaseRemaining,
    VerifyTerminal,
}

impl Stage {
    pub const ALL: [Stage; 13] = [
        Stage::ProvisionExternal,
        Stage::CreateManaged,
        Stage::AwaitReady,
        Stage::Correlate,
        Stage::ConsumeAll,
        Stage::VerifyBound,
        Stage::ReleaseAll,
        Stage::VerifyReclaimed,
        Stage::ConsumePartial,
        Stage::RequestDelete,
        Stage::VerifyFinalizerHeld,
        Stage::ReleaseRemaining,
        Stage::VerifyTerminal,
    ];

    pub fn next(self) -> Option<Stage> {
        let index = Stage::ALL.iter().position(|s| *s == self)?;
        Stage::ALL.get(index + 1).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::ProvisionExternal => "provision-external",
            Stage::CreateManaged => "create-managed",
            Stage::AwaitReady => "await-ready",
            Stage::Correlate => "correlate",
            Stage::ConsumeAll => "consume-all",
            Stage::VerifyBound => "verify-bound",
            Stage::ReleaseAll => "release-all",
            Stage::VerifyReclaimed => "verify-reclaimed",
            Stage::ConsumePartial => "consume-partial",
            Stage::RequestDelete => "request-delete",
            Stage::VerifyFinalizerHeld => "verify-finalizer-held",
            Stage::ReleaseRemaining => "release-remaining",
            Stage::VerifyTerminal => "verify-terminal",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A claim, the job writing through it, and the pod elected as the job's run.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub volume: String,
    pub claim: PersistentVolumeClaim,
    pub job: Job,
    pub pod: Pod,
}

impl Consumer {
    /// Deletion order: the job first so it does not start another pod, then
    /// the pod, then the claim it was holding.
    pub fn objects(&self) -> Vec<TrackedObject> {
        vec![
            TrackedObject::job(&self.job),
            TrackedObject::pod(&self.pod),
            TrackedObject::claim(&self.claim),
        ]
    }
}

pub struct LocalVolumeScenario<P> {
    client: Client,
    cfg: HarnessConfig,
    run_id: String,
    provisioner: Arc<P>,
    correlator: VolumeCorrelator,
    cleanup: CleanupRegistry,
    nodes: Vec<Node>,
    layout: Vec<NodeDisks>,
    local_volume: Option<LocalVolume>,
    volumes: Vec<PersistentVolume>,
    consumers: Vec<Consumer>,
}

impl<P> LocalVolumeScenario<P>
where
    P: DiskProvisioner + Send + Sync + 'static,
{
    pub fn new(client: Client, cfg: HarnessConfig, provisioner: Arc<P>) -> Self {
        let correlator =
            VolumeCorrelator::new(client.clone(), cfg.namespace.clone(), cfg.labels.clone());
        Self {
            client,
            cfg,
            run_id: new_run_id(),
            provisioner,
            correlator,
            cleanup: CleanupRegistry::new(),
            nodes: Vec::new(),
            layout: Vec::new(),
            local_volume: None,
            volumes: Vec::new(),
            consumers: Vec::new(),
        }
    }

    /// Runs every stage, then drains the cleanup registry. A stage failure
    /// takes precedence over cleanup failures, which are still logged.
    pub async fn run(mut self) -> Result<(), Error> {
        let outcome = self.run_stages().await;
        let cleaned = self.cleanup.run_all().await;
        match (outcome, cleaned) {
            (Err(e), Err(cleanup)) => {
                error!(error = %cleanup, "Cleanup after a failed run also failed.");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(cleanup)) => Err(cleanup),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn run_stages(&mut self) -> Result<(), Error> {
        info!(run_id = %self.run_id, "Starting local volume e2e test.");
        ensure_crd_registered(&self.client, LOCAL_VOLUME_CRD).await?;
        let mut stage = Some(Stage::ProvisionExternal);
        while let Some(current) = stage {
            info!(stage = %current, "Entering stage.");
            let started = Instant::now();
            if let Err(e) = self.run_stage(current).await {
                error!(stage = %current, kind = e.kind(), error = %e, "Stage failed.");
                return Err(e);
            }
            info!(stage = %current, elapsed = ?started.elapsed(), "Stage passed.");
            stage = current.next();
        }
        info!(run_id = %self.run_id, "E2e test passed.");
        Ok(())
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<(), Error> {
        match stage {
            Stage::ProvisionExternal => self.provision_external().await,
            Stage::CreateManaged => self.create_managed().await,
            Stage::AwaitReady => self.await_ready().await,
            Stage::Correlate => self.correlate().await,
            Stage::ConsumeAll => {
                let volumes = self.volumes.clone();
                self.consume(&volumes).await
            }
            Stage::VerifyBound => {
                let names: Vec<String> = self.consumers.iter().map(|c| c.volume.clone()).collect();
                let spec = self.cfg.polling.bound;
                self.correlator
                    .await_phase(&self.cfg.storage_class_name, &names, PHASE_BOUND, spec)
                    .await
            }
            Stage::ReleaseAll | Stage::ReleaseRemaining => self.release().await,
            Stage::VerifyReclaimed => {
                let names: Vec<String> = self.volumes.iter().map(|pv| pv.name_any()).collect();
                let spec = self.cfg.polling.reclaim;
                self.correlator
                    .await_phase(&self.cfg.storage_class_name, &names, PHASE_AVAILABLE, spec)
                    .await
            }
            Stage::ConsumePartial => {
                let first = self
                    .volumes
                    .first()
                    .cloned()
                    .ok_or_else(|| {
                        Error::assertion("partial consumption", "no volumes to consume")
                    })?;
                self.consume(&[first]).await
            }
            Stage::RequestDelete => self.request_delete().await,
            Stage::VerifyFinalizerHeld => self.verify_finalizer_held().await,
            Stage::VerifyTerminal => self.verify_terminal().await,
        }
    }

    fn selected(&self) -> Result<(&NodeDisks, &Disk), Error> {
        let node = self
            .layout
            .first()
            .ok_or_else(|| Error::assertion("selected node", "no disks were provisioned"))?;
        let disk = node.disks.first().ok_or_else(|| {
            Error::assertion("selected disk", format!("node {} has no disks", node.node_name()))
        })?;
        Ok((node, disk))
    }

    fn local_volume(&self) -> Result<&LocalVolume, Error> {
        self.local_volume
            .as_ref()
            .ok_or_else(|| Error::assertion("local volume", "not created yet"))
    }

    async fn provision_external(&mut self) -> Result<(), Error> {
        let polling = &self.cfg.polling;
        let worker_role = &self.cfg.labels.worker_role;
        self.nodes = worker_nodes(&self.client, worker_role, polling.create).await?;
        let wanted = self.cfg.min_nodes.max(self.cfg.disk_layout.nodes);
        if self.nodes.len() < wanted {
            return Err(Error::assertion(
                "worker nodes",
                format!("expected at least {} nodes, found {}", wanted, self.nodes.len()),
            ));
        }

        // Registered first so it runs after the disks are gone.
        for node in self.nodes.iter().take(self.cfg.disk_layout.nodes) {
            let (client, cfg) = (self.client.clone(), self.cfg.clone());
            let (run_id, node) = (self.run_id.clone(), node.name_any());
            self.cleanup
                .register(format!("cleanup-symlinks {}", node), move || async move {
                    clean_symlinks(client, cfg, run_id, node).await
                });
        }

        let nvme = self.cfg.nvme_regex()?;
        self.layout = provision_layout(
            &self.provisioner,
            &self.nodes,
            &self.cfg.disk_layout,
            &self.cfg.labels.instance_type,
            &nvme,
            &mut self.cleanup,
        )
        .await?;
        let (node, disk) = self.selected()?;
        info!(node = %node.node_name(), path = %disk.path, id = %disk.id, "Selected disk.");
        Ok(())
    }

    async fn create_managed(&mut self) -> Result<(), Error> {
        let (node, disk) = self.selected()?;
        let lv = fixtures::local_volume(&self.cfg, &node.node_name(), &[disk.path.clone()])?;

        let (client, cfg) = (self.client.clone(), self.cfg.clone());
        self.cleanup
            .register("cleanup-local-volume-resources", move || async move {
                cleanup_local_volume_resources(client, cfg).await
            });

        let lv_api: Api<LocalVolume> = Api::namespaced(self.client.clone(), &self.cfg.namespace);
        let created = eventually_create(&lv_api, &lv, &self.run_id, self.cfg.polling.create).await?;
        self.local_volume = Some(created);
        Ok(())
    }

    async fn await_ready(&mut self) -> Result<(), Error> {
        let cfg = &self.cfg;
        wait_for_agents(
            &self.client,
            &cfg.namespace,
            &cfg.agent_daemon_set,
            cfg.expected_ready_agents,
            cfg.polling.ready,
        )
        .await?;
        let lv = self.local_volume()?;
        verify_agent_tolerations(
            &self.client,
            &cfg.namespace,
            &cfg.agent_daemon_set,
            &lv.spec.tolerations,
            cfg.polling.ready,
        )
        .await?;

        let lv_api: Api<LocalVolume> = Api::namespaced(self.client.clone(), &cfg.namespace);
        let name = lv.name_any();
        let what = format!("local volume {} to be available", name);
        let ready = eventually(&what, cfg.polling.ready, || async {
            let lv = lv_api.get(&name).await?;
            if lv.finalizers().is_empty() {
                return Ok(Probe::pending("no finalizers yet"));
            }
            match lv.availability() {
                Availability::Available => Ok(Probe::Ready(lv)),
                Availability::NoConditions => Ok(Probe::pending("no conditions")),
                Availability::NeverTransitioned => {
                    Ok(Probe::pending("available without a transition time"))
                }
                Availability::NotAvailable(detail) => Ok(Probe::Pending(detail)),
            }
        })
        .await?;
        info!(local_volume = %name, finalizers = ?ready.finalizers(), "Local volume is available.");
        self.local_volume = Some(ready);
        Ok(())
    }

    async fn correlate(&mut self) -> Result<(), Error> {
        let lv = self.local_volume()?;
        let expected: usize =
            lv.spec.storage_class_devices.iter().map(|d| d.device_paths.len()).sum();
        let (_, disk) = self.selected()?;
        let disks = [disk.clone()];
        let cfg = &self.cfg;
        let class = &cfg.storage_class_name;

        let found = self
            .correlator
            .find_volumes(class, expected, cfg.polling.find_volumes)
            .await?;
        verify_device_paths(&found, &disks)?;
        verify_provenance(&found, &self.nodes, &cfg.labels, &cfg.provisioner_name)?;

        let replaced = self
            .correlator
            .replace_volumes(class, &found, cfg.polling.delete, cfg.polling.find_volumes)
            .await?;
        verify_device_paths(&replaced, &disks)?;
        verify_provenance(&replaced, &self.nodes, &cfg.labels, &cfg.provisioner_name)?;
        let names: Vec<String> = replaced.iter().map(|pv| pv.name_any()).collect();
        info!(volumes = ?names, "Volumes correlated.");
        self.volumes = replaced;
        Ok(())
    }

    async fn consume(&mut self, volumes: &[PersistentVolume]) -> Result<(), Error> {
        for pv in volumes {
            let consumer = self.consume_one(pv).await?;
            self.consumers.push(consumer);
        }
        Ok(())
    }

    async fn consume_one(&mut self, pv: &PersistentVolume) -> Result<Consumer, Error> {
        let cfg = &self.cfg;
        let claim = fixtures::consumer_claim(cfg, pv)?;
        let job = fixtures::consumer_job(cfg, pv, &claim)?;

        let (client, delete) = (self.client.clone(), cfg.polling.delete);
        let leftovers = vec![TrackedObject::job(&job), TrackedObject::claim(&claim)];
        self.cleanup
            .register(format!("delete-consumer {}", pv.name_any()), move || async move {
                eventually_delete(&client, &leftovers, delete).await
            });

        let claim_api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &cfg.namespace);
        let claim = eventually_create(&claim_api, &claim, &self.run_id, cfg.polling.create).await?;

        let started = timestamp_floor(Utc::now(), cfg.timestamp_granularity)?;
        let job_api: Api<Job> = Api::namespaced(self.client.clone(), &cfg.namespace);
        let job = eventually_create(&job_api, &job, &self.run_id, cfg.polling.create).await?;
        let job_name = job.name_any();
        let job =
            wait_for_job_success(&self.client, &cfg.namespace, &job_name, cfg.polling.job_complete)
                .await?;

        let volume = pv.name_any();
        let pod = self
            .correlator
            .find_consumer_pod(&cfg.consumer.app_label, &volume, started, cfg.polling.consumer_pod)
            .await?;
        info!(volume = %volume, pod = %pod.name_any(), "Volume consumed.");
        Ok(Consumer {
            volume,
            claim,
            job,
            pod,
        })
    }

    async fn release(&mut self) -> Result<(), Error> {
        let consumers = std::mem::take(&mut self.consumers);
        for consumer in &consumers {
            eventually_delete(&self.client, &consumer.objects(), self.cfg.polling.delete).await?;
            info!(volume = %consumer.volume, "Volume released.");
        }
        Ok(())
    }

    async fn request_delete(&mut self) -> Result<(), Error> {
        let object = TrackedObject::local_volume(self.local_volume()?);
        let what = format!("deletion request for {}", object.key());
        eventually(&what, self.cfg.polling.request_delete, || async {
            object.delete(&self.client).await?;
            Ok(Probe::Ready(()))
        })
        .await?;
        info!(object = %object.key(), "Deletion requested.");
        Ok(())
    }

    async fn verify_finalizer_held(&mut self) -> Result<(), Error> {
        let lv_api: Api<LocalVolume> = Api::namespaced(self.client.clone(), &self.cfg.namespace);
        let name = self.local_volume()?.name_any();
        let what = format!("finalizers of {} while a consumer is bound", name);
        consistently(&what, self.cfg.polling.finalizer_window, || async {
            match lv_api.get(&name).await {
                Ok(lv) => {
                    debug!(finalizers = ?lv.finalizers(), "Local volume still present.");
                    Ok(!lv.finalizers().is_empty())
                }
                Err(e) if is_gone(&e) => Err(Error::assertion(
                    &what,
                    "local volume was deleted while a volume was bound",
                )),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn verify_terminal(&mut self) -> Result<(), Error> {
        let lv_api: Api<LocalVolume> = Api::namespaced(self.client.clone(), &self.cfg.namespace);
        let name = self.local_volume()?.name_any();
        let what = format!("local volume {} to be gone", name);
        eventually(&what, self.cfg.polling.terminal, || async {
            match lv_api.get(&name).await {
                Ok(lv) => Ok(Probe::pending(format!(
                    "present with finalizers {:?}",
                    lv.finalizers()
                ))),
                Err(e) if is_gone(&e) => Ok(Probe::Ready(())),
                Err(e) => Err(e.into()),
            }
        })
        .await?;
        info!(local_volume = %name, "Local volume deleted.");

        let class = &self.cfg.storage_class_name;
        match self.correlator.list_volumes(class, self.cfg.polling.delete).await {
            Ok(leftovers) if !leftovers.is_empty() => warn!(
                count = leftovers.len(),
                "Volumes of the class outlived the local volume, leaving them to cleanup."
            ),
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Could not list leftover volumes, leaving them to cleanup.")
            }
        }
        Ok(())
    }
}

/// Runs the symlink cleanup job on `node` to completion and removes it.
async fn clean_symlinks(
    client: Client,
    cfg: HarnessConfig,
    run_id: String,
    node: String,
) -> Result<(), Error> {
    let job = fixtures::symlink_cleanup_job(&cfg, &node)?;
    let job_api: Api<Job> = Api::namespaced(client.clone(), &cfg.namespace);
    let job = eventually_create(&job_api, &job, &run_id, cfg.polling.create).await?;
    let job_name = job.name_any();
    let outcome =
        wait_for_job_success(&client, &cfg.namespace, &job_name, cfg.polling.job_complete).await;
    eventually_delete(&client, &[TrackedObject::job(&job)], cfg.polling.delete).await?;
    outcome.map(|_| ())
}

/// Deletes the local volume, its storage class, and every volume of the class.
async fn cleanup_local_volume_resources(client: Client, cfg: HarnessConfig) -> Result<(), Error> {
    let owned = [
        TrackedObject::LocalVolume {
            namespace: cfg.namespace.clone(),
            name: cfg.local_volume_name.clone(),
        },
        TrackedObject::StorageClass {
            name: cfg.storage_class_name.clone(),
        },
    ];
    eventually_delete(&client, &owned, cfg.polling.delete).await?;

    let pv_api: Api<PersistentVolume> = Api::all(client.clone());
    let pvs = eventually("listing volumes to clean up", cfg.polling.delete, || async {
        Ok(Probe::Ready(pv_api.list(&ListParams::default()).await?.items))
    })
    .await?;
    let volumes: Vec<TrackedObject> = volumes_of_class(pvs, &cfg.storage_class_name)
        .iter()
        .map(TrackedObject::persistent_volume)
        .collect();
    info!(count = volumes.len(), "Deleting volumes of the local volume.");
    eventually_delete(&client, &volumes, cfg.polling.delete).await
}

/// Runs the scenario against the current kube context with the pre-attached
/// disks listed in `cfg`.
pub async fn local_volume_e2e_test(cfg: HarnessConfig) -> Result<(), Error> {
    cfg.validate()?;
    let client = Client::try_default().await?;
    let provisioner = Arc::new(StaticDiskProvisioner::new(cfg.static_disks.clone()));
    LocalVolumeScenario::new(client, cfg, provisioner).run().await
}
