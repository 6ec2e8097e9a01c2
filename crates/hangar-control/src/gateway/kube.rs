// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes gateway.
//!
//! Machines are pods in one namespace. Each pod carries the machine id and
//! owner as labels; tools and disk size ride along as annotations so a pod
//! alone is enough to re-derive its creation spec. Data volumes are
//! persistent volume claims, snapshots are CSI `VolumeSnapshot` objects
//! accessed through the dynamic API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements,
    TypedLocalObjectReference, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use kube::Client;
use kube::api::{
    Api, ApiResource, AttachParams, DeleteParams, DynamicObject, GroupVersionKind, ListParams,
    LogParams, PostParams,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use super::traits::*;
use crate::machine::{Resources, owner_label, workload_name};

const MAIN_CONTAINER: &str = "machine";
const DATA_VOLUME: &str = "data";
const DATA_MOUNT_PATH: &str = "/data";

const APP_LABEL: &str = "app";
const MACHINE_APP: &str = "hangar-machine";
const SNAPSHOT_APP: &str = "hangar-snapshot";
const MACHINE_ID_LABEL: &str = "hangar/machine-id";
const OWNER_LABEL: &str = "hangar/owner";

const TOOLS_ANNOTATION: &str = "hangar/tools";
const DISK_ANNOTATION: &str = "hangar/disk";
const DESCRIPTION_ANNOTATION: &str = "hangar/description";
const CREATED_AT_ANNOTATION: &str = "hangar/created-at";

const SNAPSHOT_GROUP: &str = "snapshot.storage.k8s.io";
const SNAPSHOT_VERSION: &str = "v1";
const SNAPSHOT_KIND: &str = "VolumeSnapshot";
const SNAPSHOT_PLURAL: &str = "volumesnapshots";

/// Settings for [`KubeGateway`].
#[derive(Debug, Clone)]
pub struct KubeGatewayConfig {
    /// Namespace holding machines, claims and snapshots.
    pub namespace: String,
    /// Headless service the pods use as DNS subdomain.
    pub service_domain: String,
    /// Storage class for new claims.
    pub storage_class: Option<String>,
    /// Snapshot class for new snapshots.
    pub snapshot_class: Option<String>,
}

/// Cluster gateway backed by the Kubernetes API.
pub struct KubeGateway {
    client: Client,
    config: KubeGatewayConfig,
}

impl KubeGateway {
    /// Create a gateway from an already configured client.
    pub fn new(client: Client, config: KubeGatewayConfig) -> Self {
        Self { client, config }
    }

    /// Create a gateway using the ambient kubeconfig or in-cluster credentials.
    pub async fn try_default(config: KubeGatewayConfig) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| GatewayError::Other(format!("Failed to create k8s client: {}", e)))?;
        Ok(Self::new(client, config))
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn claims(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn snapshots(&self) -> (Api<DynamicObject>, ApiResource) {
        let gvk = GroupVersionKind::gvk(SNAPSHOT_GROUP, SNAPSHOT_VERSION, SNAPSHOT_KIND);
        let resource = ApiResource::from_gvk_with_plural(&gvk, SNAPSHOT_PLURAL);
        let api = Api::namespaced_with(self.client.clone(), &self.config.namespace, &resource);
        (api, resource)
    }
}

fn build_pod(config: &KubeGatewayConfig, spec: &WorkloadSpec) -> Pod {
    let name = workload_name(&spec.machine_id);

    let labels = BTreeMap::from([
        (APP_LABEL.to_string(), MACHINE_APP.to_string()),
        (MACHINE_ID_LABEL.to_string(), spec.machine_id.clone()),
        (OWNER_LABEL.to_string(), owner_label(&spec.owner)),
    ]);

    let mut annotations = BTreeMap::new();
    if !spec.tools.is_empty() {
        annotations.insert(TOOLS_ANNOTATION.to_string(), json!(spec.tools).to_string());
    }
    if let Some(disk) = &spec.resources.disk {
        annotations.insert(DISK_ANNOTATION.to_string(), disk.clone());
    }

    let env: Vec<EnvVar> = spec
        .env
        .iter()
        .map(|(key, value)| EnvVar {
            name: key.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    let mut limits = BTreeMap::new();
    if let Some(cpu) = &spec.resources.cpu {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &spec.resources.memory {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }

    let (volumes, volume_mounts) = match &spec.volume_claim {
        Some(claim) => (
            Some(vec![Volume {
                name: DATA_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.clone(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            Some(vec![VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: DATA_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
        ),
        None => (None, None),
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            hostname: Some(name),
            subdomain: Some(config.service_domain.clone()),
            restart_policy: Some("Always".to_string()),
            containers: vec![Container {
                name: MAIN_CONTAINER.to_string(),
                image: Some(spec.image.clone()),
                env: Some(env),
                resources: Some(ResourceRequirements {
                    limits: Some(limits),
                    ..Default::default()
                }),
                volume_mounts,
                ..Default::default()
            }],
            volumes,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn api_error(error: kube::Error) -> GatewayError {
    match error {
        kube::Error::Api(response) if response.code == 404 => {
            GatewayError::NotFound(response.message)
        }
        kube::Error::Api(response) if response.code == 409 => {
            GatewayError::AlreadyExists(response.message)
        }
        other => GatewayError::Api(other.to_string()),
    }
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

fn workload_from_pod(pod: Pod) -> Option<Workload> {
    let Pod {
        metadata,
        spec,
        status,
    } = pod;

    let labels = metadata.labels.unwrap_or_default();
    let machine_id = labels.get(MACHINE_ID_LABEL)?.clone();
    let owner = labels.get(OWNER_LABEL).cloned().unwrap_or_default();
    let annotations = metadata.annotations.unwrap_or_default();

    let spec = spec.unwrap_or_default();
    let container = spec
        .containers
        .iter()
        .find(|c| c.name == MAIN_CONTAINER)
        .or(spec.containers.first());

    let image = container.and_then(|c| c.image.clone()).unwrap_or_default();
    let env: BTreeMap<String, String> = container
        .and_then(|c| c.env.as_ref())
        .map(|vars| {
            vars.iter()
                .filter_map(|v| Some((v.name.clone(), v.value.clone()?)))
                .collect()
        })
        .unwrap_or_default();

    let limits = container
        .and_then(|c| c.resources.as_ref())
        .and_then(|r| r.limits.as_ref());
    let resources = Resources {
        cpu: limits.and_then(|l| l.get("cpu")).map(|q| q.0.clone()),
        memory: limits.and_then(|l| l.get("memory")).map(|q| q.0.clone()),
        disk: annotations.get(DISK_ANNOTATION).cloned(),
    };

    let tools = annotations
        .get(TOOLS_ANNOTATION)
        .map(|raw| parse_tools(raw))
        .unwrap_or_default();

    let volume_claim = spec.volumes.as_ref().and_then(|volumes| {
        volumes.iter().find_map(|v| {
            v.persistent_volume_claim
                .as_ref()
                .map(|c| c.claim_name.clone())
        })
    });

    let status = status.unwrap_or_default();
    let containers: Vec<ContainerReadiness> = status
        .container_statuses
        .unwrap_or_default()
        .into_iter()
        .map(|cs| {
            let reason = cs.state.as_ref().and_then(|state| {
                state
                    .waiting
                    .as_ref()
                    .and_then(|w| w.reason.clone())
                    .or_else(|| state.terminated.as_ref().and_then(|t| t.reason.clone()))
            });
            ContainerReadiness {
                name: cs.name,
                ready: cs.ready,
                reason,
            }
        })
        .collect();

    let reason = status
        .reason
        .clone()
        .or_else(|| containers.iter().find_map(|c| c.reason.clone()))
        .or_else(|| {
            status.conditions.as_ref().and_then(|conditions| {
                conditions
                    .iter()
                    .find(|c| c.status == "False")
                    .and_then(|c| c.reason.clone())
            })
        });

    Some(Workload {
        name: metadata.name.unwrap_or_default(),
        machine_id,
        owner,
        image,
        env,
        tools,
        resources,
        volume_claim,
        phase: WorkloadPhase::parse(status.phase.as_deref()),
        reason,
        message: status.message,
        containers,
        created_at: metadata.creation_timestamp.map(|t| t.0),
        pod_ip: status.pod_ip,
        terminating: metadata.deletion_timestamp.is_some(),
    })
}

/// Tools are stored as a JSON array. Pods annotated before that carry a
/// comma list.
fn parse_tools(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_else(|_| crate::config::parse_list(raw))
}

fn claim_from_pvc(pvc: PersistentVolumeClaim) -> VolumeClaim {
    let spec = pvc.spec.unwrap_or_default();
    VolumeClaim {
        name: pvc.metadata.name.unwrap_or_default(),
        machine_id: pvc
            .metadata
            .labels
            .and_then(|labels| labels.get(MACHINE_ID_LABEL).cloned()),
        size: spec
            .resources
            .and_then(|r| r.requests)
            .and_then(|requests| requests.get("storage").map(|q| q.0.clone())),
        source_snapshot: spec
            .data_source
            .filter(|source| source.kind == SNAPSHOT_KIND)
            .map(|source| source.name),
    }
}

fn snapshot_from_object(object: DynamicObject) -> SnapshotRecord {
    let labels = object.metadata.labels.unwrap_or_default();
    let annotations = object.metadata.annotations.unwrap_or_default();
    let status = object.data.get("status");

    let created_at = annotations
        .get(CREATED_AT_ANNOTATION)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
        .or(object.metadata.creation_timestamp.map(|t| t.0));

    SnapshotRecord {
        id: object.metadata.name.unwrap_or_default(),
        machine_id: labels.get(MACHINE_ID_LABEL).cloned(),
        description: annotations
            .get(DESCRIPTION_ANNOTATION)
            .cloned()
            .unwrap_or_default(),
        created_at,
        source_claim: object
            .data
            .pointer("/spec/source/persistentVolumeClaimName")
            .and_then(Value::as_str)
            .map(str::to_string),
        ready: status
            .and_then(|s| s.get("readyToUse"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        restore_size: status
            .and_then(|s| s.get("restoreSize"))
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

async fn read_output<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut bytes = Vec::new();
    if let Err(e) = reader.read_to_end(&mut bytes).await {
        warn!(error = %e, "Failed to read exec output");
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Exit code from an exec status. Non-zero exits are reported as a
/// `NonZeroExitCode` failure with the code in the `ExitCode` cause.
fn exit_code_from_status(status: &Status) -> Option<i32> {
    if status.status.as_deref() == Some("Success") {
        return Some(0);
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.parse().ok())
        })
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    fn gateway_type(&self) -> &'static str {
        "kube"
    }

    fn namespace(&self) -> &str {
        &self.config.namespace
    }

    async fn find(&self, machine_id: &str) -> Result<Option<Workload>> {
        let pod = self
            .pods()
            .get_opt(&workload_name(machine_id))
            .await
            .map_err(api_error)?;
        Ok(pod.and_then(workload_from_pod))
    }

    async fn create(&self, spec: &WorkloadSpec) -> Result<Workload> {
        let pod = build_pod(&self.config, spec);
        let created = self
            .pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(api_error)?;
        debug!(machine_id = %spec.machine_id, "Pod created");
        workload_from_pod(created)
            .ok_or_else(|| GatewayError::Other("created pod is missing machine labels".to_string()))
    }

    async fn delete(&self, machine_id: &str) -> Result<bool> {
        match self
            .pods()
            .delete(&workload_name(machine_id), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(api_error(e)),
        }
    }

    async fn list_all(&self) -> Result<Vec<Workload>> {
        let params = ListParams::default().labels(&format!("{}={}", APP_LABEL, MACHINE_APP));
        let pods = self.pods().list(&params).await.map_err(api_error)?;
        Ok(pods.items.into_iter().filter_map(workload_from_pod).collect())
    }

    fn service_host(&self, workload: &Workload) -> String {
        format!(
            "{}.{}.{}.svc.cluster.local",
            workload.name, self.config.service_domain, self.config.namespace
        )
    }

    async fn exec(&self, machine_id: &str, command: &[String]) -> Result<ExecOutput> {
        let params = AttachParams::default()
            .container(MAIN_CONTAINER)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut process = self
            .pods()
            .exec(&workload_name(machine_id), command.to_vec(), &params)
            .await
            .map_err(api_error)?;

        let status = process.take_status();
        let stdout = process.stdout();
        let stderr = process.stderr();
        let (stdout, stderr) = tokio::join!(read_output(stdout), read_output(stderr));

        let status = match status {
            Some(pending) => pending.await,
            None => None,
        };
        if let Err(e) = process.join().await {
            warn!(machine_id = %machine_id, error = %e, "Exec session did not close cleanly");
        }

        let exit_code = status.as_ref().and_then(exit_code_from_status);
        let error = status
            .filter(|s| s.status.as_deref() != Some("Success"))
            .map(|s| {
                s.message
                    .unwrap_or_else(|| "command failed".to_string())
            });

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
            error,
        })
    }

    async fn logs(&self, machine_id: &str, options: &LogOptions) -> Result<LogStream> {
        let pods = self.pods();
        let name = workload_name(machine_id);
        let params = LogParams {
            container: Some(
                options
                    .container
                    .clone()
                    .unwrap_or_else(|| MAIN_CONTAINER.to_string()),
            ),
            follow: options.follow,
            tail_lines: options.tail,
            ..Default::default()
        };

        let stream = async_stream::stream! {
            match pods.log_stream(&name, &params).await {
                Ok(reader) => {
                    let mut lines = Box::pin(reader.lines());
                    while let Some(line) = lines.next().await {
                        yield line.map_err(|e| GatewayError::Api(e.to_string()));
                    }
                }
                Err(e) => yield Err(api_error(e)),
            }
        };
        Ok(stream.boxed())
    }

    async fn find_volume_claim(&self, name: &str) -> Result<Option<VolumeClaim>> {
        let pvc = self.claims().get_opt(name).await.map_err(api_error)?;
        Ok(pvc.map(claim_from_pvc))
    }

    async fn create_volume_claim(&self, spec: &VolumeClaimSpec) -> Result<VolumeClaim> {
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                namespace: Some(self.config.namespace.clone()),
                labels: Some(BTreeMap::from([
                    (APP_LABEL.to_string(), MACHINE_APP.to_string()),
                    (MACHINE_ID_LABEL.to_string(), spec.machine_id.clone()),
                ])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: self.config.storage_class.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(spec.size.clone()),
                    )])),
                    ..Default::default()
                }),
                data_source: spec.source_snapshot.as_ref().map(|snapshot| {
                    TypedLocalObjectReference {
                        api_group: Some(SNAPSHOT_GROUP.to_string()),
                        kind: SNAPSHOT_KIND.to_string(),
                        name: snapshot.clone(),
                    }
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .claims()
            .create(&PostParams::default(), &pvc)
            .await
            .map_err(api_error)?;
        Ok(claim_from_pvc(created))
    }

    async fn delete_volume_claim(&self, name: &str) -> Result<bool> {
        match self.claims().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(api_error(e)),
        }
    }

    async fn create_snapshot(&self, request: &SnapshotRequest) -> Result<SnapshotRecord> {
        let (api, resource) = self.snapshots();

        let mut spec = json!({
            "source": { "persistentVolumeClaimName": request.claim_name }
        });
        if let Some(class) = &self.config.snapshot_class {
            spec["volumeSnapshotClassName"] = json!(class);
        }

        let mut object = DynamicObject::new(&request.id, &resource)
            .within(&self.config.namespace)
            .data(json!({ "spec": spec }));
        object.metadata.labels = Some(BTreeMap::from([
            (APP_LABEL.to_string(), SNAPSHOT_APP.to_string()),
            (MACHINE_ID_LABEL.to_string(), request.machine_id.clone()),
        ]));
        object.metadata.annotations = Some(BTreeMap::from([
            (
                DESCRIPTION_ANNOTATION.to_string(),
                request.description.clone(),
            ),
            (
                CREATED_AT_ANNOTATION.to_string(),
                request.created_at.to_rfc3339(),
            ),
        ]));

        let created = api
            .create(&PostParams::default(), &object)
            .await
            .map_err(api_error)?;
        Ok(snapshot_from_object(created))
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>> {
        let (api, _) = self.snapshots();
        let object = api.get_opt(snapshot_id).await.map_err(api_error)?;
        Ok(object.map(snapshot_from_object))
    }

    async fn list_snapshots(&self, machine_id: &str) -> Result<Vec<SnapshotRecord>> {
        let (api, _) = self.snapshots();
        let params = ListParams::default().labels(&format!("{}={}", MACHINE_ID_LABEL, machine_id));
        let objects = api.list(&params).await.map_err(api_error)?;
        Ok(objects.items.into_iter().map(snapshot_from_object).collect())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool> {
        let (api, _) = self.snapshots();
        match api.delete(snapshot_id, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(api_error(e)),
        }
    }
}
