// Docker-engine container runtime
//
// Reads pod metadata from the labels the kubelet puts on Docker containers
// (cri-dockerd / dockershim layout) and runs commands with `docker exec`.
//
// # Label layout
// - every container: io.kubernetes.pod.namespace, io.kubernetes.pod.name
// - sandbox container: io.kubernetes.docker.type=podsandbox, pod labels copied
//   verbatim, pod annotations as `annotation.<key>`

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions, LogOutput};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::ContainerSummary;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{ContainerRuntime, CriError, ExecOutput, Pod};

const LABEL_NAMESPACE: &str = "io.kubernetes.pod.namespace";
const LABEL_POD_NAME: &str = "io.kubernetes.pod.name";
const LABEL_CONTAINER_NAME: &str = "io.kubernetes.container.name";
const LABEL_DOCKER_TYPE: &str = "io.kubernetes.docker.type";
const SANDBOX_TYPE: &str = "podsandbox";
const SANDBOX_CONTAINER_NAME: &str = "POD";
const ANNOTATION_PREFIX: &str = "annotation.";

/// Container runtime backed by the local Docker daemon
///
/// # Requirements
/// - Docker daemon must be running
/// - The agent must be able to access the Docker socket
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the default socket, falling back to DOCKER_HOST and friends.
    pub fn connect() -> Result<Self, CriError> {
        let docker = Docker::connect_with_socket_defaults().or_else(|_| Docker::connect_with_local_defaults())?;
        Ok(DockerRuntime { docker })
    }

    async fn pod_containers(&self, namespace: &str, pod: &str) -> Result<Vec<ContainerSummary>, CriError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![
                format!("{LABEL_NAMESPACE}={namespace}"),
                format!("{LABEL_POD_NAME}={pod}"),
            ],
        )]);
        let options = ListContainersOptions {
            filters,
            ..Default::default()
        };
        Ok(self.docker.list_containers(Some(options)).await?)
    }
}

fn labels_of(container: &ContainerSummary) -> HashMap<String, String> {
    container.labels.clone().unwrap_or_default()
}

fn is_sandbox(labels: &HashMap<String, String>) -> bool {
    labels.get(LABEL_DOCKER_TYPE).map(String::as_str) == Some(SANDBOX_TYPE)
        || labels.get(LABEL_CONTAINER_NAME).map(String::as_str) == Some(SANDBOX_CONTAINER_NAME)
}

/// Splits sandbox labels into pod labels and pod annotations.
fn split_labels(labels: &HashMap<String, String>) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut pod_labels = BTreeMap::new();
    let mut annotations = BTreeMap::new();
    for (key, value) in labels {
        if let Some(annotation) = key.strip_prefix(ANNOTATION_PREFIX) {
            annotations.insert(annotation.to_string(), value.clone());
        } else if !key.starts_with("io.kubernetes.") {
            pod_labels.insert(key.clone(), value.clone());
        }
    }
    (pod_labels, annotations)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn get_pod(&self, namespace: &str, pod: &str) -> Result<Option<Arc<Pod>>, CriError> {
        let containers = self.pod_containers(namespace, pod).await?;
        if containers.is_empty() {
            debug!("No containers found for pod {}/{}", namespace, pod);
            return Ok(None);
        }

        let mut result = Pod {
            namespace: namespace.to_string(),
            name: pod.to_string(),
            ..Default::default()
        };

        for container in &containers {
            let labels = labels_of(container);
            if is_sandbox(&labels) {
                let (pod_labels, annotations) = split_labels(&labels);
                result.labels = pod_labels;
                result.annotations = annotations;

                if let Some(id) = container.id.as_deref() {
                    let inspect = self
                        .docker
                        .inspect_container(id, None::<InspectContainerOptions>)
                        .await?;
                    result.hostname = inspect
                        .config
                        .and_then(|c| c.hostname)
                        .unwrap_or_default();
                    result.ip = inspect
                        .network_settings
                        .and_then(|n| {
                            n.ip_address.filter(|ip| !ip.is_empty()).or_else(|| {
                                n.networks?
                                    .into_values()
                                    .find_map(|e| e.ip_address.filter(|ip| !ip.is_empty()))
                            })
                        })
                        .unwrap_or_default();
                }
            } else if result.main_container.is_none() {
                result.main_container = container.id.clone();
            }
        }

        if result.main_container.is_none() {
            warn!("Pod {}/{} has only a sandbox container", namespace, pod);
        }

        Ok(Some(Arc::new(result)))
    }

    async fn exec(&self, container: &str, cmd: Vec<String>, stdin: Vec<u8>) -> Result<ExecOutput, CriError> {
        debug!("Exec in container {}: {:?}", container, cmd);

        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd),
                    ..Default::default()
                },
            )
            .await?;

        let mut out = ExecOutput::default();

        if let StartExecResults::Attached { mut output, mut input } = self.docker.start_exec(&exec.id, None).await? {
            let write = async {
                input.write_all(&stdin).await?;
                input.shutdown().await
            };
            let read = async {
                while let Some(chunk) = output.next().await {
                    match chunk? {
                        LogOutput::StdOut { message } => out.stdout.extend_from_slice(&message),
                        LogOutput::StdErr { message } => out.stderr.extend_from_slice(&message),
                        _ => {}
                    }
                }
                Ok::<(), bollard::errors::Error>(())
            };
            let (written, read) = tokio::join!(write, read);
            written?;
            read?;
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        out.exit_code = inspect.exit_code.unwrap_or(-1);
        Ok(out)
    }
}
