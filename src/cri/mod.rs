// Container runtime module - pod metadata lookup and exec in containers
//
// The core needs exactly two things from the runtime: the current metadata of
// a pod, and the ability to run a command inside one of its containers with
// stdin attached. All process-spawn and runtime plumbing stays behind
// `ContainerRuntime`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod docker;

pub use docker::DockerRuntime;

/// Errors surfaced by the container runtime
#[derive(Error, Debug)]
pub enum CriError {
    #[error("pod {namespace}/{pod} not found")]
    NoPod { namespace: String, pod: String },

    #[error("pod {0} has no container to exec in")]
    NoContainer(String),

    #[error("exec timed out after {0:?}")]
    Timeout(Duration),

    #[error("docker api failed: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("exec stdin failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Snapshot of a pod as the runtime sees it right now.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    pub ip: String,
    pub hostname: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,

    /// Container used for exec: the application container, not the sandbox
    pub main_container: Option<String>,
}

impl Pod {
    /// Resolves a metadata path: `labels.<X>`, `annotations.<X>`, or one of
    /// `namespace`, `pod`, `ip`, `hostname`. Empty values count as missing.
    pub fn lookup(&self, path: &str) -> Option<&str> {
        let value = if let Some(label) = path.strip_prefix("labels.") {
            self.labels.get(label).map(String::as_str)
        } else if let Some(annotation) = path.strip_prefix("annotations.") {
            self.annotations.get(annotation).map(String::as_str)
        } else {
            match path {
                "namespace" => Some(self.namespace.as_str()),
                "pod" | "name" => Some(self.name.as_str()),
                "ip" => Some(self.ip.as_str()),
                "hostname" | "host" => Some(self.hostname.as_str()),
                _ => None,
            }
        };
        value.filter(|v| !v.is_empty())
    }

    /// Application name: the `app` label, falling back to `app.kubernetes.io/name`.
    pub fn app(&self) -> Option<&str> {
        self.lookup("labels.app")
            .or_else(|| self.lookup("labels.app.kubernetes.io/name"))
    }
}

/// Output of a finished exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Current metadata of a pod, `None` if the runtime does not know it.
    async fn get_pod(&self, namespace: &str, pod: &str) -> Result<Option<Arc<Pod>>, CriError>;

    /// Runs `cmd` inside `container` feeding `stdin`, waiting for it to exit.
    async fn exec(&self, container: &str, cmd: Vec<String>, stdin: Vec<u8>) -> Result<ExecOutput, CriError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_lookup_paths() {
        let pod = Pod {
            namespace: "default".into(),
            name: "web-0".into(),
            ip: "10.0.0.1".into(),
            hostname: "web-0".into(),
            labels: BTreeMap::from([("app".into(), "web".into()), ("tier".into(), String::new())]),
            annotations: BTreeMap::from([("owner".into(), "team-a".into())]),
            main_container: Some("c1".into()),
        };

        assert_eq!(pod.lookup("labels.app"), Some("web"));
        assert_eq!(pod.lookup("labels.tier"), None);
        assert_eq!(pod.lookup("annotations.owner"), Some("team-a"));
        assert_eq!(pod.lookup("ip"), Some("10.0.0.1"));
        assert_eq!(pod.lookup("unknown"), None);
        assert_eq!(pod.app(), Some("web"));
    }
}
