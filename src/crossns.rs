// Cross-namespace collector - RPC over container exec
//
// Probes that must observe a pod's network view are executed by the helper
// binary inside the pod's main container:
//
//   <helper_path> inputProxy <action_type>   stdin: request bytes
//                                            stdout: {"data": "<base64>"}
//
// Only the exec transport lives here; the request and response payloads are
// opaque and belong to the input.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::cri::{ContainerRuntime, CriError};
use crate::model::Accumulator;
use crate::plugin::CrossNamespace;
use crate::task::CollectTarget;

/// Extra time granted to the exec on top of the probe's own timeout.
pub const EXEC_GRACE: Duration = Duration::from_secs(3);

/// Helper subcommand name.
pub const PROXY_COMMAND: &str = "inputProxy";

/// Errors of the exec transport
#[derive(Error, Debug)]
pub enum CrossNsError {
    #[error("pod {namespace}/{pod} not found")]
    NoPod { namespace: String, pod: String },

    #[error("target has no namespace/pod meta")]
    MissingPodMeta,

    #[error("no container runtime available")]
    NoRuntime,

    #[error("exec failed: {0}")]
    Exec(#[from] CriError),

    #[error("helper exited with code {code}: {stderr}")]
    ExitCode { code: i64, stderr: String },

    #[error("invalid helper response: {0}")]
    Envelope(String),

    #[error("serialize request: {0}")]
    Request(#[source] anyhow::Error),

    #[error("process response: {0}")]
    Response(#[source] anyhow::Error),
}

impl CrossNsError {
    /// Whether the target itself is gone, as opposed to a transport failure.
    pub fn is_no_pod(&self) -> bool {
        matches!(self, CrossNsError::NoPod { .. } | CrossNsError::Exec(CriError::NoPod { .. }))
    }
}

/// Helper stdout envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "crate::codec::base64_bytes", default)]
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn parse(stdout: &[u8]) -> Result<Vec<u8>, CrossNsError> {
        serde_json::from_slice::<Envelope>(stdout)
            .map(|e| e.data)
            .map_err(|e| CrossNsError::Envelope(e.to_string()))
    }
}

/// Runs one cross-namespace collection round for `target`.
///
/// Pod lookup failures end the round with `NoPod` before anything is sent.
/// Transport failures after that point are handed to the input's
/// `process_response` so it can report them as metrics.
pub async fn collect(
    runtime: Option<&dyn ContainerRuntime>,
    helper_path: &str,
    target: &CollectTarget,
    input: &mut dyn CrossNamespace,
    acc: &mut dyn Accumulator,
) -> Result<(), CrossNsError> {
    let request = input.serialize_request().map_err(CrossNsError::Request)?;

    let runtime = runtime.ok_or(CrossNsError::NoRuntime)?;
    let (Some(namespace), Some(pod_name)) = (target.meta_value("namespace"), target.meta_value("pod")) else {
        return Err(CrossNsError::MissingPodMeta);
    };
    let no_pod = || CrossNsError::NoPod {
        namespace: namespace.to_string(),
        pod: pod_name.to_string(),
    };
    let pod = runtime.get_pod(namespace, pod_name).await?.ok_or_else(no_pod)?;
    let container = pod
        .main_container
        .clone()
        .ok_or_else(|| CrossNsError::Exec(CriError::NoContainer(format!("{namespace}/{pod_name}"))))?;

    let cmd = vec![
        helper_path.to_string(),
        PROXY_COMMAND.to_string(),
        request.action_type.clone(),
    ];
    let budget = request.timeout + EXEC_GRACE;
    debug!(
        "Dispatching {} to pod {}/{} (budget {:?})",
        request.action_type, namespace, pod_name, budget
    );

    let response = match tokio::time::timeout(budget, runtime.exec(&container, cmd, request.request)).await {
        Err(_) => Err(CrossNsError::Exec(CriError::Timeout(budget))),
        Ok(Err(e)) => Err(CrossNsError::Exec(e)),
        Ok(Ok(output)) if !output.success() => Err(CrossNsError::ExitCode {
            code: output.exit_code,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
        Ok(Ok(output)) => Envelope::parse(&output.stdout),
    };

    input
        .process_response(request.state, response, acc)
        .map_err(CrossNsError::Response)
}
