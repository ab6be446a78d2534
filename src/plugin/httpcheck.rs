// HTTP check input
//
// Probes an HTTP endpoint and reports whether it answered and how long it took.
// With `networkMode: POD` the probe runs inside the target pod through the
// helper, so it sees the pod's own network view.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{host_port, parse_timeout, target_host, CrossNamespace, Input, NetworkMode, ProxyRequest};
use crate::crossns::CrossNsError;
use crate::model::{Accumulator, Metric};
use crate::task::CollectTask;

pub const ACTION: &str = "httpcheck";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Task content of an httpcheck config
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct HttpCheckConf {
    /// Full URL; when absent it is built from the target host and the fields below
    url: Option<String>,
    scheme: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    method: Option<String>,
    timeout: Option<String>,
    network_mode: NetworkMode,
}

/// Request sent to the helper, also used for in-process checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpCheckRequest {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// humantime text, e.g. "3s"
    pub timeout: String,
}

impl HttpCheckRequest {
    pub fn timeout(&self) -> Duration {
        parse_timeout(Some(&self.timeout), DEFAULT_TIMEOUT).unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// Runs one check. Never fails: an unreachable endpoint is `up=0`.
///
/// # Metrics
/// - `up`: 1 when the endpoint answered with a 2xx/3xx status
/// - `cost`: round-trip time in milliseconds
pub async fn http_check(request: &HttpCheckRequest) -> Vec<Metric> {
    let started = Instant::now();
    let up = match probe(request).await {
        Ok(status) => {
            debug!("HTTP check {} answered {}", request.url, status);
            status.is_success() || status.is_redirection()
        }
        Err(e) => {
            debug!("HTTP check {} failed: {}", request.url, e);
            false
        }
    };
    let cost = started.elapsed().as_secs_f64() * 1000.0;

    vec![Metric::new("up", if up { 1.0 } else { 0.0 }), Metric::new("cost", cost)]
}

async fn probe(request: &HttpCheckRequest) -> anyhow::Result<reqwest::StatusCode> {
    let client = reqwest::Client::builder()
        .timeout(request.timeout())
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let method = reqwest::Method::from_bytes(request.method.as_deref().unwrap_or("GET").as_bytes())?;
    let response = client.request(method, &request.url).send().await?;
    Ok(response.status())
}

pub struct HttpCheckInput {
    request: HttpCheckRequest,
    network_mode: NetworkMode,
}

impl HttpCheckInput {
    pub fn from_task(task: &CollectTask) -> anyhow::Result<Self> {
        let conf: HttpCheckConf = serde_json::from_slice(&task.config.content)?;
        let timeout = parse_timeout(conf.timeout.as_deref(), DEFAULT_TIMEOUT)?;

        let url = match conf.url.filter(|u| !u.is_empty()) {
            Some(url) => url,
            None => {
                let host = target_host(&task.target)
                    .ok_or_else(|| anyhow::anyhow!("httpcheck needs a url or a target with an address"))?;
                let scheme = conf.scheme.as_deref().unwrap_or("http");
                let path = conf.path.as_deref().unwrap_or("/");
                let path = if path.starts_with('/') { path.to_string() } else { format!("/{path}") };
                match conf.port {
                    Some(port) => format!("{scheme}://{}{path}", host_port(&host, port)),
                    None if host.contains(':') => format!("{scheme}://[{host}]{path}"),
                    None => format!("{scheme}://{host}{path}"),
                }
            }
        };

        Ok(HttpCheckInput {
            request: HttpCheckRequest {
                url,
                method: conf.method,
                timeout: humantime::format_duration(timeout).to_string(),
            },
            network_mode: conf.network_mode,
        })
    }

    pub fn request(&self) -> &HttpCheckRequest {
        &self.request
    }
}

#[async_trait]
impl Input for HttpCheckInput {
    fn default_prefix(&self) -> &str {
        "httpcheck_"
    }

    async fn collect(&mut self, acc: &mut dyn Accumulator) -> anyhow::Result<()> {
        for metric in http_check(&self.request).await {
            acc.add_metric(metric);
        }
        Ok(())
    }

    fn cross_namespace(&mut self) -> Option<&mut dyn CrossNamespace> {
        Some(self)
    }

    fn debug_info(&self) -> serde_json::Value {
        serde_json::json!({ "url": self.request.url, "networkMode": self.network_mode })
    }
}

impl CrossNamespace for HttpCheckInput {
    fn network_mode(&self) -> NetworkMode {
        self.network_mode
    }

    fn serialize_request(&mut self) -> anyhow::Result<ProxyRequest> {
        Ok(ProxyRequest {
            state: None,
            action_type: ACTION.to_string(),
            request: serde_json::to_vec(&self.request)?,
            timeout: self.request.timeout(),
        })
    }

    fn process_response(
        &mut self,
        _state: Option<serde_json::Value>,
        response: Result<Vec<u8>, CrossNsError>,
        acc: &mut dyn Accumulator,
    ) -> anyhow::Result<()> {
        match response {
            Ok(data) => {
                let metrics: Vec<Metric> = serde_json::from_slice(&data)?;
                for metric in metrics {
                    acc.add_metric(metric);
                }
            }
            Err(e) => {
                warn!("HTTP check {} via helper failed: {}", self.request.url, e);
                acc.add_metric(Metric::new("up", 0.0));
            }
        }
        Ok(())
    }
}
