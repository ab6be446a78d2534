// TCP dial check input
//
// Opens a TCP connection to `host:port` and reports reachability and latency.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{host_port, parse_timeout, target_host, CrossNamespace, Input, NetworkMode, ProxyRequest};
use crate::crossns::CrossNsError;
use crate::model::{Accumulator, Metric};
use crate::task::CollectTask;

pub const ACTION: &str = "dialcheck";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DialCheckConf {
    host: Option<String>,
    port: u16,
    timeout: Option<String>,
    network_mode: NetworkMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialCheckRequest {
    /// `host:port`
    pub addr: String,
    pub timeout: String,
}

impl DialCheckRequest {
    pub fn timeout(&self) -> Duration {
        parse_timeout(Some(&self.timeout), DEFAULT_TIMEOUT).unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// Dials once. `up` is 1 on a completed handshake, `cost` is in milliseconds.
pub async fn dial_check(request: &DialCheckRequest) -> Vec<Metric> {
    let started = Instant::now();
    let up = match tokio::time::timeout(request.timeout(), TcpStream::connect(&request.addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Dial {} failed: {}", request.addr, e);
            false
        }
        Err(_) => {
            debug!("Dial {} timed out", request.addr);
            false
        }
    };
    let cost = started.elapsed().as_secs_f64() * 1000.0;
    vec![Metric::new("up", if up { 1.0 } else { 0.0 }), Metric::new("cost", cost)]
}

pub struct DialCheckInput {
    request: DialCheckRequest,
    network_mode: NetworkMode,
}

impl DialCheckInput {
    pub fn from_task(task: &CollectTask) -> anyhow::Result<Self> {
        let conf: DialCheckConf = serde_json::from_slice(&task.config.content)?;
        if conf.port == 0 {
            anyhow::bail!("dialcheck needs a port");
        }
        let host = conf
            .host
            .filter(|h| !h.is_empty())
            .or_else(|| target_host(&task.target))
            .ok_or_else(|| anyhow::anyhow!("dialcheck needs a host or a target with an address"))?;
        let timeout = parse_timeout(conf.timeout.as_deref(), DEFAULT_TIMEOUT)?;

        Ok(DialCheckInput {
            request: DialCheckRequest {
                addr: host_port(&host, conf.port),
                timeout: humantime::format_duration(timeout).to_string(),
            },
            network_mode: conf.network_mode,
        })
    }
}

#[async_trait]
impl Input for DialCheckInput {
    fn default_prefix(&self) -> &str {
        "dialcheck_"
    }

    async fn collect(&mut self, acc: &mut dyn Accumulator) -> anyhow::Result<()> {
        for metric in dial_check(&self.request).await {
            acc.add_metric(metric);
        }
        Ok(())
    }

    fn cross_namespace(&mut self) -> Option<&mut dyn CrossNamespace> {
        Some(self)
    }

    fn debug_info(&self) -> serde_json::Value {
        serde_json::json!({ "addr": self.request.addr, "networkMode": self.network_mode })
    }
}

impl CrossNamespace for DialCheckInput {
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
                for metric in serde_json::from_slice::<Vec<Metric>>(&data)? {
                    acc.add_metric(metric);
                }
            }
            Err(e) => {
                warn!("Dial check {} via helper failed: {}", self.request.addr, e);
                acc.add_metric(Metric::new("up", 0.0));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MemoryAccumulator;
    use crate::testutil::task_with;

    #[test]
    fn test_addr_from_target() {
        let task = task_with("T1", "dialcheck", br#"{"port":6379}"#, "pod");
        let input = DialCheckInput::from_task(&task).unwrap();
        assert_eq!(input.request.addr, "10.0.0.1:6379");
        assert_eq!(input.request.timeout(), Duration::from_secs(3));

        let task = task_with("T1", "dialcheck", b"{}", "pod");
        assert!(DialCheckInput::from_task(&task).is_err());
    }

    #[test]
    fn test_addr_from_ipv6_pod() {
        let task = task_with("T1", "dialcheck", br#"{"port":6379}"#, "pod");
        let mut target = (*task.target).clone();
        target.meta.insert("ip".into(), "fd00::12".into());
        let task = CollectTask::new("T1", task.config.clone(), std::sync::Arc::new(target));

        let input = DialCheckInput::from_task(&task).unwrap();
        assert_eq!(input.request.addr, "[fd00::12]:6379");
        assert!(input.request.addr.parse::<std::net::SocketAddr>().is_ok());
    }

    #[tokio::test]
    async fn test_dial_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let request = DialCheckRequest {
            addr: addr.to_string(),
            timeout: "1s".into(),
        };

        let metrics = dial_check(&request).await;
        assert_eq!(metrics[0], Metric::new("up", 1.0));

        drop(listener);
        let mut input = DialCheckInput {
            request,
            network_mode: NetworkMode::Agent,
        };
        let mut acc = MemoryAccumulator::new();
        input.collect(&mut acc).await.unwrap();
        assert_eq!(acc.len(), 2);
        assert_eq!(acc.metrics()[0].name, "up");
    }
}
