// Output module - where each round's batch ends up
//
// Pipelines hold an `OutputAdapter`: the shared sink plus the per-target
// extension (tenant). Sinks are picked by name at start-up.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::config::AgentConfig;
use crate::model::Metric;
use crate::task::CollectTarget;

pub mod console;
pub mod gateway;

pub use console::ConsoleOutput;
pub use gateway::GatewayOutput;

/// Errors raised while creating a sink or writing to it
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("unknown output {0}")]
    Unknown(String),

    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("stdout write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-batch context passed along with the samples.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Extension {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

#[async_trait]
pub trait Output: Send + Sync {
    fn name(&self) -> &str;

    async fn write(&self, metrics: &[Metric], extension: &Extension) -> Result<(), OutputError>;
}

/// Builds the sink named `name`.
pub fn create(name: &str, config: &AgentConfig) -> Result<Arc<dyn Output>, OutputError> {
    match name {
        "console" => Ok(Arc::new(ConsoleOutput::new())),
        "gateway" => Ok(Arc::new(GatewayOutput::new(config)?)),
        other => Err(OutputError::Unknown(other.to_string())),
    }
}

/// A sink bound to one target.
#[derive(Clone)]
pub struct OutputAdapter {
    output: Arc<dyn Output>,
    extension: Extension,
}

impl OutputAdapter {
    /// The tenant comes from `target.meta.tenant`, else from the agent config.
    pub fn new(output: Arc<dyn Output>, target: &CollectTarget, config: &AgentConfig) -> Self {
        let tenant = target
            .meta_value("tenant")
            .map(str::to_string)
            .or_else(|| config.tenant.clone().filter(|t| !t.is_empty()));
        OutputAdapter {
            output,
            extension: Extension { tenant },
        }
    }

    pub fn extension(&self) -> &Extension {
        &self.extension
    }

    pub fn name(&self) -> &str {
        self.output.name()
    }

    pub async fn write(&self, metrics: &[Metric]) -> Result<(), OutputError> {
        self.output.write(metrics, &self.extension).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{target, CaptureOutput};

    #[test]
    fn test_create_by_name() {
        let config = AgentConfig {
            gateway_addr: "gw:8080".into(),
            ..Default::default()
        };
        assert_eq!(create("console", &config).unwrap().name(), "console");
        assert_eq!(create("gateway", &config).unwrap().name(), "gateway");
        let err = create("kafka", &config).err().unwrap();
        assert_eq!(err.to_string(), "unknown output kafka");
    }

    #[tokio::test]
    async fn test_adapter_tenant_precedence() {
        let capture = Arc::new(CaptureOutput::default());
        let config = AgentConfig {
            tenant: Some("default-tenant".into()),
            ..Default::default()
        };

        let mut with_tenant = target("V1", "1", "pod");
        with_tenant.meta.insert("tenant".into(), "acme".into());
        let adapter = OutputAdapter::new(capture.clone(), &with_tenant, &config);
        adapter.write(&[Metric::new("up", 1.0)]).await.unwrap();

        let adapter = OutputAdapter::new(capture.clone(), &target("V2", "1", "localhost"), &config);
        adapter.write(&[Metric::new("up", 1.0)]).await.unwrap();

        let batches = capture.batches();
        assert_eq!(batches[0].1.tenant.as_deref(), Some("acme"));
        assert_eq!(batches[1].1.tenant.as_deref(), Some("default-tenant"));
    }
}
