// Gateway output - batches posted as JSON to the central gateway

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::{Extension, Output, OutputError};
use crate::config::AgentConfig;
use crate::model::Metric;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Request body of one write.
#[derive(Debug, Serialize)]
pub struct WriteRequest<'a> {
    #[serde(flatten)]
    pub extension: &'a Extension,

    pub metrics: &'a [Metric],
}

pub struct GatewayOutput {
    client: reqwest::Client,
    url: String,
    apikey: String,
}

impl GatewayOutput {
    pub const WRITE_PATH: &'static str = "/api/v1/gateway/write/metrics";

    pub fn new(config: &AgentConfig) -> Result<Self, OutputError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hi-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(WRITE_TIMEOUT)
            .build()?;
        Ok(GatewayOutput {
            client,
            url: format!("{}{}", config.gateway_url(), Self::WRITE_PATH),
            apikey: config.apikey.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Output for GatewayOutput {
    fn name(&self) -> &str {
        "gateway"
    }

    async fn write(&self, metrics: &[Metric], extension: &Extension) -> Result<(), OutputError> {
        let response = self
            .client
            .post(&self.url)
            .header("apikey", &self.apikey)
            .json(&WriteRequest { extension, metrics })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OutputError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!("Wrote {} sample(s) to gateway", metrics.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_and_body() {
        let config = AgentConfig {
            gateway_addr: "gw.example.com".into(),
            gateway_secure: true,
            ..Default::default()
        };
        let output = GatewayOutput::new(&config).unwrap();
        assert_eq!(output.url(), "https://gw.example.com/api/v1/gateway/write/metrics");

        let extension = Extension {
            tenant: Some("acme".into()),
        };
        let metrics = [Metric::new("up", 1.0)];
        let body = serde_json::to_value(WriteRequest {
            extension: &extension,
            metrics: &metrics,
        })
        .unwrap();
        assert_eq!(body["tenant"], "acme");
        assert_eq!(body["metrics"][0]["name"], "up");
    }
}
