// Console output - one human readable line per sample on stdout

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::io::AsyncWriteExt;

use super::{Extension, Output, OutputError};
use crate::model::Metric;

#[derive(Debug, Default)]
pub struct ConsoleOutput;

impl ConsoleOutput {
    pub fn new() -> Self {
        ConsoleOutput
    }
}

/// `2024-01-01T00:00:00Z [tenant] name{k=v,...} value`
pub fn format_line(metric: &Metric, extension: &Extension) -> String {
    let time = Utc
        .timestamp_millis_opt(metric.timestamp)
        .single()
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| metric.timestamp.to_string());
    let tags = metric
        .tags
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    let tenant = extension.tenant.as_deref().unwrap_or("-");
    format!("{time} [{tenant}] {}{{{tags}}} {}", metric.name, metric.value)
}

#[async_trait]
impl Output for ConsoleOutput {
    fn name(&self) -> &str {
        "console"
    }

    async fn write(&self, metrics: &[Metric], extension: &Extension) -> Result<(), OutputError> {
        let mut text = String::new();
        for metric in metrics {
            text.push_str(&format_line(metric, extension));
            text.push('\n');
        }
        let mut stdout = tokio::io::stdout();
        stdout.write_all(text.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}
