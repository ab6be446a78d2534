// Input proxy - the helper side of cross-namespace collection
//
// Runs as `hi-agent inputProxy <action>` inside a target container. Reads one
// request from stdin, runs the matching probe in this (the pod's) network
// namespace and writes `{"data": "<base64>"}` to stdout. Nothing from the
// parent agent's filesystem or environment is needed.

use std::future::Future;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::crossns::Envelope;
use crate::model::Metric;
use crate::plugin::dialcheck::{self, DialCheckRequest};
use crate::plugin::httpcheck::{self, HttpCheckRequest};

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("unknown action {0}")]
    UnknownAction(String),

    #[error("invalid request: {0}")]
    Request(#[from] serde_json::Error),

    #[error("stdio failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs the probe named by `action` against the raw request bytes.
pub async fn handle(action: &str, request: &[u8]) -> Result<Vec<u8>, ProxyError> {
    let metrics = match action {
        httpcheck::ACTION => run_json(request, |r: HttpCheckRequest| async move { httpcheck::http_check(&r).await }).await?,
        dialcheck::ACTION => run_json(request, |r: DialCheckRequest| async move { dialcheck::dial_check(&r).await }).await?,
        other => return Err(ProxyError::UnknownAction(other.to_string())),
    };
    Ok(serde_json::to_vec(&metrics)?)
}

async fn run_json<R, F, Fut>(request: &[u8], probe: F) -> Result<Vec<Metric>, ProxyError>
where
    R: serde::de::DeserializeOwned,
    F: FnOnce(R) -> Fut,
    Fut: Future<Output = Vec<Metric>>,
{
    let request: R = serde_json::from_slice(request)?;
    Ok(probe(request).await)
}

/// Reads the request from `stdin`, writes the envelope to `stdout`.
pub async fn serve<I, O>(action: &str, mut stdin: I, mut stdout: O) -> Result<(), ProxyError>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut request = Vec::new();
    stdin.read_to_end(&mut request).await?;
    debug!("inputProxy {}: {} request bytes", action, request.len());

    let data = handle(action, &request).await?;
    let envelope = serde_json::to_vec(&Envelope { data })?;
    stdout.write_all(&envelope).await?;
    stdout.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dialcheck_envelope() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let request = serde_json::to_vec(&DialCheckRequest {
            addr: listener.local_addr().unwrap().to_string(),
            timeout: "1s".into(),
        })
        .unwrap();

        let mut stdout = Vec::new();
        serve("dialcheck", request.as_slice(), &mut stdout).await.unwrap();

        let data = Envelope::parse(&stdout).unwrap();
        let metrics: Vec<Metric> = serde_json::from_slice(&data).unwrap();
        assert_eq!(metrics[0], Metric::new("up", 1.0));
        assert_eq!(metrics[1].name, "cost");
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let err = handle("jvm", b"{}").await.unwrap_err();
        assert!(matches!(err, ProxyError::UnknownAction(a) if a == "jvm"));
    }

    #[tokio::test]
    async fn test_bad_request() {
        let err = handle("httpcheck", b"not json").await.unwrap_err();
        assert!(matches!(err, ProxyError::Request(_)));
    }
}
