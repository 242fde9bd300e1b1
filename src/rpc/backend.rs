// Backend Transport
//
// The downstream tool server speaks line-delimited JSON-RPC over stdio.
// The client owns the child process, correlates responses by an internal
// request id, and enforces a per-request timeout. Forwards are issued
// outside every manager lock; a timed-out request is reported as an error
// and never retried by the transport (at-most-once).

use crate::error::{GateError, Result};
use crate::rpc::{RpcId, RpcRequest, RpcResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// One hop to the downstream tool server.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    async fn forward(&self, request: RpcRequest, timeout_ms: u64) -> Result<Value>;
}

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<RpcResponse>>>>;

pub struct StdioBackend {
    writer_tx: mpsc::UnboundedSender<String>,
    pending: Pending,
    next_id: AtomicI64,
    child: Mutex<Option<Child>>,
}

impl StdioBackend {
    /// Spawn the backend process and wire its stdio.
    pub fn spawn(command: &str, args: &[String]) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GateError::Upstream(format!("failed to spawn backend: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GateError::Upstream("backend stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GateError::Upstream("backend stdout unavailable".to_string()))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();

        // Writer task: serialized line writes to the child's stdin.
        let mut stdin = stdin;
        tokio::spawn(async move {
            while let Some(line) = writer_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader task: match response lines back to pending requests.
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<RpcResponse>(line) {
                            Ok(response) => {
                                let id = match &response.id {
                                    Some(RpcId::Number(n)) => *n,
                                    _ => {
                                        debug!("backend line without numeric id, dropping");
                                        continue;
                                    }
                                };
                                if let Some(sender) = reader_pending.lock().remove(&id) {
                                    let _ = sender.send(response);
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "unparseable backend line");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "backend stdout read failed");
                        break;
                    }
                }
            }
            // Child is gone: fail everything still waiting.
            info!("backend stdout closed");
            reader_pending.lock().clear();
        });

        Ok(Self {
            writer_tx,
            pending,
            next_id: AtomicI64::new(1),
            child: Mutex::new(Some(child)),
        })
    }

    pub async fn shutdown(&self) {
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
impl BackendTransport for StdioBackend {
    async fn forward(&self, request: RpcRequest, timeout_ms: u64) -> Result<Value> {
        // The proxy's client-facing id stays out of the backend link; the
        // transport correlates on its own counter.
        let internal_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let wire_request = RpcRequest {
            jsonrpc: "2.0".to_string(),
            method: request.method.clone(),
            params: request.params.clone(),
            id: Some(RpcId::Number(internal_id)),
        };
        let line = serde_json::to_string(&wire_request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(internal_id, tx);

        if self.writer_tx.send(line).is_err() {
            self.pending.lock().remove(&internal_id);
            return Err(GateError::Upstream("backend is not running".to_string()));
        }

        let response = match tokio::time::timeout(
            std::time::Duration::from_millis(timeout_ms),
            rx,
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(GateError::Upstream(
                    "backend closed before responding".to_string(),
                ))
            }
            Err(_) => {
                self.pending.lock().remove(&internal_id);
                return Err(GateError::Timeout(format!(
                    "backend did not respond within {}ms",
                    timeout_ms
                )));
            }
        };

        match response.error {
            Some(error) => Err(GateError::Upstream(format!(
                "backend error {}: {}",
                error.code, error.message
            ))),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }
}

/// In-process backend backed by a handler function. Used in tests and as a
/// loopback target for demos.
pub struct FnBackend<F>
where
    F: Fn(&RpcRequest) -> Result<Value> + Send + Sync,
{
    handler: F,
}

impl<F> FnBackend<F>
where
    F: Fn(&RpcRequest) -> Result<Value> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F> BackendTransport for FnBackend<F>
where
    F: Fn(&RpcRequest) -> Result<Value> + Send + Sync,
{
    async fn forward(&self, request: RpcRequest, _timeout_ms: u64) -> Result<Value> {
        (self.handler)(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_backend_round_trip() {
        let backend = FnBackend::new(|request: &RpcRequest| {
            Ok(json!({"echo": request.method.clone()}))
        });
        let result = backend
            .forward(RpcRequest::new("tools/call", None, None), 1_000)
            .await
            .unwrap();
        assert_eq!(result["echo"], "tools/call");
    }

    #[tokio::test]
    async fn test_fn_backend_error_propagates() {
        let backend =
            FnBackend::new(|_: &RpcRequest| Err(GateError::Upstream("boom".to_string())));
        let err = backend
            .forward(RpcRequest::new("m", None, None), 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_stdio_backend_against_cat() {
        // `cat` echoes every request line back verbatim, which parses as a
        // response carrying the same id with no result or error fields.
        let backend = StdioBackend::spawn("cat", &[]).unwrap();
        let result = backend
            .forward(RpcRequest::new("tools/list", None, None), 2_000)
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_stdio_backend_timeout() {
        // `sleep` never writes to stdout, so the forward times out.
        let backend = StdioBackend::spawn("sleep", &["5".to_string()]).unwrap();
        let err = backend
            .forward(RpcRequest::new("tools/list", None, None), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Timeout(_)));
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        assert!(StdioBackend::spawn("/nonexistent/binary", &[]).is_err());
    }
}
