//! Local child-process transport: newline-delimited JSON-RPC over stdio.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{McpError, Result};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::McpTransport;

/// Requests awaiting a reply, keyed by JSON-RPC id.
type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct StdioTransport {
    server_id: String,
    timeout: Duration,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: Pending,
    reader: JoinHandle<()>,
}

impl StdioTransport {
    /// Spawn the server process and start dispatching its replies.
    pub fn spawn(
        server_id: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::Transport(format!("Failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("Failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("Failed to capture stdout".into()))?;

        // Surface server stderr in our logs
        if let Some(stderr) = child.stderr.take() {
            let server_id = server_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!(server_id = %server_id, "stderr: {line}");
                    }
                }
            });
        }

        let pending = Pending::default();
        let reader = tokio::spawn(dispatch_replies(
            server_id.to_string(),
            stdout,
            pending.clone(),
        ));

        Ok(Self {
            server_id: server_id.to_string(),
            timeout,
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            pending,
            reader,
        })
    }

    async fn write_line(&self, message: &JsonRpcRequest) -> Result<()> {
        let line = serde_json::to_string(message)? + "\n";
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(McpError::Aborted)?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Transport(format!("stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("stdin flush failed: {e}")))
    }

    async fn request(&self, id: i64, message: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        // Registered before writing so a fast reply always finds its waiter
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.write_line(message).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::Transport("server closed stdout".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout(self.timeout))
            }
        }
    }
}

/// Read stdout line by line and hand each reply to the request waiting on
/// its id. Notifications and replies nobody waits for are skipped. At EOF
/// every waiter is dropped, failing its request.
async fn dispatch_replies(server_id: String, stdout: ChildStdout, pending: Pending) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(server_id = %server_id, %e, "stdout read failed");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Ok(response) = serde_json::from_str::<JsonRpcResponse>(line) else {
            debug!(server_id = %server_id, "Ignoring non-JSON line: {}", truncate(line, 100));
            continue;
        };
        let waiter = match response.id.as_ref().and_then(|v| v.as_i64()) {
            Some(id) => pending.lock().await.remove(&id),
            None => None,
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(server_id = %server_id, "Skipping message: {}", truncate(line, 200)),
        }
    }
    debug!(server_id = %server_id, "MCP server stdout closed");
    pending.lock().await.clear();
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    fn kind(&self) -> &'static str {
        "stdio"
    }

    async fn send(&self, message: &JsonRpcRequest) -> Result<Option<JsonRpcResponse>> {
        match message.id {
            Some(id) => self.request(id, message).await.map(Some),
            None => self.write_line(message).await.map(|()| None),
        }
    }

    async fn close(&self) {
        self.stdin.lock().await.take();
        self.reader.abort();
        self.pending.lock().await.clear();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(server_id = %self.server_id, %e, "Failed to kill MCP server process");
            }
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_command() {
        let result = StdioTransport::spawn(
            "bad",
            "/nonexistent/binary/path",
            &[],
            &HashMap::new(),
            Duration::from_secs(1),
        );
        let Err(err) = result else {
            panic!("expected spawn failure");
        };
        assert!(err.to_string().contains("Failed to spawn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_round_trip_through_cat() {
        // `cat` echoes the request back; its id matches so it reads as the reply.
        let transport =
            StdioTransport::spawn("cat", "cat", &[], &HashMap::new(), Duration::from_secs(5))
                .unwrap();

        let notified = transport
            .send(&JsonRpcRequest::notification("notifications/initialized", None))
            .await
            .unwrap();
        assert!(notified.is_none());

        let reply = transport
            .send(&JsonRpcRequest::new(7, "tools/list", None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.id, Some(serde_json::json!(7)));

        transport.close().await;
        let err = transport
            .send(&JsonRpcRequest::new(8, "tools/list", None))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Aborted));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_out_of_order_replies_reach_their_callers() {
        // Reads both requests, then answers the second one first.
        let transport = StdioTransport::spawn(
            "swap",
            "sh",
            &["-c".into(), r#"read a; read b; echo "$b"; echo "$a""#.into()],
            &HashMap::new(),
            Duration::from_secs(5),
        )
        .unwrap();

        let first = JsonRpcRequest::new(1, "tools/list", None);
        let second = JsonRpcRequest::new(2, "tools/list", None);
        let (a, b) = tokio::join!(transport.send(&first), transport.send(&second));

        assert_eq!(a.unwrap().unwrap().id, Some(serde_json::json!(1)));
        assert_eq!(b.unwrap().unwrap().id, Some(serde_json::json!(2)));
        transport.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_exit_fails_pending_request() {
        let transport = StdioTransport::spawn(
            "quit",
            "sh",
            &["-c".into(), "read a".into()],
            &HashMap::new(),
            Duration::from_secs(5),
        )
        .unwrap();

        let err = transport
            .send(&JsonRpcRequest::new(1, "tools/list", None))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
    }
}
