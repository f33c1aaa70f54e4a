//! Newline-framed JSON over stdio (spec.md §4.2), grounded in the teacher's
//! `mcp/jsonrpc.rs`: a spawned child's stdin/stdout carry protocol traffic,
//! its stderr is forwarded to `tracing` as out-of-band diagnostics, and a
//! bounded exponential backoff absorbs a transient `ExecutableFileBusy` on
//! spawn (the teacher's `spawn_with_subcommand`).

use std::io;
use std::process::Stdio as StdStdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::McpError;
use crate::transport::Transport;
use crate::wire::Message;

const MAX_SPAWN_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

pub struct StdioTransport {
    writer: Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Result<Message, McpError>>>,
    // Kept alive so the pipes stay open for the transport's lifetime; never
    // read after construction.
    _child: Option<Child>,
}

impl StdioTransport {
    /// Spawns `command` as a server subprocess and speaks the protocol over
    /// its stdin/stdout.
    pub async fn spawn(command: &str, args: &[String]) -> Result<Self, McpError> {
        Self::spawn_with_env(command, args, &std::collections::BTreeMap::new()).await
    }

    /// Like [`Self::spawn`], additionally setting the given environment
    /// variables on the child process.
    pub async fn spawn_with_env(
        command: &str,
        args: &[String],
        env: &std::collections::BTreeMap<String, String>,
    ) -> Result<Self, McpError> {
        let child = spawn_with_retry(command, args, env).await?;
        Self::from_child(child)
    }

    fn from_child(mut child: Child) -> Result<Self, McpError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("child process has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("child process has no stdout".into()))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(stdout, tx));
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(stderr));
        }

        Ok(StdioTransport {
            writer: Mutex::new(Box::new(stdin)),
            inbound: Mutex::new(rx),
            _child: Some(child),
        })
    }

    /// Wraps this process's own stdin/stdout: the server side of spec.md
    /// §4.2's stdio contract (`stdin` in, `stdout` out, `stderr` reserved).
    pub fn from_std_streams() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(tokio::io::stdin(), tx));
        StdioTransport {
            writer: Mutex::new(Box::new(tokio::io::stdout())),
            inbound: Mutex::new(rx),
            _child: None,
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: Message) -> Result<(), McpError> {
        let mut bytes = message.encode();
        bytes.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        writer.flush().await.map_err(|e| McpError::Transport(e.to_string()))
    }

    async fn recv(&self) -> Result<Option<Message>, McpError> {
        match self.inbound.lock().await.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), McpError> {
        Ok(())
    }
}

async fn read_loop<R>(stream: R, tx: mpsc::UnboundedSender<Result<Message, McpError>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if tx.send(Message::decode(trimmed.as_bytes())).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(McpError::Transport(e.to_string())));
                break;
            }
        }
    }
}

async fn forward_stderr<R>(stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "mcp_engine::child_stderr", "{line}");
    }
}

async fn spawn_with_retry(
    command: &str,
    args: &[String],
    env: &std::collections::BTreeMap<String, String>,
) -> Result<Child, McpError> {
    let mut attempt = 0;
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let result = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(StdStdio::piped())
            .stdout(StdStdio::piped())
            .stderr(StdStdio::piped())
            .kill_on_drop(true)
            .spawn();
        match result {
            Ok(child) => return Ok(child),
            Err(e) if is_text_file_busy(&e) && attempt + 1 < MAX_SPAWN_ATTEMPTS => {
                attempt += 1;
                warn!(command, attempt, "spawn hit ExecutableFileBusy, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                return Err(McpError::Spawn {
                    command: command.to_string(),
                    source: e,
                });
            }
        }
    }
}

fn is_text_file_busy(e: &io::Error) -> bool {
    e.raw_os_error() == Some(26)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RequestId;

    #[tokio::test]
    async fn round_trips_through_cat() {
        let transport = StdioTransport::spawn("cat", &[]).await.unwrap();
        transport
            .send(Message::request(RequestId::Number(1), "ping", None))
            .await
            .unwrap();
        let echoed = transport.recv().await.unwrap().unwrap();
        assert_eq!(echoed.method(), Some("ping"));
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_mcp_error() {
        let err = StdioTransport::spawn("definitely-not-a-real-binary", &[]).await;
        assert!(matches!(err, Err(McpError::Spawn { .. })));
    }

    #[tokio::test]
    async fn spawn_with_env_passes_variables_to_child() {
        let mut env = std::collections::BTreeMap::new();
        env.insert("MCP_ENGINE_TEST_METHOD".to_string(), "demo/ping".to_string());
        let transport = StdioTransport::spawn_with_env(
            "sh",
            &[
                "-c".into(),
                r#"printf '{"jsonrpc":"2.0","method":"%s"}\n' "$MCP_ENGINE_TEST_METHOD""#.into(),
            ],
            &env,
        )
        .await
        .unwrap();
        let message = transport.recv().await.unwrap().unwrap();
        assert_eq!(message.method(), Some("demo/ping"));
    }
}
