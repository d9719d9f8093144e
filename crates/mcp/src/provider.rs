//! One MCP provider subprocess: spawn, handshake, reply correlation, teardown.
//!
//! A single reader task owns stdout and drives all correlation through the
//! shared awaiter table; callers never touch the byte stream. Writes go
//! through one mutex-guarded stdin handle so frames are never interleaved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use maestro_config::{McpConfig, ProviderConfig};
use maestro_core::{Awaiter, AwaiterTable, Error, ErrorKind, Result};

use crate::protocol::{self, Classified, LineParse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Spawning,
    Handshaking,
    Ready,
    Draining,
    Exited,
}

/// One tool as advertised by a provider's `tools/list` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug)]
struct ProviderShared {
    name: String,
    state: RwLock<ProviderState>,
    tools: RwLock<Arc<Vec<ToolInfo>>>,
    pending: Arc<AwaiterTable<u64, Value>>,
    next_id: AtomicU64,
    stdin: Mutex<Option<ChildStdin>>,
    call_timeout: Duration,
}

impl ProviderShared {
    fn state(&self) -> ProviderState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, state: ProviderState) {
        *self.state.write().unwrap() = state;
    }

    /// Fatal for this provider only: mark exited and fail everything pending.
    fn mark_failed(&self, reason: &str) {
        self.set_state(ProviderState::Exited);
        let rejected = self
            .pending
            .reject_all(&Error::new(ErrorKind::ProviderUnreachable, reason));
        if rejected > 0 {
            warn!(provider = %self.name, rejected, reason, "rejected pending calls");
        }
    }

    async fn send_frame(&self, frame: &Value) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(Error::new(
                ErrorKind::ProviderUnreachable,
                format!("provider {} stdin closed", self.name),
            ));
        };
        let mut bytes = serde_json::to_vec(frame)
            .map_err(|err| Error::new(ErrorKind::ToolError, format!("encode frame: {err}")))?;
        bytes.push(b'\n');
        let written = async {
            stdin.write_all(&bytes).await?;
            stdin.flush().await
        }
        .await;
        drop(guard);

        if let Err(err) = written {
            self.mark_failed(&format!("stdin write failed: {err}"));
            return Err(Error::new(
                ErrorKind::ProviderUnreachable,
                format!("provider {} stdin write failed: {err}", self.name),
            ));
        }
        Ok(())
    }

    /// Allocate the next monotonic id, register its awaiter, write the frame.
    async fn request(
        self: &Arc<Self>,
        build: impl FnOnce(u64) -> Value,
        deadline: Duration,
        on_timeout: Error,
    ) -> Result<Awaiter<Value>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let awaiter = self.pending.register(id, deadline, on_timeout);
        let frame = build(id);
        if let Err(err) = self.send_frame(&frame).await {
            self.pending.reject(&id, err.clone());
            return Err(err);
        }
        Ok(awaiter)
    }

    async fn handle_line(self: &Arc<Self>, line: &str) {
        let message = match protocol::parse_line(line) {
            LineParse::Message(message) => message,
            LineParse::Garbage => {
                debug!(provider = %self.name, line, "skipping non-JSON stdout line");
                return;
            }
            LineParse::Concatenated => {
                warn!(provider = %self.name, "concatenated JSON objects on one line");
                self.mark_failed("protocol violation: concatenated frames");
                return;
            }
        };

        match protocol::classify(&message) {
            Classified::Result { id, result } => {
                if !self.pending.resolve(&id, result) {
                    warn!(provider = %self.name, id, "result for unknown request id");
                }
            }
            Classified::Error { id, error } => {
                if !self.pending.reject(&id, error) {
                    warn!(provider = %self.name, id, "error for unknown request id");
                }
            }
            Classified::Initialized => {
                info!(provider = %self.name, "provider initialized");
                if self.state() == ProviderState::Handshaking {
                    self.set_state(ProviderState::Ready);
                }
            }
            Classified::ToolsListChanged => {
                debug!(provider = %self.name, "tools/listChanged, refreshing");
                let shared = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = shared.refresh_tools().await {
                        warn!(provider = %shared.name, %err, "tools refresh failed");
                    }
                });
            }
            Classified::Unmatched => {
                warn!(provider = %self.name, "dropping unmatched message");
            }
        }
    }

    /// Issue `tools/list` and atomically replace the published snapshot.
    async fn refresh_tools(self: &Arc<Self>) -> Result<()> {
        let awaiter = self
            .request(
                protocol::tools_list_request,
                self.call_timeout,
                Error::timeout("tools/list timed out"),
            )
            .await?;
        let result = awaiter.recv().await?;

        let tools: Vec<ToolInfo> = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        info!(provider = %self.name, count = tools.len(), "tool list refreshed");
        *self.tools.write().unwrap() = Arc::new(tools);
        Ok(())
    }
}

/// Handle to one running provider subprocess.
#[derive(Debug)]
pub struct ProviderHandle {
    shared: Arc<ProviderShared>,
    child: Arc<Mutex<Child>>,
}

impl ProviderHandle {
    /// Spawn the subprocess and start its stderr drain and stdout reader
    /// tasks. The handshake runs separately via [`ProviderHandle::handshake`].
    pub fn spawn(name: &str, config: &ProviderConfig, mcp: &McpConfig) -> Result<Self> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|err| {
            Error::new(
                ErrorKind::ProviderUnreachable,
                format!("spawn {name} ({}): {err}", config.command),
            )
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            Error::new(ErrorKind::ProviderUnreachable, "child stdin unavailable")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::new(ErrorKind::ProviderUnreachable, "child stdout unavailable")
        })?;

        // stderr is diagnostics only, never protocol.
        if let Some(stderr) = child.stderr.take() {
            let provider = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(provider = %provider, "stderr: {}", line.trim_end());
                }
            });
        }

        let shared = Arc::new(ProviderShared {
            name: name.to_string(),
            state: RwLock::new(ProviderState::Spawning),
            tools: RwLock::new(Arc::new(Vec::new())),
            pending: Arc::new(AwaiterTable::new()),
            next_id: AtomicU64::new(1),
            stdin: Mutex::new(Some(stdin)),
            call_timeout: mcp.tool_call_timeout(),
        });

        let child = Arc::new(Mutex::new(child));
        Self::start_reader(shared.clone(), child.clone(), stdout);

        Ok(Self { shared, child })
    }

    fn start_reader(
        shared: Arc<ProviderShared>,
        child: Arc<Mutex<Child>>,
        mut stdout: tokio::process::ChildStdout,
    ) {
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => {
                        // Draining means we asked it to exit; anything else is
                        // the provider dying underneath us.
                        if shared.state() != ProviderState::Draining {
                            let code = child
                                .lock()
                                .await
                                .try_wait()
                                .ok()
                                .flatten()
                                .and_then(|status| status.code());
                            let reason = match code {
                                Some(code) => format!("process exited, code={code}"),
                                None => "process exited".to_string(),
                            };
                            warn!(provider = %shared.name, reason, "stdout closed");
                            shared.mark_failed(&reason);
                        }
                        break;
                    }
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        for line in protocol::drain_lines(&mut buf) {
                            shared.handle_line(&line).await;
                            if shared.state() == ProviderState::Exited {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        shared.mark_failed(&format!("stdout read error: {err}"));
                        break;
                    }
                }
            }
        });
    }

    /// Send `initialize` and wait for the reply. On timeout the default
    /// policy forces the provider ready (and logs); `strict_handshake`
    /// inverts that to a hard failure. A successful handshake fetches the
    /// initial tool list.
    pub async fn handshake(&self, mcp: &McpConfig) -> Result<()> {
        self.shared.set_state(ProviderState::Handshaking);

        let awaiter = self
            .shared
            .request(
                protocol::initialize_request,
                mcp.initialize_timeout(),
                Error::new(ErrorKind::ProviderNotReady, "initialize timed out"),
            )
            .await?;

        match awaiter.recv().await {
            Ok(_) => {
                self.shared.set_state(ProviderState::Ready);
                info!(provider = %self.name(), "handshake complete");
            }
            Err(err) if err.kind() == ErrorKind::ProviderNotReady && !mcp.strict_handshake => {
                warn!(provider = %self.name(), "no initialize reply in time, forcing ready");
                self.shared.set_state(ProviderState::Ready);
            }
            Err(err) => {
                self.shared.mark_failed("handshake failed");
                return Err(err);
            }
        }

        if let Err(err) = self.shared.refresh_tools().await {
            warn!(provider = %self.name(), %err, "initial tools/list failed");
        }
        Ok(())
    }

    /// Issue `tools/call`. The returned awaiter completes with the raw
    /// JSON-RPC `result`, or fails on provider error, timeout, or teardown.
    pub async fn call(&self, raw_tool: &str, arguments: &Value) -> Result<Awaiter<Value>> {
        match self.state() {
            ProviderState::Ready => {}
            ProviderState::Exited => {
                return Err(Error::new(
                    ErrorKind::ProviderUnreachable,
                    format!("provider {} has exited", self.name()),
                ));
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::ProviderNotReady,
                    format!("provider {} is not ready", self.name()),
                ));
            }
        }

        self.shared
            .request(
                |id| protocol::tools_call_request(id, raw_tool, arguments),
                self.shared.call_timeout,
                Error::timeout(format!("tools/call {raw_tool} timed out")),
            )
            .await
    }

    /// Graceful teardown: close stdin, give the child `shutdown_grace` to
    /// exit, then kill. Everything still pending is rejected as terminated.
    pub async fn shutdown(&self, grace: Duration) {
        self.shared.set_state(ProviderState::Draining);
        self.shared.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
        if !exited {
            warn!(provider = %self.name(), "did not exit within grace, killing");
            let _ = child.kill().await;
        }

        self.shared
            .pending
            .reject_all(&Error::new(ErrorKind::ProviderUnreachable, "terminated"));
        self.shared.set_state(ProviderState::Exited);
        info!(provider = %self.name(), "provider shut down");
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ProviderState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ProviderState::Ready
    }

    /// Current tool snapshot; cheap to clone, replaced atomically on refresh.
    pub fn tools(&self) -> Arc<Vec<ToolInfo>> {
        self.shared.tools.read().unwrap().clone()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.pending_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_shared(call_timeout_ms: u64) -> Arc<ProviderShared> {
        Arc::new(ProviderShared {
            name: "test".to_string(),
            state: RwLock::new(ProviderState::Handshaking),
            tools: RwLock::new(Arc::new(Vec::new())),
            pending: Arc::new(AwaiterTable::new()),
            next_id: AtomicU64::new(1),
            stdin: Mutex::new(None),
            call_timeout: Duration::from_millis(call_timeout_ms),
        })
    }

    #[tokio::test]
    async fn result_line_resolves_pending() {
        let shared = test_shared(1_000);
        let awaiter =
            shared
                .pending
                .register(7, Duration::from_secs(5), Error::timeout("t"));

        shared
            .handle_line(&json!({"jsonrpc":"2.0","id":7,"result":{"ok":true}}).to_string())
            .await;

        let result = awaiter.recv().await.unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(shared.pending.pending_len(), 0);
    }

    #[tokio::test]
    async fn error_line_rejects_with_tool_error() {
        let shared = test_shared(1_000);
        let awaiter =
            shared
                .pending
                .register(3, Duration::from_secs(5), Error::timeout("t"));

        shared
            .handle_line(
                &json!({"jsonrpc":"2.0","id":3,"error":{"code":-32602,"message":"bad args"}})
                    .to_string(),
            )
            .await;

        let err = awaiter.recv().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolError);
        assert!(err.message().starts_with("invalid-params"));
    }

    #[tokio::test]
    async fn initialized_notification_marks_ready() {
        let shared = test_shared(1_000);
        assert_eq!(shared.state(), ProviderState::Handshaking);
        shared
            .handle_line(&json!({"jsonrpc":"2.0","method":"initialized"}).to_string())
            .await;
        assert_eq!(shared.state(), ProviderState::Ready);
    }

    #[tokio::test]
    async fn garbage_line_does_not_stall_or_fail() {
        let shared = test_shared(1_000);
        shared.handle_line("npm WARN deprecated something").await;
        assert_ne!(shared.state(), ProviderState::Exited);
    }

    #[tokio::test]
    async fn concatenated_frames_are_fatal() {
        let shared = test_shared(1_000);
        let awaiter =
            shared
                .pending
                .register(1, Duration::from_secs(5), Error::timeout("t"));
        shared.handle_line(r#"{"id":1,"result":{}}{"id":2}"#).await;
        assert_eq!(shared.state(), ProviderState::Exited);
        let err = awaiter.recv().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderUnreachable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_failure_is_provider_unreachable() {
        let config = ProviderConfig {
            command: "/nonexistent/definitely-not-a-binary".to_string(),
            ..Default::default()
        };
        let err = ProviderHandle::spawn("ghost", &config, &McpConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderUnreachable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_child_forced_ready_then_call_times_out() {
        // `cat` echoes our own requests back; they classify as unmatched and
        // are dropped, so the handshake relies on the forced-ready path and a
        // call runs into its deadline.
        let config = ProviderConfig {
            command: "cat".to_string(),
            ..Default::default()
        };
        let mcp = McpConfig {
            initialize_timeout_ms: 100,
            tool_call_timeout_ms: 100,
            ..Default::default()
        };
        let handle = ProviderHandle::spawn("echo", &config, &mcp).unwrap();
        handle.handshake(&mcp).await.unwrap();
        assert!(handle.is_ready());

        let awaiter = handle.call("read_file", &json!({"path": "/x"})).await.unwrap();
        let err = awaiter.recv().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolTimeout);
        assert_eq!(handle.pending_len(), 0);

        handle.shutdown(Duration::from_millis(200)).await;
        assert_eq!(handle.state(), ProviderState::Exited);
    }
}
