//! STDIO transport for child-process providers
//!
//! The child speaks newline-delimited JSON on stdin/stdout. A reader task
//! turns raw stdout chunks into JSON frames (see [`FrameBuffer`]) and queues
//! them; discovery and tool calls consume that queue while holding the
//! handle's frame lock, which serializes exchanges on one instance.
//!
//! Discovery tolerates peers that never answer `initialize` but push a
//! listing on their own, and degrades to an empty tool list on timeout.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcpool_core::{
    executable_name, ClientType, McpConfig, PoolError, PoolResult, StdioConfig, TimeoutPhase,
    Tool, TransportSettings, INSTANCE_ID_ENV,
};
use mcpool_mcp::{
    extract_tool_listing, ClientInfo, Frame, FrameBuffer, JsonRpcNotification, JsonRpcRequest,
    ResponseFrame,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::provision::{setup_hint, EnvironmentProvisioner, Provisioned};
use super::shell_env;
use super::{ConnectedSession, McpConnection, TransportConnector};

const INITIALIZE_ID: u64 = 1;
const TOOLS_LIST_ID: u64 = 2;
const FIRST_CALL_ID: u64 = 1000;
const FRAME_QUEUE: usize = 1024;
const STDERR_TAIL: usize = 20;
const READ_CHUNK: usize = 8192;

/// Apply platform process flags to a child command.
///
/// Unix: the child gets its own process group, so terminal signals aimed at
/// the pool host do not reach providers and teardown can signal the whole
/// group (wrappers like `npx` or `uvx` fork the real server).
/// Windows: `CREATE_NO_WINDOW` keeps console children from opening windows.
pub fn configure_child_process_platform(cmd: &mut Command) {
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
}

/// A running provider process.
pub struct StdioHandle {
    instance_id: String,
    pid: Option<u32>,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    frames: Mutex<mpsc::Receiver<Value>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    stderr_tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
    io_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl StdioHandle {
    fn start(instance_id: &str, mut child: Child) -> PoolResult<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::spawn("child stdout was not captured", None))?;
        let stdin = child.stdin.take();
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(FRAME_QUEUE);
        let stderr_tail = Arc::new(parking_lot::Mutex::new(VecDeque::with_capacity(STDERR_TAIL)));

        let mut io_tasks = vec![tokio::spawn(pump_stdout(instance_id.to_string(), stdout, tx))];
        if let Some(stderr) = stderr {
            io_tasks.push(tokio::spawn(pump_stderr(
                instance_id.to_string(),
                stderr,
                stderr_tail.clone(),
            )));
        }

        Ok(Self {
            instance_id: instance_id.to_string(),
            pid: child.id(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            frames: Mutex::new(rx),
            next_id: AtomicU64::new(FIRST_CALL_ID),
            closed: AtomicBool::new(false),
            stderr_tail,
            io_tasks: parking_lot::Mutex::new(io_tasks),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the child is still running and the handle is open.
    pub async fn is_running(&self) -> bool {
        !self.is_closed() && matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn write_line(&self, line: &str) -> PoolResult<()> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| PoolError::TransportUnavailable("stdin is closed".to_string()))?;
        let io_err = |e: std::io::Error| {
            PoolError::TransportUnavailable(format!("write to provider stdin failed: {}", e))
        };
        pipe.write_all(line.as_bytes()).await.map_err(io_err)?;
        pipe.flush().await.map_err(io_err)
    }

    async fn send_request(&self, request: &JsonRpcRequest) -> PoolResult<()> {
        let line = request
            .to_line()
            .map_err(|e| PoolError::MalformedResponse(format!("cannot encode request: {}", e)))?;
        self.write_line(&line).await
    }

    async fn send_notification(&self, notification: &JsonRpcNotification) -> PoolResult<()> {
        let line = notification
            .to_line()
            .map_err(|e| PoolError::MalformedResponse(format!("cannot encode notification: {}", e)))?;
        self.write_line(&line).await
    }

    async fn exit_status(&self) -> Option<ExitStatus> {
        self.child.lock().await.try_wait().ok().flatten()
    }

    fn stderr_excerpt(&self) -> String {
        let tail = self.stderr_tail.lock();
        let start = tail.len().saturating_sub(5);
        tail.iter().skip(start).cloned().collect::<Vec<_>>().join(" | ")
    }

    /// Close stdin, SIGTERM, then SIGKILL after `grace`. Idempotent.
    pub async fn shutdown(&self, grace: Duration) -> PoolResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for task in self.io_tasks.lock().drain(..) {
            task.abort();
        }
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            debug!(instance_id = %self.instance_id, %status, "[StdioConnector] Process already exited");
            return Ok(());
        }

        send_terminate(&mut child);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(instance_id = %self.instance_id, %status, "[StdioConnector] Process exited");
                return Ok(());
            }
            Ok(Err(e)) => {
                warn!(instance_id = %self.instance_id, error = %e, "[StdioConnector] Waiting for process failed");
            }
            Err(_) => {
                warn!(
                    instance_id = %self.instance_id,
                    grace_ms = grace.as_millis() as u64,
                    "[StdioConnector] Process ignored SIGTERM, killing"
                );
            }
        }

        force_kill(&mut child);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(PoolError::TerminationTimeout(grace * 2)),
        }
    }
}

impl Drop for StdioHandle {
    fn drop(&mut self) {
        for task in self.io_tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let pid = pid as libc::pid_t;
        // SAFETY: plain signal delivery to a pid we spawned.
        unsafe {
            if libc::kill(-pid, libc::SIGTERM) != 0 {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: see send_terminate.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
}

async fn pump_stdout(instance_id: String, mut stdout: ChildStdout, tx: mpsc::Sender<Value>) {
    let mut buffer = FrameBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => {
                forward_frames(&instance_id, &tx, buffer.finish());
                break;
            }
            Ok(n) => {
                buffer.push(&chunk[..n]);
                if !forward_frames(&instance_id, &tx, buffer.drain()) {
                    break;
                }
            }
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "[StdioConnector] stdout read failed");
                break;
            }
        }
    }
    debug!(instance_id = %instance_id, "[StdioConnector] stdout closed");
}

/// Queue JSON frames, log text ones. Returns false once nobody can receive.
fn forward_frames(instance_id: &str, tx: &mpsc::Sender<Value>, frames: Vec<Frame>) -> bool {
    for frame in frames {
        match frame {
            Frame::Json(value) => match tx.try_send(value) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(instance_id, "[StdioConnector] Frame queue full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            },
            Frame::Text(line) => debug!(instance_id, "[StdioConnector] stdout: {}", line),
        }
    }
    true
}

async fn pump_stderr(
    instance_id: String,
    stderr: ChildStderr,
    tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(instance_id = %instance_id, "[StdioConnector] stderr: {}", line);
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Program and arguments to launch once provisioning is done.
fn launch_command(cfg: &StdioConfig, provisioned: &Provisioned) -> (String, Vec<String>) {
    let exe = executable_name(&cfg.command);
    if let Some(python) = &provisioned.interpreter {
        if exe.starts_with("python") {
            return (python.to_string_lossy().into_owned(), cfg.args.clone());
        }
    }
    if exe.ends_with(".js") {
        let mut args = Vec::with_capacity(cfg.args.len() + 1);
        args.push(cfg.command.clone());
        args.extend(cfg.args.iter().cloned());
        return ("node".to_string(), args);
    }
    (cfg.command.clone(), cfg.args.clone())
}

pub struct StdioConnector {
    settings: TransportSettings,
    provisioner: Arc<dyn EnvironmentProvisioner>,
    client_info: ClientInfo,
}

impl StdioConnector {
    pub fn new(settings: TransportSettings, provisioner: Arc<dyn EnvironmentProvisioner>) -> Self {
        Self {
            settings,
            provisioner,
            client_info: ClientInfo::default(),
        }
    }

    /// Allow-list check on the executable basename; any `*.js` file passes.
    pub fn is_allowed(&self, command: &str) -> bool {
        let exe = executable_name(command);
        if exe.ends_with(".js") {
            return true;
        }
        let exe = exe.trim_end_matches(".exe").trim_end_matches(".cmd");
        self.settings
            .allowed_executables
            .iter()
            .any(|allowed| allowed == exe)
    }

    fn ensure_allowed(&self, command: &str) -> PoolResult<()> {
        if self.is_allowed(command) {
            Ok(())
        } else {
            Err(PoolError::config(format!(
                "executable '{}' is not allowed (allowed: {}, or any .js file)",
                command,
                self.settings.allowed_executables.join(", ")
            )))
        }
    }

    async fn spawn(
        &self,
        instance_id: &str,
        cfg: &StdioConfig,
        provisioned: &Provisioned,
    ) -> PoolResult<StdioHandle> {
        let (program, args) = launch_command(cfg, provisioned);
        let cwd = provisioned
            .working_dir
            .clone()
            .or_else(|| cfg.working_dir.as_ref().map(PathBuf::from));

        let lookup = (program.clone(), cwd.clone());
        let resolved = tokio::task::spawn_blocking(move || {
            shell_env::resolve_program(&lookup.0, lookup.1.as_deref())
        })
        .await
        .ok()
        .flatten()
        .ok_or_else(|| {
            PoolError::spawn(
                format!("Command not found: {}", program),
                Some("ensure it is installed and on PATH"),
            )
        })?;

        debug!(instance_id, path = ?resolved.path, args = ?args, "[StdioConnector] Spawning");

        let mut cmd = Command::new(&resolved.path);
        cmd.args(&args)
            .envs(&cfg.env)
            .env(INSTANCE_ID_ENV, instance_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut search_path = resolved.search_path.clone();
        if let Some(bin_dir) = &provisioned.bin_dir {
            search_path = Some(shell_env::prepend_path(bin_dir, search_path.as_ref()));
            if let Some(venv) = bin_dir.parent() {
                cmd.env("VIRTUAL_ENV", venv);
            }
        }
        if let Some(path) = search_path {
            if !cfg.env.contains_key("PATH") {
                cmd.env("PATH", path);
            }
        }
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }
        configure_child_process_platform(&mut cmd);

        let child = cmd.spawn().map_err(|e| {
            let hint = (e.kind() == std::io::ErrorKind::NotFound)
                .then_some("ensure it is installed and on PATH");
            PoolError::spawn(format!("Failed to spawn {}: {}", program, e), hint)
        })?;

        info!(
            instance_id,
            pid = ?child.id(),
            command = %program,
            "[StdioConnector] Process started"
        );
        StdioHandle::start(instance_id, child)
    }

    async fn discover_tools(&self, handle: &StdioHandle) -> PoolResult<Vec<Tool>> {
        let mut frames = handle.frames.lock().await;
        let limit = self.settings.discovery_timeout;

        let exchange = async {
            let handshake = tokio::time::sleep(self.settings.handshake_delay);
            tokio::pin!(handshake);
            let mut initialize_sent = false;

            loop {
                tokio::select! {
                    _ = &mut handshake, if !initialize_sent => {
                        initialize_sent = true;
                        handle
                            .send_request(&JsonRpcRequest::initialize(INITIALIZE_ID, &self.client_info))
                            .await?;
                    }
                    frame = frames.recv() => {
                        let Some(value) = frame else {
                            return Err(self.exited_during_discovery(handle).await);
                        };
                        if let Some(tools) = extract_tool_listing(&value) {
                            return Ok(tools);
                        }
                        let Some(reply) = ResponseFrame::parse(&value) else {
                            continue;
                        };
                        if reply.answers(INITIALIZE_ID) {
                            if let Some(error) = &reply.error {
                                warn!(
                                    instance_id = %handle.instance_id,
                                    "[StdioConnector] initialize rejected ({}), requesting tools anyway",
                                    error.message
                                );
                            }
                            handle.send_notification(&JsonRpcNotification::initialized()).await?;
                            handle.send_request(&JsonRpcRequest::tools_list(TOOLS_LIST_ID)).await?;
                        } else if reply.answers(TOOLS_LIST_ID) {
                            match &reply.error {
                                Some(error) => warn!(
                                    instance_id = %handle.instance_id,
                                    "[StdioConnector] tools/list failed: {}",
                                    error.message
                                ),
                                None => warn!(
                                    instance_id = %handle.instance_id,
                                    "[StdioConnector] tools/list reply has no tool array"
                                ),
                            }
                            return Ok(Vec::new());
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    instance_id = %handle.instance_id,
                    timeout_ms = limit.as_millis() as u64,
                    "[StdioConnector] Tool discovery timed out, continuing with no tools"
                );
                Ok(Vec::new())
            }
        }
    }

    async fn exited_during_discovery(&self, handle: &StdioHandle) -> PoolError {
        let status = tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                if let Some(status) = handle.exit_status().await {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .ok();

        let stderr = handle.stderr_excerpt();
        let mut message = match status {
            Some(status) => format!("Process exited during tool discovery ({})", status),
            None => "Process closed stdout during tool discovery".to_string(),
        };
        if !stderr.is_empty() {
            message = format!("{}: {}", message, stderr);
        }
        PoolError::spawn(message, setup_hint(status.and_then(|s| s.code()), &stderr))
    }
}

#[async_trait]
impl TransportConnector for StdioConnector {
    fn client_type(&self) -> ClientType {
        ClientType::Stdio
    }

    async fn connect(&self, instance_id: &str, config: &McpConfig) -> PoolResult<ConnectedSession> {
        let cfg = config
            .as_stdio()
            .ok_or_else(|| PoolError::config("stdio connector requires a stdio config"))?;
        config.validate()?;
        self.ensure_allowed(&cfg.command)?;
        if let Some(setup) = &cfg.setup {
            self.ensure_allowed(&setup.command)?;
        }

        info!(
            instance_id,
            command = %cfg.command,
            args = ?cfg.args,
            "[StdioConnector] Connecting"
        );

        let provisioned = match self.provisioner.provision(instance_id, cfg).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                self.provisioner.release(instance_id).await;
                return Err(e);
            }
        };
        let handle = match self.spawn(instance_id, cfg, &provisioned).await {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                self.provisioner.release(instance_id).await;
                return Err(e);
            }
        };

        match self.discover_tools(&handle).await {
            Ok(tools) => {
                info!(
                    instance_id,
                    tool_count = tools.len(),
                    "[StdioConnector] Connected"
                );
                Ok(ConnectedSession {
                    connection: McpConnection::Stdio(handle),
                    tools,
                })
            }
            Err(e) => {
                if let Err(kill_err) = handle.shutdown(self.settings.kill_grace).await {
                    warn!(instance_id, error = %kill_err, "[StdioConnector] Cleanup after failed connect did not finish");
                }
                self.provisioner.release(instance_id).await;
                Err(e)
            }
        }
    }

    async fn call_tool(
        &self,
        connection: &McpConnection,
        tool_name: &str,
        params: Value,
    ) -> PoolResult<Value> {
        let handle = connection.as_stdio()?;
        if handle.is_closed() {
            return Err(PoolError::TransportUnavailable(format!(
                "instance {} is disconnected",
                handle.instance_id
            )));
        }

        let mut frames = handle.frames.lock().await;
        while let Ok(stale) = frames.try_recv() {
            debug!(instance_id = %handle.instance_id, frame = %stale, "[StdioConnector] Discarding stale frame");
        }

        let id = handle.next_request_id();
        debug!(instance_id = %handle.instance_id, tool = tool_name, id, "[StdioConnector] tools/call");
        handle
            .send_request(&JsonRpcRequest::tools_call(id, tool_name, params))
            .await?;

        let compat = self
            .settings
            .compat_tool_names
            .iter()
            .any(|name| name == tool_name);

        let wait = async {
            loop {
                let Some(value) = frames.recv().await else {
                    return Err(PoolError::TransportUnavailable(format!(
                        "instance {} exited during tool call",
                        handle.instance_id
                    )));
                };
                let Some(reply) = ResponseFrame::parse(&value) else {
                    continue;
                };
                if reply.answers(id) {
                    return match (reply.error, reply.result) {
                        (Some(error), _) => Err(PoolError::Protocol(error.message)),
                        (None, Some(result)) => Ok(result),
                        (None, None) => Err(PoolError::MalformedResponse(
                            "reply has neither result nor error".to_string(),
                        )),
                    };
                }
                if compat && reply.error.is_none() {
                    if let Some(result) = reply.result.filter(Value::is_object) {
                        info!(
                            instance_id = %handle.instance_id,
                            tool = tool_name,
                            expected_id = id,
                            got_id = ?reply.id,
                            "[StdioConnector] Accepting reply with mismatched id"
                        );
                        return Ok(result);
                    }
                }
                debug!(instance_id = %handle.instance_id, got_id = ?reply.id, "[StdioConnector] Skipping unrelated frame");
            }
        };

        let limit = self.settings.call_timeout;
        match tokio::time::timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    instance_id = %handle.instance_id,
                    tool = tool_name,
                    timeout_ms = limit.as_millis() as u64,
                    "[StdioConnector] Tool call timed out"
                );
                Err(PoolError::timeout(TimeoutPhase::ToolCall, limit))
            }
        }
    }

    async fn disconnect(&self, connection: &McpConnection) -> PoolResult<()> {
        let handle = connection.as_stdio()?;
        let result = handle.shutdown(self.settings.kill_grace).await;
        self.provisioner.release(&handle.instance_id).await;
        result
    }

    async fn check_connection(&self, connection: &McpConnection) -> bool {
        match connection.as_stdio() {
            Ok(handle) => handle.is_running().await,
            Err(_) => false,
        }
    }
}
