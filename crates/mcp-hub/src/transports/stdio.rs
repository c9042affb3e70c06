use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::config::StdioConfig;
use crate::error::{McpError, Result};
use crate::protocol::McpTransport;
use crate::transports::TransportObserver;

/// Longest stdout line accepted from a server.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;
/// Stderr lines kept for diagnostics.
const STDERR_TAIL_LINES: usize = 50;
const GRACEFUL_EXIT: Duration = Duration::from_secs(5);

#[cfg(unix)]
const INHERITED_ENV_VARS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

#[cfg(windows)]
const INHERITED_ENV_VARS: &[&str] = &[
    "APPDATA",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PROCESSOR_ARCHITECTURE",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "USERNAME",
    "USERPROFILE",
];

/// Environment for a server process: a small inherited base (including the
/// search path) overlaid with the configured variables.
pub fn child_environment(overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    child_environment_from(overrides, |key| std::env::var(key).ok())
}

fn child_environment_from(
    overrides: &BTreeMap<String, String>,
    lookup: impl Fn(&str) -> Option<String>,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = INHERITED_ENV_VARS
        .iter()
        .filter_map(|key| lookup(key).map(|value| (key.to_string(), value)))
        // exported shell functions
        .filter(|(_, value)| !value.starts_with("()"))
        .collect();

    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Channel to a child process over its stdin/stdout.
pub struct StdioTransport {
    name: String,
    command: String,
    config: StdioConfig,
    observer: Arc<dyn TransportObserver>,
    connected: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    inbound: Mutex<Option<mpsc::Receiver<String>>>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    stderr_tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
}

impl StdioTransport {
    pub fn new(
        name: impl Into<String>,
        command: String,
        config: StdioConfig,
        observer: Arc<dyn TransportObserver>,
    ) -> Self {
        Self {
            name: name.into(),
            command,
            config,
            observer,
            connected: Arc::new(AtomicBool::new(false)),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            inbound: Mutex::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
            stderr_tail: Arc::new(parking_lot::Mutex::new(VecDeque::new())),
        }
    }

    fn spawn_stdout_reader(
        &self,
        stdout: tokio::process::ChildStdout,
        tx: mpsc::Sender<String>,
    ) -> tokio::task::JoinHandle<()> {
        let name = self.name.clone();
        let observer = self.observer.clone();
        let connected = self.connected.clone();

        tokio::spawn(async move {
            let mut lines =
                FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

            loop {
                match lines.next().await {
                    Some(Ok(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        debug!("[{}] <- {}", name, line);
                        if tx.send(line.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        connected.store(false, Ordering::SeqCst);
                        let err = McpError::Transport(format!("Failed to read stdout: {}", e));
                        warn!("MCP server '{}': {}", name, err);
                        observer.on_error(&err);
                        break;
                    }
                    None => {
                        connected.store(false, Ordering::SeqCst);
                        info!("MCP server '{}' closed its stdout", name);
                        observer.on_close();
                        break;
                    }
                }
            }
        })
    }

    fn spawn_stderr_reader(&self, stderr: tokio::process::ChildStderr) -> tokio::task::JoinHandle<()> {
        let name = self.name.clone();
        let tail = self.stderr_tail.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[{} stderr] {}", name, line);
                let mut tail = tail.lock();
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn connect(&self) -> Result<()> {
        info!(
            "Starting MCP server '{}': {} {:?}",
            self.name, self.command, self.config.args
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.config.args)
            .env_clear()
            .envs(child_environment(&self.config.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn MCP server '{}': {}", self.name, e);
            McpError::Transport(format!("Failed to spawn '{}': {}", self.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("Failed to capture stdout".to_string()))?;

        self.connected.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(256);
        let mut tasks = vec![self.spawn_stdout_reader(stdout, tx)];
        if let Some(stderr) = child.stderr.take() {
            tasks.push(self.spawn_stderr_reader(stderr));
        }

        *self.child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);
        *self.inbound.lock().await = Some(rx);
        self.tasks.lock().extend(tasks);

        info!("MCP server '{}' process started", self.name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);

        // Dropping stdin signals EOF to the server.
        self.stdin.lock().await.take();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(GRACEFUL_EXIT, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("MCP server '{}' exited: {}", self.name, status);
                }
                _ => {
                    warn!("MCP server '{}' did not exit gracefully, killing", self.name);
                    let _ = child.kill().await;
                }
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        Ok(())
    }

    async fn send(&self, message: String) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(McpError::Disconnected)?;

        stdin
            .write_all(format!("{}\n", message).as_bytes())
            .await
            .map_err(|e| McpError::Transport(format!("Failed to write: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("Failed to flush: {}", e)))?;

        debug!("[{}] -> {}", self.name, message);
        Ok(())
    }

    async fn receive(&self) -> Option<String> {
        let mut inbound = self.inbound.lock().await;
        inbound.as_mut()?.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn diagnostics(&self) -> Option<String> {
        let tail = self.stderr_tail.lock();
        if tail.is_empty() {
            None
        } else {
            Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}
