//! Worker transport over a child process's stdio.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::config::WorkerConfig;
use crate::process;
use crate::protocol::{self, IncomingFrame, Notification, Request};
use crate::transport::{
    ExitFut, ExitReason, InboundNotification, Launched, TransportError, TransportFut,
    WorkerConnection, WorkerLauncher,
};

const INIT_TIMEOUT: Duration = Duration::from_secs(30);

const WRITER_CHANNEL_CAPACITY: usize = 64;

const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, protocol::ResponseError>>>>>;

enum WriterCommand {
    Send(Value),
    Shutdown,
}

/// Launches the worker as a child process speaking JSON-RPC over stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: String,
    args: Vec<String>,
    request_timeout: Option<Duration>,
}

impl ProcessLauncher {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            request_timeout: None,
        }
    }

    /// Build from config; `None` when no worker command is configured.
    #[must_use]
    pub fn from_config(config: &WorkerConfig) -> Option<Self> {
        let command = config.command()?;
        Some(Self {
            command,
            args: config.args(),
            request_timeout: config.request_timeout(),
        })
    }

    /// Give up on requests that take longer than this. Off by default: some
    /// worker requests legitimately run for minutes.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch<'a>(&'a self, workspace_path: &'a Path) -> TransportFut<'a, Launched> {
        Box::pin(async move {
            let (worker, notifications) = RunningWorker::spawn(self, workspace_path)
                .await
                .map_err(TransportError::Launch)?;
            Ok(Launched {
                connection: Arc::new(worker),
                notifications,
            })
        })
    }
}

pub(crate) struct RunningWorker {
    command: String,
    pid: Option<u32>,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: AtomicU64,
    pending: PendingMap,
    exit_rx: watch::Receiver<Option<ExitReason>>,
    request_timeout: Option<Duration>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningWorker {
    async fn spawn(
        launcher: &ProcessLauncher,
        workspace_path: &Path,
    ) -> Result<(Self, mpsc::Receiver<InboundNotification>)> {
        let resolved = which::which(&launcher.command)
            .with_context(|| format!("{} not found in PATH", launcher.command))?;
        let mut cmd = Command::new(&resolved);
        cmd.args(&launcher.args)
            .current_dir(workspace_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        process::set_new_session(&mut cmd);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", launcher.command))?;
        let child_pid = child.id();

        let stdout = child.stdout.take().context("no stdout from worker")?;
        let stdin = child.stdin.take().context("no stdin from worker")?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let (notification_tx, notification_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);

        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(stdin);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!("worker write error: {e:#}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_writer_tx = writer_tx.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(stdout);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        Self::dispatch_frame(
                            frame,
                            &reader_pending,
                            &notification_tx,
                            &reader_writer_tx,
                        )
                        .await;
                    }
                    Ok(None) => {
                        tracing::info!("worker closed stdout");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("worker read error: {e:#}");
                        break;
                    }
                }
            }
            // Dropping the senders fails every in-flight request with `Closed`.
            reader_pending.lock().await.clear();
        });

        let wait_handle = tokio::spawn(async move {
            let reason = match child.wait().await {
                Ok(status) => ExitReason::Exited(status.code()),
                Err(e) => ExitReason::Failed(e.to_string()),
            };
            tracing::info!(pid = ?child_pid, "worker process {reason}");
            let _ = exit_tx.send(Some(reason));
        });

        let mut tasks = vec![writer_handle, reader_handle, wait_handle];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(forward_stderr(stderr)));
        }

        let mut worker = Self {
            command: launcher.command.clone(),
            pid: child_pid,
            writer_tx,
            next_id: AtomicU64::new(1),
            pending,
            exit_rx,
            request_timeout: launcher.request_timeout,
            tasks,
        };

        let result = worker
            .call(
                "initialize",
                Some(protocol::initialize_params(workspace_path)),
                Some(INIT_TIMEOUT),
            )
            .await
            .map_err(|e| anyhow!("initialize failed: {e}"))?;
        if let Some(pid) = protocol::reported_pid(&result) {
            worker.pid = Some(pid);
        }
        worker
            .send_notification("initialized", Some(serde_json::json!({})))
            .await?;

        tracing::info!(pid = ?worker.pid, "worker started");
        Ok((worker, notification_rx))
    }

    async fn dispatch_frame(
        frame: Value,
        pending: &Mutex<HashMap<u64, oneshot::Sender<Result<Value, protocol::ResponseError>>>>,
        notification_tx: &mpsc::Sender<InboundNotification>,
        writer_tx: &mpsc::Sender<WriterCommand>,
    ) {
        let Some(incoming) = protocol::parse_incoming(frame) else {
            tracing::trace!("ignoring malformed JSON-RPC frame from worker");
            return;
        };

        match incoming {
            IncomingFrame::Response { id, outcome } => {
                let sender = pending.lock().await.remove(&id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => tracing::debug!("response for unknown request id {id}"),
                }
            }
            IncomingFrame::ServerRequest { id, method } => {
                // The worker blocks on unanswered requests; refuse what we don't serve.
                tracing::debug!("worker sent request {method}, replying method not found");
                let reply = protocol::method_not_found(id, &method);
                let _ = writer_tx.send(WriterCommand::Send(reply)).await;
            }
            IncomingFrame::Notification { method, params } => {
                tracing::trace!("worker notification: {method}");
                if notification_tx
                    .send(InboundNotification { method, params })
                    .await
                    .is_err()
                {
                    tracing::trace!("notification dropped, no dispatcher attached");
                }
            }
        }
    }

    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = serde_json::to_value(Request::new(id, method, params))
            .context("serializing request")?;
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(TransportError::Closed);
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    return Err(TransportError::Timeout {
                        method: method.to_string(),
                    });
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(TransportError::Response(error)),
            Err(_) => Err(TransportError::Closed),
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let frame = serde_json::to_value(Notification::new(method, params))
            .context("serializing notification")?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| anyhow!("writer channel closed"))
    }

    async fn wait_for_exit(&self) -> ExitReason {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(ExitReason::Failed("unknown".into())),
            Err(_) => ExitReason::Failed("exit watcher stopped".into()),
        }
    }
}

impl WorkerConnection for RunningWorker {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn request<'a>(&'a self, method: &'a str, params: Option<Value>) -> TransportFut<'a, Value> {
        Box::pin(self.call(method, params, self.request_timeout))
    }

    fn notify<'a>(&'a self, method: &'a str, params: Option<Value>) -> TransportFut<'a, ()> {
        Box::pin(async move {
            self.send_notification(method, params)
                .await
                .map_err(|_| TransportError::Closed)
        })
    }

    fn shutdown(&self) -> TransportFut<'_, ()> {
        Box::pin(async move {
            match self.call("shutdown", None, Some(INIT_TIMEOUT)).await {
                Ok(_) => {
                    let _ = self.send_notification("exit", None).await;
                }
                Err(e) => {
                    tracing::debug!("{} did not acknowledge shutdown: {e}", self.command);
                }
            }
            let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
            self.wait_for_exit().await;
            Ok(())
        })
    }

    fn kill(&self) {
        let Some(pid) = self.pid else {
            tracing::warn!("cannot kill {}: pid unknown", self.command);
            return;
        };
        match process::kill_process_group(pid) {
            Ok(outcome) => tracing::info!(pid, "forced worker stop: {outcome:?}"),
            Err(e) => tracing::warn!(pid, "failed to kill worker process group: {e}"),
        }
    }

    fn exited(&self) -> ExitFut<'_> {
        Box::pin(self.wait_for_exit())
    }
}

impl Drop for RunningWorker {
    fn drop(&mut self) {
        // Aborting the wait task drops the child, and kill_on_drop reaps it.
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(target: "tether::worker", "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::trace!("worker stderr closed: {e}");
                break;
            }
        }
    }
}
