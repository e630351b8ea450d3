//! The seam between the supervisor and whatever actually runs the worker.
//!
//! [`crate::ProcessLauncher`] is the real implementation (child process,
//! JSON-RPC over stdio). Tests plug in scripted launchers.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::ResponseError;

pub type TransportFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

pub type ExitFut<'a> = Pin<Box<dyn Future<Output = ExitReason> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to launch worker: {0:#}")]
    Launch(anyhow::Error),
    #[error("worker connection closed")]
    Closed,
    #[error("request '{method}' timed out")]
    Timeout { method: String },
    #[error("worker returned error {}: {}", .0.code, .0.message)]
    Response(ResponseError),
    #[error(transparent)]
    Protocol(#[from] anyhow::Error),
}

impl TransportError {
    /// The JSON-RPC error code, when the worker answered with an error.
    #[must_use]
    pub fn response_code(&self) -> Option<i64> {
        match self {
            Self::Response(error) => Some(error.code),
            _ => None,
        }
    }
}

/// Why the worker process went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The process exited; `None` when it was killed by a signal.
    Exited(Option<i32>),
    /// The process could not be observed any more (wait failed, etc.).
    Failed(String),
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(Some(code)) => write!(f, "exited with code {code}"),
            Self::Exited(None) => write!(f, "terminated by signal"),
            Self::Failed(msg) => write!(f, "lost: {msg}"),
        }
    }
}

/// A notification pushed by the worker.
#[derive(Debug, Clone)]
pub struct InboundNotification {
    pub method: String,
    pub params: Option<Value>,
}

/// A freshly launched, initialized worker.
pub struct Launched {
    pub connection: Arc<dyn WorkerConnection>,
    /// Every notification the worker sends, in arrival order. Closed when the
    /// worker's output ends.
    pub notifications: mpsc::Receiver<InboundNotification>,
}

impl std::fmt::Debug for Launched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launched")
            .field("pid", &self.connection.pid())
            .finish_non_exhaustive()
    }
}

pub trait WorkerLauncher: Send + Sync {
    /// Spawn the worker for `workspace_path` and complete its handshake.
    fn launch<'a>(&'a self, workspace_path: &'a Path) -> TransportFut<'a, Launched>;
}

/// A live channel to one worker process.
pub trait WorkerConnection: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Send a request and wait for its correlated response.
    fn request<'a>(&'a self, method: &'a str, params: Option<Value>) -> TransportFut<'a, Value>;

    fn notify<'a>(&'a self, method: &'a str, params: Option<Value>) -> TransportFut<'a, ()>;

    /// Ask the worker to exit and wait until it has. Callers bound this with
    /// their own timeout.
    fn shutdown(&self) -> TransportFut<'_, ()>;

    /// Terminate the worker and its process group without asking.
    fn kill(&self);

    /// Resolves once the worker process is gone. Safe to drop and call again.
    fn exited(&self) -> ExitFut<'_>;
}
