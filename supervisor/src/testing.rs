//! Scripted stand-ins for the worker process and the daemon.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::lock;
use crate::protocol::{DEFAULT_BUSY_ERROR_CODE, NotificationType, ResponseError, WorkspaceRefresh};
use crate::transport::{
    ExitFut, ExitReason, InboundNotification, Launched, TransportError, TransportFut,
    WorkerConnection, WorkerLauncher,
};
use crate::watcher::{DaemonCallback, DaemonClient, DaemonError, DaemonFut, DaemonSignal, Unregister};

#[derive(Default)]
struct Script {
    busy_responses: AtomicUsize,
    echo_refresh: AtomicBool,
    hang_on_shutdown: AtomicBool,
    hold_requests: AtomicBool,
}

#[derive(Default)]
pub(crate) struct FakeLauncher {
    script: Arc<Script>,
    launches: AtomicUsize,
    fail_next: AtomicUsize,
    launch_delay: Mutex<Duration>,
    paths: Mutex<Vec<PathBuf>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeLauncher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_launch_delay(&self, delay: Duration) {
        *lock(&self.launch_delay) = delay;
    }

    /// Answer the next `count` requests with the busy error code.
    pub(crate) fn set_busy_responses(&self, count: usize) {
        self.script.busy_responses.store(count, Ordering::SeqCst);
    }

    /// Reply to `workspace/refresh` with the completion notification.
    pub(crate) fn set_echo_refresh(&self, echo: bool) {
        self.script.echo_refresh.store(echo, Ordering::SeqCst);
    }

    pub(crate) fn set_hang_on_shutdown(&self, hang: bool) {
        self.script.hang_on_shutdown.store(hang, Ordering::SeqCst);
    }

    /// Leave requests unanswered until the connection exits.
    pub(crate) fn set_hold_requests(&self, hold: bool) {
        self.script.hold_requests.store(hold, Ordering::SeqCst);
    }

    pub(crate) fn connection(&self, index: usize) -> Arc<FakeConnection> {
        Arc::clone(&lock(&self.connections)[index])
    }

    pub(crate) fn live_connections(&self) -> usize {
        lock(&self.connections)
            .iter()
            .filter(|connection| connection.is_alive())
            .count()
    }

    pub(crate) fn launch_paths(&self) -> Vec<PathBuf> {
        lock(&self.paths).clone()
    }
}

impl WorkerLauncher for FakeLauncher {
    fn launch<'a>(&'a self, workspace_path: &'a Path) -> TransportFut<'a, Launched> {
        Box::pin(async move {
            let n = self.launches.fetch_add(1, Ordering::SeqCst);
            lock(&self.paths).push(workspace_path.to_path_buf());

            let delay = *lock(&self.launch_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let failed = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(TransportError::Launch(anyhow!("scripted launch failure")));
            }

            let (notify_tx, notifications) = mpsc::channel(64);
            let pid = 1000 + u32::try_from(n).unwrap_or(0);
            let connection = Arc::new(FakeConnection::new(pid, Arc::clone(&self.script), notify_tx));
            lock(&self.connections).push(Arc::clone(&connection));
            Ok(Launched {
                connection,
                notifications,
            })
        })
    }
}

pub(crate) struct FakeConnection {
    pid: u32,
    script: Arc<Script>,
    notify_tx: mpsc::Sender<InboundNotification>,
    requests: Mutex<Vec<String>>,
    notifications: Mutex<Vec<(String, Option<Value>)>>,
    sent: watch::Sender<usize>,
    received: watch::Sender<usize>,
    shutdowns: AtomicU32,
    kills: AtomicU32,
    exit_tx: watch::Sender<Option<ExitReason>>,
}

impl FakeConnection {
    fn new(pid: u32, script: Arc<Script>, notify_tx: mpsc::Sender<InboundNotification>) -> Self {
        Self {
            pid,
            script,
            notify_tx,
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            sent: watch::channel(0).0,
            received: watch::channel(0).0,
            shutdowns: AtomicU32::new(0),
            kills: AtomicU32::new(0),
            exit_tx: watch::channel(None).0,
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }

    pub(crate) fn notifications(&self) -> Vec<(String, Option<Value>)> {
        lock(&self.notifications).clone()
    }

    pub(crate) async fn wait_for_notifications(&self, count: usize) {
        let mut rx = self.sent.subscribe();
        let _ = rx.wait_for(|sent| *sent >= count).await;
    }

    pub(crate) async fn wait_for_requests(&self, count: usize) {
        let mut rx = self.received.subscribe();
        let _ = rx.wait_for(|received| *received >= count).await;
    }

    pub(crate) fn shutdowns(&self) -> u32 {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub(crate) fn kills(&self) -> u32 {
        self.kills.load(Ordering::SeqCst)
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.exit_tx.borrow().is_none()
    }

    /// Simulate the process dying on its own.
    pub(crate) fn crash(&self, code: i32) {
        self.exit(ExitReason::Exited(Some(code)));
    }

    /// Push a notification as if the worker sent it.
    pub(crate) fn emit(&self, method: &str, params: Option<Value>) {
        let _ = self.notify_tx.try_send(InboundNotification {
            method: method.to_string(),
            params,
        });
    }

    fn exit(&self, reason: ExitReason) {
        self.exit_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }
}

impl WorkerConnection for FakeConnection {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn request<'a>(&'a self, method: &'a str, params: Option<Value>) -> TransportFut<'a, Value> {
        Box::pin(async move {
            lock(&self.requests).push(method.to_string());
            self.received.send_modify(|received| *received += 1);
            if self.script.hold_requests.load(Ordering::SeqCst) {
                let mut exit = self.exit_tx.subscribe();
                let _ = exit.wait_for(Option::is_some).await;
            }
            if !self.is_alive() {
                return Err(TransportError::Closed);
            }
            let busy = self
                .script
                .busy_responses
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if busy {
                return Err(TransportError::Response(ResponseError {
                    code: DEFAULT_BUSY_ERROR_CODE,
                    message: "busy".into(),
                    data: None,
                }));
            }
            if method == "test/fail" {
                return Err(TransportError::Response(ResponseError {
                    code: -32603,
                    message: "scripted failure".into(),
                    data: None,
                }));
            }
            Ok(serde_json::json!({ "method": method, "params": params }))
        })
    }

    fn notify<'a>(&'a self, method: &'a str, params: Option<Value>) -> TransportFut<'a, ()> {
        Box::pin(async move {
            if !self.is_alive() {
                return Err(TransportError::Closed);
            }
            lock(&self.notifications).push((method.to_string(), params));
            self.sent.send_modify(|sent| *sent += 1);
            if method == WorkspaceRefresh::METHOD && self.script.echo_refresh.load(Ordering::SeqCst)
            {
                self.emit(WorkspaceRefresh::METHOD, None);
            }
            Ok(())
        })
    }

    fn shutdown(&self) -> TransportFut<'_, ()> {
        Box::pin(async move {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            if self.script.hang_on_shutdown.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.exit(ExitReason::Exited(Some(0)));
            Ok(())
        })
    }

    fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.exit(ExitReason::Exited(None));
    }

    fn exited(&self) -> ExitFut<'_> {
        Box::pin(async move {
            let mut rx = self.exit_tx.subscribe();
            match rx.wait_for(Option::is_some).await {
                Ok(reason) => reason.clone().unwrap_or(ExitReason::Exited(None)),
                Err(_) => ExitReason::Failed("dropped".into()),
            }
        })
    }
}

/// A daemon whose events are pushed by the test.
#[derive(Default)]
pub(crate) struct FakeDaemon {
    registrations: AtomicUsize,
    unregisters: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    failures: Mutex<Vec<DaemonError>>,
    delay: Mutex<Duration>,
    signal_on_register: Mutex<Option<DaemonSignal>>,
    callbacks: Mutex<Vec<DaemonCallback<Value>>>,
}

impl FakeDaemon {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub(crate) fn unregisters(&self) -> usize {
        self.unregisters.load(Ordering::SeqCst)
    }

    /// Subscriptions handed out and not yet unregistered.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Fail the next registrations, in order.
    pub(crate) fn fail_with(&self, errors: Vec<DaemonError>) {
        *lock(&self.failures) = errors;
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Push `signal` through the next registration's callback before that
    /// registration completes.
    pub(crate) fn signal_during_next_registration(&self, signal: DaemonSignal) {
        *lock(&self.signal_on_register) = Some(signal);
    }

    /// Deliver a signal to the most recently registered callback.
    pub(crate) fn emit(&self, signal: DaemonSignal, payload: Option<Value>) {
        let callback = lock(&self.callbacks).last().cloned();
        if let Some(callback) = callback {
            callback(signal, payload);
        }
    }

    /// Deliver a signal to the callback of the `index`th successful registration.
    pub(crate) fn emit_to(&self, index: usize, signal: DaemonSignal, payload: Option<Value>) {
        let callback = lock(&self.callbacks).get(index).cloned();
        if let Some(callback) = callback {
            callback(signal, payload);
        }
    }
}

impl DaemonClient for FakeDaemon {
    type Payload = Value;

    fn register_listener(&self, callback: DaemonCallback<Value>) -> DaemonFut<'_, Unregister> {
        Box::pin(async move {
            self.registrations.fetch_add(1, Ordering::SeqCst);
            let delay = *lock(&self.delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            {
                let mut failures = lock(&self.failures);
                if !failures.is_empty() {
                    return Err(failures.remove(0));
                }
            }

            let early = lock(&self.signal_on_register).take();
            if let Some(signal) = early {
                callback(signal, None);
            }

            lock(&self.callbacks).push(callback);
            self.live.fetch_add(1, Ordering::SeqCst);
            let live = Arc::clone(&self.live);
            let unregisters = Arc::clone(&self.unregisters);
            let unregister: Unregister = Box::new(move || {
                unregisters.fetch_add(1, Ordering::SeqCst);
                live.fetch_sub(1, Ordering::SeqCst);
            });
            Ok(unregister)
        })
    }
}
