//! Lifecycle owner for the worker process.
//!
//! All transitions go through `WorkerSupervisor::handle`, which applies one
//! event to the machine under a `std::sync::Mutex` and publishes the new state
//! on a `watch` channel. Anything async (launching, tearing down, sending the
//! workspace change) runs in a spawned task that reports back with another
//! event, so the lock is never held across an `.await`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::listeners::{MethodRegistry, Subscription};
use crate::lock;
use crate::progress::{Cancellable, ProgressReporter};
use crate::protocol::{
    self, ChangeWorkspace, DEFAULT_BUSY_ERROR_CODE, NotificationType, RequestType, StopDaemon,
    WorkspaceRefresh, WorkspaceRefreshStarted,
};
use crate::transport::{
    InboundNotification, Launched, TransportError, WorkerConnection, WorkerLauncher,
};
use crate::types::{SupervisorError, WorkerState};

type RawListener = dyn Fn(&Value) + Send + Sync;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Response error code meaning "busy, send it again".
    pub busy_error_code: i64,
    /// Retries after a busy response (not counting the first attempt).
    pub max_busy_retries: u32,
    /// How long a graceful shutdown may take before the process group is killed.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            busy_error_code: DEFAULT_BUSY_ERROR_CODE,
            max_busy_retries: 3,
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

enum Event {
    Start {
        workspace_path: Option<PathBuf>,
    },
    Stop {
        process_alive: bool,
    },
    SetWorkspacePath(PathBuf),
    Launched {
        generation: u64,
        result: Result<Launched, TransportError>,
    },
    Exited {
        generation: u64,
    },
    TornDown {
        generation: u64,
    },
}

enum Effect {
    Launch {
        generation: u64,
        workspace_path: PathBuf,
    },
    Teardown {
        generation: u64,
        connection: Arc<dyn WorkerConnection>,
        process_alive: bool,
    },
    ChangeWorkspace {
        connection: Arc<dyn WorkerConnection>,
        workspace_path: PathBuf,
    },
}

#[derive(Default)]
struct Machine {
    state: WorkerState,
    /// Bumped on every START; results from older launches are ignored.
    generation: u64,
    workspace_path: Option<PathBuf>,
    workspace_change_pending: bool,
    /// Bumped every time the machine enters `Idle`.
    idle_epoch: u64,
    pid: Option<u32>,
    connection: Option<Arc<dyn WorkerConnection>>,
    /// Exit listener and notification dispatch for the live connection.
    tasks: Vec<JoinHandle<()>>,
}

impl Machine {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

struct Shared {
    launcher: Arc<dyn WorkerLauncher>,
    options: WorkerOptions,
    machine: Mutex<Machine>,
    state_tx: watch::Sender<WorkerState>,
    idle_tx: watch::Sender<u64>,
    listeners: MethodRegistry<RawListener>,
}

/// Supervises one worker process. Cheap to clone; clones share the process.
///
/// Requests and notifications start the worker on demand. Every method that
/// spawns work must be called from inside a tokio runtime.
#[derive(Clone)]
pub struct WorkerSupervisor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let machine = lock(&self.shared.machine);
        f.debug_struct("WorkerSupervisor")
            .field("state", &machine.state)
            .field("pid", &machine.pid)
            .field("workspace_path", &machine.workspace_path)
            .finish_non_exhaustive()
    }
}

impl WorkerSupervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, options: WorkerOptions) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Idle);
        let (idle_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                launcher,
                options,
                machine: Mutex::new(Machine::default()),
                state_tx,
                idle_tx,
                listeners: MethodRegistry::new(),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        lock(&self.shared.machine).state
    }

    /// Observe state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.shared.state_tx.subscribe()
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        lock(&self.shared.machine).pid
    }

    #[must_use]
    pub fn workspace_path(&self) -> Option<PathBuf> {
        lock(&self.shared.machine).workspace_path.clone()
    }

    /// Start the worker, optionally for a new workspace. Ignored unless idle.
    pub fn start(&self, workspace_path: Option<PathBuf>) {
        self.handle(Event::Start { workspace_path });
    }

    /// Stop the worker gracefully. Ignored when idle or already stopping.
    pub fn stop(&self) {
        self.handle(Event::Stop {
            process_alive: true,
        });
    }

    /// Stop the worker and wait until it is gone. Returns even when another
    /// caller starts a fresh worker right after.
    pub async fn shutdown(&self) {
        self.stop_and_wait().await;
    }

    pub fn set_workspace_path(&self, workspace_path: impl Into<PathBuf>) {
        self.handle(Event::SetWorkspacePath(workspace_path.into()));
    }

    /// Send a typed request. `None` covers every failure: the worker could
    /// not start, stayed busy, or answered with an error.
    pub async fn send_request<R: RequestType>(&self, params: &R::Params) -> Option<R::Result> {
        let params = match protocol::to_params(params) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!("could not serialize params for {}: {e}", R::METHOD);
                return None;
            }
        };
        let value = self.send_request_raw(R::METHOD, params).await?;
        match serde_json::from_value(value) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!("unexpected result for {}: {e}", R::METHOD);
                None
            }
        }
    }

    pub async fn send_request_raw(&self, method: &str, params: Option<Value>) -> Option<Value> {
        let options = &self.shared.options;
        let mut busy_retries = 0;
        loop {
            let connection = match self.ensure_running().await {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::warn!("dropping request {method}: {e}");
                    return None;
                }
            };

            match connection.request(method, params.clone()).await {
                Ok(value) => return Some(value),
                Err(e) if e.response_code() == Some(options.busy_error_code) => {
                    if busy_retries >= options.max_busy_retries {
                        tracing::warn!(
                            "worker still busy after {busy_retries} retries, giving up on {method}"
                        );
                        return None;
                    }
                    busy_retries += 1;
                    tracing::debug!(
                        "worker busy, retrying {method} ({busy_retries}/{})",
                        options.max_busy_retries
                    );
                }
                Err(e) => {
                    tracing::warn!("request {method} failed: {e}");
                    return None;
                }
            }
        }
    }

    pub async fn send_notification<N: NotificationType>(
        &self,
        params: &N::Params,
    ) -> Result<(), SupervisorError> {
        let params = protocol::to_params(params)?;
        self.send_notification_raw(N::METHOD, params).await
    }

    pub async fn send_notification_raw(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), SupervisorError> {
        let connection = self.ensure_running().await?;
        if let Err(e) = connection.notify(method, params).await {
            tracing::warn!("notification {method} not delivered: {e}");
        }
        Ok(())
    }

    /// Call `callback` with the params of every `N` notification.
    pub fn listen<N, F>(&self, callback: F) -> Subscription
    where
        N: NotificationType,
        F: Fn(N::Params) + Send + Sync + 'static,
    {
        self.listen_raw(N::METHOD, move |value| {
            match serde_json::from_value::<N::Params>(value.clone()) {
                Ok(params) => callback(params),
                Err(e) => tracing::warn!("skipping malformed {} notification: {e}", N::METHOD),
            }
        })
    }

    /// Untyped [`listen`](Self::listen). Notifications without params arrive
    /// as `Value::Null`.
    pub fn listen_raw<F>(&self, method: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let (subscription, first) = self.shared.listeners.insert(method, Arc::new(callback));
        if first {
            tracing::trace!("now listening for {method}");
        }
        subscription
    }

    /// Number of live `listen` subscriptions for `method`.
    #[must_use]
    pub fn listener_count(&self, method: &str) -> usize {
        self.shared.listeners.count(method)
    }

    /// Call `callback` whenever the worker finishes a workspace refresh.
    pub fn on_workspace_refreshed<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listen_raw(WorkspaceRefresh::METHOD, move |_| callback())
    }

    /// Surface refreshes the worker starts on its own: report when one
    /// begins and finish when it completes.
    pub fn track_background_refreshes(&self, reporter: Arc<dyn ProgressReporter>) -> Subscription {
        let active = Arc::new(AtomicBool::new(false));

        let started = {
            let active = Arc::clone(&active);
            let reporter = Arc::clone(&reporter);
            self.listen_raw(WorkspaceRefreshStarted::METHOD, move |_| {
                if !active.swap(true, Ordering::SeqCst) {
                    reporter.report(Some("Refreshing workspace"), None);
                }
            })
        };
        let finished = self.listen_raw(WorkspaceRefresh::METHOD, move |_| {
            if active.swap(false, Ordering::SeqCst) {
                reporter.finish();
            }
        });

        Subscription::combine(vec![started, finished])
    }

    /// Restart the worker and wait for it to rebuild its view of the workspace.
    ///
    /// Cancelling `cancel` silences `progress` and stops waiting for the
    /// completion notification; the restart itself always runs to the end.
    pub async fn refresh_workspace(
        &self,
        progress: &dyn ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<(), SupervisorError> {
        let progress = Cancellable::new(progress, cancel.clone());
        let result = self.run_refresh(&progress, &cancel).await;
        progress.finish();
        result.map_err(|e| {
            tracing::error!("workspace refresh failed: {e}");
            SupervisorError::RefreshFailed(Box::new(e))
        })
    }

    async fn run_refresh(
        &self,
        progress: &Cancellable<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        if let Some(connection) = self.running_connection() {
            progress.report(Some("Stopping daemon"), Some(10));
            if let Err(e) = connection.request(StopDaemon::METHOD, None).await {
                tracing::debug!("daemon stop before refresh failed: {e}");
            }
        } else {
            progress.report(None, Some(10));
        }

        progress.report(Some("Restarting worker"), Some(30));
        self.stop_and_wait().await;

        let (done_tx, done_rx) = oneshot::channel();
        let done_tx = Mutex::new(Some(done_tx));
        let mut completion = self.listen_raw(WorkspaceRefresh::METHOD, move |_| {
            if let Some(tx) = lock(&done_tx).take() {
                let _ = tx.send(());
            }
        });

        self.start(None);
        progress.report(Some("Refreshing workspace"), Some(30));
        if let Err(e) = self
            .send_notification::<WorkspaceRefresh>(&Value::Null)
            .await
        {
            completion.dispose();
            return Err(e);
        }

        tokio::select! {
            _ = done_rx => tracing::info!("workspace refresh complete"),
            () = cancel.cancelled() => tracing::debug!("stopped waiting for workspace refresh"),
        }
        completion.dispose();
        Ok(())
    }

    fn running_connection(&self) -> Option<Arc<dyn WorkerConnection>> {
        let machine = lock(&self.shared.machine);
        match machine.state {
            WorkerState::Running => machine.connection.clone(),
            _ => None,
        }
    }

    /// Stop, then wait for the machine to pass through `Idle`. The idle epoch
    /// is read under the same lock as the stop, so a restart racing in
    /// behind the teardown cannot hide the transition.
    async fn stop_and_wait(&self) {
        let mut idle = self.shared.idle_tx.subscribe();
        let (effects, seen) = {
            let mut machine = lock(&self.shared.machine);
            if machine.state == WorkerState::Idle {
                return;
            }
            let seen = machine.idle_epoch;
            let effects = self.transition(
                &mut machine,
                Event::Stop {
                    process_alive: true,
                },
            );
            (effects, seen)
        };
        for effect in effects {
            self.run(effect);
        }
        let _ = idle.wait_for(|epoch| *epoch > seen).await;
    }

    /// Wait until the worker is running, starting it if idle.
    ///
    /// A caller that depended on a start (it saw `Idle` or `Starting`) and
    /// then sees `Idle` again gets `WorkerUnavailable` instead of looping.
    async fn ensure_running(&self) -> Result<Arc<dyn WorkerConnection>, SupervisorError> {
        let mut rx = self.shared.state_tx.subscribe();
        let mut awaited_start = false;
        loop {
            let state = *rx.borrow_and_update();
            match state {
                WorkerState::Running => {
                    let machine = lock(&self.shared.machine);
                    if machine.state == WorkerState::Running {
                        return machine
                            .connection
                            .clone()
                            .ok_or(SupervisorError::NotInitialized);
                    }
                }
                WorkerState::Idle if awaited_start => {
                    return Err(SupervisorError::WorkerUnavailable);
                }
                WorkerState::Idle => {
                    awaited_start = true;
                    self.handle(Event::Start {
                        workspace_path: None,
                    });
                }
                WorkerState::Starting => awaited_start = true,
                WorkerState::Stopping => {}
            }
            if rx.changed().await.is_err() {
                return Err(SupervisorError::WorkerUnavailable);
            }
        }
    }

    fn handle(&self, event: Event) {
        let effects = {
            let mut machine = lock(&self.shared.machine);
            self.transition(&mut machine, event)
        };
        for effect in effects {
            self.run(effect);
        }
    }

    fn enter(&self, machine: &mut Machine, to: WorkerState) {
        tracing::info!("worker {} -> {to}", machine.state);
        machine.state = to;
        if to == WorkerState::Idle {
            machine.idle_epoch += 1;
            self.shared.idle_tx.send_replace(machine.idle_epoch);
        }
        self.shared.state_tx.send_replace(to);
    }

    fn transition(&self, machine: &mut Machine, event: Event) -> Vec<Effect> {
        match (machine.state, event) {
            (WorkerState::Idle, Event::Start { workspace_path }) => {
                if workspace_path.is_some() {
                    machine.workspace_path = workspace_path;
                }
                machine.generation += 1;
                self.enter(machine, WorkerState::Starting);
                match machine.workspace_path.clone() {
                    Some(workspace_path) => {
                        machine.workspace_change_pending = false;
                        vec![Effect::Launch {
                            generation: machine.generation,
                            workspace_path,
                        }]
                    }
                    None => {
                        tracing::error!("cannot start worker: no workspace path set");
                        self.enter(machine, WorkerState::Idle);
                        Vec::new()
                    }
                }
            }

            (
                WorkerState::Starting,
                Event::Launched {
                    generation,
                    result: Ok(launched),
                },
            ) if generation == machine.generation => {
                let Launched {
                    connection,
                    notifications,
                } = launched;
                machine.pid = connection.pid();
                machine.connection = Some(Arc::clone(&connection));
                machine.tasks = vec![
                    self.spawn_exit_listener(generation, Arc::clone(&connection)),
                    spawn_dispatcher(self.shared.listeners.clone(), notifications),
                ];
                self.enter(machine, WorkerState::Running);

                if std::mem::take(&mut machine.workspace_change_pending)
                    && let Some(workspace_path) = machine.workspace_path.clone()
                {
                    return vec![Effect::ChangeWorkspace {
                        connection,
                        workspace_path,
                    }];
                }
                Vec::new()
            }

            (
                WorkerState::Starting,
                Event::Launched {
                    generation,
                    result: Err(e),
                },
            ) if generation == machine.generation => {
                tracing::warn!("worker failed to start: {e}");
                machine.pid = None;
                self.enter(machine, WorkerState::Idle);
                Vec::new()
            }

            (WorkerState::Stopping, Event::Launched { generation, result })
                if generation == machine.generation =>
            {
                match result {
                    Ok(launched) => {
                        tracing::info!("worker came up after stop was requested, tearing it down");
                        vec![Effect::Teardown {
                            generation,
                            connection: launched.connection,
                            process_alive: true,
                        }]
                    }
                    Err(e) => {
                        tracing::debug!("launch abandoned by stop failed anyway: {e}");
                        self.enter(machine, WorkerState::Idle);
                        Vec::new()
                    }
                }
            }

            (WorkerState::Starting, Event::Stop { .. }) => {
                self.enter(machine, WorkerState::Stopping);
                Vec::new()
            }

            (WorkerState::Running, Event::Stop { process_alive }) => {
                self.begin_teardown(machine, process_alive)
            }

            (WorkerState::Running, Event::Exited { generation })
                if generation == machine.generation =>
            {
                self.begin_teardown(machine, false)
            }

            (WorkerState::Stopping, Event::TornDown { generation })
                if generation == machine.generation =>
            {
                machine.pid = None;
                self.enter(machine, WorkerState::Idle);
                Vec::new()
            }

            (state, Event::SetWorkspacePath(workspace_path)) => {
                tracing::info!("workspace path set to {}", workspace_path.display());
                machine.workspace_path = Some(workspace_path.clone());
                match state {
                    WorkerState::Running => match machine.connection.clone() {
                        Some(connection) => vec![Effect::ChangeWorkspace {
                            connection,
                            workspace_path,
                        }],
                        None => Vec::new(),
                    },
                    WorkerState::Starting => {
                        machine.workspace_change_pending = true;
                        Vec::new()
                    }
                    WorkerState::Idle | WorkerState::Stopping => Vec::new(),
                }
            }

            (state, Event::Start { .. }) => {
                tracing::debug!("ignoring start while {state}");
                Vec::new()
            }
            (state, Event::Stop { .. }) => {
                tracing::debug!("ignoring stop while {state}");
                Vec::new()
            }
            (state, Event::Launched { generation, .. }) => {
                tracing::debug!("ignoring launch result {generation} while {state}");
                Vec::new()
            }
            (_, Event::Exited { .. } | Event::TornDown { .. }) => Vec::new(),
        }
    }

    fn begin_teardown(&self, machine: &mut Machine, process_alive: bool) -> Vec<Effect> {
        machine.abort_tasks();
        let connection = machine.connection.take();
        self.enter(machine, WorkerState::Stopping);
        match connection {
            Some(connection) => vec![Effect::Teardown {
                generation: machine.generation,
                connection,
                process_alive,
            }],
            None => {
                machine.pid = None;
                self.enter(machine, WorkerState::Idle);
                Vec::new()
            }
        }
    }

    fn run(&self, effect: Effect) {
        let weak = Arc::downgrade(&self.shared);
        match effect {
            Effect::Launch {
                generation,
                workspace_path,
            } => {
                let launcher = Arc::clone(&self.shared.launcher);
                tokio::spawn(async move {
                    tracing::info!("launching worker for {}", workspace_path.display());
                    let result = launcher.launch(&workspace_path).await;
                    send_event(&weak, Event::Launched { generation, result });
                });
            }
            Effect::Teardown {
                generation,
                connection,
                process_alive,
            } => {
                let shutdown_timeout = self.shared.options.shutdown_timeout;
                tokio::spawn(async move {
                    teardown(connection, process_alive, shutdown_timeout).await;
                    send_event(&weak, Event::TornDown { generation });
                });
            }
            Effect::ChangeWorkspace {
                connection,
                workspace_path,
            } => {
                tokio::spawn(async move {
                    notify_workspace_change(connection.as_ref(), &workspace_path).await;
                });
            }
        }
    }

    fn spawn_exit_listener(
        &self,
        generation: u64,
        connection: Arc<dyn WorkerConnection>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let reason = connection.exited().await;
            tracing::warn!(pid = ?connection.pid(), "worker {reason}");
            drop(connection);
            send_event(&weak, Event::Exited { generation });
        })
    }
}

fn send_event(shared: &Weak<Shared>, event: Event) {
    if let Some(shared) = shared.upgrade() {
        WorkerSupervisor { shared }.handle(event);
    }
}

fn spawn_dispatcher(
    listeners: MethodRegistry<RawListener>,
    mut notifications: tokio::sync::mpsc::Receiver<InboundNotification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(InboundNotification { method, params }) = notifications.recv().await {
            let params = params.unwrap_or(Value::Null);
            for callback in listeners.snapshot(&method) {
                callback(&params);
            }
        }
    })
}

async fn notify_workspace_change(connection: &dyn WorkerConnection, workspace_path: &Path) {
    let params = Value::from(workspace_path.to_string_lossy().into_owned());
    if let Err(e) = connection
        .notify(ChangeWorkspace::METHOD, Some(params))
        .await
    {
        tracing::warn!("could not tell worker about workspace change: {e}");
    }
}

async fn teardown(
    connection: Arc<dyn WorkerConnection>,
    process_alive: bool,
    shutdown_timeout: Duration,
) {
    if !process_alive {
        return;
    }
    match tokio::time::timeout(shutdown_timeout, connection.shutdown()).await {
        Ok(Ok(())) => tracing::debug!("worker shut down cleanly"),
        Ok(Err(e)) => {
            tracing::warn!("worker shutdown failed, killing it: {e}");
            connection.kill();
        }
        Err(_) => {
            tracing::warn!("worker didn't exit within {shutdown_timeout:?}, killing it");
            connection.kill();
        }
    }
}
