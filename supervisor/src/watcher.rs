//! Passive subscription to the background daemon.
//!
//! The watcher never drives the daemon; it only registers a listener and
//! fans the daemon's signals out to its own subscribers. Each registration
//! carries a generation number so that results and callbacks from a
//! superseded registration cannot touch the current one.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::listeners::{ListenerRegistry, Subscription};
use crate::lock;
use crate::operational::OperationalCallback;
use crate::types::WatcherState;

/// What the daemon reports alongside (or instead of) a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonSignal {
    /// Fresh data; the payload, if any, accompanies it.
    Ok,
    Error(String),
    Closed,
    /// The daemon lost its own connection and is retrying. Advisory only.
    Reconnecting,
    Reconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon unavailable: {0}")]
    Unavailable(String),
    #[error("daemon is disabled")]
    Disabled,
    #[error("failed to register with daemon: {0}")]
    Registration(String),
}

/// Tears down one daemon subscription.
pub type Unregister = Box<dyn FnOnce() + Send>;

pub type DaemonCallback<P> = Arc<dyn Fn(DaemonSignal, Option<P>) + Send + Sync>;

pub type DaemonFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, DaemonError>> + Send + 'a>>;

/// The daemon's listener registration surface.
pub trait DaemonClient: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;

    fn register_listener(&self, callback: DaemonCallback<Self::Payload>) -> DaemonFut<'_, Unregister>;
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Delay before each reconnect attempt after the subscription fails.
    /// Once exhausted the watcher stays idle until started again.
    pub reconnect_delays: Vec<Duration>,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            reconnect_delays: [2, 5, 10, 20].map(Duration::from_secs).to_vec(),
        }
    }
}

type WatchListener<P> = dyn Fn(&DaemonSignal, Option<&P>) + Send + Sync;

#[derive(Default)]
struct WatcherMachine {
    state: WatcherState,
    generation: u64,
    unregister: Option<Unregister>,
    reconnect_attempts: usize,
    reconnect: Option<JoinHandle<()>>,
    disposed: bool,
}

impl WatcherMachine {
    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect.take() {
            timer.abort();
        }
    }
}

impl Drop for WatcherMachine {
    fn drop(&mut self) {
        self.cancel_reconnect();
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

struct WatcherShared<D: DaemonClient> {
    daemon: Arc<D>,
    options: WatcherOptions,
    operational: Option<OperationalCallback>,
    machine: Mutex<WatcherMachine>,
    state_tx: watch::Sender<WatcherState>,
    listeners: ListenerRegistry<WatchListener<D::Payload>>,
}

/// Keeps one listener registered with the daemon while started.
///
/// `start`, `stop` and `dispose` never fail; problems show up in
/// [`state`](Self::state) and through the operational callback.
pub struct PassiveWatcherSupervisor<D: DaemonClient> {
    shared: Arc<WatcherShared<D>>,
}

impl<D: DaemonClient> Clone for PassiveWatcherSupervisor<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: DaemonClient> std::fmt::Debug for PassiveWatcherSupervisor<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let machine = lock(&self.shared.machine);
        f.debug_struct("PassiveWatcherSupervisor")
            .field("state", &machine.state)
            .field("generation", &machine.generation)
            .field("disposed", &machine.disposed)
            .finish_non_exhaustive()
    }
}

impl<D: DaemonClient> PassiveWatcherSupervisor<D> {
    pub fn new(
        daemon: Arc<D>,
        options: WatcherOptions,
        operational: Option<OperationalCallback>,
    ) -> Self {
        let (state_tx, _) = watch::channel(WatcherState::Idle);
        Self {
            shared: Arc::new(WatcherShared {
                daemon,
                options,
                operational,
                machine: Mutex::new(WatcherMachine::default()),
                state_tx,
                listeners: ListenerRegistry::new(),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> WatcherState {
        lock(&self.shared.machine).state
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.shared.state_tx.subscribe()
    }

    #[must_use]
    pub fn is_operational(&self) -> bool {
        self.state() == WatcherState::Listening
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Receive every signal the daemon forwards, with its payload.
    pub fn listen<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DaemonSignal, Option<&D::Payload>) + Send + Sync + 'static,
    {
        self.shared.listeners.insert(Arc::new(callback))
    }

    /// Register with the daemon. Ignored unless idle, and after `dispose`.
    pub fn start(&self) {
        self.begin_registration(false);
    }

    /// Drop the daemon subscription and any scheduled reconnect.
    pub fn stop(&self) {
        let (unregister, was_listening) = {
            let mut machine = lock(&self.shared.machine);
            machine.cancel_reconnect();
            machine.reconnect_attempts = 0;
            let was_listening = machine.state == WatcherState::Listening;
            if machine.state != WatcherState::Idle {
                self.enter(&mut machine, WatcherState::Idle);
            }
            (machine.unregister.take(), was_listening)
        };
        if let Some(unregister) = unregister {
            unregister();
        }
        if was_listening {
            self.report_operational(false);
        }
    }

    /// Stop for good and forget every listener. Safe to call repeatedly.
    pub fn dispose(&self) {
        {
            let mut machine = lock(&self.shared.machine);
            if machine.disposed {
                return;
            }
            machine.disposed = true;
        }
        self.stop();
        self.shared.listeners.clear();
        tracing::debug!("daemon watcher disposed");
    }

    fn enter(&self, machine: &mut WatcherMachine, to: WatcherState) {
        tracing::info!("daemon watcher {} -> {to}", machine.state);
        machine.state = to;
        self.shared.state_tx.send_replace(to);
    }

    fn report_operational(&self, operational: bool) {
        if let Some(callback) = &self.shared.operational {
            callback(operational);
        }
    }

    fn begin_registration(&self, from_timer: bool) {
        let generation = {
            let mut machine = lock(&self.shared.machine);
            if machine.disposed {
                tracing::debug!("ignoring start on disposed daemon watcher");
                return;
            }
            if machine.state != WatcherState::Idle {
                return;
            }
            if from_timer {
                machine.reconnect = None;
            } else {
                machine.cancel_reconnect();
            }
            machine.generation += 1;
            self.enter(&mut machine, WatcherState::Starting);
            machine.generation
        };

        let weak = Arc::downgrade(&self.shared);
        let daemon = Arc::clone(&self.shared.daemon);
        let callback = signal_callback(weak.clone(), generation);
        tokio::spawn(async move {
            let result = daemon.register_listener(callback).await;
            match weak.upgrade() {
                Some(shared) => PassiveWatcherSupervisor { shared }.on_registered(generation, result),
                None => {
                    if let Ok(unregister) = result {
                        unregister();
                    }
                }
            }
        });
    }

    fn on_registered(&self, generation: u64, result: Result<Unregister, DaemonError>) {
        let mut machine = lock(&self.shared.machine);
        let current = generation == machine.generation
            && machine.state == WatcherState::Starting
            && !machine.disposed;

        match result {
            Ok(unregister) if current => {
                machine.unregister = Some(unregister);
                self.enter(&mut machine, WatcherState::Listening);
                drop(machine);
                self.report_operational(true);
            }
            Ok(unregister) => {
                drop(machine);
                tracing::debug!("discarding daemon subscription {generation}, no longer wanted");
                unregister();
            }
            Err(e) if current => {
                tracing::warn!("could not subscribe to daemon: {e}");
                self.enter(&mut machine, WatcherState::Idle);
                self.schedule_reconnect(&mut machine);
                drop(machine);
                self.report_operational(false);
            }
            Err(e) => tracing::debug!("stale daemon registration {generation} failed: {e}"),
        }
    }

    fn on_signal(&self, generation: u64, signal: DaemonSignal, payload: Option<D::Payload>) {
        {
            let machine = lock(&self.shared.machine);
            let live = matches!(
                machine.state,
                WatcherState::Starting | WatcherState::Listening
            );
            if generation != machine.generation || !live {
                tracing::trace!("ignoring daemon signal from subscription {generation}");
                return;
            }
        }

        for listener in self.shared.listeners.snapshot() {
            listener(&signal, payload.as_ref());
        }

        match signal {
            DaemonSignal::Ok => {
                lock(&self.shared.machine).reconnect_attempts = 0;
            }
            DaemonSignal::Reconnecting | DaemonSignal::Reconnected => {
                tracing::debug!("daemon signalled {signal:?}");
            }
            DaemonSignal::Error(reason) => self.fail(generation, &reason),
            DaemonSignal::Closed => self.fail(generation, "connection closed"),
        }
    }

    fn fail(&self, generation: u64, reason: &str) {
        let (unregister, was_listening) = {
            let mut machine = lock(&self.shared.machine);
            if generation != machine.generation || machine.state == WatcherState::Idle {
                return;
            }
            tracing::warn!("daemon subscription lost: {reason}");
            let was_listening = machine.state == WatcherState::Listening;
            let unregister = machine.unregister.take();
            self.enter(&mut machine, WatcherState::Idle);
            self.schedule_reconnect(&mut machine);
            (unregister, was_listening)
        };
        if let Some(unregister) = unregister {
            unregister();
        }
        if was_listening {
            self.report_operational(false);
        }
    }

    fn schedule_reconnect(&self, machine: &mut WatcherMachine) {
        let delays = &self.shared.options.reconnect_delays;
        let Some(&delay) = delays.get(machine.reconnect_attempts) else {
            if !delays.is_empty() {
                tracing::warn!(
                    "giving up on daemon after {} reconnect attempts",
                    machine.reconnect_attempts
                );
            }
            return;
        };
        machine.reconnect_attempts += 1;
        tracing::info!(
            "reconnecting to daemon in {delay:?} (attempt {}/{})",
            machine.reconnect_attempts,
            delays.len()
        );

        let weak = Arc::downgrade(&self.shared);
        machine.cancel_reconnect();
        machine.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                PassiveWatcherSupervisor { shared }.begin_registration(true);
            }
        }));
    }
}

fn signal_callback<D: DaemonClient>(
    weak: Weak<WatcherShared<D>>,
    generation: u64,
) -> DaemonCallback<D::Payload> {
    Arc::new(move |signal: DaemonSignal, payload: Option<D::Payload>| {
        if let Some(shared) = weak.upgrade() {
            PassiveWatcherSupervisor { shared }.on_signal(generation, signal, payload);
        }
    })
}
