//! Supervision of an out-of-process analysis worker and a passive listener
//! on the background daemon.

pub mod codec;
pub mod config;
pub mod process;
pub mod protocol;
pub mod transport;
pub mod types;

mod listeners;
mod operational;
mod progress;
mod stdio;
mod watcher;
mod worker;

#[cfg(test)]
mod testing;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{ConfigError, SupervisorConfig, WatcherConfig, WorkerConfig};
pub use listeners::Subscription;
pub use operational::{OperationalCallback, OperationalStateBroadcaster};
pub use progress::{ProgressReporter, TracingProgress};
pub use stdio::ProcessLauncher;
pub use transport::{
    ExitReason, InboundNotification, Launched, TransportError, WorkerConnection, WorkerLauncher,
};
pub use types::{SupervisorError, WatcherState, WorkerState};
pub use watcher::{
    DaemonCallback, DaemonClient, DaemonError, DaemonFut, DaemonSignal, PassiveWatcherSupervisor,
    Unregister, WatcherOptions,
};
pub use worker::{WorkerOptions, WorkerSupervisor};

/// Lock a std mutex, ignoring poisoning. No critical section here leaves
/// shared state half-written.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
