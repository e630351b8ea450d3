//! Progress reporting for long-running workspace operations.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Receives progress for an operation such as a workspace refresh.
///
/// `increment` is a percentage of the whole operation.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, message: Option<&str>, increment: Option<u32>);

    /// Called once when the operation ends, successfully or not.
    fn finish(&self) {}
}

/// Logs progress through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingProgress {
    title: String,
}

impl TracingProgress {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }
}

impl ProgressReporter for TracingProgress {
    fn report(&self, message: Option<&str>, increment: Option<u32>) {
        tracing::info!(
            title = %self.title,
            increment = increment.unwrap_or(0),
            "{}",
            message.unwrap_or("")
        );
    }

    fn finish(&self) {
        tracing::info!(title = %self.title, "done");
    }
}

/// Drops reports once `cancel` fires.
pub(crate) struct Cancellable<'a> {
    inner: &'a dyn ProgressReporter,
    cancel: CancellationToken,
}

impl<'a> Cancellable<'a> {
    pub(crate) fn new(inner: &'a dyn ProgressReporter, cancel: CancellationToken) -> Self {
        Self { inner, cancel }
    }

    pub(crate) fn report(&self, message: Option<&str>, increment: Option<u32>) {
        if !self.cancel.is_cancelled() {
            self.inner.report(message, increment);
        }
    }

    pub(crate) fn finish(&self) {
        self.inner.finish();
    }
}

impl<T: ProgressReporter + ?Sized> ProgressReporter for Arc<T> {
    fn report(&self, message: Option<&str>, increment: Option<u32>) {
        (**self).report(message, increment);
    }

    fn finish(&self) {
        (**self).finish();
    }
}
