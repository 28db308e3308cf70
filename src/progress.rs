//! Progress reporting and cooperative cancellation
//!
//! This module provides the context object threaded through every
//! long-running core operation. It carries a shared cancellation flag and a
//! trait-based sink so the core stays decoupled from display concerns.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::Error;

/// Sink receiving progress messages - implement this for different display backends.
pub trait ProgressSink: Send + Sync {
    /// Receive one message, tagged with the hierarchical path of the
    /// operation that emitted it.
    fn message(&self, path: &str, message: &str);
}

/// A no-op sink for when progress output is disabled.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn message(&self, _path: &str, _message: &str) {}
}

/// Forwards progress messages to `tracing` at debug level.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn message(&self, path: &str, message: &str) {
        tracing::debug!(path, "{message}");
    }
}

/// Shared cancellation flag. Hand a clone to whatever controls the run;
/// every [`Progress`] derived from the same root observes it.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Operations polling this flag return promptly,
    /// leaving partially built structures in a consistent state.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Cooperative progress and cancellation context.
///
/// Cloning is cheap; [`Progress::resolve`] derives a child context whose
/// messages are prefixed with the given segment, while cancellation remains
/// shared with the root.
#[derive(Clone)]
pub struct Progress {
    cancel: CancelFlag,
    sink: Arc<dyn ProgressSink>,
    path: String,
}

impl Progress {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            cancel: CancelFlag::new(),
            sink,
            path: String::new(),
        }
    }

    pub fn with_cancel(sink: Arc<dyn ProgressSink>, cancel: CancelFlag) -> Self {
        Self {
            cancel,
            sink,
            path: String::new(),
        }
    }

    /// A silent context without cancellation wiring, for callers that do not
    /// care about either.
    pub fn null() -> Self {
        Self::new(Arc::new(NullSink))
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Poll the cancellation flag, erroring out when it was raised.
    pub fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn log(&self, message: impl AsRef<str>) {
        self.sink.message(&self.path, message.as_ref());
    }

    /// Derive a child context for a sub-operation.
    pub fn resolve(&self, segment: &str) -> Progress {
        let path = if self.path.is_empty() {
            segment.to_owned()
        } else {
            format!("{}/{segment}", self.path)
        };
        Progress {
            cancel: self.cancel.clone(),
            sink: self.sink.clone(),
            path,
        }
    }

    /// Derive a child context for one element of a counted sequence and log
    /// its position.
    pub fn resolve_indexed(&self, segment: &str, index: usize, total: usize) -> Progress {
        let child = self.resolve(segment);
        child.log(format!("{} / {total}", index + 1));
        child
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}
