//! Broadcast of thread-local work to the active threads of a context.
//!
//! The initiator enqueues one [`PendingAction`] per target thread under the
//! context lock. Targets run their mailbox whenever they wait on the context,
//! reach a safepoint or leave. The initiator then waits until every target has
//! acknowledged and aggregates the failures.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use super::context::ContextShared;
use crate::error::{HookError, LifecycleError};

pub(crate) type ThreadAction =
    Arc<dyn Fn(&Arc<ContextShared>, ThreadId) -> Result<(), LifecycleError> + Send + Sync>;

#[derive(Default)]
pub(crate) struct Rendezvous {
    remaining: AtomicUsize,
    failures: Mutex<Vec<LifecycleError>>,
}

impl Rendezvous {
    pub(crate) fn new(participants: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(participants),
            failures: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }

    /// Record one participant's outcome. Called with the context lock held.
    pub(crate) fn acknowledge(&self, outcome: Result<(), LifecycleError>) {
        if let Err(e) = outcome {
            self.failures.lock().push(e);
        }
        self.remaining.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn take_failures(&self) -> Vec<LifecycleError> {
        std::mem::take(&mut *self.failures.lock())
    }
}

/// Work queued on one thread's mailbox.
pub(crate) struct PendingAction {
    pub(crate) action: ThreadAction,
    pub(crate) rendezvous: Arc<Rendezvous>,
}

impl PendingAction {
    /// Runs without the context lock; the caller acknowledges once it holds the lock again.
    pub(crate) fn run(
        self,
        shared: &Arc<ContextShared>,
        thread: ThreadId,
    ) -> (Arc<Rendezvous>, Result<(), LifecycleError>) {
        let outcome = (self.action)(shared, thread);
        if let Err(e) = &outcome {
            tracing::debug!(thread = ?thread, error = %e, "Thread-local action failed");
        }
        (self.rendezvous, outcome)
    }
}

fn into_hook_error(err: LifecycleError) -> HookError {
    match err {
        LifecycleError::Hook { source, .. } => source,
        other => HookError::internal(other),
    }
}

/// Fold per-thread initialization failures into one error.
///
/// All guest failures become [`LifecycleError::ThreadInitializationFailed`];
/// anything else makes the whole result an internal error. The first failure
/// is the primary cause in both cases.
pub(crate) fn aggregate_thread_failures(
    language: &str,
    failures: Vec<LifecycleError>,
) -> Result<(), LifecycleError> {
    if failures.is_empty() {
        return Ok(());
    }
    let count = failures.len();
    let mut hooks = failures.into_iter().map(into_hook_error);
    let Some(cause) = hooks.next() else {
        return Ok(());
    };
    let suppressed: Vec<HookError> = hooks.collect();

    if cause.is_guest() && suppressed.iter().all(HookError::is_guest) {
        Err(LifecycleError::ThreadInitializationFailed {
            language: language.to_string(),
            count,
            cause,
            suppressed,
        })
    } else {
        Err(LifecycleError::Internal {
            message: format!("the initialization of language {language} failed on {count} threads"),
            cause: Some(cause),
            suppressed,
        })
    }
}
