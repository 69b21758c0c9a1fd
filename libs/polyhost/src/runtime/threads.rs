use parking_lot::MutexGuard;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tokio_util::sync::CancellationToken;

use super::context::{ContextLock, ContextShared};
use super::lifecycle::LanguageContext;
use super::rendezvous::{aggregate_thread_failures, PendingAction, Rendezvous, ThreadAction};
use crate::error::LifecycleError;

/// Per-thread activation of one language.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum ThreadActivation {
    #[default]
    Inactive,
    Activating,
    Activated,
}

/// One-time multi-threading initialization of a language.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum MultiThreading {
    #[default]
    Pending,
    Initializing(ThreadId),
    Done,
}

/// A thread that entered the context at least once.
pub(crate) struct ThreadInfo {
    /// Nesting depth of [`EnterGuard`](super::context::EnterGuard)s; active while non-zero.
    pub(crate) entered: usize,
    pub(crate) token: CancellationToken,
    pub(crate) finalization_complete: bool,
    /// Indexed like the context's languages.
    pub(crate) activation: Vec<ThreadActivation>,
    pub(crate) pending: Vec<PendingAction>,
}

impl ThreadInfo {
    pub(crate) fn new(token: CancellationToken, languages: usize) -> Self {
        Self {
            entered: 0,
            token,
            finalization_complete: false,
            activation: vec![ThreadActivation::Inactive; languages],
            pending: Vec::new(),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.entered > 0
    }
}

impl LanguageContext<'_> {
    /// Activate `thread` for this language once it is initialized.
    ///
    /// Stale (finalized) and unknown threads are skipped, as are threads that
    /// are already activated or activating. When `thread` is the one that
    /// triggered initialization, multi-threading support is ensured first.
    pub(crate) fn initialize_thread_if_needed(
        &self,
        state: &mut ContextLock<'_>,
        trigger: Option<ThreadId>,
        thread: ThreadId,
        must_succeed: bool,
    ) -> Result<(), LifecycleError> {
        let i = self.index();
        match state.threads.get(&thread) {
            Some(info) if !info.finalization_complete => {}
            _ => return Ok(()),
        }
        if trigger == Some(thread) {
            self.ensure_multi_threading_initialized(state, must_succeed)?;
        }
        if !state.lifecycle[i].initialized {
            return Ok(());
        }
        let Some(env) = self.env() else {
            return Ok(());
        };
        match state.threads.get_mut(&thread) {
            Some(info) if info.activation[i] == ThreadActivation::Inactive => {
                info.activation[i] = ThreadActivation::Activating;
            }
            _ => return Ok(()),
        }

        let provider = self.slot().provider.clone();
        let result = MutexGuard::unlocked(state, || provider.initialize_thread(&env, thread));

        if let Some(info) = state.threads.get_mut(&thread) {
            info.activation[i] = match result {
                Ok(()) => ThreadActivation::Activated,
                Err(_) => ThreadActivation::Inactive,
            };
        }
        match result {
            Ok(()) => {
                tracing::trace!(language = %self.id(), thread = ?thread, "Thread activated");
                Ok(())
            }
            Err(source) => self.best_effort("initialize_thread", source, must_succeed),
        }
    }

    /// Run the multi-threading hook the first time the context has more than one thread.
    pub(crate) fn ensure_multi_threading_initialized(
        &self,
        state: &mut ContextLock<'_>,
        must_succeed: bool,
    ) -> Result<(), LifecycleError> {
        let i = self.index();
        let current = thread::current().id();
        loop {
            if state.single_threaded || !state.lifecycle[i].created {
                return Ok(());
            }
            match state.lifecycle[i].multi_threading {
                MultiThreading::Done => return Ok(()),
                // re-entered from the hook itself
                MultiThreading::Initializing(t) if t == current => return Ok(()),
                MultiThreading::Initializing(_) => {
                    self.shared().wait_until(state, false, |s| {
                        !matches!(s.lifecycle[i].multi_threading, MultiThreading::Initializing(_))
                    })?;
                }
                MultiThreading::Pending => break,
            }
        }
        let Some(env) = self.env() else {
            return Ok(());
        };

        state.lifecycle[i].multi_threading = MultiThreading::Initializing(current);
        let provider = self.slot().provider.clone();
        let result = MutexGuard::unlocked(state, || provider.initialize_multi_threading(&env));
        let outcome = match result {
            Ok(()) => Ok(()),
            Err(source) => self.best_effort("initialize_multi_threading", source, must_succeed),
        };
        state.lifecycle[i].multi_threading = match outcome {
            Ok(()) => MultiThreading::Done,
            Err(_) => MultiThreading::Pending,
        };
        self.shared().cond.notify_all();
        tracing::debug!(language = %self.id(), "Multi-threading initialized");
        outcome
    }

    /// Activate every active thread of the context, the initiator included, and
    /// wait for all of them.
    pub(crate) fn initialize_active_threads(&self, initiator: ThreadId) -> Result<(), LifecycleError> {
        let index = self.index();
        let action: ThreadAction = Arc::new(move |shared: &Arc<ContextShared>, thread: ThreadId| {
            let lc = LanguageContext::new(shared, index);
            let mut state = shared.lock();
            lc.initialize_thread_if_needed(&mut state, Some(initiator), thread, true)
        });

        let mut state = self.shared().lock();
        let targets = state.active_threads();
        let rendezvous = Rendezvous::new(targets.len());
        for thread in &targets {
            if let Some(info) = state.threads.get_mut(thread) {
                info.pending.push(PendingAction {
                    action: action.clone(),
                    rendezvous: rendezvous.clone(),
                });
            }
        }
        self.shared().cond.notify_all();
        tracing::debug!(language = %self.id(), threads = targets.len(), "Broadcasting thread initialization");

        let waited = self
            .shared()
            .wait_until(&mut state, true, |_| rendezvous.is_complete());
        drop(state);
        waited?;
        aggregate_thread_failures(self.id(), rendezvous.take_failures())
    }
}
