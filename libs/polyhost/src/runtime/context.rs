use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::lifecycle::{LanguageContext, LanguageSlot, LifecycleState, PatchPlan};
use super::sharing::SharingLayer;
use super::threads::ThreadInfo;
use crate::config::ContextConfig;
use crate::contracts::{ExitMode, LifecycleEvent, NotificationSink};
use crate::error::LifecycleError;
use crate::language::LanguageInfo;
use crate::registry::LanguageRegistry;

pub type ContextLock<'a> = MutexGuard<'a, ContextState>;

/// Bookkeeping guarded by the context lock.
pub struct ContextState {
    pub(crate) threads: HashMap<ThreadId, ThreadInfo>,
    pub(crate) lifecycle: Vec<LifecycleState>,
    /// Cleared for good once a second thread enters.
    pub(crate) single_threaded: bool,
    pub(crate) closing: bool,
    pub(crate) closed: bool,
}

impl ContextState {
    pub(crate) fn is_active(&self, thread: ThreadId) -> bool {
        self.threads.get(&thread).is_some_and(ThreadInfo::is_active)
    }

    pub(crate) fn has_other_active_thread(&self, thread: ThreadId) -> bool {
        self.threads
            .iter()
            .any(|(id, info)| *id != thread && info.is_active())
    }

    pub(crate) fn active_threads(&self) -> Vec<ThreadId> {
        self.threads
            .iter()
            .filter(|(_, info)| info.is_active())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_single_threaded(&self) -> bool {
        self.single_threaded
    }

    pub fn is_closing(&self) -> bool {
        self.closing || self.closed
    }
}

pub(crate) struct ContextShared {
    pub(crate) id: Uuid,
    pub(crate) registry: Arc<LanguageRegistry>,
    pub(crate) config: ArcSwap<ContextConfig>,
    pub(crate) layer: SharingLayer,
    pub(crate) sink: Arc<dyn NotificationSink>,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: Mutex<ContextState>,
    pub(crate) cond: Condvar,
    pub(crate) languages: Vec<LanguageSlot>,
}

impl ContextShared {
    pub(crate) fn lock(&self) -> ContextLock<'_> {
        self.state.lock()
    }

    /// Fire-and-forget lifecycle notification.
    pub(crate) fn notify(&self, event: LifecycleEvent, language: &LanguageInfo) {
        if let Err(e) = self.sink.notify(event, self.id, language) {
            tracing::warn!(
                context = %self.id,
                language = %language.id,
                event = ?event,
                error = %e,
                "Notification sink failed"
            );
        }
    }

    /// Block on the context condition until `done` holds.
    ///
    /// Active threads keep running their thread-local mailbox while waiting.
    /// With `allow_interrupt`, an active thread also observes cancellation of
    /// the context and of its own token. Inactive threads never do, so a pending
    /// interrupt stays set for later.
    pub(crate) fn wait_until<F>(
        self: &Arc<Self>,
        guard: &mut ContextLock<'_>,
        allow_interrupt: bool,
        mut done: F,
    ) -> Result<(), LifecycleError>
    where
        F: FnMut(&ContextState) -> bool,
    {
        let current = thread::current().id();
        loop {
            if done(&**guard) {
                return Ok(());
            }
            if guard.is_active(current) {
                if self.run_pending(guard, current) {
                    continue;
                }
                if allow_interrupt {
                    self.check_interrupted(guard, current)?;
                }
            }
            let poll = self.config.load().poll_interval;
            self.cond.wait_for(guard, poll);
        }
    }

    /// Run the mailbox of `thread` without the lock. Returns whether anything ran.
    pub(crate) fn run_pending(self: &Arc<Self>, guard: &mut ContextLock<'_>, thread: ThreadId) -> bool {
        let actions = match guard.threads.get_mut(&thread) {
            Some(info) if !info.pending.is_empty() => std::mem::take(&mut info.pending),
            _ => return false,
        };
        for action in actions {
            let (rendezvous, outcome) = MutexGuard::unlocked(guard, || action.run(self, thread));
            rendezvous.acknowledge(outcome);
        }
        self.cond.notify_all();
        true
    }

    pub(crate) fn check_interrupted(
        &self,
        state: &mut ContextState,
        thread: ThreadId,
    ) -> Result<(), LifecycleError> {
        if self.cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled);
        }
        if let Some(info) = state.threads.get_mut(&thread) {
            if info.token.is_cancelled() {
                // consumed: the next wait starts with a fresh token
                info.token = self.cancel.child_token();
                return Err(LifecycleError::Interrupted {
                    thread: describe_thread(thread),
                });
            }
        }
        Ok(())
    }
}

pub(crate) fn describe_thread(thread: ThreadId) -> String {
    let current = thread::current();
    match current.name() {
        Some(name) if current.id() == thread => name.to_string(),
        _ => format!("{thread:?}"),
    }
}

/// One shared execution session: a language context per registered language
/// plus the thread registry.
#[derive(Clone)]
pub struct Context {
    shared: Arc<ContextShared>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.shared.id)
            .field("languages", &self.shared.languages.len())
            .finish()
    }
}

impl Context {
    pub(crate) fn new(
        registry: Arc<LanguageRegistry>,
        config: ContextConfig,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let languages: Vec<LanguageSlot> = registry
            .languages()
            .iter()
            .map(|entry| LanguageSlot::new(entry.info.clone(), entry.provider.clone()))
            .collect();
        let lifecycle = languages.iter().map(|_| LifecycleState::default()).collect();
        let cancel = CancellationToken::new();
        let shared = Arc::new(ContextShared {
            id: Uuid::new_v4(),
            registry,
            config: ArcSwap::from_pointee(config),
            layer: SharingLayer::new(),
            sink,
            cancel,
            state: Mutex::new(ContextState {
                threads: HashMap::new(),
                lifecycle,
                single_threaded: true,
                closing: false,
                closed: false,
            }),
            cond: Condvar::new(),
            languages,
        });
        tracing::debug!(context = %shared.id, languages = shared.languages.len(), "Context created");
        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<ContextShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn config(&self) -> Arc<ContextConfig> {
        self.shared.config.load_full()
    }

    pub fn registry(&self) -> &Arc<LanguageRegistry> {
        &self.shared.registry
    }

    pub fn language(&self, id: &str) -> Result<LanguageContext<'_>, LifecycleError> {
        self.shared
            .registry
            .index_of(id)
            .map(|index| LanguageContext::new(&self.shared, index))
            .ok_or_else(|| LifecycleError::UnknownLanguage(id.to_string()))
    }

    /// Language contexts in registry order (host first).
    pub fn languages(&self) -> impl DoubleEndedIterator<Item = LanguageContext<'_>> + '_ {
        (0..self.shared.languages.len()).map(move |index| LanguageContext::new(&self.shared, index))
    }

    /// Acquire the context lock, e.g. to [`LanguageContext::close`] a language.
    pub fn lock(&self) -> ContextLock<'_> {
        self.shared.lock()
    }

    /// Threads that have entered this context at least once.
    pub fn seen_threads(&self) -> Vec<ThreadId> {
        self.shared.lock().threads.keys().copied().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Make the current thread an active thread of this context.
    ///
    /// A first entry checks thread access against every created language and
    /// activates the thread for every initialized one. The second distinct
    /// thread also triggers multi-threading initialization.
    pub fn enter(&self) -> Result<EnterGuard, LifecycleError> {
        let shared = &self.shared;
        let current = thread::current().id();
        let mut state = shared.lock();
        if state.is_closing() {
            return Err(LifecycleError::Closed);
        }
        if shared.cancel.is_cancelled() {
            return Err(LifecycleError::Cancelled);
        }

        if let Some(info) = state.threads.get_mut(&current) {
            if info.is_active() {
                info.entered += 1;
                return Ok(self.enter_guard(current));
            }
        }

        let single = state.single_threaded && state.threads.keys().all(|t| *t == current);
        let denied: Vec<String> = shared
            .languages
            .iter()
            .zip(state.lifecycle.iter())
            .filter(|(_, lc)| lc.created)
            .filter_map(|(slot, _)| {
                let env = slot.env.load_full()?;
                (!slot.provider.is_thread_access_allowed(&env, current, single))
                    .then(|| slot.info.id.clone())
            })
            .collect();
        if !denied.is_empty() {
            return Err(LifecycleError::ThreadAccessDenied {
                languages: denied,
                thread: describe_thread(current),
                single_threaded: single,
            });
        }

        let became_multi = state.single_threaded && !single;
        state.single_threaded = single;
        let token = shared.cancel.child_token();
        let languages = shared.languages.len();
        state
            .threads
            .entry(current)
            .or_insert_with(|| ThreadInfo::new(token, languages))
            .entered += 1;
        tracing::trace!(context = %shared.id, thread = ?current, multi_threaded = !single, "Thread entered");

        if let Err(e) = self.activate_entered_thread(&mut state, current, became_multi) {
            if let Some(info) = state.threads.get_mut(&current) {
                info.entered = info.entered.saturating_sub(1);
            }
            shared.cond.notify_all();
            return Err(e);
        }
        drop(state);
        Ok(self.enter_guard(current))
    }

    fn enter_guard(&self, thread: ThreadId) -> EnterGuard {
        EnterGuard {
            shared: self.shared.clone(),
            thread,
            _not_send: PhantomData,
        }
    }

    fn activate_entered_thread(
        &self,
        state: &mut ContextLock<'_>,
        thread: ThreadId,
        became_multi: bool,
    ) -> Result<(), LifecycleError> {
        for lc in self.languages() {
            if !state.lifecycle[lc.index()].initialized {
                continue;
            }
            if became_multi {
                lc.ensure_multi_threading_initialized(state, false)?;
            }
            lc.initialize_thread_if_needed(state, None, thread, false)?;
        }
        Ok(())
    }

    /// Run pending thread-local actions and observe interruption.
    pub fn safepoint(&self) -> Result<(), LifecycleError> {
        let current = thread::current().id();
        let mut state = self.shared.lock();
        while self.shared.run_pending(&mut state, current) {}
        if state.is_active(current) {
            self.shared.check_interrupted(&mut state, current)?;
        }
        Ok(())
    }

    /// Request cooperative interruption of `thread`. Returns false for unknown threads.
    pub fn interrupt(&self, thread: ThreadId) -> bool {
        let state = self.shared.lock();
        let Some(info) = state.threads.get(&thread) else {
            return false;
        };
        info.token.cancel();
        self.shared.cond.notify_all();
        true
    }

    /// Cancel every interruptible wait of this context, now and later.
    pub fn cancel(&self) {
        let _state = self.shared.lock();
        self.shared.cancel.cancel();
        self.shared.cond.notify_all();
        tracing::debug!(context = %self.shared.id, "Context cancelled");
    }

    /// Apply a new configuration to every created language.
    ///
    /// All or nothing: every language prepares its patch first. If one rejects
    /// it, neither the languages nor the context see the new configuration.
    pub fn patch(&self, config: ContextConfig) -> Result<bool, LifecycleError> {
        if self.shared.lock().is_closing() {
            return Err(LifecycleError::Closed);
        }
        let mut plans = Vec::with_capacity(self.shared.languages.len());
        for lc in self.languages() {
            match lc.prepare_patch(&config)? {
                PatchPlan::Rejected => {
                    tracing::info!(context = %self.shared.id, language = %lc.id(), "Patch rejected");
                    return Ok(false);
                }
                plan => plans.push((lc, plan)),
            }
        }
        for (lc, plan) in plans {
            lc.apply_patch(plan);
        }
        self.shared.config.store(Arc::new(config));
        Ok(true)
    }

    /// Natural exit of every initialized language. All languages are notified;
    /// the first failure is returned.
    pub fn exit(&self, code: i32) -> Result<(), LifecycleError> {
        let mut first = None;
        for lc in self.languages() {
            if let Err(e) = lc.exit_context(ExitMode::Natural, code) {
                tracing::warn!(context = %self.shared.id, language = %lc.id(), error = %e, "Exit failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Finalize, dispose and retire the context. Idempotent once it succeeded.
    pub fn close(&self) -> Result<(), LifecycleError> {
        let current = thread::current().id();
        {
            let state = self.shared.lock();
            if state.closed {
                return Ok(());
            }
            if state.closing {
                return Err(LifecycleError::Closed);
            }
            if state.has_other_active_thread(current) {
                return Err(LifecycleError::ConcurrentActivity);
            }
        }

        // finalizers may initialize further languages
        loop {
            let mut finalized = false;
            for lc in self.languages() {
                finalized |= lc.finalize_context(true)?;
            }
            if !finalized {
                break;
            }
        }

        {
            let mut state = self.shared.lock();
            state.closing = true;
            for info in state.threads.values_mut() {
                info.finalization_complete = true;
            }
        }

        let mut first = None;
        for lc in self.languages().rev() {
            if let Err(e) = lc.dispose() {
                tracing::error!(context = %self.shared.id, language = %lc.id(), error = %e, "Dispose failed");
                first.get_or_insert(e);
            }
        }

        let mut state = self.shared.lock();
        for lc in self.languages() {
            lc.close(&mut state);
        }
        state.closed = true;
        self.shared.cancel.cancel();
        self.shared.cond.notify_all();
        drop(state);
        tracing::debug!(context = %self.shared.id, "Context closed");
        first.map_or(Ok(()), Err)
    }
}

/// Keeps the current thread entered. Leaving runs the thread's pending actions.
pub struct EnterGuard {
    shared: Arc<ContextShared>,
    thread: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        while self.shared.run_pending(&mut state, self.thread) {}
        if let Some(info) = state.threads.get_mut(&self.thread) {
            info.entered = info.entered.saturating_sub(1);
        }
        self.shared.cond.notify_all();
        tracing::trace!(context = %self.shared.id, thread = ?self.thread, "Thread left");
    }
}
