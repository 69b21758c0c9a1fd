//! Per-language lifecycle within one context.
//!
//! `created → initialized → finalized → exited`, torn down by `dispose` or
//! `close`. Every flag lives in [`LifecycleState`] under the context lock;
//! provider hooks always run with the lock released.

use arc_swap::{ArcSwap, ArcSwapOption};
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use super::context::{describe_thread, Context, ContextShared, ContextState};
use super::sharing::LanguageInstance;
use super::threads::{MultiThreading, ThreadActivation};
use crate::access::AccessPermissions;
use crate::config::ContextConfig;
use crate::contracts::{Env, EnvRequest, ExitMode, LanguageProvider, LifecycleEvent};
use crate::error::{HookError, LifecycleError};
use crate::language::{LanguageInfo, ServiceId};
use crate::services::{ServiceCollector, ServiceRegistry};

/// Immutable per-language part of a context plus the published handles.
pub(crate) struct LanguageSlot {
    pub(crate) info: Arc<LanguageInfo>,
    pub(crate) provider: Arc<dyn LanguageProvider>,
    pub(crate) env: ArcSwapOption<Env>,
    pub(crate) lazy: ArcSwapOption<Lazy>,
}

impl LanguageSlot {
    pub(crate) fn new(info: Arc<LanguageInfo>, provider: Arc<dyn LanguageProvider>) -> Self {
        Self {
            info,
            provider,
            env: ArcSwapOption::empty(),
            lazy: ArcSwapOption::empty(),
        }
    }
}

/// State that exists exactly while the language is created.
pub(crate) struct Lazy {
    pub(crate) instance: Arc<LanguageInstance>,
    pub(crate) permissions: ArcSwap<AccessPermissions>,
    pub(crate) services: ServiceRegistry,
}

#[derive(Debug, Default)]
pub(crate) struct LifecycleState {
    pub(crate) created: bool,
    pub(crate) initialized: bool,
    pub(crate) initialization_failed: bool,
    pub(crate) finalized: bool,
    pub(crate) exited: Option<ExitMode>,
    /// Set while dispose hooks run; cleared by the reset that ends disposal.
    pub(crate) disposing: bool,
    pub(crate) creating_thread: Option<ThreadId>,
    pub(crate) initializing_thread: Option<ThreadId>,
    pub(crate) owned_threads: HashSet<ThreadId>,
    pub(crate) multi_threading: MultiThreading,
}

impl LifecycleState {
    /// Back to uncreated. Threads holding the creation or initialization slot keep it.
    fn reset(&mut self) {
        *self = Self {
            creating_thread: self.creating_thread,
            initializing_thread: self.initializing_thread,
            ..Self::default()
        };
    }
}

/// Observable position of a language context in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecyclePhase {
    Uncreated,
    Creating,
    Created,
    Initializing,
    Initialized,
    Finalized,
    Exited(ExitMode),
}

/// Handle to one language within a [`Context`].
#[derive(Clone, Copy)]
pub struct LanguageContext<'a> {
    shared: &'a Arc<ContextShared>,
    index: usize,
}

impl std::fmt::Debug for LanguageContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageContext")
            .field("context", &self.shared.id)
            .field("language", &self.id())
            .finish()
    }
}

impl<'a> LanguageContext<'a> {
    pub(crate) fn new(shared: &'a Arc<ContextShared>, index: usize) -> Self {
        Self { shared, index }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn shared(&self) -> &'a Arc<ContextShared> {
        self.shared
    }

    pub(crate) fn slot(&self) -> &'a LanguageSlot {
        &self.shared.languages[self.index]
    }

    pub fn id(&self) -> &'a str {
        &self.slot().info.id
    }

    pub fn info(&self) -> &'a Arc<LanguageInfo> {
        &self.slot().info
    }

    /// The published environment, if created.
    pub fn env(&self) -> Option<Arc<Env>> {
        self.slot().env.load_full()
    }

    pub fn instance(&self) -> Option<Arc<LanguageInstance>> {
        self.slot().lazy.load().as_ref().map(|l| l.instance.clone())
    }

    pub fn phase(&self) -> LifecyclePhase {
        let state = self.shared.lock();
        let lc = &state.lifecycle[self.index];
        if let Some(mode) = lc.exited {
            LifecyclePhase::Exited(mode)
        } else if lc.finalized {
            LifecyclePhase::Finalized
        } else if lc.initializing_thread.is_some() {
            LifecyclePhase::Initializing
        } else if lc.initialized {
            LifecyclePhase::Initialized
        } else if lc.created {
            LifecyclePhase::Created
        } else if lc.creating_thread.is_some() {
            LifecyclePhase::Creating
        } else {
            LifecyclePhase::Uncreated
        }
    }

    pub fn is_created(&self) -> bool {
        self.shared.lock().lifecycle[self.index].created
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.lock().lifecycle[self.index].initialized
    }

    /// Whether the last initialization attempt failed. Cleared by a successful one.
    pub fn initialization_failed(&self) -> bool {
        self.shared.lock().lifecycle[self.index].initialization_failed
    }

    pub(crate) fn hook_error(&self, operation: &'static str, source: HookError) -> LifecycleError {
        LifecycleError::Hook {
            language: self.id().to_string(),
            operation,
            source,
        }
    }

    /// Swallow a guest failure of a best-effort hook; internal failures always propagate.
    pub(crate) fn best_effort(
        &self,
        operation: &'static str,
        source: HookError,
        must_succeed: bool,
    ) -> Result<(), LifecycleError> {
        if must_succeed || source.is_internal() {
            return Err(self.hook_error(operation, source));
        }
        tracing::warn!(language = %self.id(), operation, error = %source, "Ignoring hook failure");
        Ok(())
    }

    fn require_env(&self) -> Result<Arc<Env>, LifecycleError> {
        self.env().ok_or_else(|| LifecycleError::NotCreated {
            language: self.id().to_string(),
        })
    }

    fn env_request<'c>(&self, config: &'c ContextConfig) -> EnvRequest<'c>
    where
        'a: 'c,
    {
        let info = &self.slot().info;
        EnvRequest {
            context: self.shared.id,
            language: info,
            options: config.language_options(&info.id),
            arguments: config.language_arguments(&info.id),
            io: &config.io,
        }
    }

    /// Fails unless `accessing` (`None` for the embedder) may use this language.
    pub fn check_access(&self, accessing: Option<&LanguageInfo>) -> Result<(), LifecycleError> {
        if self.shared.lock().is_closing() {
            return Err(LifecycleError::Closed);
        }
        let config = self.shared.config.load();
        if !config
            .access
            .is_access_permitted(&self.shared.registry, accessing, self.info())
        {
            return Err(LifecycleError::AccessDenied {
                language: self.id().to_string(),
            });
        }
        Ok(())
    }

    /// Create the language context unless it already is. Returns whether this call created it.
    pub fn ensure_created(&self, accessing: Option<&LanguageInfo>) -> Result<bool, LifecycleError> {
        let current = thread::current().id();
        let i = self.index;
        let mut state = self.shared.lock();
        loop {
            let lc = &state.lifecycle[i];
            if lc.disposing {
                return Err(LifecycleError::CreationNotAllowed {
                    language: self.id().to_string(),
                });
            }
            if lc.created {
                return Ok(false);
            }
            if state.closed {
                return Err(LifecycleError::Closed);
            }
            if state.closing {
                return Err(LifecycleError::CreationNotAllowed {
                    language: self.id().to_string(),
                });
            }
            let creating = lc.creating_thread;
            match creating {
                None => break,
                Some(t) if t == current => {
                    return Err(LifecycleError::CyclicAccess {
                        language: self.id().to_string(),
                    })
                }
                Some(_) => self.shared.wait_until(&mut state, true, |s| {
                    s.lifecycle[i].created || s.lifecycle[i].creating_thread.is_none()
                })?,
            }
        }
        state.lifecycle[i].creating_thread = Some(current);
        drop(state);

        let prepared = self.create(accessing);

        let mut state = self.shared.lock();
        state.lifecycle[i].creating_thread = None;
        // commit rejections still owe the sink a CreateFailed
        let committed = match prepared {
            Ok((env, lazy)) => self.commit(&mut state, env, lazy).map_err(|e| (e, true)),
            Err(e) => Err((e, false)),
        };
        self.shared.cond.notify_all();
        drop(state);

        match committed {
            Ok(()) => {
                tracing::debug!(context = %self.shared.id, language = %self.id(), "Language context created");
                self.shared.notify(LifecycleEvent::Created, self.info());
                Ok(true)
            }
            Err((e, rejected_on_commit)) => {
                if rejected_on_commit {
                    self.shared.notify(LifecycleEvent::CreateFailed, self.info());
                }
                tracing::debug!(context = %self.shared.id, language = %self.id(), error = %e, "Language context creation failed");
                Err(e)
            }
        }
    }

    fn create(&self, accessing: Option<&LanguageInfo>) -> Result<(Arc<Env>, Lazy), LifecycleError> {
        let slot = self.slot();
        let config = self.shared.config.load_full();
        if !slot.info.supports_sandbox(config.sandbox) {
            return Err(LifecycleError::SandboxViolation {
                language: slot.info.id.clone(),
                policy: config.sandbox,
            });
        }
        self.check_access(accessing)?;

        let instance = self.shared.layer.allocate(&slot.info)?;
        self.shared.notify(LifecycleEvent::Create, &slot.info);
        let prepared = self.prepare(&config, instance);
        if prepared.is_err() {
            self.abandon_creation();
        }
        prepared
    }

    fn prepare(
        &self,
        config: &ContextConfig,
        instance: Arc<LanguageInstance>,
    ) -> Result<(Arc<Env>, Lazy), LifecycleError> {
        let slot = self.slot();
        let request = self.env_request(config);
        let state = slot
            .provider
            .create_env(&request)
            .map_err(|source| self.hook_error("create_env", source))?;
        let env = Arc::new(Env::new(&request, slot.info.clone(), state));

        let mut collector = ServiceCollector::default();
        slot.provider
            .create_context(&env, &mut collector)
            .map_err(|source| self.hook_error("create_context", source))?;
        let services = ServiceRegistry::verify(&self.shared.registry, &slot.info, collector)?;

        let permissions = AccessPermissions::resolve(&self.shared.registry, &slot.info, &config.access);
        Ok((
            env,
            Lazy {
                instance,
                permissions: ArcSwap::from_pointee(permissions),
                services,
            },
        ))
    }

    /// Thread access check and publication, under the lock.
    fn commit(&self, state: &mut ContextState, env: Arc<Env>, lazy: Lazy) -> Result<(), LifecycleError> {
        let slot = self.slot();
        let single = state.single_threaded;
        let denied = state
            .active_threads()
            .into_iter()
            .find(|t| !slot.provider.is_thread_access_allowed(&env, *t, single));
        if let Some(thread) = denied {
            self.shared.layer.release(&slot.info);
            return Err(LifecycleError::ThreadAccessDenied {
                languages: vec![slot.info.id.clone()],
                thread: describe_thread(thread),
                single_threaded: single,
            });
        }

        slot.env.store(Some(env));
        slot.lazy.store(Some(Arc::new(lazy)));
        state.lifecycle[self.index].created = true;
        Ok(())
    }

    fn abandon_creation(&self) {
        self.shared.layer.release(self.info());
        self.shared.notify(LifecycleEvent::CreateFailed, self.info());
    }

    /// Create and initialize. Returns whether this call ran the initialization.
    pub fn ensure_initialized(&self, accessing: Option<&LanguageInfo>) -> Result<bool, LifecycleError> {
        self.ensure_created(accessing)?;

        let current = thread::current().id();
        let i = self.index;
        let mut state = self.shared.lock();
        loop {
            let lc = &state.lifecycle[i];
            if lc.disposing {
                return Err(LifecycleError::InitializationNotAllowed {
                    language: self.id().to_string(),
                });
            }
            if lc.initialized && lc.initializing_thread.map_or(true, |t| t == current) {
                return Ok(false);
            }
            if state.closed {
                return Err(LifecycleError::Closed);
            }
            let thread_finalized = state
                .threads
                .get(&current)
                .is_some_and(|t| t.finalization_complete);
            if thread_finalized && !self.info().host {
                return Err(LifecycleError::ThreadFinalized {
                    language: self.id().to_string(),
                });
            }
            if state.closing {
                return Err(LifecycleError::InitializationNotAllowed {
                    language: self.id().to_string(),
                });
            }
            if !lc.created {
                return Err(LifecycleError::NotCreated {
                    language: self.id().to_string(),
                });
            }
            if lc.initializing_thread.is_none() {
                break;
            }
            self.shared
                .wait_until(&mut state, true, |s| s.lifecycle[i].initializing_thread.is_none())?;
        }

        // published before the hooks run so re-entrant use during initialization is legal
        state.lifecycle[i].initializing_thread = Some(current);
        state.lifecycle[i].initialized = true;
        let broadcast = state.has_other_active_thread(current);
        drop(state);

        let result = self.run_initialization(current, broadcast);

        let mut state = self.shared.lock();
        let lc = &mut state.lifecycle[i];
        lc.initializing_thread = None;
        match &result {
            Ok(()) => lc.initialization_failed = false,
            Err(_) => {
                lc.initialized = false;
                lc.initialization_failed = true;
            }
        }
        self.shared.cond.notify_all();
        drop(state);

        match result {
            Ok(()) => {
                tracing::debug!(context = %self.shared.id, language = %self.id(), "Language context initialized");
                self.shared.notify(LifecycleEvent::Initialized, self.info());
                Ok(true)
            }
            Err(e) => {
                tracing::debug!(context = %self.shared.id, language = %self.id(), error = %e, "Language context initialization failed");
                self.shared.notify(LifecycleEvent::InitializeFailed, self.info());
                Err(e)
            }
        }
    }

    fn run_initialization(&self, current: ThreadId, broadcast: bool) -> Result<(), LifecycleError> {
        let env = self.require_env()?;
        self.shared.notify(LifecycleEvent::Initialize, self.info());

        {
            let mut state = self.shared.lock();
            self.ensure_multi_threading_initialized(&mut state, true)?;
        }
        if broadcast && !self.info().host {
            self.initialize_active_threads(current)?;
        } else {
            let mut state = self.shared.lock();
            self.initialize_thread_if_needed(&mut state, Some(current), current, true)?;
        }

        self.slot()
            .provider
            .post_init(&env)
            .map_err(|source| self.hook_error("post_init", source))
    }

    /// Let the language run its finalization. Returns whether the hook ran.
    pub fn finalize_context(&self, must_succeed: bool) -> Result<bool, LifecycleError> {
        let current = thread::current().id();
        let i = self.index;
        let mut state = self.shared.lock();
        self.shared.wait_until(&mut state, !must_succeed, |s| {
            s.lifecycle[i]
                .initializing_thread
                .map_or(true, |t| t == current)
        })?;
        let lc = &mut state.lifecycle[i];
        if !lc.initialized || lc.finalized {
            return Ok(false);
        }
        lc.finalized = true;
        drop(state);

        let env = self.require_env()?;
        if let Err(source) = self.slot().provider.finalize(&env) {
            self.best_effort("finalize", source, must_succeed)?;
        }
        tracing::debug!(context = %self.shared.id, language = %self.id(), "Language context finalized");
        self.shared.notify(LifecycleEvent::Finalized, self.info());
        Ok(true)
    }

    /// Record `mode` and run the exit hook unless an equal or more severe exit happened.
    pub fn exit_context(&self, mode: ExitMode, code: i32) -> Result<bool, LifecycleError> {
        let current = thread::current().id();
        let i = self.index;
        let mut state = self.shared.lock();
        self.shared
            .wait_until(&mut state, mode == ExitMode::Natural, |s| {
                s.lifecycle[i]
                    .initializing_thread
                    .map_or(true, |t| t == current)
            })?;
        let lc = &mut state.lifecycle[i];
        if !lc.initialized || lc.exited.is_some_and(|m| m >= mode) {
            return Ok(false);
        }
        lc.exited = Some(mode);
        drop(state);

        let env = self.require_env()?;
        if let Err(source) = self.slot().provider.exit(&env, mode, code) {
            match mode {
                ExitMode::Natural => return Err(self.hook_error("exit", source)),
                ExitMode::Hard if source.is_internal() => return Err(self.hook_error("exit", source)),
                ExitMode::Hard => {
                    tracing::debug!(language = %self.id(), error = %source, "Ignoring failure during hard exit")
                }
            }
        }
        tracing::debug!(context = %self.shared.id, language = %self.id(), mode = ?mode, code, "Language context exited");
        Ok(true)
    }

    /// Tear the language context down. Returns false if it was never created
    /// or another call is already disposing it.
    pub fn dispose(&self) -> Result<bool, LifecycleError> {
        let current = thread::current().id();
        let i = self.index;
        let mut state = self.shared.lock();
        let lc = &state.lifecycle[i];
        if !lc.created || lc.disposing {
            return Ok(false);
        }
        if !lc.owned_threads.is_empty() {
            return Err(LifecycleError::OwnedThreadsAlive {
                language: self.id().to_string(),
                threads: lc.owned_threads.iter().map(|t| format!("{t:?}")).collect(),
            });
        }
        if state.has_other_active_thread(current) {
            return Err(LifecycleError::ConcurrentActivity);
        }
        let activated: Vec<ThreadId> = state
            .threads
            .iter()
            .filter(|(_, info)| info.activation[i] == ThreadActivation::Activated)
            .map(|(id, _)| *id)
            .collect();
        let env = self.require_env()?;
        state.lifecycle[i].disposing = true;
        drop(state);

        let slot = self.slot();
        let mut failure: Option<(&'static str, HookError)> = None;
        for thread in activated {
            if let Err(source) = slot.provider.dispose_thread(&env, thread) {
                failure.get_or_insert(("dispose_thread", source));
            }
        }
        if let Err(source) = slot.provider.dispose(&env) {
            failure.get_or_insert(("dispose", source));
        }

        let mut state = self.shared.lock();
        self.reset(&mut state);
        self.shared.cond.notify_all();
        drop(state);
        tracing::debug!(context = %self.shared.id, language = %self.id(), "Language context disposed");
        self.shared.notify(LifecycleEvent::Disposed, self.info());

        match failure {
            None => Ok(true),
            Some((operation, source)) if source.is_internal() => Err(self.hook_error(operation, source)),
            Some((_, source)) => Err(LifecycleError::GuestCodeDuringDisposal {
                language: self.id().to_string(),
                source,
            }),
        }
    }

    fn reset(&self, state: &mut ContextState) {
        let slot = self.slot();
        state.lifecycle[self.index].reset();
        for info in state.threads.values_mut() {
            info.activation[self.index] = ThreadActivation::Inactive;
        }
        slot.env.store(None);
        slot.lazy.store(None);
        self.shared.layer.release(&slot.info);
    }

    /// Hard reset while the owning context is torn down. The caller holds the lock.
    pub fn close(&self, state: &mut ContextState) {
        self.reset(state);
    }

    /// Reconfigure a created language. Never-created languages accept any patch.
    pub fn patch(&self, config: &ContextConfig) -> Result<bool, LifecycleError> {
        let plan = self.prepare_patch(config)?;
        Ok(self.apply_patch(plan))
    }

    /// Ask the provider for the patched environment and resolve the new access
    /// maps. Nothing is published.
    pub(crate) fn prepare_patch(&self, config: &ContextConfig) -> Result<PatchPlan, LifecycleError> {
        let slot = self.slot();
        let Some(env) = slot.env.load_full() else {
            return Ok(PatchPlan::Uncreated);
        };

        let mut patched_env = None;
        if config.targets(&slot.info) {
            let request = self.env_request(config);
            let patched = slot
                .provider
                .patch_env(&env, &request)
                .map_err(|source| self.hook_error("patch_env", source))?;
            let Some(state) = patched else {
                tracing::debug!(language = %self.id(), "Language rejected live reconfiguration");
                return Ok(PatchPlan::Rejected);
            };
            patched_env = Some(Arc::new(Env::new(&request, slot.info.clone(), state)));
        }

        Ok(PatchPlan::Ready {
            env: patched_env,
            permissions: AccessPermissions::resolve(&self.shared.registry, &slot.info, &config.access),
        })
    }

    /// Publish a prepared patch. Returns false for a rejected one.
    pub(crate) fn apply_patch(&self, plan: PatchPlan) -> bool {
        let (env, permissions) = match plan {
            PatchPlan::Rejected => return false,
            PatchPlan::Uncreated => return true,
            PatchPlan::Ready { env, permissions } => (env, permissions),
        };
        let slot = self.slot();
        let state = self.shared.lock();
        // disposed since it was prepared
        if !state.lifecycle[self.index].created {
            return true;
        }
        if let Some(env) = env {
            slot.env.store(Some(env));
        }
        if let Some(lazy) = slot.lazy.load().as_ref() {
            lazy.permissions.store(Arc::new(permissions));
        }
        drop(state);
        tracing::debug!(language = %self.id(), "Language context patched");
        true
    }

    /// Languages visible from this one; `None` until created.
    pub fn accessible_languages(&self, internal: bool) -> Option<BTreeMap<String, Arc<LanguageInfo>>> {
        self.slot()
            .lazy
            .load()
            .as_ref()
            .map(|l| l.permissions.load().view(internal).clone())
    }

    /// Whether code of this language may evaluate code of `target` (`None`: any).
    pub fn is_eval_allowed(&self, target: Option<&LanguageInfo>) -> bool {
        let config = self.shared.config.load();
        if config
            .access
            .eval_access
            .get(self.id())
            .is_some_and(|list| list.is_empty())
        {
            return false;
        }
        let Some(target) = target else {
            return true;
        };
        self.accessible_languages(false)
            .is_some_and(|public| public.contains_key(&target.id))
    }

    pub fn lookup_service<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.slot()
            .lazy
            .load()
            .as_ref()
            .and_then(|l| l.services.lookup::<T>())
    }

    pub fn lookup_service_by_id(&self, id: &ServiceId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.slot()
            .lazy
            .load()
            .as_ref()
            .and_then(|l| l.services.lookup_by_id(&self.shared.registry, id))
    }

    /// Live threads started through [`LanguageContext::spawn_thread`].
    pub fn owned_threads(&self) -> Vec<ThreadId> {
        self.shared.lock().lifecycle[self.index]
            .owned_threads
            .iter()
            .copied()
            .collect()
    }

    /// Start a worker thread owned by this language. The thread is entered into
    /// the context for the duration of `f`.
    pub fn spawn_thread<F, T>(
        &self,
        name: impl Into<String>,
        f: F,
    ) -> Result<JoinHandle<Result<T, LifecycleError>>, LifecycleError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let i = self.index;
        let mut state = self.shared.lock();
        if state.is_closing() {
            return Err(LifecycleError::Closed);
        }
        if !state.lifecycle[i].created {
            return Err(LifecycleError::NotCreated {
                language: self.id().to_string(),
            });
        }

        let shared = Arc::clone(self.shared);
        // the lock is held until the id is recorded, so the thread cannot deregister first
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let _owned = OwnedThread {
                    shared: shared.clone(),
                    index: i,
                };
                let _entered = Context::from_shared(shared).enter()?;
                Ok(f())
            })
            .map_err(|e| LifecycleError::Internal {
                message: format!("failed to start a thread for language {}", self.id()),
                cause: Some(HookError::internal(e)),
                suppressed: Vec::new(),
            })?;
        state.lifecycle[i].owned_threads.insert(handle.thread().id());
        Ok(handle)
    }
}

/// A reconfiguration prepared for one language.
pub(crate) enum PatchPlan {
    Uncreated,
    Rejected,
    Ready {
        env: Option<Arc<Env>>,
        permissions: AccessPermissions,
    },
}

struct OwnedThread {
    shared: Arc<ContextShared>,
    index: usize,
}

impl Drop for OwnedThread {
    fn drop(&mut self) {
        let current = thread::current().id();
        let mut state = self.shared.lock();
        state.lifecycle[self.index].owned_threads.remove(&current);
        self.shared.cond.notify_all();
    }
}
