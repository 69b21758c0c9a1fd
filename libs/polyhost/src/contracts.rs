use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

use uuid::Uuid;

use crate::config::IoConfig;
use crate::error::HookError;
use crate::language::LanguageInfo;
use crate::services::ServiceCollector;

/// How a context is being exited. Ordered by severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExitMode {
    Natural,
    Hard,
}

/// Everything the environment factory gets to build a language environment.
pub struct EnvRequest<'a> {
    pub context: Uuid,
    pub language: &'a LanguageInfo,
    pub options: serde_json::Value,
    pub arguments: &'a [String],
    pub io: &'a IoConfig,
}

/// Opaque per-language environment handle published on creation.
pub struct Env {
    context: Uuid,
    language: Arc<LanguageInfo>,
    options: serde_json::Value,
    arguments: Vec<String>,
    state: Arc<dyn Any + Send + Sync>,
}

impl Env {
    pub(crate) fn new(
        request: &EnvRequest<'_>,
        language: Arc<LanguageInfo>,
        state: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            context: request.context,
            language,
            options: request.options.clone(),
            arguments: request.arguments.to_vec(),
            state,
        }
    }

    pub fn context_id(&self) -> Uuid {
        self.context
    }

    pub fn language(&self) -> &LanguageInfo {
        &self.language
    }

    pub fn options(&self) -> &serde_json::Value {
        &self.options
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Language-private state produced by the factory.
    pub fn state<T: Any>(&self) -> Option<&T> {
        self.state.downcast_ref::<T>()
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("context", &self.context)
            .field("language", &self.language.id)
            .field("options", &self.options)
            .field("arguments", &self.arguments)
            .finish()
    }
}

/// A language implementation hosted by the engine.
///
/// Every hook may re-enter the lifecycle core (recursive guest calls) and is
/// always invoked without the context lock held.
pub trait LanguageProvider: Send + Sync + 'static {
    /// Environment factory.
    fn create_env(
        &self,
        request: &EnvRequest<'_>,
    ) -> Result<Arc<dyn Any + Send + Sync>, HookError>;

    /// Builds the language's context state and reports the services it offers.
    fn create_context(
        &self,
        _env: &Env,
        _services: &mut ServiceCollector,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Live reconfiguration. `Ok(None)` means the language cannot be patched.
    fn patch_env(
        &self,
        _env: &Env,
        _request: &EnvRequest<'_>,
    ) -> Result<Option<Arc<dyn Any + Send + Sync>>, HookError> {
        Ok(None)
    }

    /// Whether `thread` may use this language. Evaluated under the context lock,
    /// so it must not call back into the core.
    fn is_thread_access_allowed(&self, _env: &Env, _thread: ThreadId, _single_threaded: bool) -> bool {
        true
    }

    /// Runs once after per-thread initialization of the initializing thread.
    fn post_init(&self, _env: &Env) -> Result<(), HookError> {
        Ok(())
    }

    fn initialize_thread(&self, _env: &Env, _thread: ThreadId) -> Result<(), HookError> {
        Ok(())
    }

    /// Called the first time the context stops being single-threaded.
    fn initialize_multi_threading(&self, _env: &Env) -> Result<(), HookError> {
        Ok(())
    }

    fn finalize(&self, _env: &Env) -> Result<(), HookError> {
        Ok(())
    }

    fn exit(&self, _env: &Env, _mode: ExitMode, _code: i32) -> Result<(), HookError> {
        Ok(())
    }

    fn dispose_thread(&self, _env: &Env, _thread: ThreadId) -> Result<(), HookError> {
        Ok(())
    }

    fn dispose(&self, _env: &Env) -> Result<(), HookError> {
        Ok(())
    }
}

/// Lifecycle transitions reported to instrumentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Create,
    Created,
    CreateFailed,
    Initialize,
    Initialized,
    InitializeFailed,
    Finalized,
    Disposed,
}

/// Receiver of lifecycle notifications. Errors are logged and ignored.
pub trait NotificationSink: Send + Sync {
    fn notify(
        &self,
        event: LifecycleEvent,
        context: Uuid,
        language: &LanguageInfo,
    ) -> anyhow::Result<()>;
}

/// Sink used when the embedder does not subscribe to lifecycle events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, _: LifecycleEvent, _: Uuid, _: &LanguageInfo) -> anyhow::Result<()> {
        Ok(())
    }
}
