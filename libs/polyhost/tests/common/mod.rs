//! Scripted language provider and recording sink shared by the integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use polyhost::{
    Context, ContextConfig, Engine, Env, EnvRequest, ExitMode, HookError, LanguageInfo,
    LanguageProvider, LanguageRegistry, LifecycleEvent, NotificationSink, ServiceCollector,
};
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(10);

/// Environment state produced by [`TestLanguage`]; `generation` grows with every
/// factory or patch call.
#[derive(Debug)]
pub struct EnvState {
    pub generation: u64,
}

/// Service object registered by languages that offer one.
#[derive(Debug)]
pub struct TestService {
    pub language: String,
}

type Hook = Arc<dyn Fn(ThreadId) -> Result<(), HookError> + Send + Sync>;

#[derive(Default)]
pub struct TestLanguage {
    calls: Mutex<Vec<(&'static str, ThreadId)>>,
    hooks: Mutex<HashMap<&'static str, Hook>>,
    generation: AtomicU64,
    /// Service type registered on context creation.
    pub service: Mutex<Option<&'static str>>,
    pub patchable: AtomicBool,
    pub single_thread_only: AtomicBool,
}

impl TestLanguage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script a hook by name (`create_env`, `create_context`, `post_init`,
    /// `initialize_thread`, `initialize_multi_threading`, `finalize`, `exit`,
    /// `dispose_thread`, `dispose`, `patch_env`).
    pub fn on<F>(&self, hook: &'static str, f: F)
    where
        F: Fn(ThreadId) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.hooks.lock().insert(hook, Arc::new(f));
    }

    pub fn count(&self, hook: &str) -> usize {
        self.calls.lock().iter().filter(|(h, _)| *h == hook).count()
    }

    pub fn threads(&self, hook: &str) -> Vec<ThreadId> {
        self.calls
            .lock()
            .iter()
            .filter(|(h, _)| *h == hook)
            .map(|(_, t)| *t)
            .collect()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(|(h, _)| *h).collect()
    }

    fn run(&self, hook: &'static str, thread: ThreadId) -> Result<(), HookError> {
        self.calls.lock().push((hook, thread));
        // cloned out so the hook may script other hooks
        let f = self.hooks.lock().get(hook).cloned();
        match f {
            Some(f) => f(thread),
            None => Ok(()),
        }
    }

    fn here(&self, hook: &'static str) -> Result<(), HookError> {
        self.run(hook, std::thread::current().id())
    }

    fn next_state(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::new(EnvState {
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }
}

impl LanguageProvider for TestLanguage {
    fn create_env(&self, _request: &EnvRequest<'_>) -> Result<Arc<dyn Any + Send + Sync>, HookError> {
        self.here("create_env")?;
        Ok(self.next_state())
    }

    fn create_context(&self, env: &Env, services: &mut ServiceCollector) -> Result<(), HookError> {
        self.here("create_context")?;
        if let Some(id) = *self.service.lock() {
            services.register(
                id,
                Arc::new(TestService {
                    language: env.language().id.clone(),
                }),
            );
        }
        Ok(())
    }

    fn patch_env(
        &self,
        _env: &Env,
        _request: &EnvRequest<'_>,
    ) -> Result<Option<Arc<dyn Any + Send + Sync>>, HookError> {
        self.here("patch_env")?;
        if self.patchable.load(Ordering::SeqCst) {
            Ok(Some(self.next_state()))
        } else {
            Ok(None)
        }
    }

    fn is_thread_access_allowed(&self, _env: &Env, _thread: ThreadId, single_threaded: bool) -> bool {
        single_threaded || !self.single_thread_only.load(Ordering::SeqCst)
    }

    fn post_init(&self, _env: &Env) -> Result<(), HookError> {
        self.here("post_init")
    }

    fn initialize_thread(&self, _env: &Env, thread: ThreadId) -> Result<(), HookError> {
        self.run("initialize_thread", thread)
    }

    fn initialize_multi_threading(&self, _env: &Env) -> Result<(), HookError> {
        self.here("initialize_multi_threading")
    }

    fn finalize(&self, _env: &Env) -> Result<(), HookError> {
        self.here("finalize")
    }

    fn exit(&self, _env: &Env, _mode: ExitMode, _code: i32) -> Result<(), HookError> {
        self.here("exit")
    }

    fn dispose_thread(&self, _env: &Env, thread: ThreadId) -> Result<(), HookError> {
        self.run("dispose_thread", thread)
    }

    fn dispose(&self, _env: &Env) -> Result<(), HookError> {
        self.here("dispose")
    }
}

/// Sink recording `(event, language)` pairs; can be told to fail.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(LifecycleEvent, String)>>,
    pub fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events_for(&self, language: &str) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(_, l)| l == language)
            .map(|(e, _)| *e)
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, event: LifecycleEvent, _context: Uuid, language: &LanguageInfo) -> anyhow::Result<()> {
        self.events.lock().push((event, language.id.clone()));
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("sink unavailable");
        }
        Ok(())
    }
}

/// Engine over the given languages, with the service types the tests use.
pub fn engine(languages: Vec<(LanguageInfo, Arc<TestLanguage>)>) -> Engine {
    let mut builder = LanguageRegistry::builder()
        .with_service_type("Service", Vec::<String>::new())
        .with_service_type("Parser", ["Service"])
        .with_service_type("js.Parser", ["Parser"]);
    for (info, provider) in languages {
        builder.register_language(info, provider);
    }
    Engine::new(builder.build().expect("registry builds"))
}

/// A single language `js` with a fresh provider.
pub fn single(info: LanguageInfo) -> (Engine, Arc<TestLanguage>) {
    let lang = TestLanguage::new();
    (engine(vec![(info, lang.clone())]), lang)
}

pub fn context(engine: &Engine) -> Context {
    engine.create_context(ContextConfig::default())
}

/// Late-bound context handle for hooks that re-enter the core.
#[derive(Clone, Default)]
pub struct ContextCell(Arc<Mutex<Option<Context>>>);

impl ContextCell {
    pub fn set(&self, ctx: &Context) {
        *self.0.lock() = Some(ctx.clone());
    }

    pub fn get(&self) -> Context {
        self.0.lock().clone().expect("context cell is set")
    }
}

pub fn guest(msg: &str) -> HookError {
    HookError::guest(anyhow::anyhow!(msg.to_string()))
}

pub fn internal(msg: &str) -> HookError {
    HookError::internal(anyhow::anyhow!(msg.to_string()))
}
