//! # Polyhost - language context lifecycle core
//!
//! Several independently implemented guest languages share one [`Context`]
//! while each keeps private state. This crate brings one language's presence
//! in a context up, keeps it consistent across threads and tears it down.
//!
//! ## Features
//!
//! - **Lifecycle**: create → initialize → finalize → exit → dispose, with
//!   exactly-once initialization across concurrent threads
//! - **Threads**: per-thread activation, broadcast initialization when a
//!   context becomes multi-threaded, cooperative interruption
//! - **Access**: internal and public visibility maps per language
//! - **Services**: capabilities verified against declarations on creation
//!
//! ## Example
//!
//! ```rust,ignore
//! use polyhost::{ContextConfig, Engine, LanguageInfo, LanguageRegistry};
//! use std::sync::Arc;
//!
//! let registry = LanguageRegistry::builder()
//!     .with_language(LanguageInfo::new("js").offers("js.Parser"), Arc::new(JsLanguage))
//!     .with_service_type("js.Parser", Vec::<String>::new())
//!     .build()?;
//! let engine = Engine::new(registry);
//! let context = engine.create_context(ContextConfig::default());
//!
//! let _entered = context.enter()?;
//! context.language("js")?.ensure_initialized(None)?;
//! ```
//!
//! Languages can also be registered through `inventory`:
//!
//! ```rust,ignore
//! polyhost::inventory::submit! {
//!     polyhost::Registrator(|b| b.register_language(LanguageInfo::new("js"), Arc::new(JsLanguage)))
//! }
//! let engine = polyhost::Engine::discover()?;
//! ```

// Re-export inventory for language crates
pub use inventory;

pub mod access;
pub mod config;
pub mod contracts;
pub mod error;
pub mod language;
pub mod registry;
pub mod runtime;
pub mod services;

pub use access::{AccessPermissions, AccessPolicy};
pub use config::{ContextConfig, IoConfig, StreamTarget};
pub use contracts::{
    Env, EnvRequest, ExitMode, LanguageProvider, LifecycleEvent, NoopSink, NotificationSink,
};
pub use error::{FailureKind, HookError, LifecycleError};
pub use language::{LanguageInfo, SandboxPolicy, ServiceId};
pub use registry::{LanguageEntry, LanguageRegistry, Registrator, RegistryBuilder, RegistryError};
pub use runtime::{
    Context, ContextLock, ContextState, Engine, EnterGuard, LanguageContext, LanguageInstance,
    LifecyclePhase, SharingLayer,
};
pub use services::{ServiceCollector, ServiceRegistry};
