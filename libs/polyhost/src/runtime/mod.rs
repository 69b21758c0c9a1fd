mod context;
mod engine;
mod lifecycle;
mod rendezvous;
mod sharing;
mod threads;

pub use context::{Context, ContextLock, ContextState, EnterGuard};
pub use engine::Engine;
pub use lifecycle::{LanguageContext, LifecyclePhase};
pub use sharing::{LanguageInstance, SharingLayer};
