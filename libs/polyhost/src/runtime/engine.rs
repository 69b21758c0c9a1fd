use std::sync::Arc;

use super::context::Context;
use crate::config::ContextConfig;
use crate::contracts::{NoopSink, NotificationSink};
use crate::registry::{LanguageRegistry, RegistryError};

/// Owns the language catalog and creates contexts over it.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<LanguageRegistry>,
    sink: Arc<dyn NotificationSink>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(registry: LanguageRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            sink: Arc::new(NoopSink),
        }
    }

    /// Engine over every language submitted through `inventory`.
    pub fn discover() -> Result<Self, RegistryError> {
        Ok(Self::new(LanguageRegistry::discover_and_build()?))
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &Arc<LanguageRegistry> {
        &self.registry
    }

    pub fn create_context(&self, config: ContextConfig) -> Context {
        Context::new(self.registry.clone(), config, self.sink.clone())
    }
}
