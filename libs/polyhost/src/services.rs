//! Capability objects a language exposes to other languages and the embedder.

use std::any::Any;
use std::sync::Arc;

use crate::error::LifecycleError;
use crate::language::{LanguageInfo, ServiceId};
use crate::registry::LanguageRegistry;

#[derive(Clone)]
pub struct RegisteredService {
    pub id: ServiceId,
    object: Arc<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for RegisteredService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredService")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Handed to [`LanguageProvider::create_context`](crate::contracts::LanguageProvider::create_context)
/// to collect the services of a new language context.
#[derive(Debug, Default)]
pub struct ServiceCollector {
    services: Vec<RegisteredService>,
}

impl ServiceCollector {
    /// Register `object` as an implementation of the service type `id`.
    pub fn register<T>(&mut self, id: impl Into<ServiceId>, object: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        self.services.push(RegisteredService {
            id: id.into(),
            object,
        });
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Services of one created language context. Frozen after creation.
#[derive(Debug, Default, Clone)]
pub struct ServiceRegistry {
    services: Vec<RegisteredService>,
}

impl ServiceRegistry {
    /// Check every service `language` declares against the reported ones.
    pub fn verify(
        registry: &LanguageRegistry,
        language: &LanguageInfo,
        collector: ServiceCollector,
    ) -> Result<Self, LifecycleError> {
        for declared in &language.services {
            let satisfied = collector
                .services
                .iter()
                .any(|s| registry.is_service_subtype(&s.id, declared));
            if !satisfied {
                return Err(LifecycleError::MissingService {
                    language: language.id.clone(),
                    service: declared.clone(),
                });
            }
        }
        Ok(Self {
            services: collector.services,
        })
    }

    /// First registered service of concrete type `T`.
    pub fn lookup<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.services
            .iter()
            .find_map(|s| s.object.clone().downcast::<T>().ok())
    }

    /// First registered service satisfying the service type `id`.
    pub fn lookup_by_id(
        &self,
        registry: &LanguageRegistry,
        id: &ServiceId,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services
            .iter()
            .find(|s| registry.is_service_subtype(&s.id, id))
            .map(|s| s.object.clone())
    }

    pub fn ids(&self) -> impl Iterator<Item = &ServiceId> {
        self.services.iter().map(|s| &s.id)
    }
}
