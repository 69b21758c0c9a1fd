use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::LifecycleError;
use crate::language::LanguageInfo;

/// Per-context handle of a language implementation.
#[derive(Debug)]
pub struct LanguageInstance {
    id: u64,
    language: Arc<LanguageInfo>,
}

impl LanguageInstance {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn language(&self) -> &LanguageInfo {
        &self.language
    }
}

/// Allocation unit from which languages claim their per-context instance.
///
/// The host language has a single instance for the lifetime of the layer.
/// Guest languages claim a slot on creation and give it back on failure or
/// disposal.
#[derive(Debug, Default)]
pub struct SharingLayer {
    next_id: AtomicU64,
    host: DashMap<String, Arc<LanguageInstance>>,
    claimed: DashMap<String, Arc<LanguageInstance>>,
}

impl SharingLayer {
    pub fn new() -> Self {
        Self::default()
    }

    fn instance(&self, language: &Arc<LanguageInfo>) -> Arc<LanguageInstance> {
        Arc::new(LanguageInstance {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            language: language.clone(),
        })
    }

    pub fn allocate(&self, language: &Arc<LanguageInfo>) -> Result<Arc<LanguageInstance>, LifecycleError> {
        if language.host {
            return Ok(self
                .host
                .entry(language.id.clone())
                .or_insert_with(|| self.instance(language))
                .value()
                .clone());
        }

        match self.claimed.entry(language.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(LifecycleError::internal(format!(
                "sharing layer slot for language {} is already claimed",
                language.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let instance = self.instance(language);
                v.insert(instance.clone());
                tracing::trace!(language = %language.id, instance = instance.id, "Claimed sharing layer slot");
                Ok(instance)
            }
        }
    }

    /// Give back a guest slot. The host instance is never released.
    pub fn release(&self, language: &LanguageInfo) {
        if language.host {
            return;
        }
        if self.claimed.remove(&language.id).is_some() {
            tracing::trace!(language = %language.id, "Released sharing layer slot");
        }
    }

    pub fn is_claimed(&self, language: &str) -> bool {
        self.claimed.contains_key(language) || self.host.contains_key(language)
    }
}
