//! Language visibility.
//!
//! Every language context sees two maps of other languages: the *internal* view
//! (what its implementation may call into, dependencies and internal languages
//! included) and the *public* view (what guest code may name explicitly). Both
//! are derived from the registry and the context's [`AccessPolicy`] and are
//! recomputed after every successful patch.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::language::LanguageInfo;
use crate::registry::LanguageRegistry;

/// Which languages the embedder and each language may access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessPolicy {
    /// Public languages the embedder permits. Empty grants access to all of them.
    #[serde(default)]
    pub allowed_languages: BTreeSet<String>,
    /// Per-language override: language id → languages it may evaluate code of.
    #[serde(default)]
    pub eval_access: BTreeMap<String, BTreeSet<String>>,
}

impl AccessPolicy {
    pub fn allow<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_languages
            .extend(languages.into_iter().map(Into::into));
        self
    }

    pub fn with_eval_access<I, S>(mut self, from: impl Into<String>, to: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.eval_access
            .insert(from.into(), to.into_iter().map(Into::into).collect());
        self
    }

    fn embedder_all_access(&self) -> bool {
        self.allowed_languages.is_empty()
    }

    fn override_for(&self, language: &str) -> Option<&BTreeSet<String>> {
        self.eval_access.get(language)
    }

    /// Ids the resolution starts from; always contains `language` itself.
    fn resolution_set(&self, registry: &LanguageRegistry, language: &LanguageInfo) -> BTreeSet<String> {
        let mut ids: BTreeSet<String> = match self.override_for(&language.id) {
            Some(list) => list.clone(),
            None if self.embedder_all_access() => registry
                .languages()
                .iter()
                .map(|l| l.info.id.clone())
                .collect(),
            None => self.allowed_languages.clone(),
        };
        ids.insert(language.id.clone());
        ids
    }

    /// Authoritative check whether `from` may access `to`. `None` is the embedder.
    pub fn is_access_permitted(
        &self,
        registry: &LanguageRegistry,
        from: Option<&LanguageInfo>,
        to: &LanguageInfo,
    ) -> bool {
        let Some(from) = from else {
            return to.host
                || (!to.internal
                    && (self.embedder_all_access() || self.allowed_languages.contains(&to.id)));
        };
        if from.host || to.internal || from.id == to.id {
            return true;
        }

        // breadth-first walk over declared dependencies of the resolution set
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = self.resolution_set(registry, from).into_iter().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if id == to.id {
                return registry.get(&id).is_some();
            }
            if let Some(entry) = registry.get(&id) {
                queue.extend(entry.info.dependencies.iter().cloned());
            }
        }
        false
    }
}

/// Resolved visibility maps of one language context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPermissions {
    pub internal: BTreeMap<String, Arc<LanguageInfo>>,
    pub public: BTreeMap<String, Arc<LanguageInfo>>,
}

impl AccessPermissions {
    /// Compute both views for `language` under `policy`.
    pub fn resolve(
        registry: &LanguageRegistry,
        language: &LanguageInfo,
        policy: &AccessPolicy,
    ) -> Self {
        if language.host {
            let all = registry.all_languages();
            return Self {
                public: all.clone(),
                internal: all,
            };
        }

        let ids = policy.resolution_set(registry, language);
        let mut internal = BTreeMap::new();
        let mut public = BTreeMap::new();
        for id in &ids {
            // resolved languages may not be installed
            let Some(entry) = registry.get(id) else {
                continue;
            };
            internal.insert(id.clone(), entry.info.clone());
            if !entry.info.internal {
                public.insert(id.clone(), entry.info.clone());
            }
        }

        for id in &ids {
            if let Some(entry) = registry.get(id) {
                add_dependencies(registry, &mut internal, &entry.info);
            }
        }
        for info in registry.internal_languages() {
            internal.insert(info.id.clone(), info.clone());
        }

        debug_assert!(
            registry.languages().iter().all(|l| {
                policy.is_access_permitted(registry, Some(language), &l.info)
                    == internal.contains_key(&l.info.id)
            }),
            "inconsistent access permissions for language {}",
            language.id
        );

        Self { internal, public }
    }

    pub fn view(&self, internal: bool) -> &BTreeMap<String, Arc<LanguageInfo>> {
        if internal {
            &self.internal
        } else {
            &self.public
        }
    }
}

fn add_dependencies(
    registry: &LanguageRegistry,
    resolved: &mut BTreeMap<String, Arc<LanguageInfo>>,
    language: &LanguageInfo,
) {
    for dep in &language.dependencies {
        let Some(entry) = registry.get(dep) else {
            continue;
        };
        // cycle or duplicate
        if resolved.contains_key(dep) {
            continue;
        }
        resolved.insert(dep.clone(), entry.info.clone());
        add_dependencies(registry, resolved, &entry.info);
    }
}
