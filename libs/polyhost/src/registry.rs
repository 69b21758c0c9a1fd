// polyhost/src/registry.rs
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::contracts::LanguageProvider;
use crate::language::{LanguageInfo, ServiceId};

pub struct LanguageEntry {
    pub info: Arc<LanguageInfo>,
    pub provider: Arc<dyn LanguageProvider>,
}

impl std::fmt::Debug for LanguageEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageEntry")
            .field("id", &self.info.id)
            .field("internal", &self.info.internal)
            .field("host", &self.info.host)
            .field("dependencies", &self.info.dependencies)
            .field("services", &self.info.services)
            .finish()
    }
}

/// The function type submitted via `inventory::submit!`.
/// It fills a *builder*, not the final registry.
pub struct Registrator(pub fn(&mut RegistryBuilder));

inventory::collect!(Registrator);

/// Engine catalog: every language known to the engine plus the service type lattice.
pub struct LanguageRegistry {
    languages: Vec<LanguageEntry>, // host first, then by id
    index: HashMap<String, usize>,
    service_types: HashMap<ServiceId, Vec<ServiceId>>,
}

impl std::fmt::Debug for LanguageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.languages.iter().map(|l| l.info.id.as_str()).collect();
        f.debug_struct("LanguageRegistry")
            .field("languages", &ids)
            .field("service_types", &self.service_types.len())
            .finish()
    }
}

impl LanguageRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Discover via inventory, have registrators fill the builder, then build.
    pub fn discover_and_build() -> Result<Self, RegistryError> {
        let mut b = RegistryBuilder::default();
        for r in ::inventory::iter::<Registrator> {
            r.0(&mut b);
        }
        b.build()
    }

    pub fn languages(&self) -> &[LanguageEntry] {
        &self.languages
    }

    pub fn get(&self, id: &str) -> Option<&LanguageEntry> {
        self.index.get(id).map(|&i| &self.languages[i])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn host(&self) -> Option<&LanguageEntry> {
        self.languages.iter().find(|l| l.info.host)
    }

    /// Every registered language, internal ones included.
    pub fn all_languages(&self) -> BTreeMap<String, Arc<LanguageInfo>> {
        self.languages
            .iter()
            .map(|l| (l.info.id.clone(), l.info.clone()))
            .collect()
    }

    pub fn internal_languages(&self) -> impl Iterator<Item = &Arc<LanguageInfo>> {
        self.languages
            .iter()
            .map(|l| &l.info)
            .filter(|info| info.internal)
    }

    /// Direct supertypes and implemented interfaces of a service type.
    pub fn service_supertypes(&self, id: &ServiceId) -> &[ServiceId] {
        self.service_types
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether `ty` is `expected` or reaches it through the lattice.
    pub fn is_service_subtype(&self, ty: &ServiceId, expected: &ServiceId) -> bool {
        if ty == expected {
            return true;
        }
        self.service_supertypes(ty)
            .iter()
            .any(|parent| self.is_service_subtype(parent, expected))
    }
}

/// Builder fed by registrators or by embedders directly.
/// Keys are language **ids**; uniqueness enforced at build time.
#[derive(Default)]
pub struct RegistryBuilder {
    languages: Vec<LanguageEntry>,
    service_types: HashMap<ServiceId, Vec<ServiceId>>,
    errors: Vec<String>,
}

impl RegistryBuilder {
    pub fn register_language(&mut self, info: LanguageInfo, provider: Arc<dyn LanguageProvider>) {
        if self.languages.iter().any(|l| l.info.id == info.id) {
            self.errors
                .push(format!("Language '{}' is already registered", info.id));
            return;
        }
        self.languages.push(LanguageEntry {
            info: Arc::new(info),
            provider,
        });
    }

    pub fn with_language(
        mut self,
        info: LanguageInfo,
        provider: Arc<dyn LanguageProvider>,
    ) -> Self {
        self.register_language(info, provider);
        self
    }

    /// Declare a service type and the types it satisfies (supertype, interfaces).
    pub fn register_service_type<I, S>(&mut self, id: impl Into<ServiceId>, supertypes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<ServiceId>,
    {
        let id = id.into();
        if self.service_types.contains_key(&id) {
            self.errors
                .push(format!("Service type '{id}' is already registered"));
            return;
        }
        self.service_types
            .insert(id, supertypes.into_iter().map(Into::into).collect());
    }

    pub fn with_service_type<I, S>(mut self, id: impl Into<ServiceId>, supertypes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ServiceId>,
    {
        self.register_service_type(id, supertypes);
        self
    }

    /// Detect cycles in the service type lattice using DFS with path tracking.
    /// Returns the cycle path if found, None otherwise.
    fn detect_cycle_with_path(names: &[ServiceId], adj: &[Vec<usize>]) -> Option<Vec<ServiceId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White, // unvisited
            Gray,  // on current path
            Black, // finished
        }

        fn dfs(
            node: usize,
            names: &[ServiceId],
            adj: &[Vec<usize>],
            colors: &mut [Color],
            path: &mut Vec<usize>,
        ) -> Option<Vec<ServiceId>> {
            colors[node] = Color::Gray;
            path.push(node);

            for &neighbor in &adj[node] {
                match colors[neighbor] {
                    Color::Gray => {
                        if let Some(start) = path.iter().position(|&n| n == neighbor) {
                            let mut cycle: Vec<ServiceId> =
                                path[start..].iter().map(|&i| names[i].clone()).collect();
                            cycle.push(names[neighbor].clone());
                            return Some(cycle);
                        }
                    }
                    Color::White => {
                        if let Some(cycle) = dfs(neighbor, names, adj, colors, path) {
                            return Some(cycle);
                        }
                    }
                    Color::Black => {}
                }
            }

            path.pop();
            colors[node] = Color::Black;
            None
        }

        let mut colors = vec![Color::White; names.len()];
        let mut path = Vec::new();
        for i in 0..names.len() {
            if colors[i] == Color::White {
                if let Some(cycle) = dfs(i, names, adj, &mut colors, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Validate and freeze the catalog.
    pub fn build(self) -> Result<LanguageRegistry, RegistryError> {
        let mut errors = self.errors;

        let hosts: Vec<&str> = self
            .languages
            .iter()
            .filter(|l| l.info.host)
            .map(|l| l.info.id.as_str())
            .collect();
        if hosts.len() > 1 {
            errors.push(format!(
                "Multiple host languages detected: {}. Only one host language is allowed.",
                hosts.join(", ")
            ));
        }
        if !errors.is_empty() {
            return Err(RegistryError::InvalidRegistryConfiguration { errors });
        }

        // 1) every supertype must be a known service type
        for (id, parents) in &self.service_types {
            for parent in parents {
                if !self.service_types.contains_key(parent) {
                    return Err(RegistryError::UnknownServiceType {
                        service: id.clone(),
                        supertype: parent.clone(),
                    });
                }
            }
        }

        // 2) the lattice must be acyclic
        let mut names: Vec<ServiceId> = self.service_types.keys().cloned().collect();
        names.sort();
        let idx: HashMap<&ServiceId, usize> =
            names.iter().enumerate().map(|(i, n)| (n, i)).collect();
        let mut adj = vec![Vec::<usize>::new(); names.len()];
        for (id, parents) in &self.service_types {
            for parent in parents {
                adj[idx[id]].push(idx[parent]);
            }
        }
        if let Some(path) = Self::detect_cycle_with_path(&names, &adj) {
            return Err(RegistryError::ServiceTypeCycle { path });
        }

        // 3) dependencies may point at languages that are not installed
        let known: HashSet<&str> = self.languages.iter().map(|l| l.info.id.as_str()).collect();
        for l in &self.languages {
            for dep in &l.info.dependencies {
                if !known.contains(dep.as_str()) {
                    tracing::debug!(
                        language = %l.info.id,
                        dependency = %dep,
                        "Declared dependency is not installed; ignoring"
                    );
                }
            }
        }

        // 4) host first, then by id
        let mut languages = self.languages;
        languages.sort_by(|a, b| {
            b.info
                .host
                .cmp(&a.info.host)
                .then_with(|| a.info.id.cmp(&b.info.id))
        });
        let index = languages
            .iter()
            .enumerate()
            .map(|(i, l)| (l.info.id.clone(), i))
            .collect();

        tracing::info!(
            languages = ?languages.iter().map(|l| l.info.id.as_str()).collect::<Vec<_>>(),
            "Language catalog built"
        );

        Ok(LanguageRegistry {
            languages,
            index,
            service_types: self.service_types,
        })
    }
}

/// Structured errors for the language registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service type '{service}' extends unknown type '{supertype}'")]
    UnknownServiceType {
        service: ServiceId,
        supertype: ServiceId,
    },
    #[error("cyclic service type hierarchy detected: {}", path.iter().map(ServiceId::as_str).collect::<Vec<_>>().join(" -> "))]
    ServiceTypeCycle { path: Vec<ServiceId> },
    #[error("invalid registry configuration:\n{errors:#?}")]
    InvalidRegistryConfiguration { errors: Vec<String> },
}
