//! Engine-level language descriptors.
//!
//! A [`LanguageInfo`] is immutable once the registry is built. Contexts and
//! language contexts only ever hold it behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a service capability (nominal type name).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ServiceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sandbox strictness, from least to most restrictive.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SandboxPolicy {
    #[default]
    Trusted,
    Constrained,
    Isolated,
    Untrusted,
}

impl fmt::Display for SandboxPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxPolicy::Trusted => "trusted",
            SandboxPolicy::Constrained => "constrained",
            SandboxPolicy::Isolated => "isolated",
            SandboxPolicy::Untrusted => "untrusted",
        };
        f.write_str(s)
    }
}

/// Static description of a language known to the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LanguageInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Internal languages are never visible to the embedder but always reachable
    /// from other languages.
    #[serde(default)]
    pub internal: bool,
    /// The distinguished language representing the embedding runtime itself.
    #[serde(default)]
    pub host: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Capabilities this language promises to register on creation.
    #[serde(default)]
    pub services: Vec<ServiceId>,
    /// Strictest sandbox policy the language supports.
    #[serde(default)]
    pub sandbox: SandboxPolicy,
}

impl LanguageInfo {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: None,
            internal: false,
            host: false,
            dependencies: Vec::new(),
            services: Vec::new(),
            sandbox: SandboxPolicy::Trusted,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_version(mut self, v: impl Into<String>) -> Self {
        self.version = Some(v.into());
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn host(mut self) -> Self {
        self.host = true;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn offers(mut self, service: impl Into<ServiceId>) -> Self {
        self.services.push(service.into());
        self
    }

    pub fn with_sandbox(mut self, policy: SandboxPolicy) -> Self {
        self.sandbox = policy;
        self
    }

    /// Whether the language may be created under the given context policy.
    pub fn supports_sandbox(&self, policy: SandboxPolicy) -> bool {
        policy <= self.sandbox
    }
}

impl fmt::Display for LanguageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
