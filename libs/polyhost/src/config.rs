//! Context configuration snapshot.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use crate::access::AccessPolicy;
use crate::language::{LanguageInfo, SandboxPolicy};

/// Where a standard stream of a language environment goes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamTarget {
    #[default]
    Inherit,
    Null,
    File(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoConfig {
    #[serde(default)]
    pub stdin: StreamTarget,
    #[serde(default)]
    pub stdout: StreamTarget,
    #[serde(default)]
    pub stderr: StreamTarget,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(5)
}

/// Configuration of one context. Replaced wholesale on patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    #[serde(default)]
    pub access: AccessPolicy,
    #[serde(default)]
    pub sandbox: SandboxPolicy,
    /// Languages the configuration targets; empty means all. Used to decide which
    /// language contexts a patch applies to.
    #[serde(default)]
    pub languages: BTreeSet<String>,
    /// Per-language option values: language id → arbitrary JSON.
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
    /// Per-language application arguments.
    #[serde(default)]
    pub arguments: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub io: IoConfig,
    /// Upper bound between checks for cooperative cancellation while waiting.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            access: AccessPolicy::default(),
            sandbox: SandboxPolicy::default(),
            languages: BTreeSet::new(),
            options: HashMap::new(),
            arguments: HashMap::new(),
            io: IoConfig::default(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl ContextConfig {
    pub fn language_options(&self, language: &str) -> serde_json::Value {
        self.options
            .get(language)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }

    pub fn language_arguments(&self, language: &str) -> &[String] {
        self.arguments
            .get(language)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether a patch with this configuration targets `language`.
    pub fn targets(&self, language: &LanguageInfo) -> bool {
        language.host
            || language.internal
            || self.languages.is_empty()
            || self.languages.contains(&language.id)
    }
}
