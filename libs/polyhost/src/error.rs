//! Error types for language hooks and lifecycle operations.

use std::fmt;
use thiserror::Error;

use crate::language::{SandboxPolicy, ServiceId};

/// Who raised a hook failure.
///
/// This is the single place where guest vs. host failures are told apart: the
/// best-effort paths swallow `Guest` and `Exit` failures and always propagate
/// `Internal` ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Raised by guest code running inside the hook.
    Guest,
    /// Unwinding caused by a hard exit of the context.
    Exit,
    /// A bug or contract breach in the language implementation or the host.
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Guest => f.write_str("guest"),
            FailureKind::Exit => f.write_str("exit"),
            FailureKind::Internal => f.write_str("internal"),
        }
    }
}

/// Failure returned by a [`LanguageProvider`](crate::contracts::LanguageProvider) hook.
///
/// Plain `anyhow` errors converted with `?` are classified as guest failures.
/// Use [`HookError::internal`] for anything that should be fatal.
#[derive(Debug, Error)]
#[error("{kind} failure: {source}")]
pub struct HookError {
    kind: FailureKind,
    #[source]
    source: anyhow::Error,
}

impl HookError {
    pub fn guest(source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: FailureKind::Guest,
            source: source.into(),
        }
    }

    pub fn internal(source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: FailureKind::Internal,
            source: source.into(),
        }
    }

    pub fn exit(source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: FailureKind::Exit,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn is_guest(&self) -> bool {
        self.kind == FailureKind::Guest
    }

    pub fn is_internal(&self) -> bool {
        self.kind == FailureKind::Internal
    }

    pub fn source_error(&self) -> &anyhow::Error {
        &self.source
    }
}

impl From<anyhow::Error> for HookError {
    fn from(source: anyhow::Error) -> Self {
        Self::guest(source)
    }
}

/// Errors surfaced by lifecycle entry points.
#[derive(Debug, Error)]
pub enum LifecycleError {
    // Usage / configuration errors
    #[error("the context is already closed")]
    Closed,
    #[error("unknown language '{0}'")]
    UnknownLanguage(String),
    #[error("creation of context for language {language} is no longer allowed, the context is being closed or disposed")]
    CreationNotAllowed { language: String },
    #[error("initialization of context for language {language} is no longer allowed, the context is being closed or disposed")]
    InitializationNotAllowed { language: String },
    #[error("initialization of context for language {language} is no longer allowed on this thread, the thread is already finalized")]
    ThreadFinalized { language: String },
    #[error("cyclic access to language context for language {language}, the context is currently being created")]
    CyclicAccess { language: String },
    #[error("access to language '{language}' is not permitted")]
    AccessDenied { language: String },
    #[error("language '{language}' does not support sandbox policy '{policy}'")]
    SandboxViolation {
        language: String,
        policy: SandboxPolicy,
    },
    #[error("language {language} declares service {service} but doesn't register it")]
    MissingService { language: String, service: ServiceId },
    #[error("{}", thread_access_message(.languages, .thread, *.single_threaded))]
    ThreadAccessDenied {
        languages: Vec<String>,
        thread: String,
        single_threaded: bool,
    },
    #[error("language '{language}' has not been created in this context")]
    NotCreated { language: String },
    #[error("another thread is still active while closing the context")]
    ConcurrentActivity,

    // Cooperative cancellation
    #[error("thread {thread} was interrupted while waiting")]
    Interrupted { thread: String },
    #[error("the context was cancelled")]
    Cancelled,

    // Hook failures that propagate
    #[error("{operation} failed for language {language}")]
    Hook {
        language: String,
        operation: &'static str,
        #[source]
        source: HookError,
    },
    #[error("the initialization of language {language} failed on {count} threads")]
    ThreadInitializationFailed {
        language: String,
        count: usize,
        #[source]
        cause: HookError,
        suppressed: Vec<HookError>,
    },
    #[error("guest language code was run during disposal of language {language}")]
    GuestCodeDuringDisposal {
        language: String,
        #[source]
        source: HookError,
    },

    // Invariant violations, always fatal
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        cause: Option<HookError>,
        suppressed: Vec<HookError>,
    },
    #[error("language {language} did not complete all of its threads: {threads:?}")]
    OwnedThreadsAlive {
        language: String,
        threads: Vec<String>,
    },
}

fn thread_access_message(languages: &[String], thread: &str, single_threaded: bool) -> String {
    if single_threaded {
        format!(
            "single threaded access requested by thread {thread} but is not allowed for language(s) {}",
            languages.join(", ")
        )
    } else {
        format!(
            "multi threaded access requested by thread {thread} but is not allowed for language(s) {}",
            languages.join(", ")
        )
    }
}

impl LifecycleError {
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            cause: None,
            suppressed: Vec::new(),
        }
    }

    /// Fatal conditions that indicate a broken contract rather than a usage error.
    pub fn is_internal(&self) -> bool {
        match self {
            LifecycleError::Internal { .. }
            | LifecycleError::OwnedThreadsAlive { .. }
            | LifecycleError::ConcurrentActivity => true,
            LifecycleError::Hook { source, .. } => source.is_internal(),
            _ => false,
        }
    }

    /// Hook failures carried by this error, primary cause first.
    pub fn hook_failures(&self) -> Vec<&HookError> {
        match self {
            LifecycleError::Hook { source, .. }
            | LifecycleError::GuestCodeDuringDisposal { source, .. } => vec![source],
            LifecycleError::ThreadInitializationFailed {
                cause, suppressed, ..
            } => std::iter::once(cause).chain(suppressed.iter()).collect(),
            LifecycleError::Internal {
                cause, suppressed, ..
            } => cause.iter().chain(suppressed.iter()).collect(),
            _ => Vec::new(),
        }
    }
}
