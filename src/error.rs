use std::sync::Arc;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error
    /// (e.g., "config.hot_capacity", "filter")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected value, cache key)
    pub details: Option<String>,
    /// Source of the error (e.g., "hot_tier", "warm_tier", "lease")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the response cache.
///
/// Tier faults (`Storage`, `Timeout`, `Codec`) are absorbed by the coordinator and
/// only surface from the low-level tier APIs. Callers of `fetch` normally see
/// `Origin`, `Coalesced` or `Cancelled`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    /// Failure reported by the origin (inference backend) call.
    #[error("Origin call failed: {message}")]
    Origin {
        message: String,
        retryable: bool,
    },

    /// The origin failure of another caller's build, shared with every waiter on that lease.
    #[error("{0}")]
    Coalesced(Arc<Error>),

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("Storage error ({backend}): {message}")]
    Storage { backend: String, message: String },

    #[error("Operation timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Request cancelled while waiting for cache key {key}")]
    Cancelled { key: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Convenience constructor for origin failures.
    pub fn origin(msg: impl Into<String>) -> Self {
        Error::Origin {
            message: msg.into(),
            retryable: false,
        }
    }

    pub fn storage(backend: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Storage {
            backend: backend.into(),
            message: msg.into(),
        }
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Error::Codec {
            message: msg.into(),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            Error::Coalesced(inner) => inner.context(),
            _ => None,
        }
    }

    /// The error that actually happened, looking through coalesced wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Coalesced(inner) => inner.root(),
            other => other,
        }
    }

    /// Whether this is a (possibly shared) origin failure.
    pub fn is_origin(&self) -> bool {
        matches!(self.root(), Error::Origin { .. })
    }

    /// Owned copy of this error. I/O and serde sources are not `Clone`, so they
    /// are carried over as their rendered message.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::Configuration { message, context } => Error::Configuration {
                message: message.clone(),
                context: context.clone(),
            },
            Error::Validation { message, context } => Error::Validation {
                message: message.clone(),
                context: context.clone(),
            },
            Error::Runtime { message, context } => Error::Runtime {
                message: message.clone(),
                context: context.clone(),
            },
            Error::Origin { message, retryable } => Error::Origin {
                message: message.clone(),
                retryable: *retryable,
            },
            Error::Coalesced(inner) => Error::Coalesced(Arc::clone(inner)),
            Error::Codec { message } => Error::codec(message.clone()),
            Error::Storage { backend, message } => Error::storage(backend.clone(), message.clone()),
            Error::Timeout {
                operation,
                elapsed_ms,
            } => Error::Timeout {
                operation: operation.clone(),
                elapsed_ms: *elapsed_ms,
            },
            Error::Cancelled { key } => Error::Cancelled { key: key.clone() },
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Serialization(e) => Error::runtime_with_context(
                e.to_string(),
                ErrorContext::new().with_source("serialization"),
            ),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::Origin { retryable, .. } => *retryable,
            Error::Storage { .. } | Error::Timeout { .. } => true,
            _ => false,
        }
    }
}
