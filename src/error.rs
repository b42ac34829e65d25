//! Error taxonomy shared by every backend.
//!
//! Adapters translate their native failures into [`Error`] at the boundary
//! through [`NativeError`], so the façade and the hook layer only ever see
//! the four kinds below.
use std::backtrace::Backtrace;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Categorized failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Table or item does not exist
    NotFound,
    /// Malformed input, rejected either locally or by the backend
    Validation,
    /// Missing or malformed connection, credential or table config
    Configuration,
    /// Hook failures and anything unexpected
    Plugin,
}

impl ErrorKind {
    pub fn title(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Validation => "validation error",
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Plugin => "plugin error",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Validation => 400,
            ErrorKind::Configuration => 500,
            ErrorKind::Plugin => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not found")]
    NotFound { detail: Option<String> },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("plugin error: {message}")]
    Plugin {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
}

/// Structured problem record handed to callers (RFC 7807 shaped).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub title: String,
    pub detail: Option<String>,
    pub status: u16,
    #[serde(rename = "type")]
    pub r#type: Option<String>,
}

impl Error {
    pub fn not_found() -> Self {
        Error::NotFound { detail: None }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    pub fn plugin(message: impl Into<String>) -> Self {
        Error::Plugin {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an error returned by a hook implementation.
    pub fn from_hook(hook: &str, plugin: &str, err: anyhow::Error) -> Self {
        Error::Plugin {
            message: format!("{hook} hook of {plugin} failed"),
            source: Some(err.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Configuration { .. } => ErrorKind::Configuration,
            Error::Plugin { .. } => ErrorKind::Plugin,
        }
    }

    /// Render as a problem record. Plugin diagnostics stay in the logs.
    pub fn to_problem(&self) -> Problem {
        let kind = self.kind();
        let detail = match self {
            Error::NotFound { detail } => detail.clone(),
            Error::Validation { message } | Error::Configuration { message } => {
                Some(message.clone())
            }
            Error::Plugin { .. } => None,
        };
        Problem {
            title: kind.title().to_string(),
            detail,
            status: kind.status(),
            r#type: None,
        }
    }
}

/// Whether a lookup treats a missing resource as an absent result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundPolicy {
    Raise,
    Suppress,
}

/// Implemented by each backend's native error type.
pub trait NativeError: std::error::Error + Send + Sync + 'static {
    fn kind(&self) -> ErrorKind;
}

/// Translate a native failure into the common taxonomy.
pub fn translate<E: NativeError>(err: E) -> Error {
    let message = err.to_string();
    match err.kind() {
        ErrorKind::NotFound => {
            tracing::debug!(error = %message, "backend reported not found");
            Error::not_found()
        }
        ErrorKind::Validation => Error::validation(message),
        ErrorKind::Configuration => Error::config(message),
        ErrorKind::Plugin => {
            tracing::error!(
                error = %message,
                backtrace = %Backtrace::capture(),
                "unexpected backend failure"
            );
            Error::Plugin {
                message: "unexpected backend failure".to_string(),
                source: Some(Box::new(err)),
            }
        }
    }
}

pub fn normalize<T, E: NativeError>(result: std::result::Result<T, E>) -> Result<T> {
    result.map_err(translate)
}

pub fn normalize_lookup<T, E: NativeError>(
    result: std::result::Result<Option<T>, E>,
    policy: NotFoundPolicy,
) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(value),
        Err(err) if policy == NotFoundPolicy::Suppress && err.kind() == ErrorKind::NotFound => {
            Ok(None)
        }
        Err(err) => Err(translate(err)),
    }
}
