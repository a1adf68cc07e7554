//! Unified error type.
//!
//! Everything that can go wrong in bough funnels into one [`Error`]. During
//! dispatch every variant ends up in the controller's single error handler,
//! which turns it into a response via [`Error::status`]. Outside dispatch the
//! same type reports registration, configuration and lifecycle failures.

use http::StatusCode;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by bough's fallible operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No registered pattern matches the request path.
    #[error("not found")]
    NotFound,

    /// The path matches, but not under the request method.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// An explicit HTTP error raised by a handler or middleware.
    #[error("{message}")]
    Http { status: StatusCode, message: String },

    /// Arbitrary application failure surfaced by a handler or middleware.
    #[error(transparent)]
    Handler(Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Request data could not be decoded by a binder.
    #[error("bind: {0}")]
    Bind(#[from] serde_json::Error),

    #[error("invalid route `{pattern}`: {reason}")]
    InvalidRoute { pattern: String, reason: String },

    #[error("route {method} {pattern} is already registered")]
    DuplicateRoute { method: http::Method, pattern: String },

    #[error("plugin `{0}` is already registered")]
    DuplicatePlugin(String),

    /// A caller asked for a capability that no registered plugin provides.
    #[error("no plugin `{id}` providing {capability}")]
    PluginAbsent { id: String, capability: &'static str },

    /// A plugin hook failed.
    #[error("plugin `{id}`: {source}")]
    Plugin {
        id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// A lifecycle transition was requested from the wrong state.
    #[error("cannot {action} while {state}")]
    InvalidState { action: &'static str, state: crate::State },

    /// The drain deadline passed with requests still running; they were aborted.
    #[error("shutdown deadline exceeded, aborted {0} in-flight connection(s)")]
    ShutdownTimeout(usize),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// An HTTP error with a status and message written by the default error handler.
    pub fn http(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Http { status, message: message.into() }
    }

    /// Wraps any application error.
    pub fn handler<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Handler(Box::new(err))
    }

    /// The HTTP status this error maps to when it escapes a handler.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Http { status, .. } => *status,
            Self::Bind(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::MethodNotAllowed.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            Error::http(StatusCode::CONFLICT, "taken").status(),
            StatusCode::CONFLICT
        );
        let io = std::io::Error::other("disk");
        assert_eq!(Error::handler(io).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn http_error_displays_its_message() {
        assert_eq!(Error::http(StatusCode::BAD_REQUEST, "no name").to_string(), "no name");
    }
}
