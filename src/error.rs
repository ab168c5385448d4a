//! Error types for pijs environments.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for environment construction, evaluation and timer control.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Global scope creation or scope operation errors
    #[error("Scope error: {0}")]
    Scope(String),

    /// Fake timer installation or driving errors
    #[error("Fake timers error: {0}")]
    Timers(String),

    /// An exception thrown by evaluated source
    #[error("Evaluation error in {file_name}: {message}")]
    Evaluation {
        file_name: String,
        message: String,
        stack: Option<String>,
    },

    /// The resource loader had no source for the requested address
    #[error("Unable to find source for {url}")]
    ResourceNotFound { url: String },

    /// A second script was offered before the first one was served
    #[error("A pending script for {pending} has not been served yet")]
    PendingScriptBusy { pending: String },

    /// The environment was already disposed
    #[error("Environment has been disposed")]
    Disposed,

    /// QuickJS engine errors
    #[error("QuickJS: {0}")]
    Js(#[from] Box<rquickjs::Error>),

    /// URL errors
    #[error("URL error: {0}")]
    Url(#[from] Box<url::ParseError>),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] Box<serde_json::Error>),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a scope error.
    pub fn scope(message: impl Into<String>) -> Self {
        Self::Scope(message.into())
    }

    /// Create a fake timers error.
    pub fn timers(message: impl Into<String>) -> Self {
        Self::Timers(message.into())
    }

    /// Create an evaluation error without a stack.
    pub fn evaluation(file_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Evaluation {
            file_name: file_name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Create a resource-not-found error for the given address.
    pub fn resource_not_found(url: impl Into<String>) -> Self {
        Self::ResourceNotFound { url: url.into() }
    }

    /// Whether this error came from source code throwing.
    pub const fn is_evaluation(&self) -> bool {
        matches!(self, Self::Evaluation { .. })
    }
}

impl From<rquickjs::Error> for Error {
    fn from(value: rquickjs::Error) -> Self {
        Self::Js(Box::new(value))
    }
}

impl From<url::ParseError> for Error {
    fn from(value: url::ParseError) -> Self {
        Self::Url(Box::new(value))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Box::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Box::new(value))
    }
}
