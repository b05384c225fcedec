//! Error types for confab.
//!
//! Every failure the crate can surface is a variant of [`Error`].  Errors are raised where they
//! are detected and reported once, at the top of the binary.

use std::error;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// The category of a failed call to the remote completion service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The API key was missing or rejected.
    Authentication,
    /// The API key is valid but lacks access.
    Permission,
    /// Too many requests.
    RateLimit,
    /// The request was malformed or referenced an unknown model.
    BadRequest,
    /// The endpoint does not exist.
    NotFound,
    /// The request timed out.
    Timeout,
    /// The service could not be reached.
    Connection,
    /// The service failed internally or is overloaded.
    Server,
    /// The response stream broke off or carried garbage.
    Streaming,
    /// Any other status the service reports.
    Api,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteErrorKind::Authentication => "authentication",
            RemoteErrorKind::Permission => "permission",
            RemoteErrorKind::RateLimit => "rate limit",
            RemoteErrorKind::BadRequest => "bad request",
            RemoteErrorKind::NotFound => "not found",
            RemoteErrorKind::Timeout => "timeout",
            RemoteErrorKind::Connection => "connection",
            RemoteErrorKind::Server => "server",
            RemoteErrorKind::Streaming => "streaming",
            RemoteErrorKind::Api => "api",
        };
        f.write_str(s)
    }
}

/// The main error type for confab.
#[derive(Clone, Debug)]
pub enum Error {
    /// Neither the user cache directory nor the platform cache directory is usable.
    StorageUnavailable {
        /// Human-readable error message.
        message: String,
        /// The underlying error, if any.
        source: Option<Arc<io::Error>>,
    },

    /// Writing a session file failed.  The previously persisted session is untouched.
    StorageWrite {
        /// Human-readable error message.
        message: String,
        /// The file that could not be written.
        path: PathBuf,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// A stored or legacy file could not be decoded.
    Format {
        /// Human-readable error message.
        message: String,
        /// The offending file, when the record came from disk.
        path: Option<PathBuf>,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// The named session does not exist.
    SessionNotFound {
        /// Session name.
        name: String,
    },

    /// A session with this name already exists.
    SessionExists {
        /// Session name.
        name: String,
    },

    /// The session name cannot be used as a file name.
    InvalidSessionName {
        /// The rejected name.
        name: String,
    },

    /// No prompt template could be found.
    PromptNotFound {
        /// The name or path the user asked for.
        name: String,
        /// Every location that was tried, in order.
        searched: Vec<PathBuf>,
    },

    /// A prompt template was requested for a session that already has history.
    ConflictingInit {
        /// Session name.
        session: String,
    },

    /// There is no session and no query, so there is nothing to send or show.
    NothingToDo,

    /// The remote stream ended without producing a single delta.
    EmptyStream,

    /// The remote completion call failed.
    Remote {
        /// What kind of failure this was.
        kind: RemoteErrorKind,
        /// Human-readable error message.
        message: String,
        /// HTTP status code, when one was received.
        status_code: Option<u16>,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// I/O error outside of session writes.
    Io {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Arc<io::Error>,
    },

    /// Error during JSON or YAML serialization of something other than a session file.
    Serialization {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// A configuration value is out of range.
    Validation {
        /// Human-readable error message.
        message: String,
        /// Parameter that failed validation.
        param: Option<String>,
    },
}

impl Error {
    /// Creates a new storage-unavailable error.
    pub fn storage_unavailable(message: impl Into<String>, source: Option<io::Error>) -> Self {
        Error::StorageUnavailable {
            message: message.into(),
            source: source.map(Arc::new),
        }
    }

    /// Creates a new storage-write error.
    pub fn storage_write(
        message: impl Into<String>,
        path: impl Into<PathBuf>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::StorageWrite {
            message: message.into(),
            path: path.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new format error.
    pub fn format(
        message: impl Into<String>,
        path: Option<PathBuf>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Format {
            message: message.into(),
            path,
            source: source.map(Arc::from),
        }
    }

    /// Creates a new session-not-found error.
    pub fn session_not_found(name: impl Into<String>) -> Self {
        Error::SessionNotFound { name: name.into() }
    }

    /// Creates a new session-exists error.
    pub fn session_exists(name: impl Into<String>) -> Self {
        Error::SessionExists { name: name.into() }
    }

    /// Creates a new invalid-session-name error.
    pub fn invalid_session_name(name: impl Into<String>) -> Self {
        Error::InvalidSessionName { name: name.into() }
    }

    /// Creates a new prompt-not-found error.
    pub fn prompt_not_found(name: impl Into<String>, searched: Vec<PathBuf>) -> Self {
        Error::PromptNotFound {
            name: name.into(),
            searched,
        }
    }

    /// Creates a new conflicting-init error.
    pub fn conflicting_init(session: impl Into<String>) -> Self {
        Error::ConflictingInit {
            session: session.into(),
        }
    }

    /// Creates a new remote error.
    pub fn remote(
        kind: RemoteErrorKind,
        message: impl Into<String>,
        status_code: Option<u16>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Remote {
            kind,
            message: message.into(),
            status_code,
            source: source.map(Arc::from),
        }
    }

    /// Creates a new I/O error.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            message: message.into(),
            source: Arc::new(source),
        }
    }

    /// Creates a new serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Serialization {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>, param: Option<String>) -> Self {
        Error::Validation {
            message: message.into(),
            param,
        }
    }

    /// Returns true if this error is a format error.
    pub fn is_format(&self) -> bool {
        matches!(self, Error::Format { .. })
    }

    /// Returns true if this error is a storage write error.
    pub fn is_storage_write(&self) -> bool {
        matches!(self, Error::StorageWrite { .. })
    }

    /// Returns true if this error reports a missing session.
    pub fn is_session_not_found(&self) -> bool {
        matches!(self, Error::SessionNotFound { .. })
    }

    /// Returns true if this error reports an already existing session.
    pub fn is_session_exists(&self) -> bool {
        matches!(self, Error::SessionExists { .. })
    }

    /// Returns true if this error rejects a session name.
    pub fn is_invalid_session_name(&self) -> bool {
        matches!(self, Error::InvalidSessionName { .. })
    }

    /// Returns true if this error is a prompt-not-found error.
    pub fn is_prompt_not_found(&self) -> bool {
        matches!(self, Error::PromptNotFound { .. })
    }

    /// Returns true if this error is a conflicting-init error.
    pub fn is_conflicting_init(&self) -> bool {
        matches!(self, Error::ConflictingInit { .. })
    }

    /// Returns true if there was nothing to do.
    pub fn is_nothing_to_do(&self) -> bool {
        matches!(self, Error::NothingToDo)
    }

    /// Returns true if the remote stream was empty.
    pub fn is_empty_stream(&self) -> bool {
        matches!(self, Error::EmptyStream)
    }

    /// Returns true if this error came from the remote completion service.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote { .. })
    }

    /// Returns the remote error kind, if this is a remote error.
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            Error::Remote { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns the status code associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Remote { status_code, .. } => *status_code,
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::StorageUnavailable { message, .. } => {
                write!(f, "Storage unavailable: {message}")
            }
            Error::StorageWrite { message, path, .. } => {
                write!(f, "Could not write {}: {message}", path.display())
            }
            Error::Format { message, path, .. } => {
                if let Some(path) = path {
                    write!(f, "Malformed file {}: {message}", path.display())
                } else {
                    write!(f, "Malformed record: {message}")
                }
            }
            Error::SessionNotFound { name } => {
                write!(f, "session {name} does not exist")
            }
            Error::SessionExists { name } => {
                write!(f, "session {name} already exists")
            }
            Error::InvalidSessionName { name } => {
                write!(f, "invalid session name {name:?}")
            }
            Error::PromptNotFound { name, searched } => {
                write!(f, "prompt {name} not found; searched:")?;
                for path in searched {
                    write!(f, " {}", path.display())?;
                }
                Ok(())
            }
            Error::ConflictingInit { session } => {
                write!(
                    f,
                    "session {session} already has history; a prompt config can only start a new session"
                )
            }
            Error::NothingToDo => {
                write!(f, "no query or option given, nothing to do")
            }
            Error::EmptyStream => {
                write!(f, "the response stream ended without any content")
            }
            Error::Remote {
                kind,
                message,
                status_code,
                ..
            } => {
                if let Some(status_code) = status_code {
                    write!(f, "Remote error ({kind}, HTTP {status_code}): {message}")
                } else {
                    write!(f, "Remote error ({kind}): {message}")
                }
            }
            Error::Io { message, .. } => {
                write!(f, "I/O error: {message}")
            }
            Error::Serialization { message, .. } => {
                write!(f, "Serialization error: {message}")
            }
            Error::Validation { message, param } => {
                if let Some(param) = param {
                    write!(f, "Validation error: {message} (parameter: {param})")
                } else {
                    write!(f, "Validation error: {message}")
                }
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::StorageUnavailable { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            Error::StorageWrite { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            Error::Format { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            Error::Remote { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            Error::Io { source, .. } => Some(source.as_ref()),
            Error::Serialization { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err.to_string(), err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(format!("JSON error: {err}"), Some(Box::new(err)))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::serialization(format!("YAML error: {err}"), Some(Box::new(err)))
    }
}

/// A specialized Result type for confab operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_not_found_lists_every_path() {
        let err = Error::prompt_not_found(
            "coder",
            vec![PathBuf::from("coder"), PathBuf::from("/cfg/coder.yaml")],
        );
        let text = err.to_string();
        assert!(text.contains("coder not found"));
        assert!(text.contains("/cfg/coder.yaml"));
        assert!(err.is_prompt_not_found());
    }

    #[test]
    fn remote_error_reports_kind_and_status() {
        let err = Error::remote(RemoteErrorKind::RateLimit, "slow down", Some(429), None);
        assert_eq!(err.remote_kind(), Some(RemoteErrorKind::RateLimit));
        assert_eq!(err.status_code(), Some(429));
        assert_eq!(
            err.to_string(),
            "Remote error (rate limit, HTTP 429): slow down"
        );
    }

    #[test]
    fn io_error_keeps_source() {
        let err: Error = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert!(error::Error::source(&err).is_some());
    }
}
