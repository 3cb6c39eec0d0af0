//! Error types for engine operations.

use thiserror::Error;

/// Result type alias using [`KmsError`].
pub type Result<T> = std::result::Result<T, KmsError>;

/// Errors surfaced to the operation dispatcher.
///
/// Each variant belongs to one response class, see [`KmsError::status_code`].
#[derive(Debug, Error)]
pub enum KmsError {
    /// A field value was malformed or violated a constraint.
    #[error("{0}")]
    Validation(String),

    /// The field map carried names absent from the operation schema.
    #[error("{}", unknown_fields_message(.0))]
    UnknownFields(Vec<String>),

    /// Required fields were not supplied.
    #[error("missing required field(s): {0:?}")]
    MissingFields(Vec<String>),

    /// No key is registered under the alias.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The remote service reported the resource as absent.
    #[error("{step}: remote resource not found: {resource}")]
    RemoteNotFound {
        /// Step that failed (e.g. "failed to get crypto key")
        step: String,
        /// Resource path, as reported by the remote service
        resource: String,
    },

    /// The operation is not permitted.
    ///
    /// Carries no detail so a version-window denial looks like any other
    /// refusal.
    #[error("permission denied")]
    PermissionDenied,

    /// Alias already registered.
    #[error("key already exists: {0}")]
    AlreadyExists(String),

    /// Remote service call failed.
    #[error("{step}: {source}")]
    Upstream {
        /// Step that failed
        step: String,
        /// Error returned by the remote service
        #[source]
        source: RemoteError,
    },

    /// One or more version destroys failed during trim or delete.
    #[error(transparent)]
    Trim(#[from] TrimFailure),

    /// Credentials could not be parsed or discovered.
    #[error("credentials: {0}")]
    Credentials(String),

    /// Storage collaborator failed.
    #[error("storage: {0}")]
    Storage(String),

    /// The operation stopped before all work was issued.
    #[error("operation cancelled")]
    Cancelled,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error (catch-all).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn unknown_fields_message(fields: &[String]) -> String {
    match fields {
        [one] => format!("unknown field: {}", one),
        many => format!("unknown fields: {}", many.join(",")),
    }
}

impl KmsError {
    /// Wraps a remote error with the step that produced it.
    ///
    /// Remote not-found becomes [`KmsError::RemoteNotFound`]; every other
    /// remote error is carried verbatim as [`KmsError::Upstream`].
    ///
    /// # Example
    ///
    /// ```
    /// use gcpkms::{KmsError, RemoteError, RemoteCode};
    ///
    /// let err = RemoteError::new(RemoteCode::Unavailable, "connection reset");
    /// let wrapped = KmsError::upstream("failed to encrypt", err);
    ///
    /// assert_eq!(
    ///     wrapped.to_string(),
    ///     "failed to encrypt: unavailable: connection reset"
    /// );
    /// ```
    pub fn upstream(step: impl Into<String>, err: RemoteError) -> Self {
        match err.code {
            RemoteCode::NotFound => Self::RemoteNotFound {
                step: step.into(),
                resource: err.message,
            },
            _ => Self::Upstream {
                step: step.into(),
                source: err,
            },
        }
    }

    /// Returns the HTTP-equivalent status class for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::UnknownFields(_) | Self::MissingFields(_) => 422,
            Self::KeyNotFound(_) | Self::RemoteNotFound { .. } => 404,
            Self::PermissionDenied => 403,
            Self::AlreadyExists(_) | Self::Trim(_) => 409,
            Self::Upstream { .. } => 502,
            Self::Credentials(_)
            | Self::Storage(_)
            | Self::Cancelled
            | Self::Json(_)
            | Self::Other(_) => 500,
        }
    }

    /// Returns true for errors raised before any side effect took place.
    pub fn is_validation(&self) -> bool {
        self.status_code() == 422
    }
}

/// Error class reported by the remote key-management service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCode {
    /// Resource does not exist
    NotFound,
    /// Caller lacks permission on the resource
    PermissionDenied,
    /// Request was malformed
    InvalidArgument,
    /// Resource with that name exists already
    AlreadyExists,
    /// Resource is in the wrong state for the request
    FailedPrecondition,
    /// Service temporarily unreachable
    Unavailable,
    /// Request timed out
    DeadlineExceeded,
    /// Quota or rate limit hit
    ResourceExhausted,
    /// Anything else
    Unknown,
}

impl std::fmt::Display for RemoteCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::FailedPrecondition => write!(f, "failed precondition"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Error returned by a single remote call.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    /// Error class
    pub code: RemoteCode,
    /// Message from the remote service
    pub message: String,
}

impl RemoteError {
    /// Creates a remote error.
    pub fn new(code: RemoteCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Returns true when retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code,
            RemoteCode::Unavailable | RemoteCode::DeadlineExceeded | RemoteCode::ResourceExhausted
        )
    }
}

/// Aggregated per-version destroy failures.
#[derive(Debug, Error)]
#[error("failed to destroy {} crypto key version(s): {}", .failures.len(), summarize(.failures))]
pub struct TrimFailure {
    /// Version resource path and the error that stopped it
    pub failures: Vec<(String, KmsError)>,
}

fn summarize(failures: &[(String, KmsError)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{} ({})", name, err))
        .collect::<Vec<_>>()
        .join("; ")
}
