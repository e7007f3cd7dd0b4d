use std::fmt;

/// Coarse classification of [`Error`] for callers that map failures onto
/// an external surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    ResourceExhausted,
    RemoteOperation,
    Persistence,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::ResourceExhausted => "resource_exhausted",
            Self::RemoteOperation => "remote_operation",
            Self::Persistence => "persistence",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{op} failed: {source}")]
    RemoteOperation {
        op: &'static str,
        source: pvm_infra::Error,
    },

    #[error("persistence error: {0}")]
    Persistence(#[source] pvm_db::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::RemoteOperation { .. } => ErrorKind::RemoteOperation,
            Self::Persistence(_) => ErrorKind::Persistence,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn remote(op: &'static str) -> impl FnOnce(pvm_infra::Error) -> Self {
        move |source| Self::RemoteOperation { op, source }
    }

    /// The hypervisor reported the target as already absent.
    pub fn is_remote_not_found(&self) -> bool {
        matches!(self, Self::RemoteOperation { source, .. } if source.is_not_found())
    }
}

impl From<pvm_db::Error> for Error {
    fn from(err: pvm_db::Error) -> Self {
        match err {
            pvm_db::Error::NotFound { entity, key } => Self::NotFound { entity, key },
            pvm_db::Error::Conflict(msg) => Self::Conflict(msg),
            other => Self::Persistence(other),
        }
    }
}
