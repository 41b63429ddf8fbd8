//! The error taxonomy shared by every appgate component.
//!
//! Callers branch on error kinds (a missing key is not a validation failure,
//! a CAS divergence is retried, contention is surfaced), so the taxonomy is
//! part of the public API and must survive propagation across crates.

/// Result alias used across appgate crates.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// The error kinds observable by callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Static validation failed at an API boundary.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// The requested key or resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A `create` hit an existing key.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A compare-and-swap observed a divergent stored value.
    #[error("compare failed: {0}")]
    CompareFailed(String),

    /// Admission or retry budget exhausted.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Authorization failed.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// An upstream dial or handshake failed.
    #[error("connection problem: {0}")]
    ConnectionProblem(String),

    /// The operation is not supported by this resource kind.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Wrapped internal failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Build a [`Error::BadParameter`].
    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        Self::BadParameter(msg.into())
    }

    /// Build a [`Error::NotFound`].
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Build a [`Error::AlreadyExists`].
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Build a [`Error::CompareFailed`].
    pub fn compare_failed(msg: impl Into<String>) -> Self {
        Self::CompareFailed(msg.into())
    }

    /// Build a [`Error::LimitExceeded`].
    pub fn limit_exceeded(msg: impl Into<String>) -> Self {
        Self::LimitExceeded(msg.into())
    }

    /// Build a [`Error::AccessDenied`].
    pub fn access_denied(msg: impl Into<String>) -> Self {
        Self::AccessDenied(msg.into())
    }

    /// Build a [`Error::ConnectionProblem`].
    pub fn connection_problem(msg: impl Into<String>) -> Self {
        Self::ConnectionProblem(msg.into())
    }

    /// Build a [`Error::NotImplemented`].
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    // === Predicates ===

    /// True if this is a [`Error::BadParameter`].
    pub fn is_bad_parameter(&self) -> bool {
        matches!(self, Self::BadParameter(_))
    }

    /// True if this is a [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True if this is a [`Error::AlreadyExists`].
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// True if this is a [`Error::CompareFailed`].
    pub fn is_compare_failed(&self) -> bool {
        matches!(self, Self::CompareFailed(_))
    }

    /// True if this is a [`Error::LimitExceeded`].
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, Self::LimitExceeded(_))
    }

    /// True if this is a [`Error::AccessDenied`].
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }

    /// True if this is a [`Error::ConnectionProblem`].
    pub fn is_connection_problem(&self) -> bool {
        matches!(self, Self::ConnectionProblem(_))
    }

    /// True if this is a [`Error::NotImplemented`].
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented(_))
    }

    /// The HTTP status an edge service reports for this error when it
    /// terminates a request.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadParameter(_) => 400,
            Self::AccessDenied(_) => 403,
            Self::NotFound(_) => 404,
            Self::AlreadyExists(_) => 409,
            Self::LimitExceeded(_) => 429,
            Self::ConnectionProblem(_) => 502,
            Self::CompareFailed(_) | Self::NotImplemented(_) | Self::Internal(_) => 500,
        }
    }
}
