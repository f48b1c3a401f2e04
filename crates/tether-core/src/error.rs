//! Error taxonomy for the tether session core

use thiserror::Error;

/// Reporting category of an error. User-category errors are presented to the
/// caller verbatim, without a stack trace; everything else is logged in full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorCategory {
    #[default]
    Unspecified,
    User,
    Other,
}

/// An error that carries its reporting category across the session boundary.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CategorizedError {
    pub category: ErrorCategory,
    pub message: String,
}

impl CategorizedError {
    /// A user error: misconfiguration, missing traffic manager, unmapped
    /// namespace, and the like.
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::User,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Other,
            message: message.into(),
        }
    }

    pub fn is_user(&self) -> bool {
        self.category == ErrorCategory::User
    }
}

/// Stage of connect that failed, as surfaced to the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    ClusterFailed,
    TrafficManagerFailed,
    DaemonFailed,
}

/// A failure while establishing a session. Construction failures clean up
/// everything acquired so far before this is returned.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConnectError {
    pub kind: ConnectErrorKind,
    pub category: ErrorCategory,
    pub message: String,
}

impl ConnectError {
    pub fn new(kind: ConnectErrorKind, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            kind,
            category,
            message: message.into(),
        }
    }

    pub fn cluster(err: impl std::fmt::Display) -> Self {
        Self::new(
            ConnectErrorKind::ClusterFailed,
            ErrorCategory::Other,
            err.to_string(),
        )
    }

    pub fn traffic_manager(err: impl std::fmt::Display) -> Self {
        Self::new(
            ConnectErrorKind::TrafficManagerFailed,
            ErrorCategory::Other,
            err.to_string(),
        )
    }

    pub fn daemon(err: impl std::fmt::Display) -> Self {
        Self::new(
            ConnectErrorKind::DaemonFailed,
            ErrorCategory::Other,
            err.to_string(),
        )
    }

    /// Preserve the category of a categorized error while assigning the
    /// failed stage.
    pub fn categorized(kind: ConnectErrorKind, err: &CategorizedError) -> Self {
        Self::new(kind, err.category, err.message.clone())
    }
}

/// Terminal outcome of a running session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The manager no longer knows this session. The single designated way
    /// to cause a session restart; the supervisor's caller is expected to
    /// reconnect.
    #[error("session expired")]
    Expired,

    /// Any other terminal failure. Details have already been logged.
    #[error("session failed: {0}")]
    Fatal(String),
}

/// Errors reported by the cluster collaborator.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("cluster API error: {0}")]
    Api(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}
