//! tether-core: shared types, configuration and errors for the tether
//! session core
//!
//! This crate provides the domain types, the recognized client configuration
//! options, the error taxonomy, the session identity cache, and the cluster
//! collaborator trait used by the manager client and the session supervisor.

pub mod annotations;
pub mod cache;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use cache::{SessionCache, SessionRecord};
pub use config::ClientConfig;
pub use error::{CategorizedError, ConnectError, ConnectErrorKind, ErrorCategory, SessionError};
pub use types::{DaemonIdentifier, SessionRef, WorkloadKind, WorkloadState};
