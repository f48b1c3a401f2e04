//! tether-manager: typed client surface of the in-cluster traffic manager
//!
//! The transport (gRPC over a port-forward) is supplied by a collaborator as
//! an implementation of [`api::ManagerApi`]; [`client::ManagerClient`] wraps
//! it with version handling and compatibility fallbacks.

pub mod api;
pub mod client;

pub use api::{CallOptions, ManagerApi};
pub use client::{ManagerClient, ManagerVersion};
