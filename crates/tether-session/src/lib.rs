//! tether-session: the user daemon's session core
//!
//! The long-lived [`session::Session`] negotiates and maintains membership
//! in the cluster's traffic manager, materializes a namespace-partitioned
//! view of workloads and their intercept state, fans it out to subscribers
//! under consistent snapshot semantics, supervises the session's long-lived
//! tasks, and mediates a paired lifecycle with the privileged root daemon.
//!
//! Everything that touches the outside world (the manager transport, the
//! Kubernetes API, the root daemon endpoint, the forward pumps) is a
//! supplied collaborator; see [`connect::Collaborators`].

pub mod configwatch;
pub mod connect;
pub mod forward;
pub mod registry;
pub mod rootd;
pub mod session;
pub mod tasks;
pub mod testing;
pub mod workloads;

mod remain;

pub use connect::{Collaborators, ConnectInfo, ConnectInfoError, ConnectRequest};
pub use session::{Session, SessionBehavior, UninstallRequest};
pub use workloads::{SnapshotFilter, WorkloadInfo, WorkloadView};
