// ABOUTME: Session management: registry, per-session state and the upstream session API
// Provides session lifecycle on top of the docker orchestration layer

pub mod active;
pub mod error;
pub mod registry;
pub mod service;
pub mod workspace;

pub use active::ActiveSession;
pub use error::SessionError;
pub use registry::{SandboxRef, SessionRegistry};
pub use service::SessionService;
pub use workspace::Workspace;
