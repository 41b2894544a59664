// ABOUTME: Library crate for code-in-a-box exposing the session API for embedding and testing

pub mod config;
pub mod docker;
pub mod models;
pub mod protocol;
pub mod session;

pub use config::AppConfig;
pub use docker::{OutputChunk, OutputSubscription, SandboxEngine};
pub use models::{Session, SessionId, SessionProfile, SessionState};
pub use protocol::{CommandRecord, FileRecord};
pub use session::{SessionError, SessionService};
