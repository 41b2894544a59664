// ABOUTME: Core data models for code-in-a-box sessions and sandbox profiles

pub mod profile;
pub mod session;

pub use profile::{IsolationRuntime, PayloadEncoding, SessionProfile};
pub use session::{Session, SessionId, SessionState};
