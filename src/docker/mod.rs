// ABOUTME: Docker integration for provisioning sandboxes, exec'ing commands and relaying output

pub mod container_manager;
pub mod engine;
pub mod orchestrator;
pub mod output_relay;

pub use container_manager::{ContainerError, ContainerManager};
pub use engine::{
    ExecOutcome, RawOutput, RawOutputStream, SandboxEngine, SandboxHandle, SandboxSpec, StreamKind,
};
pub use orchestrator::SandboxOrchestrator;
pub use output_relay::{OutputChunk, OutputRelay, OutputSubscription};
