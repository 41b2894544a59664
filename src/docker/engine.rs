// ABOUTME: Engine boundary consumed by the orchestrator and output relay
// Abstracts create/start/exec/attach/stop/remove so Docker can be swapped for a fake in tests

use super::ContainerError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::path::PathBuf;

/// Opaque reference to one running sandbox.
///
/// Not `Clone`: the session registry owns the only handle and
/// everything else borrows it for the duration of a call.
#[derive(Debug, PartialEq, Eq)]
pub struct SandboxHandle {
    id: String,
    name: String,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Everything the engine needs to create a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    /// Long-lived listener process
    pub command: Vec<String>,
    pub workspace_source: PathBuf,
    pub workspace_target: String,
    /// `None` keeps the engine's default runtime
    pub runtime: Option<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub output: Vec<u8>,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Combined stream of a tty-attached container
    Console,
}

/// One raw frame read from a sandbox's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    pub kind: StreamKind,
    pub data: Vec<u8>,
}

pub type RawOutputStream = BoxStream<'static, Result<RawOutput, ContainerError>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    /// Create (but do not start) a sandbox.
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle, ContainerError>;

    async fn start_sandbox(&self, handle: &SandboxHandle) -> Result<(), ContainerError>;

    /// Run a command to completion inside a running sandbox.
    async fn exec(&self, handle: &SandboxHandle, command: Vec<String>) -> Result<ExecOutcome, ContainerError>;

    /// Attach to the combined stdout/stderr of the sandbox's main process.
    async fn attach_output(&self, handle: &SandboxHandle) -> Result<RawOutputStream, ContainerError>;

    async fn stop_sandbox(&self, handle: &SandboxHandle) -> Result<(), ContainerError>;

    async fn remove_sandbox(&self, handle: &SandboxHandle) -> Result<(), ContainerError>;
}
