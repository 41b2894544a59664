// ABOUTME: In-memory sandbox engine for integration tests
// Interprets the control-file scripts the encoder produces so tests can read what a listener would see

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use code_box::config::AppConfig;
use code_box::docker::{
    ContainerError, ExecOutcome, RawOutput, RawOutputStream, SandboxEngine, SandboxHandle, SandboxSpec, StreamKind,
};
use code_box::protocol::DEFAULT_CONTROL_FILE;
use code_box::SessionService;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Linux `MAX_ARG_STRLEN`: no single exec argument may be longer.
const MAX_ARG_BYTES: usize = 128 * 1024;

type OutputSender = mpsc::UnboundedSender<Result<RawOutput, ContainerError>>;
type OutputReceiver = mpsc::UnboundedReceiver<Result<RawOutput, ContainerError>>;

struct FakeSandbox {
    spec: SandboxSpec,
    running: bool,
    files: HashMap<String, Vec<u8>>,
    output_tx: Option<OutputSender>,
    output_rx: Option<OutputReceiver>,
}

#[derive(Default)]
pub struct FakeEngine {
    sandboxes: Mutex<HashMap<String, FakeSandbox>>,
    removed: Mutex<Vec<String>>,
    scripts: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    fail_create: bool,
    fail_start: bool,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_create() -> Arc<Self> {
        Arc::new(Self {
            fail_create: true,
            ..Self::default()
        })
    }

    pub fn failing_start() -> Arc<Self> {
        Arc::new(Self {
            fail_start: true,
            ..Self::default()
        })
    }

    /// Lines currently in a sandbox's control file.
    pub fn control_lines(&self, container_id: &str) -> Vec<String> {
        let sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes.get(container_id).expect("unknown container");
        let control = sandbox.files.get(DEFAULT_CONTROL_FILE).cloned().unwrap_or_default();
        String::from_utf8(control)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn spec(&self, container_id: &str) -> SandboxSpec {
        self.sandboxes.lock().unwrap()[container_id].spec.clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    pub fn sandbox_count(&self) -> usize {
        self.sandboxes.lock().unwrap().len()
    }

    pub fn was_removed(&self, container_id: &str) -> bool {
        self.removed.lock().unwrap().iter().any(|id| id == container_id)
    }

    /// Make the sandbox's main process print `text`.
    pub fn emit(&self, container_id: &str, kind: StreamKind, text: &str) {
        let sandboxes = self.sandboxes.lock().unwrap();
        if let Some(tx) = &sandboxes[container_id].output_tx {
            let _ = tx.send(Ok(RawOutput {
                kind,
                data: text.as_bytes().to_vec(),
            }));
        }
    }

    /// Break the output stream with an engine error.
    pub fn break_output(&self, container_id: &str) {
        let sandboxes = self.sandboxes.lock().unwrap();
        if let Some(tx) = &sandboxes[container_id].output_tx {
            let _ = tx.send(Err(ContainerError::OperationFailed("connection reset".to_string())));
        }
    }

    /// End the sandbox's output stream, as when its main process exits.
    pub fn close_output(&self, container_id: &str) {
        self.sandboxes.lock().unwrap().get_mut(container_id).unwrap().output_tx = None;
    }

    /// Simulate the sandbox dying underneath a live session.
    pub fn crash(&self, container_id: &str) {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes.get_mut(container_id).unwrap();
        sandbox.running = false;
        sandbox.output_tx = None;
    }

    pub fn file_exists(&self, container_id: &str, path: &str) -> bool {
        self.sandboxes.lock().unwrap()[container_id].files.contains_key(path)
    }

    fn with_file<T>(&self, container_id: &str, path: &str, f: impl FnOnce(&mut Vec<u8>) -> T) -> Result<T, ContainerError> {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes
            .get_mut(container_id)
            .ok_or_else(|| ContainerError::NotFound(container_id.to_string()))?;
        Ok(f(sandbox.files.entry(path.to_string()).or_default()))
    }

    fn take_file(&self, container_id: &str, path: &str) -> Option<Vec<u8>> {
        self.sandboxes.lock().unwrap().get_mut(container_id)?.files.remove(path)
    }

    /// Append in two halves with a suspension point between them, so two
    /// overlapping execs against one sandbox would visibly interleave.
    async fn append_slowly(&self, container_id: &str, path: &str, bytes: &[u8]) -> Result<(), ContainerError> {
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        self.with_file(container_id, path, |file| file.extend_from_slice(head))?;
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        self.with_file(container_id, path, |file| file.extend_from_slice(tail))
    }

    fn check_running(&self, container_id: &str) -> Result<(), ContainerError> {
        match self.sandboxes.lock().unwrap().get(container_id) {
            None => Err(ContainerError::NotFound(container_id.to_string())),
            Some(sandbox) if !sandbox.running => Err(ContainerError::NotRunning(container_id.to_string())),
            Some(_) => Ok(()),
        }
    }
}

/// Contents of a single-quoted word with no embedded quotes.
fn unquote(word: &str) -> Option<&str> {
    word.strip_prefix('\'')?.strip_suffix('\'')
}

enum Script {
    Truncate { path: String },
    Decode { payload: Vec<u8>, append: bool, path: String },
    Concat { from: String, to: String },
}

/// Parse the scripts the encoder produces:
/// `: > 'p'`, `printf '%s' '<b64>' | base64 -d >[>] 'p'` and
/// `cat 's' >> 'p' && rm -f 's'`.
fn parse_script(script: &str) -> Option<Script> {
    if let Some(path) = script.strip_prefix(": > ") {
        return Some(Script::Truncate {
            path: unquote(path)?.to_string(),
        });
    }
    if let Some(rest) = script.strip_prefix("printf '%s' '") {
        let (encoded, tail) = rest.split_once('\'')?;
        let tail = tail.strip_prefix(" | base64 -d ")?;
        let (append, path) = match tail.strip_prefix(">> ") {
            Some(path) => (true, path),
            None => (false, tail.strip_prefix("> ")?),
        };
        return Some(Script::Decode {
            payload: STANDARD.decode(encoded).ok()?,
            append,
            path: unquote(path)?.to_string(),
        });
    }
    let rest = script.strip_prefix("cat ")?;
    let (from, rest) = rest.split_once(" >> ")?;
    let (to, cleanup) = rest.split_once(" && rm -f ")?;
    if cleanup != from {
        return None;
    }
    Some(Script::Concat {
        from: unquote(from)?.to_string(),
        to: unquote(to)?.to_string(),
    })
}

#[async_trait]
impl SandboxEngine for FakeEngine {
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle, ContainerError> {
        if self.fail_create {
            return Err(ContainerError::OperationFailed(format!("image {} not found", spec.image)));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        self.sandboxes.lock().unwrap().insert(
            id.clone(),
            FakeSandbox {
                spec: spec.clone(),
                running: false,
                files: HashMap::new(),
                output_tx: Some(tx),
                output_rx: Some(rx),
            },
        );
        Ok(SandboxHandle::new(id, spec.name.clone()))
    }

    async fn start_sandbox(&self, handle: &SandboxHandle) -> Result<(), ContainerError> {
        if self.fail_start {
            return Err(ContainerError::OperationFailed("unknown runtime".to_string()));
        }
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes
            .get_mut(handle.id())
            .ok_or_else(|| ContainerError::NotFound(handle.id().to_string()))?;
        sandbox.running = true;
        Ok(())
    }

    async fn exec(&self, handle: &SandboxHandle, command: Vec<String>) -> Result<ExecOutcome, ContainerError> {
        self.check_running(handle.id())?;
        assert_eq!(command[..2], ["sh".to_string(), "-c".to_string()], "commands go through sh -c");
        let script = command[2].clone();
        if script.len() > MAX_ARG_BYTES {
            return Err(ContainerError::OperationFailed(format!(
                "exec: argument list too long ({} bytes)",
                script.len()
            )));
        }
        self.scripts.lock().unwrap().push(script.clone());

        let parsed = parse_script(&script).ok_or_else(|| ContainerError::ExecFailed {
            exit_code: 2,
            output: format!("sh: unexpected script {}", script),
        })?;

        match parsed {
            Script::Truncate { path } => {
                self.with_file(handle.id(), &path, Vec::clear)?;
            }
            Script::Decode { payload, append, path } => {
                if !append {
                    self.with_file(handle.id(), &path, Vec::clear)?;
                }
                self.append_slowly(handle.id(), &path, &payload).await?;
            }
            Script::Concat { from, to } => {
                let staged = self.take_file(handle.id(), &from).ok_or_else(|| ContainerError::ExecFailed {
                    exit_code: 1,
                    output: format!("cat: {}: No such file or directory", from),
                })?;
                self.append_slowly(handle.id(), &to, &staged).await?;
            }
        }

        Ok(ExecOutcome::default())
    }

    async fn attach_output(&self, handle: &SandboxHandle) -> Result<RawOutputStream, ContainerError> {
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes
            .get_mut(handle.id())
            .ok_or_else(|| ContainerError::NotFound(handle.id().to_string()))?;
        let rx = sandbox
            .output_rx
            .take()
            .ok_or_else(|| ContainerError::OperationFailed("already attached".to_string()))?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn stop_sandbox(&self, handle: &SandboxHandle) -> Result<(), ContainerError> {
        if let Some(sandbox) = self.sandboxes.lock().unwrap().get_mut(handle.id()) {
            sandbox.running = false;
            sandbox.output_tx = None;
        }
        Ok(())
    }

    async fn remove_sandbox(&self, handle: &SandboxHandle) -> Result<(), ContainerError> {
        self.removed.lock().unwrap().push(handle.id().to_string());
        Ok(())
    }
}

pub struct Harness {
    pub engine: Arc<FakeEngine>,
    pub service: Arc<SessionService>,
    pub root: TempDir,
}

impl Harness {
    pub fn with_engine(engine: Arc<FakeEngine>) -> Self {
        let root = TempDir::new().unwrap();
        let config = AppConfig {
            workspace_root: root.path().to_path_buf(),
            ..AppConfig::default()
        };
        let service = Arc::new(SessionService::new(engine.clone(), &config));
        Self { engine, service, root }
    }

    pub fn new() -> Self {
        Self::with_engine(FakeEngine::new())
    }

    pub async fn container_id(&self, id: code_box::SessionId) -> String {
        self.service.session(id).await.unwrap().container_id
    }

    pub fn workspace_count(&self) -> usize {
        std::fs::read_dir(self.root.path()).map(|dir| dir.count()).unwrap_or(0)
    }
}
