// ABOUTME: Session service exposing the upstream API: start, upsert, run, input and output
// Resolves sessions through the registry and drives the orchestrator and output relay

use super::active::ActiveSession;
use super::registry::SessionRegistry;
use super::workspace::Workspace;
use super::SessionError;
use crate::config::AppConfig;
use crate::docker::{ContainerError, ContainerManager, OutputRelay, OutputSubscription, SandboxEngine, SandboxOrchestrator};
use crate::models::{Session, SessionId, SessionProfile};
use crate::protocol::{CommandRecord, FileRecord};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct SessionService {
    registry: SessionRegistry,
    orchestrator: SandboxOrchestrator,
    relay: OutputRelay,
    workspace_root: PathBuf,
}

impl SessionService {
    pub fn new(engine: Arc<dyn SandboxEngine>, config: &AppConfig) -> Self {
        Self {
            registry: SessionRegistry::new(),
            orchestrator: SandboxOrchestrator::new(Arc::clone(&engine), config),
            relay: OutputRelay::new(engine),
            workspace_root: config.workspace_root.clone(),
        }
    }

    /// Service backed by the local Docker daemon.
    pub async fn connect(config: &AppConfig) -> Result<Self, ContainerError> {
        let manager = ContainerManager::new(config).await?;
        Ok(Self::new(Arc::new(manager), config))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Provision a sandbox for a new session and register it.
    ///
    /// Nothing is registered unless the sandbox is up; on failure the
    /// workspace directory is removed again.
    pub async fn start_session(&self, profile: SessionProfile) -> Result<SessionId, SessionError> {
        let id = self.registry.create();
        let workspace = Workspace::create(&self.workspace_root, id)?;

        let handle = match self.orchestrator.provision(id, profile, workspace.path()).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to provision sandbox for session {}: {}", id, e);
                workspace.close();
                return Err(SessionError::Provision(e));
            }
        };

        let session = Arc::new(ActiveSession::new(id, profile, handle, workspace));
        if let Err(e) = self.registry.register(id, Arc::clone(&session)).await {
            if let Err(teardown) = session.terminate(&self.orchestrator).await {
                warn!("Failed to tear down unregistered session {}: {}", id, teardown);
            }
            return Err(e);
        }

        info!("Started {} session {}", profile, id);
        Ok(id)
    }

    /// Upload files, given as (filename, transport-encoded content) pairs.
    ///
    /// Every file is validated before anything is sent; the whole batch is
    /// delivered with a single exec, in iteration order.
    pub async fn upsert_files<I, K, V>(&self, id: SessionId, files: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let records = files
            .into_iter()
            .map(|(filename, content)| FileRecord::new(filename, content).map(CommandRecord::from))
            .collect::<Result<Vec<_>, _>>()?;

        let session = self.registry.resolve(id).await?;
        session.deliver(&self.orchestrator, &records).await
    }

    /// Upload one file from raw bytes, encoded as the session's profile expects.
    pub async fn upsert_file_bytes(
        &self,
        id: SessionId,
        filename: impl Into<String>,
        bytes: &[u8],
    ) -> Result<(), SessionError> {
        let session = self.registry.resolve(id).await?;
        let file = FileRecord::from_bytes(filename, bytes, session.profile().payload_encoding())?;
        session.deliver(&self.orchestrator, &[file.into()]).await
    }

    pub async fn start_program(&self, id: SessionId) -> Result<(), SessionError> {
        let session = self.registry.resolve(id).await?;
        let entry_file = session.profile().entry_file();
        if !session.has_uploaded(entry_file).await {
            warn!("Starting session {} before {} was uploaded", id, entry_file);
        }
        session.deliver(&self.orchestrator, &[CommandRecord::run()]).await
    }

    pub async fn send_input(&self, id: SessionId, text: impl Into<String>) -> Result<(), SessionError> {
        let record = CommandRecord::input(text)?;
        let session = self.registry.resolve(id).await?;
        session.deliver(&self.orchestrator, &[record]).await
    }

    /// Attach to a session's output as a cancellable stream.
    pub async fn output_stream(&self, id: SessionId) -> Result<OutputSubscription, SessionError> {
        let session = self.registry.resolve(id).await?;
        if session.state().await.is_terminated() {
            return Err(SessionError::Terminated(id));
        }
        self.relay
            .attach(id, session.handle())
            .await
            .map_err(SessionError::Stream)
    }

    /// Call `on_data` for every output chunk until the session's output ends.
    ///
    /// Returns the number of chunks delivered.
    pub async fn subscribe_output<F>(&self, id: SessionId, on_data: F) -> Result<usize, SessionError>
    where
        F: FnMut(String),
    {
        let subscription = self.output_stream(id).await?;
        Ok(subscription.for_each_text(on_data).await)
    }

    pub async fn session(&self, id: SessionId) -> Result<Session, SessionError> {
        Ok(self.registry.resolve(id).await?.snapshot().await)
    }

    pub async fn sessions(&self) -> Vec<Session> {
        let mut sessions = Vec::new();
        for id in self.registry.ids().await {
            if let Ok(session) = self.registry.resolve(id).await {
                sessions.push(session.snapshot().await);
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Remove a session from the registry and tear its sandbox down.
    pub async fn terminate_session(&self, id: SessionId) -> Result<(), SessionError> {
        let session = self
            .registry
            .remove(id)
            .await
            .ok_or(SessionError::UnknownSession(id))?;
        session.terminate(&self.orchestrator).await
    }

    /// Terminate every session; returns how many were torn down cleanly.
    pub async fn shutdown(&self) -> usize {
        let sessions = self.registry.drain().await;
        info!("Shutting down {} sessions", sessions.len());

        let mut clean = 0;
        for session in sessions {
            match session.terminate(&self.orchestrator).await {
                Ok(()) => clean += 1,
                Err(e) => warn!("Failed to terminate session {}: {}", session.id(), e),
            }
        }
        clean
    }
}
