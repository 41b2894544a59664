// ABOUTME: A live session: its sandbox handle, workspace and serialized control-file writer
// All writes to a session's control file go through one async mutex held across the exec

use super::workspace::Workspace;
use super::SessionError;
use crate::docker::{SandboxHandle, SandboxOrchestrator};
use crate::models::{Session, SessionId, SessionProfile, SessionState};
use crate::protocol::CommandRecord;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct ControlState {
    state: SessionState,
    records_delivered: u64,
    last_activity: DateTime<Utc>,
    uploaded: BTreeSet<String>,
    workspace: Option<Workspace>,
}

#[derive(Debug)]
pub struct ActiveSession {
    id: SessionId,
    profile: SessionProfile,
    handle: SandboxHandle,
    workspace_dir: PathBuf,
    created_at: DateTime<Utc>,
    control: Mutex<ControlState>,
}

impl ActiveSession {
    pub fn new(id: SessionId, profile: SessionProfile, handle: SandboxHandle, workspace: Workspace) -> Self {
        let now = Utc::now();
        Self {
            id,
            profile,
            handle,
            workspace_dir: workspace.path().to_path_buf(),
            created_at: now,
            control: Mutex::new(ControlState {
                state: SessionState::Created,
                records_delivered: 0,
                last_activity: now,
                uploaded: BTreeSet::new(),
                workspace: Some(workspace),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn profile(&self) -> SessionProfile {
        self.profile
    }

    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub async fn state(&self) -> SessionState {
        self.control.lock().await.state
    }

    pub(crate) async fn activate(&self) {
        let mut control = self.control.lock().await;
        if control.state == SessionState::Created {
            control.state = SessionState::Running;
            control.last_activity = Utc::now();
        }
    }

    pub async fn has_uploaded(&self, filename: &str) -> bool {
        self.control.lock().await.uploaded.contains(filename)
    }

    /// Append `records` to this session's control file.
    ///
    /// The control lock is held until every exec of the batch has completed,
    /// so a second command for the same session cannot reach the sandbox
    /// before this one has been written.
    pub async fn deliver(
        &self,
        orchestrator: &SandboxOrchestrator,
        records: &[CommandRecord],
    ) -> Result<(), SessionError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut control = self.control.lock().await;
        if control.state.is_terminated() {
            return Err(SessionError::Terminated(self.id));
        }

        for command in orchestrator.encoder().append(records) {
            orchestrator
                .exec_one_shot(&self.handle, &command)
                .await
                .map_err(|source| SessionError::Exec {
                    container: self.handle.name().to_string(),
                    source,
                })?;
        }

        for record in records {
            if let CommandRecord::Upsert { filename, .. } = record {
                control.uploaded.insert(filename.clone());
            }
        }
        control.records_delivered += records.len() as u64;
        control.last_activity = Utc::now();
        debug!(
            "Session {} delivered {} records ({} total)",
            self.id,
            records.len(),
            control.records_delivered
        );
        Ok(())
    }

    /// Mark the session terminated, tear down its sandbox and delete its workspace.
    ///
    /// Idempotent; once this returns no further command is accepted, even if
    /// the sandbox teardown itself failed.
    pub async fn terminate(&self, orchestrator: &SandboxOrchestrator) -> Result<(), SessionError> {
        let mut control = self.control.lock().await;
        if control.state.is_terminated() {
            return Ok(());
        }
        control.state = SessionState::Terminated;
        control.last_activity = Utc::now();
        info!("Terminating session {} (sandbox {})", self.id, self.handle.name());

        let result = orchestrator.teardown(&self.handle).await;
        if let Some(workspace) = control.workspace.take() {
            workspace.close();
        }

        result.map_err(|source| {
            warn!("Teardown of sandbox {} failed: {}", self.handle.name(), source);
            SessionError::Exec {
                container: self.handle.name().to_string(),
                source,
            }
        })
    }

    pub async fn snapshot(&self) -> Session {
        let control = self.control.lock().await;
        Session {
            id: self.id,
            profile: self.profile,
            workspace_dir: self.workspace_dir.clone(),
            container_id: self.handle.id().to_string(),
            container_name: self.handle.name().to_string(),
            state: control.state,
            records_delivered: control.records_delivered,
            created_at: self.created_at,
            last_activity: control.last_activity,
        }
    }
}
