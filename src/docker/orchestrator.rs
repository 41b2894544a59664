// ABOUTME: Sandbox orchestration: provisioning sandboxes for sessions and running one-shot commands
// Each exec is awaited to completion before returning, which is what orders a session's commands

use super::engine::{SandboxEngine, SandboxHandle, SandboxSpec};
use super::container_manager::{ContainerError, LABEL_MANAGED, LABEL_SESSION_ID};
use crate::config::AppConfig;
use crate::models::{SessionId, SessionProfile};
use crate::protocol::{CommandEncoder, ShellCommand};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SandboxOrchestrator {
    engine: Arc<dyn SandboxEngine>,
    encoder: CommandEncoder,
    config: AppConfig,
}

impl SandboxOrchestrator {
    pub fn new(engine: Arc<dyn SandboxEngine>, config: &AppConfig) -> Self {
        Self {
            engine,
            encoder: CommandEncoder::new(config.control_file.clone()),
            config: config.clone(),
        }
    }

    pub fn encoder(&self) -> &CommandEncoder {
        &self.encoder
    }

    /// Build the engine request for a session's sandbox.
    pub fn sandbox_spec(&self, session_id: SessionId, profile: SessionProfile, workspace: &Path) -> SandboxSpec {
        let mut labels = HashMap::new();
        labels.insert(LABEL_SESSION_ID.to_string(), session_id.to_string());
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert("code-box-profile".to_string(), profile.name().to_string());

        SandboxSpec {
            name: format!("code-box-session-{}", session_id),
            image: self.config.image_for(profile),
            command: self.config.listener_command.clone(),
            workspace_source: workspace.to_path_buf(),
            workspace_target: self.config.mount_point.clone(),
            runtime: self.config.runtime.engine_runtime().map(str::to_string),
            labels,
        }
    }

    /// Create and start a sandbox, then give its listener an empty control file.
    ///
    /// A sandbox that was created but failed to come up is removed before the
    /// error is returned, so a failed provision leaves nothing behind.
    pub async fn provision(
        &self,
        session_id: SessionId,
        profile: SessionProfile,
        workspace: &Path,
    ) -> Result<SandboxHandle, ContainerError> {
        let spec = self.sandbox_spec(session_id, profile, workspace);
        info!(
            "Provisioning {} sandbox for session {} (image: {}, runtime: {:?})",
            profile, session_id, spec.image, self.config.runtime
        );

        let handle = self.engine.create_sandbox(&spec).await?;

        let ready = match self.engine.start_sandbox(&handle).await {
            Ok(()) => self.exec_one_shot(&handle, &self.encoder.reset()).await,
            Err(e) => Err(e),
        };

        if let Err(e) = ready {
            warn!("Sandbox {} failed to start: {}", handle.name(), e);
            if let Err(cleanup) = self.engine.remove_sandbox(&handle).await {
                warn!("Failed to remove sandbox {} after failed start: {}", handle.name(), cleanup);
            }
            return Err(e);
        }

        info!("Sandbox {} ready for session {}", handle.name(), session_id);
        Ok(handle)
    }

    /// Run one command inside the sandbox and wait for it to finish.
    pub async fn exec_one_shot(&self, handle: &SandboxHandle, command: &ShellCommand) -> Result<(), ContainerError> {
        debug!(
            "Exec in {} ({:?}, {} records)",
            handle.name(),
            command.mode(),
            command.record_count()
        );
        self.engine.exec(handle, command.to_argv()).await?;
        Ok(())
    }

    /// Stop and remove a sandbox; either step tolerates an already-gone container.
    pub async fn teardown(&self, handle: &SandboxHandle) -> Result<(), ContainerError> {
        match self.engine.stop_sandbox(handle).await {
            Ok(()) | Err(ContainerError::NotFound(_)) => {}
            Err(e) => warn!("Failed to stop sandbox {}: {}", handle.name(), e),
        }
        match self.engine.remove_sandbox(handle).await {
            Ok(()) | Err(ContainerError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::engine::{ExecOutcome, MockSandboxEngine};
    use crate::models::IsolationRuntime;
    use mockall::Sequence;

    fn orchestrator(engine: MockSandboxEngine) -> SandboxOrchestrator {
        SandboxOrchestrator::new(Arc::new(engine), &AppConfig::default())
    }

    #[test]
    fn test_spec_mounts_workspace_and_selects_runtime() {
        let config = AppConfig {
            runtime: IsolationRuntime::Gvisor,
            ..AppConfig::default()
        };
        let orchestrator = SandboxOrchestrator::new(Arc::new(MockSandboxEngine::new()), &config);
        let id = SessionId::new();

        let spec = orchestrator.sandbox_spec(id, SessionProfile::Python, Path::new("/tmp/ws"));

        assert_eq!(spec.name, format!("code-box-session-{}", id));
        assert_eq!(spec.image, "code-box/python:latest");
        assert_eq!(spec.workspace_target, "/app");
        assert_eq!(spec.workspace_source, Path::new("/tmp/ws"));
        assert_eq!(spec.runtime.as_deref(), Some("runsc"));
        assert_eq!(spec.labels.get(LABEL_SESSION_ID), Some(&id.to_string()));
    }

    #[tokio::test]
    async fn test_provision_starts_then_resets_control_file() {
        let mut engine = MockSandboxEngine::new();
        let mut seq = Sequence::new();
        engine
            .expect_create_sandbox()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|spec| Ok(SandboxHandle::new("c1", spec.name.clone())));
        engine
            .expect_start_sandbox()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        engine
            .expect_exec()
            .withf(|_, argv| argv.len() == 3 && argv[2].starts_with(": > "))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(ExecOutcome::default()));
        engine.expect_remove_sandbox().never();

        let handle = orchestrator(engine)
            .provision(SessionId::new(), SessionProfile::Python, Path::new("/tmp/ws"))
            .await
            .unwrap();
        assert_eq!(handle.id(), "c1");
    }

    #[tokio::test]
    async fn test_failed_start_removes_the_created_sandbox() {
        let mut engine = MockSandboxEngine::new();
        engine
            .expect_create_sandbox()
            .returning(|spec| Ok(SandboxHandle::new("c1", spec.name.clone())));
        engine
            .expect_start_sandbox()
            .returning(|_| Err(ContainerError::OperationFailed("runtime runsc not installed".into())));
        engine.expect_exec().never();
        engine
            .expect_remove_sandbox()
            .times(1)
            .returning(|_| Ok(()));

        let result = orchestrator(engine)
            .provision(SessionId::new(), SessionProfile::Python, Path::new("/tmp/ws"))
            .await;
        assert!(matches!(result, Err(ContainerError::OperationFailed(_))));
    }

    #[tokio::test]
    async fn test_teardown_tolerates_missing_container() {
        let mut engine = MockSandboxEngine::new();
        engine
            .expect_stop_sandbox()
            .returning(|h| Err(ContainerError::NotFound(h.id().to_string())));
        engine
            .expect_remove_sandbox()
            .returning(|h| Err(ContainerError::NotFound(h.id().to_string())));

        let handle = SandboxHandle::new("gone", "code-box-session-gone");
        assert!(orchestrator(engine).teardown(&handle).await.is_ok());
    }
}
