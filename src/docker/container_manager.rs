// ABOUTME: Docker engine implementation using Bollard for creating, exec'ing and attaching to sandboxes
// Connects to the local daemon the same way the docker CLI would and labels every sandbox it owns

use super::engine::{
    ExecOutcome, RawOutput, RawOutputStream, SandboxEngine, SandboxHandle, SandboxSpec, StreamKind,
};
use crate::config::AppConfig;
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{HostConfig, HostConfigLogConfig, Mount, MountTypeEnum};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const LABEL_SESSION_ID: &str = "code-box-session-id";
pub const LABEL_MANAGED: &str = "code-box-managed";

const CONNECT_TIMEOUT_SECS: u64 = 120;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Docker connection error: {0}")]
    Connection(#[from] bollard::errors::Error),
    #[error("Container not found: {0}")]
    NotFound(String),
    #[error("Container is not running: {0}")]
    NotRunning(String),
    #[error("Container already exists: {0}")]
    AlreadyExists(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Container operation failed: {0}")]
    OperationFailed(String),
    #[error("Command exited with status {exit_code}: {output}")]
    ExecFailed { exit_code: i64, output: String },
}

impl ContainerError {
    /// Map daemon status codes onto the variants callers branch on.
    fn classify(error: bollard::errors::Error, container: &str) -> Self {
        match error {
            bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                ContainerError::NotFound(container.to_string())
            }
            bollard::errors::Error::DockerResponseServerError { status_code: 409, .. } => {
                ContainerError::NotRunning(container.to_string())
            }
            other => ContainerError::Connection(other),
        }
    }
}

pub struct ContainerManager {
    docker: Docker,
    stop_timeout: i64,
}

impl ContainerManager {
    pub async fn new(config: &AppConfig) -> Result<Self, ContainerError> {
        let docker = Self::connect_to_docker(config.docker.host.as_deref())?;

        // Test the connection
        docker.ping().await?;

        info!("Successfully connected to Docker daemon");
        Ok(Self {
            docker,
            stop_timeout: config.docker.stop_timeout,
        })
    }

    fn connect_to_docker(configured_host: Option<&str>) -> Result<Docker, ContainerError> {
        if let Some(host) = configured_host {
            info!("Using Docker host from config: {}", host);
            match Self::connect_to_host(host) {
                Ok(docker) => return Ok(docker),
                Err(e) => warn!("Failed to connect to configured Docker host {}: {}", host, e),
            }
        }

        for socket_path in Self::get_docker_socket_paths() {
            if std::path::Path::new(&socket_path).exists() {
                info!("Found Docker socket at: {}", socket_path);
                match Docker::connect_with_unix(&socket_path, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION) {
                    Ok(docker) => return Ok(docker),
                    Err(e) => {
                        warn!("Failed to connect to Docker socket {}: {}", socket_path, e);
                        continue;
                    }
                }
            }
        }

        warn!("No Docker socket found, trying default connection");
        Ok(Docker::connect_with_local_defaults()?)
    }

    fn connect_to_host(host: &str) -> Result<Docker, bollard::errors::Error> {
        if let Some(path) = host.strip_prefix("unix://") {
            Docker::connect_with_unix(path, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
        }
    }

    fn get_docker_socket_paths() -> Vec<String> {
        let mut paths = Vec::new();

        if cfg!(target_os = "macos") {
            if let Some(home) = dirs::home_dir() {
                // Docker Desktop, then Colima
                paths.push(home.join(".docker/run/docker.sock").to_string_lossy().to_string());
                paths.push(home.join(".colima/default/docker.sock").to_string_lossy().to_string());
            }
        }

        if cfg!(target_os = "linux") {
            paths.push("/var/run/docker.sock".to_string());

            // Rootless Docker, then Podman
            if let Ok(xdg_runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
                paths.push(format!("{}/docker.sock", xdg_runtime_dir));
                paths.push(format!("{}/podman/podman.sock", xdg_runtime_dir));
            }
        }

        paths
    }

    async fn container_exists(&self, name: &str) -> Result<bool, ContainerError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters: {
                    let mut filters = HashMap::new();
                    filters.insert("name".to_string(), vec![name.to_string()]);
                    filters
                },
                ..Default::default()
            }))
            .await?;

        Ok(!containers.is_empty())
    }

    async fn ensure_image_available(&self, image: &str) -> Result<(), ContainerError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                filters: {
                    let mut filters = HashMap::new();
                    filters.insert("reference".to_string(), vec![image.to_string()]);
                    filters
                },
                ..Default::default()
            }))
            .await?;

        if !images.is_empty() {
            debug!("Image {} already exists locally", image);
            return Ok(());
        }

        info!("Pulling image {}", image);

        let create_image_options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(create_image_options), None, None);

        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                error!("Failed to pull image {}: {}", image, e);
                return Err(ContainerError::OperationFailed(format!("Failed to pull image {}: {}", image, e)));
            }
        }

        info!("Successfully pulled image {}", image);
        Ok(())
    }
}

#[async_trait]
impl SandboxEngine for ContainerManager {
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle, ContainerError> {
        info!("Creating sandbox {} from image {}", spec.name, spec.image);

        if self.container_exists(&spec.name).await? {
            return Err(ContainerError::AlreadyExists(spec.name.clone()));
        }

        self.ensure_image_available(&spec.image).await?;

        let mounts = vec![Mount {
            target: Some(spec.workspace_target.clone()),
            source: Some(spec.workspace_source.to_string_lossy().to_string()),
            typ: Some(MountTypeEnum::BIND),
            read_only: Some(false),
            ..Default::default()
        }];

        let host_config = HostConfig {
            mounts: Some(mounts),
            runtime: spec.runtime.clone(),
            auto_remove: Some(false), // Lifecycle is managed by the session service
            log_config: Some(HostConfigLogConfig {
                typ: Some("json-file".to_string()),
                config: Some({
                    let mut log_config = HashMap::new();
                    log_config.insert("max-size".to_string(), "10m".to_string());
                    log_config.insert("max-file".to_string(), "3".to_string());
                    log_config
                }),
            }),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.workspace_target.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(create_options), container_config)
            .await?;

        for warning in &response.warnings {
            warn!("Docker warning for {}: {}", spec.name, warning);
        }

        info!("Created sandbox {} with ID {}", spec.name, response.id);
        Ok(SandboxHandle::new(response.id, spec.name.clone()))
    }

    async fn start_sandbox(&self, handle: &SandboxHandle) -> Result<(), ContainerError> {
        info!("Starting sandbox {}", handle.id());

        self.docker
            .start_container(handle.id(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ContainerError::classify(e, handle.id()))?;

        info!("Successfully started sandbox {}", handle.id());
        Ok(())
    }

    async fn exec(&self, handle: &SandboxHandle, command: Vec<String>) -> Result<ExecOutcome, ContainerError> {
        debug!("Executing in sandbox {}: {:?}", handle.id(), command);

        let exec_config = CreateExecOptions {
            cmd: Some(command),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(handle.id(), exec_config)
            .await
            .map_err(|e| ContainerError::classify(e, handle.id()))?;

        let mut output = Vec::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ContainerError::classify(e, handle.id()))?
        {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(frame) = stream.next().await {
                    output.extend_from_slice(&raw_from_log_output(frame?).data);
                }
            }
            StartExecResults::Detached => {
                return Err(ContainerError::OperationFailed(
                    "Exec was detached unexpectedly".to_string(),
                ));
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        exec_outcome(inspect.exit_code, output)
    }

    async fn attach_output(&self, handle: &SandboxHandle) -> Result<RawOutputStream, ContainerError> {
        let options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            ..Default::default()
        };

        let attached = self
            .docker
            .attach_container(handle.id(), Some(options))
            .await
            .map_err(|e| ContainerError::classify(e, handle.id()))?;

        debug!("Attached to output of sandbox {}", handle.id());

        Ok(attached
            .output
            .map(|frame| frame.map(raw_from_log_output).map_err(ContainerError::from))
            .boxed())
    }

    async fn stop_sandbox(&self, handle: &SandboxHandle) -> Result<(), ContainerError> {
        info!("Stopping sandbox {}", handle.id());

        let stop_options = StopContainerOptions { t: self.stop_timeout };

        match self.docker.stop_container(handle.id(), Some(stop_options)).await {
            Ok(()) => {
                info!("Successfully stopped sandbox {}", handle.id());
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
                debug!("Sandbox {} was already stopped", handle.id());
                Ok(())
            }
            Err(e) => Err(ContainerError::classify(e, handle.id())),
        }
    }

    async fn remove_sandbox(&self, handle: &SandboxHandle) -> Result<(), ContainerError> {
        info!("Removing sandbox {}", handle.id());

        let remove_options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(handle.id(), Some(remove_options)).await {
            Ok(()) => {
                info!("Successfully removed sandbox {}", handle.id());
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                debug!("Sandbox {} was already removed", handle.id());
                Ok(())
            }
            Err(e) => Err(ContainerError::classify(e, handle.id())),
        }
    }
}

/// Judge a finished exec by its exit status; a missing status is a failure.
fn exec_outcome(exit_code: Option<i64>, output: Vec<u8>) -> Result<ExecOutcome, ContainerError> {
    let Some(exit_code) = exit_code else {
        return Err(ContainerError::OperationFailed(
            "Exec finished without an exit status".to_string(),
        ));
    };

    let outcome = ExecOutcome { exit_code, output };
    if !outcome.success() {
        return Err(ContainerError::ExecFailed {
            exit_code: outcome.exit_code,
            output: String::from_utf8_lossy(&outcome.output).trim_end().to_string(),
        });
    }
    Ok(outcome)
}

fn raw_from_log_output(frame: LogOutput) -> RawOutput {
    let (kind, message) = match frame {
        LogOutput::StdOut { message } => (StreamKind::Stdout, message),
        LogOutput::StdErr { message } => (StreamKind::Stderr, message),
        LogOutput::Console { message } | LogOutput::StdIn { message } => (StreamKind::Console, message),
    };
    RawOutput {
        kind,
        data: message.to_vec(),
    }
}
