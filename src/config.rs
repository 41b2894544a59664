// ABOUTME: Application configuration loaded from a TOML file with environment overrides
// Selects the isolation runtime, sandbox images, workspace root and listener wiring

use crate::models::{IsolationRuntime, SessionProfile};
use crate::protocol::DEFAULT_CONTROL_FILE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const ENV_RUNTIME: &str = "CODE_BOX_RUNTIME";
pub const ENV_IMAGE: &str = "CODE_BOX_IMAGE";
pub const ENV_WORKSPACE_ROOT: &str = "CODE_BOX_WORKSPACE_ROOT";
pub const ENV_CONTROL_FILE: &str = "CODE_BOX_CONTROL_FILE";
pub const ENV_DOCKER_HOST: &str = "DOCKER_HOST";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub runtime: IsolationRuntime,
    /// Forces one image for every profile when set
    pub image: Option<String>,
    /// Per-profile image overrides, keyed by profile name
    pub images: HashMap<String, String>,
    pub workspace_root: PathBuf,
    pub mount_point: String,
    pub control_file: String,
    pub listener_command: Vec<String>,
    pub docker: DockerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub host: Option<String>,
    /// Seconds to wait for a sandbox to stop before it is killed
    pub stop_timeout: i64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            stop_timeout: 10,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime: IsolationRuntime::Default,
            image: None,
            images: HashMap::new(),
            workspace_root: std::env::temp_dir().join("code-box").join("workspaces"),
            mount_point: "/app".to_string(),
            control_file: DEFAULT_CONTROL_FILE.to_string(),
            listener_command: vec!["/usr/local/bin/code-box-listener".to_string()],
            docker: DockerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load the user config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::load_from_file(&path)?,
            _ => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("code-box").join("config.toml"))
    }

    /// Apply `CODE_BOX_*` and `DOCKER_HOST` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(runtime) = lookup(ENV_RUNTIME) {
            self.runtime = runtime
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .with_context(|| format!("Invalid {}", ENV_RUNTIME))?;
        }
        if let Some(image) = lookup(ENV_IMAGE).filter(|s| !s.is_empty()) {
            self.image = Some(image);
        }
        if let Some(root) = lookup(ENV_WORKSPACE_ROOT).filter(|s| !s.is_empty()) {
            self.workspace_root = PathBuf::from(root);
        }
        if let Some(control_file) = lookup(ENV_CONTROL_FILE).filter(|s| !s.is_empty()) {
            self.control_file = control_file;
        }
        if let Some(host) = lookup(ENV_DOCKER_HOST).filter(|s| !s.is_empty()) {
            self.docker.host = Some(host);
        }
        Ok(())
    }

    /// Image a new sandbox for `profile` is created from.
    pub fn image_for(&self, profile: SessionProfile) -> String {
        self.image
            .clone()
            .or_else(|| self.images.get(profile.name()).cloned())
            .unwrap_or_else(|| profile.default_image().to_string())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
