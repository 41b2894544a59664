// ABOUTME: Session profiles describing which sandbox image runs a program and how
// Also defines the isolation runtimes and the payload encodings understood by the listener

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How upserted file content is carried inside an `upsert` record.
///
/// This is the contract between the command encoder and the in-sandbox
/// listener: with `Base64` the listener decodes the content field before
/// writing the file, with `Plain` it writes the field verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Plain,
    Base64,
}

/// A kind of program a session can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionProfile {
    Python,
    Node,
    Shell,
}

impl SessionProfile {
    pub const ALL: [SessionProfile; 3] = [Self::Python, Self::Node, Self::Shell];

    pub fn name(&self) -> &'static str {
        match self {
            SessionProfile::Python => "python",
            SessionProfile::Node => "node",
            SessionProfile::Shell => "shell",
        }
    }

    /// Image used when the configuration does not override it.
    pub fn default_image(&self) -> &'static str {
        match self {
            SessionProfile::Python => "code-box/python:latest",
            SessionProfile::Node => "code-box/node:latest",
            SessionProfile::Shell => "code-box/shell:latest",
        }
    }

    /// File the listener executes on `run`.
    pub fn entry_file(&self) -> &'static str {
        match self {
            SessionProfile::Python => "main.py",
            SessionProfile::Node => "main.js",
            SessionProfile::Shell => "main.sh",
        }
    }

    pub fn payload_encoding(&self) -> PayloadEncoding {
        match self {
            SessionProfile::Python | SessionProfile::Node => PayloadEncoding::Base64,
            SessionProfile::Shell => PayloadEncoding::Plain,
        }
    }
}

impl Default for SessionProfile {
    fn default() -> Self {
        SessionProfile::Python
    }
}

impl fmt::Display for SessionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SessionProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(SessionProfile::Python),
            "node" | "js" | "javascript" => Ok(SessionProfile::Node),
            "shell" | "sh" => Ok(SessionProfile::Shell),
            other => Err(format!("unknown session profile '{}'", other)),
        }
    }
}

/// Container runtime used to isolate a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationRuntime {
    /// Whatever the engine is configured with (normally runc)
    Default,
    /// gVisor user-space kernel
    Gvisor,
    /// Kata lightweight VMs
    Kata,
}

impl IsolationRuntime {
    /// Runtime name passed to the engine, `None` keeps the engine default.
    pub fn engine_runtime(&self) -> Option<&'static str> {
        match self {
            IsolationRuntime::Default => None,
            IsolationRuntime::Gvisor => Some("runsc"),
            IsolationRuntime::Kata => Some("kata-runtime"),
        }
    }
}

impl Default for IsolationRuntime {
    fn default() -> Self {
        IsolationRuntime::Default
    }
}

impl FromStr for IsolationRuntime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "default" | "runc" => Ok(IsolationRuntime::Default),
            "gvisor" | "runsc" => Ok(IsolationRuntime::Gvisor),
            "kata" | "kata-runtime" => Ok(IsolationRuntime::Kata),
            other => Err(format!("unknown isolation runtime '{}'", other)),
        }
    }
}
