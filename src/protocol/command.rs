// ABOUTME: Command records of the in-sandbox listener protocol and their validation
// Every record is a single line: `upsert <name> <content>`, `run` or `input <text>`

use crate::models::PayloadEncoding;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use thiserror::Error;

const MAX_FILENAME_LEN: usize = 255;

/// Largest file content or input line accepted on one protocol line.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

lazy_static! {
    static ref FILENAME_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9._-]+(/[A-Za-z0-9._-]+)*$").expect("filename pattern is valid");
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Invalid filename '{filename}': {reason}")]
    InvalidFilename { filename: String, reason: String },
    #[error("Invalid content for '{filename}': {reason}")]
    InvalidContent { filename: String, reason: String },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// A file to upsert, content already in its transport text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    filename: String,
    content: String,
}

impl FileRecord {
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Result<Self, CommandError> {
        let filename = filename.into();
        let content = content.into();
        validate_filename(&filename)?;
        if let Some(reason) = unencodable(&content) {
            return Err(CommandError::InvalidContent { filename, reason });
        }
        Ok(Self { filename, content })
    }

    /// Encode raw file bytes the way the listener of a profile expects them.
    pub fn from_bytes(
        filename: impl Into<String>,
        bytes: &[u8],
        encoding: PayloadEncoding,
    ) -> Result<Self, CommandError> {
        let filename = filename.into();
        match encoding {
            PayloadEncoding::Base64 => Self::new(filename, STANDARD.encode(bytes)),
            PayloadEncoding::Plain => match std::str::from_utf8(bytes) {
                Ok(text) => Self::new(filename, text),
                Err(e) => Err(CommandError::InvalidContent {
                    filename,
                    reason: format!("not valid UTF-8 ({})", e),
                }),
            },
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRecord {
    Upsert { filename: String, content: String },
    Run,
    Input { text: String },
}

impl CommandRecord {
    pub fn upsert(filename: impl Into<String>, content: impl Into<String>) -> Result<Self, CommandError> {
        Ok(FileRecord::new(filename, content)?.into())
    }

    pub fn run() -> Self {
        CommandRecord::Run
    }

    pub fn input(text: impl Into<String>) -> Result<Self, CommandError> {
        let text = text.into();
        if let Some(reason) = unencodable(&text) {
            return Err(CommandError::InvalidInput(reason));
        }
        Ok(CommandRecord::Input { text })
    }

    pub fn verb(&self) -> &'static str {
        match self {
            CommandRecord::Upsert { .. } => "upsert",
            CommandRecord::Run => "run",
            CommandRecord::Input { .. } => "input",
        }
    }
}

impl From<FileRecord> for CommandRecord {
    fn from(file: FileRecord) -> Self {
        CommandRecord::Upsert {
            filename: file.filename,
            content: file.content,
        }
    }
}

impl fmt::Display for CommandRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandRecord::Upsert { filename, content } => write!(f, "upsert {} {}", filename, content),
            CommandRecord::Run => f.write_str("run"),
            CommandRecord::Input { text } => write!(f, "input {}", text),
        }
    }
}

fn validate_filename(filename: &str) -> Result<(), CommandError> {
    let reject = |reason: &str| {
        Err(CommandError::InvalidFilename {
            filename: filename.to_string(),
            reason: reason.to_string(),
        })
    };

    if filename.is_empty() {
        return reject("empty");
    }
    if filename.len() > MAX_FILENAME_LEN {
        return reject("too long");
    }
    if !FILENAME_PATTERN.is_match(filename) {
        return reject("only relative paths of [A-Za-z0-9._-] segments are allowed");
    }
    if filename.split('/').any(|segment| segment == "." || segment == "..") {
        return reject("path must stay inside the workspace");
    }
    Ok(())
}

/// Reason a payload cannot sit on one protocol line, if any.
fn unencodable(payload: &str) -> Option<String> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Some(format!(
            "{} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_PAYLOAD_BYTES
        ));
    }
    payload
        .chars()
        .find(|c| matches!(c, '\n' | '\r' | '\0'))
        .map(|c| format!("contains forbidden character {:?}", c))
}
