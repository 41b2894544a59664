// ABOUTME: Turns command records into one-shot shell invocations that write the control file
// Record lines are base64-wrapped so no payload is ever interpreted by the shell

use super::CommandRecord;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Default location of the control file inside every sandbox.
pub const DEFAULT_CONTROL_FILE: &str = "/tmp/code-box.control";

/// Most base64 text a single script embeds, well below the kernel's
/// 128 KiB limit on one `sh -c` argument.
pub const MAX_SCRIPT_PAYLOAD: usize = 96 * 1024;

/// How a shell invocation touches the control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Append,
    Truncate,
    /// Writes part of a batch to the staging file next to the control file
    Stage,
}

/// A non-interactive command ready to be exec'd inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    script: String,
    mode: WriteMode,
    records: usize,
}

impl ShellCommand {
    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Number of protocol records this command writes.
    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn to_argv(&self) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), self.script.clone()]
    }
}

#[derive(Debug, Clone)]
pub struct CommandEncoder {
    control_file: String,
}

impl CommandEncoder {
    pub fn new(control_file: impl Into<String>) -> Self {
        Self {
            control_file: control_file.into(),
        }
    }

    pub fn control_file(&self) -> &str {
        &self.control_file
    }

    /// Staging file for batches too large for one script.
    pub fn staging_file(&self) -> String {
        format!("{}.partial", self.control_file)
    }

    /// Encode a batch of records as appends to the control file.
    ///
    /// All verbs append. A batch that fits in one script is written by one
    /// `printf | base64 -d` pipeline. A larger batch is decoded piece by piece
    /// into the staging file and then appended with a single `cat`, so the
    /// listener never sees a partial batch. The commands must be exec'd in
    /// order, one after the other.
    pub fn append(&self, records: &[CommandRecord]) -> Vec<ShellCommand> {
        let mut payload = String::new();
        for record in records {
            payload.push_str(&record.to_string());
            payload.push('\n');
        }

        let encoded = STANDARD.encode(payload.as_bytes());
        if encoded.len() <= MAX_SCRIPT_PAYLOAD {
            return vec![ShellCommand {
                script: decode_into(&encoded, ">>", &self.control_file),
                mode: WriteMode::Append,
                records: records.len(),
            }];
        }

        let staging = self.staging_file();
        // Whole base64 quanta per piece so every piece decodes on its own
        let piece = MAX_SCRIPT_PAYLOAD / 4 * 3;
        let mut commands: Vec<ShellCommand> = payload
            .as_bytes()
            .chunks(piece)
            .enumerate()
            .map(|(index, bytes)| ShellCommand {
                script: decode_into(&STANDARD.encode(bytes), if index == 0 { ">" } else { ">>" }, &staging),
                mode: WriteMode::Stage,
                records: 0,
            })
            .collect();

        commands.push(ShellCommand {
            script: format!(
                "cat {staging} >> {control} && rm -f {staging}",
                staging = shell_quote(&staging),
                control = shell_quote(&self.control_file)
            ),
            mode: WriteMode::Append,
            records: records.len(),
        });
        commands
    }

    /// Create the control file, or empty it when it already exists.
    pub fn reset(&self) -> ShellCommand {
        ShellCommand {
            script: format!(": > {}", shell_quote(&self.control_file)),
            mode: WriteMode::Truncate,
            records: 0,
        }
    }
}

impl Default for CommandEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_CONTROL_FILE)
    }
}

fn decode_into(encoded: &str, redirect: &str, path: &str) -> String {
    format!(
        "printf '%s' {} | base64 -d {} {}",
        shell_quote(encoded),
        redirect,
        shell_quote(path)
    )
}

/// Single-quote a word for POSIX sh.
pub fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}
