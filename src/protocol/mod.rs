// ABOUTME: Listener protocol spoken to the helper process inside every sandbox
// Records are appended, one per line, to a control file the listener tails

pub mod command;
pub mod encoder;

pub use command::{CommandError, CommandRecord, FileRecord, MAX_PAYLOAD_BYTES};
pub use encoder::{shell_quote, CommandEncoder, ShellCommand, WriteMode, DEFAULT_CONTROL_FILE, MAX_SCRIPT_PAYLOAD};
