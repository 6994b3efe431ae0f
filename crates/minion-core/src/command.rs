use serde::{Deserialize, Serialize};

/// One captured output line and the time at which it was read.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    pub at: i64,
}

/// One requested execution and its accumulating result.
///
/// The same shape travels both directions: inbound as the `new_val` payload
/// of a `new_commands` frame, outbound as an `update_command` progress
/// snapshot. Every field defaults so sparse controller payloads decode.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub stderr: Vec<CommandOutput>,
    #[serde(default)]
    pub stdout: Vec<CommandOutput>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub completed_at: i64,
    #[serde(default)]
    pub action: String,
}

impl Command {
    /// Whitespace-split token list for the command line. The first token is
    /// the executable, the rest are its arguments. No shell interpretation:
    /// no quoting, pipes, globs, or variable expansion.
    pub fn argv(&self) -> Vec<&str> {
        self.command.split_whitespace().collect()
    }

    /// Append one output record to the matching stream sequence. Sequences
    /// are append-only; records are never reordered or removed.
    pub fn append_output(&mut self, stream: OutputStream, record: CommandOutput) {
        match stream {
            OutputStream::Stdout => self.stdout.push(record),
            OutputStream::Stderr => self.stderr.push(record),
        }
    }
}

/// Which subprocess stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}
