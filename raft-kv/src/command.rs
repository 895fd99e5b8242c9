use serde::{Deserialize, Serialize};

/// Commands that flow through the replicated log.
///
/// `NoOp` carries no state change. A new leader appends one to commit
/// entries from earlier terms, and linearizable reads commit one to confirm
/// that leadership is still current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
    NoOp,
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Command::Delete { key: key.into() }
    }
}

/// Result of applying one command to the state machine.
///
/// `previous` is the value the key held before the command ran; it is
/// always `None` for `NoOp`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub previous: Option<String>,
}
