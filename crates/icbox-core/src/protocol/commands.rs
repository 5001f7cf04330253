//! Protocol commands
//!
//! Defines the commands understood by the IC box.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::COMMAND_SUFFIX;

/// Protocol commands for IC box communication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Query firmware version ('@CV')
    VersionInfo,

    /// Query hook state ('@CG?')
    HookState,

    /// Check line connection status ('@CX')
    ConnectionStatus,

    /// Dial a number ('@CI<number>')
    Dial(String),

    /// Query RX level ('@CN?')
    GetRxLevel,

    /// Set RX level ('@CN<level>')
    SetRxLevel(i32),

    /// Query RX mode ('@CM?')
    GetRxMode,

    /// Set RX mode ('@CM<mode>')
    SetRxMode(i32),

    /// Query device id ('@CS?')
    GetId,

    /// Set device id ('@CS<id>')
    SetId(String),
}

impl Command {
    /// Command text without the line suffix
    pub fn text(&self) -> String {
        match self {
            Command::VersionInfo => "@CV".to_string(),
            Command::HookState => "@CG?".to_string(),
            Command::ConnectionStatus => "@CX".to_string(),
            Command::Dial(number) => format!("@CI{}", number),
            Command::GetRxLevel => "@CN?".to_string(),
            Command::SetRxLevel(level) => format!("@CN{}", level),
            Command::GetRxMode => "@CM?".to_string(),
            Command::SetRxMode(mode) => format!("@CM{}", mode),
            Command::GetId => "@CS?".to_string(),
            Command::SetId(id) => format!("@CS{}", id),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Encode arbitrary command text for the wire
pub fn encode(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + COMMAND_SUFFIX.len());
    bytes.extend_from_slice(text.as_bytes());
    bytes.extend_from_slice(COMMAND_SUFFIX.as_bytes());
    bytes
}
