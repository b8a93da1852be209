//! Command payload carried in a packet's data.
//!
//! ## Payload Format
//!
//! ```text
//! +-------------+---------------------------------------+
//! | action: u8  | args: UTF-8, up to NUL or end of data |
//! +-------------+---------------------------------------+
//! ```
//!
//! `args` names the plugin that handles the command. It is an identifier,
//! never a path: only ASCII alphanumerics, `_`, `-` and `.` are accepted and
//! it may not start with `.`.

use bytes::{BufMut, BytesMut};

/// Longest accepted plugin identifier.
pub const MAX_ARGS_LEN: usize = 64;

/// Command kind, selecting the plugin symbol to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Execute,
    Status,
    Version,
    Help,
}

impl Action {
    /// Every action, in wire-code order.
    pub const ALL: [Action; 4] = [
        Action::Execute,
        Action::Status,
        Action::Version,
        Action::Help,
    ];

    /// Wire code of this action.
    pub fn code(self) -> u8 {
        match self {
            Action::Execute => 0,
            Action::Status => 1,
            Action::Version => 2,
            Action::Help => 3,
        }
    }

    /// Name of the plugin symbol implementing this action.
    pub fn symbol(self) -> &'static str {
        match self {
            Action::Execute => "execute",
            Action::Status => "status",
            Action::Version => "version",
            Action::Help => "help",
        }
    }
}

impl TryFrom<u8> for Action {
    type Error = CommandError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Action::ALL
            .into_iter()
            .find(|action| action.code() == code)
            .ok_or(CommandError::UnknownAction(code))
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Command payload decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No bytes at all.
    Empty,
    /// Action code outside the known set.
    UnknownAction(u8),
    /// No plugin identifier given.
    MissingArgs,
    /// Plugin identifier is not a plain name.
    InvalidArgs(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Empty => write!(f, "Empty command payload"),
            CommandError::UnknownAction(code) => write!(f, "Unknown action code {}", code),
            CommandError::MissingArgs => write!(f, "Missing plugin identifier"),
            CommandError::InvalidArgs(args) => write!(f, "Invalid plugin identifier: {:?}", args),
        }
    }
}

impl std::error::Error for CommandError {}

/// A decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub action: Action,
    /// Plugin identifier.
    pub args: String,
}

impl Command {
    pub fn new(action: Action, args: impl Into<String>) -> Self {
        Self {
            action,
            args: args.into(),
        }
    }

    /// Decode a command from a packet's data.
    pub fn decode(data: &[u8]) -> Result<Self, CommandError> {
        let (&code, rest) = data.split_first().ok_or(CommandError::Empty)?;
        let action = Action::try_from(code)?;

        let args = match rest.iter().position(|&b| b == 0) {
            Some(nul) => &rest[..nul],
            None => rest,
        };
        if args.is_empty() {
            return Err(CommandError::MissingArgs);
        }

        let args = std::str::from_utf8(args)
            .map_err(|_| CommandError::InvalidArgs(String::from_utf8_lossy(args).into_owned()))?;
        if !is_identifier(args) {
            return Err(CommandError::InvalidArgs(args.to_string()));
        }

        Ok(Self::new(action, args))
    }

    /// Encode as `action | args | NUL`.
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.args.len() + 2);
        out.put_u8(self.action.code());
        out.extend_from_slice(self.args.as_bytes());
        out.put_u8(0);
        out
    }
}

fn is_identifier(args: &str) -> bool {
    args.len() <= MAX_ARGS_LEN
        && !args.starts_with('.')
        && args
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}
