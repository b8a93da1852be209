//! Command dispatch.
//!
//! One command per cycle, strictly in order:
//!
//! 1. build the plugin path from the command's identifier
//! 2. load the module (or take it from the registry cache)
//! 3. look up the handler for the command's action
//! 4. invoke it
//!
//! Any failure abandons the command; the caller decides what to reply.

use crate::command::{Action, Command, CommandError};
use crate::plugin::{LoadError, PluginRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Reasons a command was not carried out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Action code outside the known set.
    UnknownAction(u8),
    /// Payload could not be decoded into a command.
    Malformed(CommandError),
    /// The plugin module could not be loaded.
    LoadFailed { module: String, error: LoadError },
    /// The module has no handler for the action.
    SymbolNotFound {
        module: String,
        path: PathBuf,
        symbol: &'static str,
    },
    /// The handler did not return normally.
    HandlerFailed { module: String, action: Action },
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::UnknownAction(code) => {
                write!(f, "Requested action {} does not exist", code)
            }
            DispatchError::Malformed(e) => write!(f, "Malformed command: {}", e),
            DispatchError::LoadFailed { module, error } => {
                write!(f, "Unable to load plugin '{}': {}", module, error)
            }
            DispatchError::SymbolNotFound {
                module,
                path,
                symbol,
            } => write!(
                f,
                "Plugin '{}' ({}) has no symbol '{}'",
                module,
                path.display(),
                symbol
            ),
            DispatchError::HandlerFailed { module, action } => {
                write!(f, "Handler '{}' of plugin '{}' failed", action, module)
            }
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<CommandError> for DispatchError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::UnknownAction(code) => DispatchError::UnknownAction(code),
            other => DispatchError::Malformed(other),
        }
    }
}

/// Resolves commands to plugin handlers and runs them.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Run `command` on a blocking thread and wait for it.
    ///
    /// There is no timeout: a handler that never returns stalls the caller.
    pub async fn run(&self, command: Command) -> Result<(), DispatchError> {
        let dispatcher = self.clone();
        let module = command.args.clone();
        let action = command.action;

        match tokio::task::spawn_blocking(move || dispatcher.run_blocking(&command)).await {
            Ok(result) => result,
            Err(e) => {
                error!(plugin = %module, %action, error = %e, "Plugin handler panicked");
                Err(DispatchError::HandlerFailed { module, action })
            }
        }
    }

    /// Resolve and invoke the handler for `command` on the current thread.
    pub fn run_blocking(&self, command: &Command) -> Result<(), DispatchError> {
        let module = self.registry.resolve(&command.args).map_err(|error| {
            error!(plugin = %command.args, error = %error, "Unable to open plugin");
            DispatchError::LoadFailed {
                module: command.args.clone(),
                error,
            }
        })?;

        let symbol = command.action.symbol();
        let handler = module.handler(command.action).ok_or_else(|| {
            error!(plugin = %command.args, symbol, "Unable to get symbol");
            DispatchError::SymbolNotFound {
                module: command.args.clone(),
                path: module.path().to_path_buf(),
                symbol,
            }
        })?;

        info!(plugin = %command.args, action = %command.action, "Running command");
        handler.invoke();
        Ok(())
    }
}
