//! Daemon lifecycle: startup, the command loop and teardown.

use crate::config::{Config, ConfigError};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::link::{LinkAdapter, PumpExit, ReceivePump};
use crate::listener::CommandListener;
use crate::net::packet::HEADER_SIZE;
use crate::net::{BufferPool, Stack, StackError};
use crate::plugin::{DylibLoader, ModuleLoader, PluginRegistry};
use crate::response::ResponseSender;
use crate::transport::{self, TransportError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name the link interface is registered under.
pub const LINK_NAME: &str = "fifo";

/// How long blocking work may hold up process exit once the daemon stopped.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Fatal daemon errors
#[derive(Debug)]
pub enum DaemonError {
    Config(ConfigError),
    /// The named pipes could not be opened.
    Transport(TransportError),
    /// The protocol stack could not be brought up.
    ProtocolInit(StackError),
    /// An acknowledgment payload cannot be sent over this link.
    AckTooLarge {
        payload: String,
        len: usize,
        limit: usize,
    },
    /// The receive pump stopped while the daemon was running.
    LinkDown,
}

impl DaemonError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            DaemonError::Config(_) => 1,
            DaemonError::Transport(_) | DaemonError::LinkDown => 2,
            DaemonError::ProtocolInit(_) | DaemonError::AckTooLarge { .. } => 3,
        }
    }
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonError::Config(e) => write!(f, "Configuration error: {}", e),
            DaemonError::Transport(e) => write!(f, "Transport error: {}", e),
            DaemonError::ProtocolInit(e) => write!(f, "Protocol stack init failed: {}", e),
            DaemonError::AckTooLarge {
                payload,
                len,
                limit,
            } => write!(
                f,
                "Acknowledgment '{}' is {} bytes, at most {} fit a packet",
                payload, len, limit
            ),
            DaemonError::LinkDown => write!(f, "Link receive pump stopped"),
        }
    }
}

impl std::error::Error for DaemonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DaemonError::Config(e) => Some(e),
            DaemonError::Transport(e) => Some(e),
            DaemonError::ProtocolInit(e) => Some(e),
            DaemonError::AckTooLarge { .. } | DaemonError::LinkDown => None,
        }
    }
}

impl From<ConfigError> for DaemonError {
    fn from(e: ConfigError) -> Self {
        DaemonError::Config(e)
    }
}

impl From<TransportError> for DaemonError {
    fn from(e: TransportError) -> Self {
        DaemonError::Transport(e)
    }
}

impl From<StackError> for DaemonError {
    fn from(e: StackError) -> Self {
        DaemonError::ProtocolInit(e)
    }
}

/// A running command-and-control node.
pub struct Daemon {
    stack: Arc<Stack>,
    pump: ReceivePump,
    listener: CommandListener,
    dispatcher: Dispatcher,
    sender: ResponseSender,
}

impl Daemon {
    /// Bring up the stack, open the configured pipes and start listening.
    ///
    /// Plugins are loaded from shared objects under the configured directory.
    pub async fn start(config: &Config) -> Result<Self, DaemonError> {
        let stack = init_stack(config)?;
        let (rx, tx) = transport::open(&config.rx_path, &config.tx_path)?;
        Self::assemble(config, stack, rx, tx, Box::new(DylibLoader))
    }

    /// Start on an already open transport with the given plugin loader.
    pub fn with_transport<R, W>(
        config: &Config,
        reader: R,
        writer: W,
        loader: Box<dyn ModuleLoader>,
    ) -> Result<Self, DaemonError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let stack = init_stack(config)?;
        Self::assemble(config, stack, reader, writer, loader)
    }

    fn assemble<R, W>(
        config: &Config,
        stack: Arc<Stack>,
        reader: R,
        writer: W,
        loader: Box<dyn ModuleLoader>,
    ) -> Result<Self, DaemonError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let link = Arc::new(LinkAdapter::new(LINK_NAME, writer, config.mtu));
        stack.set_default_route(link.clone());
        let pump = ReceivePump::spawn(reader, link, Arc::clone(&stack));

        let listener = match CommandListener::bind(&stack, config.port, config.timeout) {
            Ok(listener) => listener,
            Err(e) => {
                // Pump would otherwise outlive the failed startup
                tokio::spawn(pump.shutdown());
                return Err(e.into());
            }
        };

        let registry = PluginRegistry::new(&config.plugin_dir, loader, config.retain_plugins);
        info!(
            dir = %registry.dir().display(),
            retain = registry.retains_modules(),
            "Plugin registry ready"
        );
        let dispatcher = Dispatcher::new(Arc::new(registry));
        let sender = ResponseSender::new(
            Arc::clone(&stack),
            config.peer_address,
            config.peer_port,
            config.timeout,
            config.ack_success.clone(),
            config.ack_failure.clone(),
        );

        info!(
            address = stack.address(),
            port = config.port,
            peer = config.peer_address,
            peer_port = config.peer_port,
            "Node ready"
        );

        Ok(Self {
            stack,
            pump,
            listener,
            dispatcher,
            sender,
        })
    }

    pub fn stack(&self) -> &Arc<Stack> {
        &self.stack
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        self.dispatcher.registry()
    }

    /// Run one accept, dispatch and acknowledge cycle.
    ///
    /// Returns `None` if no command arrived within the timeout, otherwise the
    /// outcome that was acknowledged.
    pub async fn run_once(&mut self) -> Option<Result<(), DispatchError>> {
        let outcome = match self.listener.accept_command().await {
            Ok(None) => return None,
            Ok(Some(command)) => self.dispatcher.run(command).await,
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(()) => debug!("Command completed"),
            Err(e) => error!(error = %e, "Command failed"),
        }

        // Failures are logged by the sender; nothing else to do
        let _ = self.sender.send_ack(&outcome).await;
        Some(outcome)
    }

    /// Serve commands until `shutdown` is cancelled or the link goes down.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        loop {
            if self.pump.is_finished() {
                error!("Receive pump stopped, no further commands can arrive");
                return Err(DaemonError::LinkDown);
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                _ = self.run_once() => {}
            }
        }
    }

    /// Stop the receive pump and release every cached plugin.
    pub async fn shutdown(self) {
        match self.pump.shutdown().await {
            PumpExit::Cancelled | PumpExit::Closed => debug!("Receive pump stopped"),
            PumpExit::Failed(e) => warn!(error = %e, "Receive pump had failed"),
            PumpExit::Aborted => warn!("Receive pump aborted"),
        }

        let unloaded = self.dispatcher.registry().unload_all();
        info!(plugins = unloaded, "Node stopped");
    }
}

/// Drive `future` to completion on `runtime`, then shut the runtime down.
///
/// Blocking tasks still running afterwards, such as a plugin handler that
/// never returned, get at most `grace` before they are abandoned.
pub fn block_on_bounded<F: Future>(runtime: Runtime, future: F, grace: Duration) -> F::Output {
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(grace);
    output
}

/// Validate sizing and create the buffer pool and stack.
fn init_stack(config: &Config) -> Result<Arc<Stack>, DaemonError> {
    if config.mtu <= HEADER_SIZE {
        return Err(StackError::InvalidMtu(config.mtu).into());
    }
    if config.buffer_size < config.mtu - HEADER_SIZE {
        return Err(StackError::BufferTooSmall {
            size: config.buffer_size,
            mtu: config.mtu,
        }
        .into());
    }
    if config.buffer_count > 0
        && (config.buffer_reserve == 0 || config.buffer_reserve >= config.buffer_count)
    {
        return Err(StackError::InvalidReserve {
            reserve: config.buffer_reserve,
            count: config.buffer_count,
        }
        .into());
    }

    let limit = (config.mtu - HEADER_SIZE).min(config.buffer_size);
    for payload in [&config.ack_success, &config.ack_failure] {
        if payload.len() > limit {
            return Err(DaemonError::AckTooLarge {
                payload: payload.clone(),
                len: payload.len(),
                limit,
            });
        }
    }

    let pool = BufferPool::with_reserve(
        config.buffer_count,
        config.buffer_size,
        config.buffer_reserve,
    );
    let stack = Stack::new(config.address, pool)?;
    debug!(
        address = config.address,
        buffers = config.buffer_count,
        buffer_size = config.buffer_size,
        reserve = config.buffer_reserve,
        "Protocol stack initialized"
    );
    Ok(stack)
}
