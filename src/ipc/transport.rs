//! Byte transports to the filesystem engine.
//!
//! A [`Connector`] knows how to reach the engine (spawn it, or dial it) and
//! hands back a [`Link`]: a reader, a writer and, for spawned engines, the
//! child process. [`Transport`] drives a link with two background tasks:
//!
//! - a reader task forwarding raw chunks as [`TransportEvent`]s, ending with
//!   exactly one `Closed` or `Error`
//! - a writer task draining an outbound queue in order, so a full pipe never
//!   blocks the client worker
//!
//! Every event carries the transport generation, which lets the supervisor
//! ignore late events from a transport it already discarded.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::ipc::error::TransportError;

/// Argument putting the engine binary in daemon mode.
pub const DAEMON_ARG: &str = "daemon";

/// Default engine socket address.
pub const DEFAULT_SOCKET_ADDR: &str = "127.0.0.1:7842";

/// Read buffer size for the reader task.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// How long an engine may outlive its closed stdout before it is killed.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Physical channel variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Process,
    Socket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Process => write!(f, "process"),
            TransportKind::Socket => write!(f, "socket"),
        }
    }
}

/// Why a transport closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The engine process exited. `None` when killed by a signal.
    Exited(Option<i32>),
    /// The peer closed its end of the stream.
    Disconnected,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Exited(Some(code)) => write!(f, "engine exited with code {}", code),
            CloseReason::Exited(None) => write!(f, "engine terminated by signal"),
            CloseReason::Disconnected => write!(f, "connection closed by engine"),
        }
    }
}

/// Signal emitted by a running transport.
#[derive(Debug)]
pub enum TransportSignal {
    Data(Vec<u8>),
    Closed(CloseReason),
    Error(std::io::Error),
}

/// A transport signal tagged with the generation that produced it.
#[derive(Debug)]
pub struct TransportEvent {
    pub generation: u64,
    pub signal: TransportSignal,
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// A connected duplex channel to the engine.
pub struct Link {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Spawned engine process, waited on after the reader hits EOF.
    pub process: Option<Child>,
}

impl Link {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: None,
        }
    }
}

/// Knows how to reach the engine.
#[async_trait]
pub trait Connector: Send + 'static {
    /// Channel variant, used to pick the restart policy.
    fn kind(&self) -> TransportKind;

    /// Open a fresh channel to the engine.
    async fn connect(&mut self) -> Result<Link, TransportError>;
}

#[async_trait]
impl Connector for Box<dyn Connector> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    async fn connect(&mut self) -> Result<Link, TransportError> {
        (**self).connect().await
    }
}

// =============================================================================
// Process Transport
// =============================================================================

/// Spawns the engine binary and talks to it over its standard streams.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessConnector {
    /// Launch `program daemon`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![DAEMON_ARG.to_string()],
        }
    }

    /// Replace the argument list (the daemon-mode argument is not implied).
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("RUST_BACKTRACE", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so terminal signals aimed at the UI skip the engine.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

#[async_trait]
impl Connector for ProcessConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    async fn connect(&mut self) -> Result<Link, TransportError> {
        let program = self.program.display().to_string();
        debug!("Spawning engine: {} {}", program, self.args.join(" "));

        let mut child = self.command().spawn().map_err(|source| TransportError::Spawn {
            program: program.clone(),
            source,
        })?;

        let missing_pipe = |name: &str| TransportError::Spawn {
            program: program.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("engine {} was not piped", name),
            ),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, child.id()));
        }

        info!("Engine spawned (PID: {:?})", child.id());

        Ok(Link {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Some(child),
        })
    }
}

/// Log engine stderr as diagnostics. Never mixed into the data stream.
async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!("engine stderr (PID: {:?}): {}", pid, line);
    }
}

// =============================================================================
// Socket Transport
// =============================================================================

/// Connects to an already running engine over TCP.
#[derive(Debug, Clone)]
pub struct SocketConnector {
    addr: SocketAddr,
}

impl SocketConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Default for SocketConnector {
    fn default() -> Self {
        Self::new(
            DEFAULT_SOCKET_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 7842))),
        )
    }
}

#[async_trait]
impl Connector for SocketConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn connect(&mut self) -> Result<Link, TransportError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: self.addr,
                source,
            })?;
        // Requests are small and latency-bound.
        stream.set_nodelay(true)?;

        info!("Connected to engine at {}", self.addr);

        let (read_half, write_half) = stream.into_split();
        Ok(Link::new(read_half, write_half))
    }
}

// =============================================================================
// Transport
// =============================================================================

/// A started transport.
///
/// Dropping it aborts both background tasks, which kills a spawned engine.
pub struct Transport {
    generation: u64,
    kind: TransportKind,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Transport {
    /// Start driving `link`, reporting signals on `events`.
    pub fn start(link: Link, kind: TransportKind, generation: u64, events: EventSender) -> Self {
        let Link {
            reader,
            writer,
            process,
        } = link;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(reader, process, generation, events.clone()));
        let writer = tokio::spawn(write_loop(writer, outbound_rx, generation, events));

        Self {
            generation,
            kind,
            outbound: Some(outbound_tx),
            reader,
            writer,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Queue bytes for the engine, in call order.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` once the transport was closed or its
    /// writer task has stopped.
    pub fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::Closed)?;
        outbound.send(bytes).map_err(|_| TransportError::Closed)
    }

    /// Refuse further writes.
    ///
    /// Bytes already queued keep flowing while the transport is alive;
    /// dropping it aborts the writer and discards whatever is left.
    pub fn close(&mut self) {
        self.outbound = None;
    }

    pub fn is_closed(&self) -> bool {
        self.outbound
            .as_ref()
            .map(|tx| tx.is_closed())
            .unwrap_or(true)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    mut process: Option<Child>,
    generation: u64,
    events: EventSender,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    let signal = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => {
                let event = TransportEvent {
                    generation,
                    signal: TransportSignal::Data(buf[..n].to_vec()),
                };
                if events.send(event).is_err() {
                    // Client worker is gone; nothing left to report to.
                    return;
                }
            }
            Err(e) => break Some(TransportSignal::Error(e)),
        }
    };

    let signal = match signal {
        Some(error) => error,
        None => match process.as_mut() {
            Some(child) => reap(child, generation).await,
            None => TransportSignal::Closed(CloseReason::Disconnected),
        },
    };

    debug!(generation, "Transport reader finished: {:?}", signal);
    let _ = events.send(TransportEvent { generation, signal });
}

/// Stdout EOF ends the link. Give the engine a moment to exit, then kill it.
async fn reap(child: &mut Child, generation: u64) -> TransportSignal {
    let status = match timeout(EXIT_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(generation, "Engine closed stdout but kept running, killing it");
            if let Err(e) = child.start_kill() {
                warn!(generation, "Failed to kill engine: {}", e);
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => TransportSignal::Closed(CloseReason::Exited(status.code())),
        Err(e) => TransportSignal::Error(e),
    }
}

async fn write_loop(
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    generation: u64,
    events: EventSender,
) {
    while let Some(bytes) = outbound.recv().await {
        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!(generation, "Failed to write to engine: {}", e);
            let _ = events.send(TransportEvent {
                generation,
                signal: TransportSignal::Error(e),
            });
            return;
        }
    }

    let _ = writer.shutdown().await;
}
