//! Client configuration resolved from the environment.
//!
//! | Variable                    | Meaning                          | Default          |
//! |-----------------------------|----------------------------------|------------------|
//! | `FUTURECOMMANDER_TRANSPORT` | `process` or `socket`            | `process`        |
//! | `FUTURECOMMANDER_DAEMON`    | engine binary                    | see below        |
//! | `FUTURECOMMANDER_ADDR`      | engine socket `host:port`        | `127.0.0.1:7842` |

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::ipc::{
    Connector, ProcessConnector, RestartPolicy, SocketConnector, TransportKind, DAEMON_ARG,
    DEFAULT_SOCKET_ADDR,
};

pub const TRANSPORT_ENV: &str = "FUTURECOMMANDER_TRANSPORT";
pub const DAEMON_ENV: &str = "FUTURECOMMANDER_DAEMON";
pub const ADDR_ENV: &str = "FUTURECOMMANDER_ADDR";

/// Engine binary name looked up next to us and on `PATH`.
pub const DAEMON_BINARY: &str = "futurecommander";

/// How to launch the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl DaemonConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![DAEMON_ARG.to_string()],
        }
    }
}

/// Everything needed to build an [`crate::ipc::RpcClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub transport: TransportKind,
    pub daemon: DaemonConfig,
    pub address: SocketAddr,
    /// Overrides the default policy for `transport`.
    pub restart: Option<RestartPolicy>,
}

impl ClientConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through `lookup` instead of the environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let transport = match lookup(TRANSPORT_ENV) {
            Some(value) => parse_transport(&value)?,
            None => TransportKind::Process,
        };

        let address = lookup(ADDR_ENV)
            .unwrap_or_else(|| DEFAULT_SOCKET_ADDR.to_string())
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid {} (expected host:port)", ADDR_ENV))?;

        let program = resolve_daemon_path(lookup(DAEMON_ENV));

        Ok(Self {
            transport,
            daemon: DaemonConfig::new(program),
            address,
            restart: None,
        })
    }

    /// Same configuration with a different transport.
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart
            .clone()
            .unwrap_or_else(|| RestartPolicy::for_kind(self.transport))
    }

    /// Build the connector for the configured transport.
    pub fn connector(&self) -> Box<dyn Connector> {
        match self.transport {
            TransportKind::Process => Box::new(
                ProcessConnector::new(&self.daemon.program).with_args(self.daemon.args.clone()),
            ),
            TransportKind::Socket => Box::new(SocketConnector::new(self.address)),
        }
    }
}

fn parse_transport(value: &str) -> Result<TransportKind> {
    match value.trim().to_ascii_lowercase().as_str() {
        "process" | "" => Ok(TransportKind::Process),
        "socket" | "tcp" => Ok(TransportKind::Socket),
        other => bail!("Invalid {}: {:?} (expected process or socket)", TRANSPORT_ENV, other),
    }
}

/// Resolve the engine binary.
///
/// Lookup order:
/// 1. `FUTURECOMMANDER_DAEMON`
/// 2. Next to the current executable
/// 3. The user's executable directory (`~/.local/bin` on Linux)
/// 4. Bare name, resolved through `PATH` at spawn time
fn resolve_daemon_path(from_env: Option<String>) -> PathBuf {
    if let Some(path) = from_env.filter(|p| !p.is_empty()) {
        info!("Using engine from {}: {}", DAEMON_ENV, path);
        return PathBuf::from(path);
    }

    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(binary_in));
    if let Some(path) = sibling.filter(|p| p.exists()) {
        info!("Using engine next to executable: {}", path.display());
        return path;
    }

    if let Some(path) = dirs::executable_dir()
        .map(|dir| binary_in(&dir))
        .filter(|p| p.exists())
    {
        info!("Using engine from user bin directory: {}", path.display());
        return path;
    }

    PathBuf::from(DAEMON_BINARY)
}

fn binary_in(dir: &Path) -> PathBuf {
    dir.join(format!("{}{}", DAEMON_BINARY, std::env::consts::EXE_SUFFIX))
}
