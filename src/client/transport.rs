//! Starting a language server and connecting to it.
//!
//! Three transports are supported:
//!
//! - `stdio`: the server talks over its stdin and stdout.
//! - `pipe`: the client listens on a Unix domain socket and passes its path
//!   as `--pipe=<path>`.
//! - `socket`: the client listens on a loopback TCP port and passes it as
//!   `--socket=<port>`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::error::ClientError;

use super::ClientResult;

/// Longest Unix socket path the platform accepts.
#[cfg(target_os = "macos")]
pub const MAX_PIPE_PATH_LENGTH: usize = 103;
#[cfg(not(target_os = "macos"))]
pub const MAX_PIPE_PATH_LENGTH: usize = 107;

/// How the client reaches the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Pipe,
    Socket,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdio" => Ok(Self::Stdio),
            "pipe" | "ipc" => Ok(Self::Pipe),
            "socket" => Ok(Self::Socket),
            other => Err(format!("invalid transport: {other}")),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdio => "stdio",
            Self::Pipe => "pipe",
            Self::Socket => "socket",
        })
    }
}

/// Everything needed to start a server.
#[derive(Debug, Clone)]
pub struct ServerLaunch {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub transport: TransportKind,
    /// Socket transport only; zero picks a free port.
    pub port: u16,
    /// How long to wait for the server to connect back on pipe and socket
    /// transports.
    pub connect_timeout: Duration,
}

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// A started server: its process and the streams to talk to it over.
pub struct ServerStreams {
    pub child: Child,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl fmt::Debug for ServerStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStreams")
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

/// Generates a fresh socket path under `$XDG_RUNTIME_DIR`, falling back to
/// the temp dir.
///
/// # Errors
///
/// Returns [`ClientError::PipeNameTooLong`] if the path exceeds
/// [`MAX_PIPE_PATH_LENGTH`].
pub fn generate_random_pipe_name() -> ClientResult<PathBuf> {
    let dir = std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map_or_else(std::env::temp_dir, PathBuf::from);
    pipe_name_in(&dir)
}

fn pipe_name_in(dir: &Path) -> ClientResult<PathBuf> {
    let path = dir.join(format!("langbridge-ipc-{}.sock", Uuid::new_v4().simple()));
    let length = path.as_os_str().len();
    if length > MAX_PIPE_PATH_LENGTH {
        return Err(ClientError::PipeNameTooLong {
            path: path.display().to_string(),
            limit: MAX_PIPE_PATH_LENGTH,
        });
    }
    Ok(path)
}

/// Resolves the server executable through `PATH` (and `PATHEXT` on Windows).
///
/// # Errors
///
/// Returns [`ClientError::ServerStartFailed`] if the executable is not found.
pub fn resolve_command(command: &str) -> ClientResult<PathBuf> {
    which::which(command).map_err(|e| {
        ClientError::ServerStartFailed(format!("cannot find language server '{command}': {e}"))
    })
}

/// Starts the server and connects to it over the configured transport.
///
/// # Errors
///
/// Fails if the executable cannot be found or spawned, or if the server does
/// not connect back within `connect_timeout`.
pub async fn start_server(launch: &ServerLaunch) -> ClientResult<ServerStreams> {
    let program = resolve_command(&launch.command)?;
    let mut cmd = Command::new(&program);
    cmd.args(&launch.args)
        .current_dir(&launch.working_dir)
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    tracing::debug!(
        program = %program.display(),
        transport = %launch.transport,
        "starting language server"
    );

    match launch.transport {
        TransportKind::Stdio => start_stdio(cmd, &launch.command),
        TransportKind::Pipe => start_pipe(cmd, launch).await,
        TransportKind::Socket => start_socket(cmd, launch).await,
    }
}

fn spawn(mut cmd: Command, name: &str) -> ClientResult<Child> {
    cmd.spawn()
        .map_err(|e| ClientError::ServerStartFailed(format!("failed to spawn '{name}': {e}")))
}

fn start_stdio(mut cmd: Command, name: &str) -> ClientResult<ServerStreams> {
    cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
    let mut child = spawn(cmd, name)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ClientError::ServerStartFailed("failed to capture stdout".to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ClientError::ServerStartFailed("failed to capture stdin".to_string()))?;

    Ok(ServerStreams {
        child,
        reader: Box::new(stdout),
        writer: Box::new(stdin),
    })
}

#[cfg(unix)]
async fn start_pipe(mut cmd: Command, launch: &ServerLaunch) -> ClientResult<ServerStreams> {
    let path = generate_random_pipe_name()?;
    let listener = tokio::net::UnixListener::bind(&path)?;
    cmd.arg(format!("--pipe={}", path.display()))
        .stdin(Stdio::null())
        .stdout(Stdio::null());
    let child = spawn(cmd, &launch.command)?;

    let accepted = tokio::time::timeout(launch.connect_timeout, listener.accept()).await;
    if let Err(e) = std::fs::remove_file(&path) {
        tracing::debug!("failed to remove pipe {}: {e}", path.display());
    }
    let (stream, _) = accepted.map_err(|_| ClientError::Timeout(launch.connect_timeout))??;
    let (reader, writer) = stream.into_split();

    Ok(ServerStreams {
        child,
        reader: Box::new(reader),
        writer: Box::new(writer),
    })
}

#[cfg(not(unix))]
async fn start_pipe(_cmd: Command, _launch: &ServerLaunch) -> ClientResult<ServerStreams> {
    Err(ClientError::UnsupportedTransport(
        "pipe transport requires Unix domain sockets".to_string(),
    ))
}

async fn start_socket(mut cmd: Command, launch: &ServerLaunch) -> ClientResult<ServerStreams> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", launch.port)).await?;
    let port = listener.local_addr()?.port();
    cmd.arg(format!("--socket={port}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null());
    let child = spawn(cmd, &launch.command)?;

    let (stream, peer) = tokio::time::timeout(launch.connect_timeout, listener.accept())
        .await
        .map_err(|_| ClientError::Timeout(launch.connect_timeout))??;
    tracing::debug!(%peer, "language server connected");
    let (reader, writer) = stream.into_split();

    Ok(ServerStreams {
        child,
        reader: Box::new(reader),
        writer: Box::new(writer),
    })
}
