//! Purpose: One pipe endpoint type over local FIFOs, native pipes and relay tunnels.
//! Exports: `Platform`, `PipeEndpoint`, `PipeFactory`, `CallStrategy`, `Acquired`.
//! Role: Transport layer between a load session (or relay worker) and the database.
//! Invariants: The endpoint kind is fixed when the factory is built from a platform probe.
//! Invariants: Every endpoint owns exactly one OS or network resource and closes it once.
//! Invariants: Tunnel endpoints are write-only.
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind};
use crate::core::record::LineTerminator;
use crate::core::tunnel::client::{ClientProxy, RemotePipe};

pub mod fifo;
pub mod native;
mod strategy;

pub use fifo::{AbortHook, FifoPipe};
pub use native::{NativePipe, NativePipeBackend, NativeRole, OsNativePipeBackend, RetryPolicy};
pub use strategy::{Acquired, CallStrategy};

pub const DEFAULT_FIFO_DIR: &str = "/tmp";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn local() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }

    /// Name this process reports to tunnel clients.
    pub fn local_os_name() -> &'static str {
        std::env::consts::OS
    }

    pub fn from_os_name(name: &str) -> Result<Self, Error> {
        const UNIX_NAMES: [&str; 10] = [
            "linux", "sunos", "solaris", "mac", "darwin", "freebsd", "openbsd", "netbsd", "aix",
            "unix",
        ];
        let lower = name.trim().to_ascii_lowercase();
        if lower.starts_with("windows") || lower == "win32" {
            return Ok(Self::Windows);
        }
        if UNIX_NAMES.iter().any(|unix| lower.contains(unix)) {
            return Ok(Self::Unix);
        }
        Err(Error::new(ErrorKind::Protocol)
            .with_message(format!("unsupported platform \"{name}\"")))
    }

    pub fn call_strategy(self) -> CallStrategy {
        match self {
            Self::Unix => CallStrategy::CreateBeforeLoad,
            Self::Windows => CallStrategy::CreateAfterLoad,
        }
    }

    pub fn line_terminator(self) -> LineTerminator {
        match self {
            Self::Unix => LineTerminator::Lf,
            Self::Windows => LineTerminator::CrLf,
        }
    }

    /// Path of pipe `name` as the database on this platform must open it.
    pub fn native_path(self, fifo_dir: &Path, name: &str) -> String {
        match self {
            Self::Unix => fifo_dir.join(name).display().to_string(),
            Self::Windows => native::native_path(name),
        }
    }
}

#[derive(Debug)]
pub enum PipeEndpoint {
    Fifo(FifoPipe),
    Native(NativePipe),
    Tunnel(RemotePipe),
}

impl PipeEndpoint {
    pub fn name(&self) -> &str {
        match self {
            Self::Fifo(pipe) => pipe.name(),
            Self::Native(pipe) => pipe.name(),
            Self::Tunnel(pipe) => pipe.name(),
        }
    }

    pub fn connect(&mut self) -> Result<(), Error> {
        match self {
            Self::Fifo(pipe) => pipe.connect(),
            Self::Native(pipe) => pipe.connect(),
            Self::Tunnel(pipe) => pipe.connect(),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match self {
            Self::Fifo(pipe) => pipe.read(buf),
            Self::Native(pipe) => pipe.read(buf),
            Self::Tunnel(_) => Err(Error::new(ErrorKind::Transport)
                .with_message("tunneled pipes are write-only")),
        }
    }

    /// Writes all of `buf` and returns its length.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        match self {
            Self::Fifo(pipe) => pipe.write(buf),
            Self::Native(pipe) => pipe.write(buf),
            Self::Tunnel(pipe) => pipe.write(buf),
        }
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        match self {
            Self::Fifo(pipe) => pipe.flush(),
            Self::Native(_) => Ok(()),
            Self::Tunnel(pipe) => pipe.flush(),
        }
    }

    pub fn close(&mut self) -> Result<(), Error> {
        match self {
            Self::Fifo(pipe) => pipe.close(),
            Self::Native(pipe) => pipe.close(),
            Self::Tunnel(pipe) => pipe.close(),
        }
    }

    /// Releases the resource without waiting on the peer.
    pub fn discard(&mut self) {
        match self {
            Self::Fifo(pipe) => pipe.discard(),
            Self::Native(pipe) => pipe.discard(),
            Self::Tunnel(pipe) => pipe.discard(),
        }
    }

    /// Lets a blocked FIFO open give up once `hook` returns true. No-op for other kinds.
    pub fn set_abort_hook(&mut self, hook: AbortHook) {
        if let Self::Fifo(pipe) = self {
            pipe.set_abort_hook(hook);
        }
    }
}

fn io_error(err: Error) -> io::Error {
    let kind = match err.kind() {
        ErrorKind::Timeout => io::ErrorKind::TimedOut,
        ErrorKind::Connection => io::ErrorKind::ConnectionAborted,
        _ => io::ErrorKind::BrokenPipe,
    };
    io::Error::new(kind, err)
}

impl io::Write for PipeEndpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        PipeEndpoint::write(self, buf).map_err(io_error)
    }

    fn flush(&mut self) -> io::Result<()> {
        PipeEndpoint::flush(self).map_err(io_error)
    }
}

impl io::Read for PipeEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        PipeEndpoint::read(self, buf).map_err(io_error)
    }
}

/// Builds endpoints of one kind, chosen once from the local or remote platform.
#[derive(Clone)]
pub enum PipeFactory {
    Local {
        platform: Platform,
        fifo_dir: PathBuf,
        native: Arc<dyn NativePipeBackend>,
        retry: RetryPolicy,
    },
    Remote {
        platform: Platform,
        fifo_dir: PathBuf,
        proxy: Arc<ClientProxy>,
    },
}

impl std::fmt::Debug for PipeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local { platform, fifo_dir, .. } => f
                .debug_struct("Local")
                .field("platform", platform)
                .field("fifo_dir", fifo_dir)
                .finish(),
            Self::Remote { platform, proxy, .. } => f
                .debug_struct("Remote")
                .field("platform", platform)
                .field("relay", &proxy.peer_addr())
                .finish(),
        }
    }
}

impl PipeFactory {
    pub fn local(fifo_dir: impl Into<PathBuf>) -> Self {
        Self::local_with(Platform::local(), fifo_dir, Arc::new(OsNativePipeBackend))
    }

    pub fn local_with(
        platform: Platform,
        fifo_dir: impl Into<PathBuf>,
        native: Arc<dyn NativePipeBackend>,
    ) -> Self {
        Self::Local {
            platform,
            fifo_dir: fifo_dir.into(),
            native,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        if let Self::Local { retry, .. } = &mut self {
            *retry = policy;
        }
        self
    }

    /// Remote endpoints assume the relay keeps its FIFOs in `fifo_dir` too.
    pub fn remote(proxy: Arc<ClientProxy>, fifo_dir: impl Into<PathBuf>) -> Self {
        Self::Remote {
            platform: proxy.platform(),
            fifo_dir: fifo_dir.into(),
            proxy,
        }
    }

    pub fn platform(&self) -> Platform {
        match self {
            Self::Local { platform, .. } | Self::Remote { platform, .. } => *platform,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    pub fn proxy(&self) -> Option<&Arc<ClientProxy>> {
        match self {
            Self::Remote { proxy, .. } => Some(proxy),
            Self::Local { .. } => None,
        }
    }

    pub fn strategy(&self) -> CallStrategy {
        self.platform().call_strategy()
    }

    pub fn native_path(&self, name: &str) -> String {
        match self {
            Self::Local { platform, fifo_dir, .. } | Self::Remote { platform, fifo_dir, .. } => {
                platform.native_path(fifo_dir, name)
            }
        }
    }

    /// An unconnected endpoint for `name`.
    pub fn endpoint(&self, name: &str) -> PipeEndpoint {
        match self {
            Self::Local {
                platform: Platform::Unix,
                fifo_dir,
                ..
            } => PipeEndpoint::Fifo(FifoPipe::new(fifo_dir, name)),
            Self::Local {
                platform: Platform::Windows,
                native,
                retry,
                ..
            } => PipeEndpoint::Native(
                NativePipe::new(name, NativeRole::Client, Arc::clone(native)).with_retry(*retry),
            ),
            Self::Remote { proxy, .. } => PipeEndpoint::Tunnel(RemotePipe::new(name, Arc::clone(proxy))),
        }
    }

    pub fn open(&self, name: &str) -> Result<PipeEndpoint, Error> {
        let mut endpoint = self.endpoint(name);
        endpoint.connect()?;
        Ok(endpoint)
    }
}
