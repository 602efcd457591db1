//! Purpose: Native OS pipe endpoint behind a pluggable backend.
//! Exports: `NativePipeBackend`, `NativePipeHandle`, `OsNativePipeBackend`, `NativePipe`,
//! `ServerOptions`, `RetryPolicy`.
//! Role: Transport for platforms where the database creates the pipe server itself.
//! Invariants: Client creation retries a bounded number of times before failing.
//! Invariants: Handles are closed exactly once; later I/O reports a closed pipe.
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::core::error::{Error, ErrorKind};

pub const NATIVE_PIPE_PREFIX: &str = r"\\.\pipe\";

pub trait NativePipeHandle: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn close(&mut self) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServerOptions {
    pub inbound: bool,
    pub outbound: bool,
    pub buffer_size: usize,
    pub timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            inbound: true,
            outbound: true,
            buffer_size: 4096,
            timeout: Duration::from_millis(10_000),
        }
    }
}

pub trait NativePipeBackend: Send + Sync {
    fn server_create(&self, path: &str, options: ServerOptions) -> io::Result<Box<dyn NativePipeHandle>>;
    fn client_create(&self, path: &str) -> io::Result<Box<dyn NativePipeHandle>>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(200),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OsNativePipeBackend;

#[cfg(windows)]
mod os {
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Write};

    use super::{NativePipeBackend, NativePipeHandle, OsNativePipeBackend, ServerOptions};

    struct FileHandle(Option<File>);

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "pipe handle is closed")
    }

    impl NativePipeHandle for FileHandle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.as_mut().ok_or_else(closed)?.read(buf)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.as_mut().ok_or_else(closed)?.write(buf)
        }

        fn close(&mut self) -> io::Result<()> {
            match self.0.take() {
                Some(mut file) => file.flush(),
                None => Err(closed()),
            }
        }
    }

    impl NativePipeBackend for OsNativePipeBackend {
        fn server_create(
            &self,
            _path: &str,
            _options: ServerOptions,
        ) -> io::Result<Box<dyn NativePipeHandle>> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "server-side native pipes are created by the database",
            ))
        }

        fn client_create(&self, path: &str) -> io::Result<Box<dyn NativePipeHandle>> {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            Ok(Box::new(FileHandle(Some(file))))
        }
    }
}

#[cfg(not(windows))]
impl NativePipeBackend for OsNativePipeBackend {
    fn server_create(&self, _path: &str, _options: ServerOptions) -> io::Result<Box<dyn NativePipeHandle>> {
        Err(unavailable())
    }

    fn client_create(&self, _path: &str) -> io::Result<Box<dyn NativePipeHandle>> {
        Err(unavailable())
    }
}

#[cfg(not(windows))]
fn unavailable() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "native pipes are not available on this platform",
    )
}

pub fn native_path(name: &str) -> String {
    format!("{NATIVE_PIPE_PREFIX}{name}")
}

/// Connects to a server pipe, retrying while the server side may not exist yet.
pub fn client_create_with_retry(
    backend: &dyn NativePipeBackend,
    path: &str,
    policy: RetryPolicy,
) -> Result<Box<dyn NativePipeHandle>, Error> {
    let attempts = policy.attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match backend.client_create(path) {
            Ok(handle) => return Ok(handle),
            Err(err) => {
                debug!(path, attempt, error = %err, "native pipe client create failed");
                last = Some(err);
                if attempt < attempts {
                    thread::sleep(policy.delay);
                }
            }
        }
    }
    let mut error = Error::new(ErrorKind::Transport)
        .with_message(format!("failed to open native pipe after {attempts} attempts"))
        .with_path(path)
        .with_hint("Confirm that the target table uses the brighthouse engine and accepts pipe loads.");
    if let Some(last) = last {
        error = error.with_source(last);
    }
    Err(error)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NativeRole {
    Client,
    Server,
}

pub struct NativePipe {
    name: String,
    path: String,
    role: NativeRole,
    backend: Arc<dyn NativePipeBackend>,
    retry: RetryPolicy,
    handle: Option<Box<dyn NativePipeHandle>>,
    closed: bool,
}

impl std::fmt::Debug for NativePipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativePipe")
            .field("path", &self.path)
            .field("role", &self.role)
            .field("connected", &self.handle.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl NativePipe {
    pub fn new(name: &str, role: NativeRole, backend: Arc<dyn NativePipeBackend>) -> Self {
        Self {
            name: name.to_string(),
            path: native_path(name),
            role,
            backend,
            retry: RetryPolicy::default(),
            handle: None,
            closed: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn connect(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(self.transport("pipe is closed"));
        }
        if self.handle.is_some() {
            return Ok(());
        }
        let handle = match self.role {
            NativeRole::Client => {
                client_create_with_retry(self.backend.as_ref(), &self.path, self.retry)?
            }
            NativeRole::Server => self
                .backend
                .server_create(&self.path, ServerOptions::default())
                .map_err(|err| self.transport("failed to create native pipe").with_source(err))?,
        };
        self.handle = Some(handle);
        Ok(())
    }

    fn transport(&self, message: &str) -> Error {
        Error::new(ErrorKind::Transport)
            .with_message(message.to_string())
            .with_path(&self.path)
    }

    fn handle(&mut self) -> Result<&mut Box<dyn NativePipeHandle>, Error> {
        if self.closed {
            return Err(Error::new(ErrorKind::Transport)
                .with_message("pipe is closed")
                .with_path(&self.path));
        }
        self.handle.as_mut().ok_or_else(|| {
            Error::new(ErrorKind::Transport)
                .with_message("pipe is not connected")
                .with_path(&self.path)
        })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.handle()?.read(buf).map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("native pipe read failed")
                .with_source(err)
        })
    }

    /// Writes all of `buf`; a short write from the handle is retried, zero is an error.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let handle = self.handle()?;
        let mut written = 0;
        while written < buf.len() {
            match handle.write(&buf[written..]) {
                Ok(0) => {
                    return Err(Error::new(ErrorKind::Transport).with_message(format!(
                        "native pipe accepted {written} of {} bytes",
                        buf.len()
                    )));
                }
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    return Err(Error::new(ErrorKind::Transport)
                        .with_message("native pipe write failed")
                        .with_source(err));
                }
            }
        }
        Ok(written)
    }

    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.handle.take() {
            Some(mut handle) => handle
                .close()
                .map_err(|err| self.transport("native pipe close failed").with_source(err)),
            None => Ok(()),
        }
    }

    pub fn discard(&mut self) {
        if let Err(err) = self.close() {
            debug!(path = %self.path, error = %err, "native pipe discard failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_backend {
    use super::{NativePipeBackend, NativePipeHandle, ServerOptions};
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// In-memory pipes: a server must exist before a client can attach.
    #[derive(Clone, Default)]
    pub struct TestBackend {
        pub(crate) pipes: Arc<Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>>,
        pub client_attempts: Arc<AtomicU32>,
        // Client creates fail until this many attempts were made.
        pub fail_first: u32,
    }

    struct MemHandle {
        data: Arc<Mutex<Vec<u8>>>,
        open: bool,
    }

    impl NativePipeHandle for MemHandle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut data = self.data.lock().unwrap_or_else(|p| p.into_inner());
            let n = buf.len().min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
            data.drain(..n);
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !self.open {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
            }
            // Accept at most 3 bytes per call to exercise short writes.
            let n = buf.len().min(3);
            self.data
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn close(&mut self) -> io::Result<()> {
            self.open = false;
            Ok(())
        }
    }

    impl TestBackend {
        pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
            let pipes = self.pipes.lock().unwrap_or_else(|p| p.into_inner());
            pipes
                .get(path)
                .map(|data| data.lock().unwrap_or_else(|p| p.into_inner()).clone())
        }
    }

    impl NativePipeBackend for TestBackend {
        fn server_create(
            &self,
            path: &str,
            _options: ServerOptions,
        ) -> io::Result<Box<dyn NativePipeHandle>> {
            let data = Arc::new(Mutex::new(Vec::new()));
            self.pipes
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(path.to_string(), Arc::clone(&data));
            Ok(Box::new(MemHandle { data, open: true }))
        }

        fn client_create(&self, path: &str) -> io::Result<Box<dyn NativePipeHandle>> {
            let attempt = self.client_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let pipes = self.pipes.lock().unwrap_or_else(|p| p.into_inner());
            match pipes.get(path) {
                Some(data) if attempt > self.fail_first => Ok(Box::new(MemHandle {
                    data: Arc::clone(data),
                    open: true,
                })),
                _ => Err(io::Error::new(io::ErrorKind::NotFound, "no such pipe")),
            }
        }
    }
}
