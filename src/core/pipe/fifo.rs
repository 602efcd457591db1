//! Purpose: Local FIFO endpoint backed by a special file in a fixed directory.
//! Exports: `FifoPipe`, `AbortHook`.
//! Role: Unix transport for both the load session and the relay worker.
//! Invariants: The FIFO is created with mode 0644 and removed on close or discard.
//! Invariants: Opening the write side blocks until a reader attaches, unless an
//! abort hook reports that no reader will ever come.
//! Invariants: `close` always opens the write side once so a waiting reader sees EOF.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::core::error::{Error, ErrorKind};

pub type AbortHook = Arc<dyn Fn() -> bool + Send + Sync>;

const OPEN_POLL: Duration = Duration::from_millis(10);
pub const FIFO_MODE: u32 = 0o644;

pub struct FifoPipe {
    name: String,
    path: PathBuf,
    reader: Option<File>,
    writer: Option<File>,
    abort: Option<AbortHook>,
    created: bool,
    closed: bool,
}

impl std::fmt::Debug for FifoPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoPipe")
            .field("path", &self.path)
            .field("created", &self.created)
            .field("closed", &self.closed)
            .finish()
    }
}

impl FifoPipe {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: dir.join(name),
            reader: None,
            writer: None,
            abort: None,
            created: false,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_abort_hook(&mut self, hook: AbortHook) {
        self.abort = Some(hook);
    }

    fn transport(&self, message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Transport)
            .with_message(message)
            .with_path(&self.path)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(self.transport("pipe is closed"));
        }
        if !self.created {
            return Err(self.transport("pipe is not connected"));
        }
        Ok(())
    }

    /// Creates the special file. Fails if anything already exists at the path.
    pub fn connect(&mut self) -> Result<(), Error> {
        if self.created {
            return Ok(());
        }
        make_fifo(&self.path).map_err(|err| {
            let message = if err.kind() == io::ErrorKind::AlreadyExists {
                "pipe already exists"
            } else {
                "failed to create pipe"
            };
            self.transport(message).with_source(err)
        })?;
        self.created = true;
        debug!(path = %self.path.display(), "created fifo");
        Ok(())
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.ensure_open()?;
        if self.reader.is_none() {
            let file = File::open(&self.path)
                .map_err(|err| self.transport("failed to open pipe for reading").with_source(err))?;
            self.reader = Some(file);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };
        reader
            .read(buf)
            .map_err(|err| Error::new(ErrorKind::Transport).with_message("pipe read failed").with_source(err))
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.ensure_open()?;
        let writer = self.open_writer()?;
        writer.write_all(buf).map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("pipe write failed")
                .with_source(err)
        })?;
        Ok(buf.len())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush().map_err(|err| {
                Error::new(ErrorKind::Transport)
                    .with_message("pipe flush failed")
                    .with_source(err)
            }),
            None => Ok(()),
        }
    }

    fn open_writer(&mut self) -> Result<&mut File, Error> {
        if self.writer.is_none() {
            let file = match &self.abort {
                Some(abort) => open_write_polling(&self.path, abort.as_ref()),
                None => OpenOptions::new().write(true).open(&self.path),
            }
            .map_err(|err| self.transport("failed to open pipe for writing").with_source(err))?;
            self.writer = Some(file);
        }
        self.writer.as_mut().ok_or_else(|| {
            Error::new(ErrorKind::Transport)
                .with_message("pipe writer unavailable")
                .with_path(&self.path)
        })
    }

    /// Opens the write side if it never was, then releases both sides and removes the file.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed || !self.created {
            self.closed = true;
            return Ok(());
        }
        let opened = self.open_writer().map(|_| ());
        let flushed = self.flush();
        self.writer = None;
        self.reader = None;
        let removed = self.remove_file();
        self.closed = true;
        opened.and(flushed).and(removed)
    }

    /// Releases handles and removes the file without waiting for a reader.
    pub fn discard(&mut self) {
        self.writer = None;
        self.reader = None;
        if self.created && !self.closed {
            if let Err(err) = self.remove_file() {
                debug!(path = %self.path.display(), error = %err, "fifo discard failed");
            }
        }
        self.closed = true;
    }

    fn remove_file(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.transport("failed to remove pipe").with_source(err)),
        }
    }
}

impl Drop for FifoPipe {
    fn drop(&mut self) {
        if !self.closed {
            self.discard();
        }
    }
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::PermissionsExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    // SAFETY: `c_path` is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), FIFO_MODE as libc::mode_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // mkfifo honours the umask; force the documented mode.
    fs::set_permissions(path, fs::Permissions::from_mode(FIFO_MODE))
}

#[cfg(not(unix))]
fn make_fifo(_path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "fifo pipes are only available on unix",
    ))
}

/// Non-blocking open retried until a reader appears or `abort` fires.
#[cfg(unix)]
fn open_write_polling(path: &Path, abort: &(dyn Fn() -> bool + Send + Sync)) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => {
                let fd = file.as_raw_fd();
                // SAFETY: `fd` is owned by `file`, which is alive for both calls.
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
                if flags < 0 {
                    return Err(io::Error::last_os_error());
                }
                // SAFETY: as above; only the O_NONBLOCK bit is cleared.
                if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
                    return Err(io::Error::last_os_error());
                }
                return Ok(file);
            }
            Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {
                if abort() {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "reader went away before opening the pipe",
                    ));
                }
                std::thread::sleep(OPEN_POLL);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(not(unix))]
fn open_write_polling(path: &Path, _abort: &(dyn Fn() -> bool + Send + Sync)) -> io::Result<File> {
    OpenOptions::new().write(true).open(path)
}
