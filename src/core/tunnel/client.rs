//! Purpose: Client half of the tunnel: connect, learn the relay's platform, open a
//! remote pipe within a deadline, then stream payload bytes.
//! Exports: `ClientProxy`, `RemotePipe`, `DEFAULT_HANDSHAKE_TIMEOUT`.
//! Role: Backs `PipeEndpoint::Tunnel` for load sessions targeting a remote host.
//! Invariants: The pipe-name handshake never blocks the caller past its deadline.
//! Invariants: `disconnect` is idempotent and half-closes the socket so the relay sees EOF.
use std::io::{BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use super::wire::{read_utf, write_utf};
use super::REPLY_OK;
use crate::core::error::{Error, ErrorKind};
use crate::core::pipe::Platform;
use crate::core::task::{TaskOutcome, run_with_deadline};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);
const WRITE_BUFFER: usize = 64 * 1024;

pub struct ClientProxy {
    peer: SocketAddr,
    remote_os: String,
    platform: Platform,
    control: TcpStream,
    writer: Mutex<Option<BufWriter<TcpStream>>>,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for ClientProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProxy")
            .field("peer", &self.peer)
            .field("remote_os", &self.remote_os)
            .finish()
    }
}

fn connection_error(message: impl Into<String>, err: std::io::Error) -> Error {
    Error::new(ErrorKind::Connection)
        .with_message(message)
        .with_source(err)
}

impl ClientProxy {
    /// Connects to a relay and reads the OS name it announces.
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, Error> {
        let addrs = addr
            .to_socket_addrs()
            .map_err(|err| connection_error("failed to resolve relay address", err))?;
        let mut last = None;
        let mut stream = None;
        for candidate in addrs {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(connected) => {
                    stream = Some(connected);
                    break;
                }
                Err(err) => last = Some((candidate, err)),
            }
        }
        let stream = match (stream, last) {
            (Some(stream), _) => stream,
            (None, Some((candidate, err))) => {
                return Err(connection_error(format!("failed to connect to relay at {candidate}"), err)
                    .with_hint("Check that `pipeload relay` is running on the database host."));
            }
            (None, None) => {
                return Err(Error::new(ErrorKind::Connection)
                    .with_message("relay address resolved to nothing"));
            }
        };
        let peer = stream
            .peer_addr()
            .map_err(|err| connection_error("failed to read relay address", err))?;
        let _ = stream.set_nodelay(true);

        stream
            .set_read_timeout(Some(timeout))
            .map_err(|err| connection_error("failed to set read timeout", err))?;
        let remote_os = read_utf(&mut &stream)?;
        stream
            .set_read_timeout(None)
            .map_err(|err| connection_error("failed to clear read timeout", err))?;
        let platform = Platform::from_os_name(&remote_os)?;
        debug!(%peer, remote_os = %remote_os, "connected to relay");

        let writer = stream
            .try_clone()
            .map_err(|err| connection_error("failed to clone relay socket", err))?;
        Ok(Self {
            peer,
            remote_os,
            platform,
            control: stream,
            writer: Mutex::new(Some(BufWriter::with_capacity(WRITE_BUFFER, writer))),
            handshake_timeout: timeout,
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn remote_os(&self) -> &str {
        &self.remote_os
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    fn writer(&self) -> MutexGuard<'_, Option<BufWriter<TcpStream>>> {
        self.writer.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Asks the relay to open `name` locally; fails with `Timeout` past the handshake deadline.
    pub fn open_pipe(&self, name: &str) -> Result<(), Error> {
        let clone = |what: &str| {
            self.control
                .try_clone()
                .map_err(|err| connection_error(format!("failed to clone relay socket for {what}"), err))
        };
        let mut stream = clone("handshake")?;
        let canceller = clone("cancel")?;
        let pipe = name.to_string();
        let deadline = self.handshake_timeout;

        let outcome = run_with_deadline(
            "pipeload-handshake",
            deadline,
            deadline.min(Duration::from_secs(1)),
            move || -> Result<String, Error> {
                write_utf(&mut stream, &pipe)?;
                read_utf(&mut stream)
            },
            move || {
                let _ = canceller.shutdown(Shutdown::Both);
            },
        )?;

        let timed_out = || {
            Error::new(ErrorKind::Timeout).with_message(format!(
                "connection to relay timed out after {}ms",
                deadline.as_millis()
            ))
        };
        let result = match outcome {
            TaskOutcome::Completed(Ok(reply)) if reply == REPLY_OK => Ok(()),
            TaskOutcome::Completed(Ok(reply)) => Err(Error::new(ErrorKind::Protocol)
                .with_message(format!("relay failed to create pipe {name} on remote side"))
                .with_hint(format!("relay replied \"{reply}\"; see the relay log for the cause"))),
            TaskOutcome::Completed(Err(err)) => Err(err),
            TaskOutcome::Cancelled(Ok(_)) => Err(timed_out()),
            TaskOutcome::Cancelled(Err(err)) => Err(timed_out().with_source(err)),
            TaskOutcome::Detached => {
                warn!(pipe = name, "handshake thread still blocked after cancel");
                Err(timed_out())
            }
        };
        if result.is_err() {
            let _ = self.disconnect();
        }
        result
    }

    /// Sends all of `buf`, or fails; partial writes are never reported as success.
    pub fn write(&self, buf: &[u8]) -> Result<(), Error> {
        let mut guard = self.writer();
        let writer = guard.as_mut().ok_or_else(|| {
            Error::new(ErrorKind::Transport).with_message("tunnel is disconnected")
        })?;
        writer.write_all(buf).map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("failed to send data to relay")
                .with_source(err)
        })
    }

    pub fn flush(&self) -> Result<(), Error> {
        match self.writer().as_mut() {
            Some(writer) => writer.flush().map_err(|err| {
                Error::new(ErrorKind::Transport)
                    .with_message("failed to flush data to relay")
                    .with_source(err)
            }),
            None => Ok(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.writer().is_some()
    }

    /// Flushes pending bytes and signals EOF to the relay. Safe to call more than once.
    pub fn disconnect(&self) -> Result<(), Error> {
        let Some(mut writer) = self.writer().take() else {
            return Ok(());
        };
        let flushed = writer.flush();
        let _ = self.control.shutdown(Shutdown::Write);
        let _ = self.control.shutdown(Shutdown::Both);
        debug!(peer = %self.peer, "disconnected from relay");
        flushed.map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("failed to flush data to relay")
                .with_source(err)
        })
    }
}

impl Drop for ClientProxy {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

/// Write-only endpoint for a pipe owned by a remote relay.
#[derive(Debug)]
pub struct RemotePipe {
    name: String,
    proxy: Arc<ClientProxy>,
    connected: bool,
    closed: bool,
}

impl RemotePipe {
    pub fn new(name: &str, proxy: Arc<ClientProxy>) -> Self {
        Self {
            name: name.to_string(),
            proxy,
            connected: false,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connect(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::new(ErrorKind::Transport).with_message("pipe is closed"));
        }
        if !self.connected {
            self.proxy.open_pipe(&self.name)?;
            self.connected = true;
        }
        Ok(())
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if self.closed || !self.connected {
            return Err(Error::new(ErrorKind::Transport).with_message(if self.closed {
                "pipe is closed"
            } else {
                "pipe is not connected"
            }));
        }
        self.proxy.write(buf)?;
        Ok(buf.len())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.proxy.flush()
    }

    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.proxy.disconnect()
    }

    pub fn discard(&mut self) {
        if let Err(err) = self.close() {
            debug!(pipe = %self.name, error = %err, "remote pipe discard failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tunnel::REPLY_FAIL;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    // Minimal scripted relay: announce `os`, read the pipe name, reply, then collect payload.
    fn scripted_relay(os: &'static str, reply: Option<&'static str>) -> (SocketAddr, thread::JoinHandle<(String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().expect("accept");
            write_utf(&mut socket, os).expect("os");
            let name = read_utf(&mut socket).expect("name");
            let Some(reply) = reply else {
                // Never answer; hold the socket until the client gives up.
                let mut sink = Vec::new();
                let _ = socket.read_to_end(&mut sink);
                return (name, Vec::new());
            };
            write_utf(&mut socket, reply).expect("reply");
            let mut payload = Vec::new();
            let _ = socket.read_to_end(&mut payload);
            (name, payload)
        });
        (addr, handle)
    }

    #[test]
    fn handshake_ok_then_payload_reaches_relay() {
        let (addr, relay) = scripted_relay("Linux", Some(REPLY_OK));
        let proxy = Arc::new(ClientProxy::connect(addr, Duration::from_secs(5)).expect("connect"));
        assert_eq!(proxy.remote_os(), "Linux");
        assert_eq!(proxy.platform(), Platform::Unix);

        let mut pipe = RemotePipe::new("bhnamedpipe_1", Arc::clone(&proxy));
        pipe.connect().expect("open");
        assert_eq!(pipe.write(b"abc").expect("write"), 3);
        pipe.write(b"def").expect("write");
        pipe.close().expect("close");
        pipe.close().expect("idempotent");

        let (name, payload) = relay.join().expect("relay");
        assert_eq!(name, "bhnamedpipe_1");
        assert_eq!(payload, b"abcdef");
        assert!(!proxy.is_connected());
    }

    #[test]
    fn fail_reply_is_protocol_error_and_tears_down() {
        let (addr, relay) = scripted_relay("Windows 10", Some(REPLY_FAIL));
        let proxy = Arc::new(ClientProxy::connect(addr, Duration::from_secs(5)).expect("connect"));
        assert_eq!(proxy.platform(), Platform::Windows);
        let mut pipe = RemotePipe::new("p", Arc::clone(&proxy));
        let err = pipe.connect().expect_err("fail");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(!proxy.is_connected());
        let _ = relay.join();
    }

    #[test]
    fn silent_relay_times_out_promptly() {
        let (addr, relay) = scripted_relay("Linux", None);
        let proxy = ClientProxy::connect(addr, Duration::from_secs(5))
            .expect("connect")
            .with_handshake_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = proxy.open_pipe("p").expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(3));
        drop(proxy);
        let _ = relay.join();
    }

    #[test]
    fn unknown_platform_is_rejected_at_connect() {
        let (addr, _relay) = scripted_relay("Plan 9", Some(REPLY_OK));
        let err = ClientProxy::connect(addr, Duration::from_secs(5)).expect_err("platform");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn unreachable_relay_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let err = ClientProxy::connect(addr, Duration::from_secs(2)).expect_err("refused");
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn writes_before_open_are_rejected() {
        let (addr, _relay) = scripted_relay("Linux", Some(REPLY_OK));
        let proxy = Arc::new(ClientProxy::connect(addr, Duration::from_secs(5)).expect("connect"));
        let mut pipe = RemotePipe::new("p", proxy);
        assert_eq!(
            pipe.write(b"x").expect_err("not open").message(),
            Some("pipe is not connected")
        );
    }
}
