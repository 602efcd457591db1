//! Purpose: Relay server that owns real local pipes on behalf of remote loaders.
//! Exports: `RelayServer`, `RelayConfig`, `RelayShutdown`, `WorkerSet`.
//! Role: Long-running process on the database host (`pipeload relay`).
//! Invariants: One worker thread per accepted connection, ids strictly increasing.
//! Invariants: The live-worker lock is held only to insert or to split off finished
//! workers; joins happen after the lock is released.
//! Invariants: A reaped worker has always finished running.
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::wire::{read_utf, write_utf};
use super::{DEFAULT_RELAY_PORT, REPLY_FAIL, REPLY_OK};
use crate::core::error::{Error, ErrorKind};
use crate::core::pipe::{PipeEndpoint, PipeFactory, Platform, DEFAULT_FIFO_DIR};

const COPY_BUFFER: usize = 64 * 1024;
const REAPER_TICK: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub reap_interval: Duration,
    pub fifo_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_RELAY_PORT)),
            reap_interval: Duration::from_millis(1000),
            fifo_dir: PathBuf::from(DEFAULT_FIFO_DIR),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.reap_interval.is_zero() {
            return Err(Error::new(ErrorKind::Usage).with_message("reap interval must be positive"));
        }
        if Platform::local() == Platform::Unix && !self.fifo_dir.is_dir() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("pipe directory does not exist")
                .with_path(&self.fifo_dir));
        }
        Ok(())
    }
}

struct Worker {
    id: u64,
    peer: SocketAddr,
    handle: JoinHandle<()>,
}

/// Live worker threads shared by the accept loop and the reaper.
#[derive(Clone, Default)]
pub struct WorkerSet {
    inner: Arc<Mutex<Vec<Worker>>>,
}

impl WorkerSet {
    fn lock(&self) -> MutexGuard<'_, Vec<Worker>> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn insert(&self, worker: Worker) {
        self.lock().push(worker);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.lock().iter().map(|worker| worker.id).collect()
    }

    /// Removes and joins every worker whose thread has finished; returns their ids.
    pub fn reap(&self) -> Vec<u64> {
        let finished = {
            let mut workers = self.lock();
            let mut finished = Vec::new();
            let mut index = 0;
            while index < workers.len() {
                if workers[index].handle.is_finished() {
                    finished.push(workers.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            finished
        };
        let mut reaped = Vec::with_capacity(finished.len());
        for worker in finished {
            if worker.handle.join().is_err() {
                warn!(worker = worker.id, "relay worker panicked");
            }
            info!(worker = worker.id, peer = %worker.peer, "Reaped worker [{}]", worker.id);
            reaped.push(worker.id);
        }
        reaped
    }
}

/// Stops a running relay from another thread.
#[derive(Clone, Debug)]
pub struct RelayShutdown {
    flag: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl RelayShutdown {
    pub fn trigger(&self) {
        if self.flag.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake the blocking accept.
        let mut wake = self.addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(if wake.is_ipv4() {
                std::net::Ipv4Addr::LOCALHOST.into()
            } else {
                std::net::Ipv6Addr::LOCALHOST.into()
            });
        }
        let _ = TcpStream::connect_timeout(&wake, Duration::from_millis(500));
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

pub struct RelayServer {
    listener: TcpListener,
    addr: SocketAddr,
    config: RelayConfig,
    factory: PipeFactory,
    workers: WorkerSet,
    next_worker_id: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl RelayServer {
    pub fn bind(config: RelayConfig) -> Result<Self, Error> {
        let factory = PipeFactory::local(config.fifo_dir.clone());
        Self::bind_with_factory(config, factory)
    }

    pub fn bind_with_factory(config: RelayConfig, factory: PipeFactory) -> Result<Self, Error> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind).map_err(|err| {
            Error::new(ErrorKind::Connection)
                .with_message(format!("failed to bind relay to {}", config.bind))
                .with_source(err)
        })?;
        let addr = listener.local_addr().map_err(|err| {
            Error::new(ErrorKind::Connection)
                .with_message("failed to read relay address")
                .with_source(err)
        })?;
        Ok(Self {
            listener,
            addr,
            config,
            factory,
            workers: WorkerSet::default(),
            next_worker_id: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn workers(&self) -> WorkerSet {
        self.workers.clone()
    }

    pub fn shutdown_handle(&self) -> RelayShutdown {
        RelayShutdown {
            flag: Arc::clone(&self.shutdown),
            addr: self.addr,
        }
    }

    /// Accepts connections until the shutdown handle fires.
    pub fn run(&self) -> Result<(), Error> {
        info!(addr = %self.addr, os = Platform::local_os_name(), "relay listening");
        let reaper = self.spawn_reaper()?;

        for incoming in self.listener.incoming() {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let stream = match incoming {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };
            if let Err(err) = self.spawn_worker(stream) {
                error!(error = %err, "failed to start relay worker");
            }
        }

        let _ = reaper.join();
        self.workers.reap();
        let left = self.workers.len();
        if left > 0 {
            warn!(workers = left, "relay stopping with workers still running");
        }
        info!("relay stopped");
        Ok(())
    }

    fn spawn_reaper(&self) -> Result<JoinHandle<()>, Error> {
        let workers = self.workers.clone();
        let stop = Arc::clone(&self.shutdown);
        let interval = self.config.reap_interval;
        thread::Builder::new()
            .name("pipeload-reaper".to_string())
            .spawn(move || {
                let mut last = Instant::now();
                while !stop.load(Ordering::Acquire) {
                    thread::sleep(REAPER_TICK.min(interval));
                    if last.elapsed() >= interval {
                        workers.reap();
                        last = Instant::now();
                    }
                }
            })
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to spawn reaper thread")
                    .with_source(err)
            })
    }

    fn spawn_worker(&self, stream: TcpStream) -> Result<(), Error> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed) + 1;
        let peer = stream.peer_addr().map_err(|err| {
            Error::new(ErrorKind::Connection)
                .with_message("failed to read client address")
                .with_source(err)
        })?;
        let factory = self.factory.clone();
        let handle = thread::Builder::new()
            .name(format!("pipeload-worker-{id}"))
            .spawn(move || serve_connection(id, stream, &factory))
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to spawn worker thread")
                    .with_source(err)
            })?;
        debug!(worker = id, %peer, "accepted connection");
        self.workers.insert(Worker { id, peer, handle });
        Ok(())
    }
}

fn valid_pipe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn serve_connection(id: u64, mut stream: TcpStream, factory: &PipeFactory) {
    let _ = stream.set_nodelay(true);
    match relay_one(id, &mut stream, factory) {
        Ok(bytes) => info!(worker = id, bytes, "transfer complete"),
        Err(err) => warn!(worker = id, error = %err, "transfer failed"),
    }
    let _ = stream.shutdown(Shutdown::Both);
}

fn relay_one(id: u64, stream: &mut TcpStream, factory: &PipeFactory) -> Result<u64, Error> {
    write_utf(stream, Platform::local_os_name())?;
    let name = read_utf(stream)?;
    debug!(worker = id, pipe = %name, "pipe requested");

    let acquired = if valid_pipe_name(&name) {
        factory.strategy().acquire(factory, &name)
    } else {
        Err(Error::new(ErrorKind::Protocol).with_message(format!("invalid pipe name \"{name}\"")))
    };
    let mut endpoint = match acquired {
        Ok(endpoint) => endpoint,
        Err(err) => {
            let _ = write_utf(stream, REPLY_FAIL);
            return Err(err);
        }
    };
    if let Err(err) = write_utf(stream, REPLY_OK) {
        endpoint.discard();
        return Err(err);
    }

    match copy_until_eof(stream, &mut endpoint) {
        Ok(bytes) => {
            endpoint.close()?;
            Ok(bytes)
        }
        Err(err) => {
            endpoint.discard();
            Err(err)
        }
    }
}

fn copy_until_eof(stream: &mut TcpStream, endpoint: &mut PipeEndpoint) -> Result<u64, Error> {
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let read = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(Error::new(ErrorKind::Connection)
                    .with_message("failed to read from client")
                    .with_source(err));
            }
        };
        endpoint.write(&buf[..read])?;
        total += read as u64;
    }
    endpoint.flush()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_names_cannot_escape_the_pipe_directory() {
        assert!(valid_pipe_name("bhnamedpipe_10_11_12_123-1"));
        for bad in ["", ".", "..", "../etc/passwd", "a/b", r"a\b"] {
            assert!(!valid_pipe_name(bad), "{bad:?}");
        }
    }

    #[test]
    fn reap_joins_only_finished_workers() {
        let set = WorkerSet::default();
        let peer = SocketAddr::from(([127, 0, 0, 1], 1));
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        set.insert(Worker {
            id: 1,
            peer,
            handle: thread::spawn(|| {}),
        });
        set.insert(Worker {
            id: 2,
            peer,
            handle: thread::spawn(move || {
                let _ = release_rx.recv();
            }),
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut reaped = Vec::new();
        while reaped.is_empty() && Instant::now() < deadline {
            reaped = set.reap();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(reaped, vec![1]);
        assert_eq!(set.ids(), vec![2]);

        release_tx.send(()).expect("release");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !set.is_empty() && Instant::now() < deadline {
            set.reap();
            thread::sleep(Duration::from_millis(5));
        }
        assert!(set.is_empty());
    }

    #[test]
    fn zero_reap_interval_is_rejected() {
        let config = RelayConfig {
            reap_interval: Duration::ZERO,
            ..RelayConfig::default()
        };
        assert_eq!(config.validate().expect_err("zero").kind(), ErrorKind::Usage);
    }
}
