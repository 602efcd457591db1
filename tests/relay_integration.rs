// Relay tunnel tests against an in-process relay and real FIFOs.
#![cfg(unix)]

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use pipeload::api::{ClientProxy, ErrorKind, Platform, RelayConfig, RelayServer, RelayShutdown, RemotePipe};
use pipeload::core::tunnel::relay::WorkerSet;

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

static RELAY_LOCK: Mutex<()> = Mutex::new(());

struct TestRelay {
    addr: std::net::SocketAddr,
    workers: WorkerSet,
    shutdown: RelayShutdown,
    handle: Option<JoinHandle<()>>,
    _guard: MutexGuard<'static, ()>,
}

impl TestRelay {
    fn start(fifo_dir: &Path, reap_interval: Duration) -> TestResult<Self> {
        let guard = RELAY_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let config = RelayConfig {
            bind: "127.0.0.1:0".parse()?,
            reap_interval,
            fifo_dir: fifo_dir.to_path_buf(),
        };
        let server = RelayServer::bind(config)?;
        let addr = server.local_addr();
        let workers = server.workers();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || {
            server.run().expect("relay run");
        });
        Ok(Self {
            addr,
            workers,
            shutdown,
            handle: Some(handle),
            _guard: guard,
        })
    }

    fn proxy(&self) -> TestResult<Arc<ClientProxy>> {
        Ok(Arc::new(ClientProxy::connect(self.addr, Duration::from_secs(5))?))
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

fn spawn_fifo_reader(path: PathBuf) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        assert!(wait_until(Duration::from_secs(5), || path.exists()), "fifo never appeared");
        let mut data = Vec::new();
        File::open(&path)
            .expect("open fifo")
            .read_to_end(&mut data)
            .expect("read fifo");
        data
    })
}

#[test]
fn ok_reply_then_bytes_arrive_verbatim_and_in_order() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let relay = TestRelay::start(temp.path(), Duration::from_millis(100))?;
    let proxy = relay.proxy()?;
    assert_eq!(proxy.remote_os(), Platform::local_os_name());
    assert_eq!(proxy.platform(), Platform::Unix);

    let reader = spawn_fifo_reader(temp.path().join("load_ok"));
    let mut pipe = RemotePipe::new("load_ok", Arc::clone(&proxy));
    pipe.connect()?;

    let mut expected = Vec::new();
    for chunk in 0..50u8 {
        let bytes: Vec<u8> = (0..=255u8).map(|b| b.wrapping_add(chunk)).collect();
        assert_eq!(pipe.write(&bytes)?, bytes.len());
        expected.extend_from_slice(&bytes);
    }
    pipe.close()?;

    let received = reader.join().expect("reader thread");
    assert_eq!(received, expected);
    assert!(wait_until(Duration::from_secs(2), || !temp.path().join("load_ok").exists()));
    Ok(())
}

#[test]
fn fail_reply_surfaces_promptly() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    fs::write(temp.path().join("taken"), b"occupied")?;
    let relay = TestRelay::start(temp.path(), Duration::from_millis(100))?;
    let proxy = relay.proxy()?;

    let started = Instant::now();
    let mut pipe = RemotePipe::new("taken", Arc::clone(&proxy));
    let err = pipe.connect().expect_err("relay should refuse");
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!proxy.is_connected());
    assert_eq!(fs::read(temp.path().join("taken"))?, b"occupied");
    Ok(())
}

#[test]
fn invalid_pipe_names_are_refused() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let relay = TestRelay::start(temp.path(), Duration::from_millis(100))?;
    let proxy = relay.proxy()?;
    let err = RemotePipe::new("../escape", proxy)
        .connect()
        .expect_err("path traversal");
    assert_eq!(err.kind(), ErrorKind::Protocol);
    Ok(())
}

#[test]
fn finished_workers_are_reaped_within_an_interval() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let interval = Duration::from_millis(200);
    let relay = TestRelay::start(temp.path(), interval)?;

    let reader = spawn_fifo_reader(temp.path().join("reap_me"));
    let proxy = relay.proxy()?;
    let mut pipe = RemotePipe::new("reap_me", Arc::clone(&proxy));
    pipe.connect()?;
    pipe.write(b"row\n")?;
    assert_eq!(relay.workers.len(), 1);
    pipe.close()?;
    assert_eq!(reader.join().expect("reader thread"), b"row\n");

    assert!(
        wait_until(interval * 5, || relay.workers.is_empty()),
        "worker was not reaped: {:?}",
        relay.workers.ids()
    );
    Ok(())
}

#[test]
fn unreachable_relay_is_a_connection_error() -> TestResult<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);
    let err = ClientProxy::connect(addr, Duration::from_millis(500)).expect_err("nothing listening");
    assert_eq!(err.kind(), ErrorKind::Connection);
    Ok(())
}
