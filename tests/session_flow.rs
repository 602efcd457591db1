// Load session tests with fake statement executors standing in for the database.
#![cfg(unix)]

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pipeload::api::{
    ClientProxy, ColumnSpec, DataFormat, Error, ErrorKind, LoadConfig, LoadSession, LoadTarget,
    PipeFactory, Record, RecordOptions, RelayConfig, RelayServer, SessionRegistry, SessionState,
    StatementExecutor,
};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

fn specs() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::new("id", "INT"),
        ColumnSpec::new("name", "VARCHAR").with_precision(32, 0),
        ColumnSpec::new("born", "DATE"),
    ]
}

fn infile_path(sql: &str) -> Option<PathBuf> {
    let start = sql.find("infile '")? + "infile '".len();
    let end = sql[start..].find('\'')? + start;
    Some(PathBuf::from(sql[start..end].replace("\\\\", "\\")))
}

/// Reads the pipe named by the load statement to EOF, like a database would.
#[derive(Default)]
struct FifoLoader {
    statements: Mutex<Vec<String>>,
    loaded: Mutex<Vec<u8>>,
}

impl StatementExecutor for FifoLoader {
    fn execute(&self, sql: &str) -> Result<(), Error> {
        self.statements
            .lock()
            .expect("statements")
            .push(sql.to_string());
        let Some(path) = infile_path(sql) else {
            return Ok(());
        };
        let mut data = Vec::new();
        File::open(&path)
            .and_then(|mut file| file.read_to_end(&mut data))
            .map_err(|err| {
                Error::new(ErrorKind::SqlExecution)
                    .with_message("loader could not read pipe")
                    .with_source(err)
            })?;
        self.loaded.lock().expect("loaded").extend_from_slice(&data);
        Ok(())
    }

    fn cancel(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Blocks any statement starting with `prefix` until cancelled.
struct Stalling {
    prefix: &'static str,
    released: Mutex<bool>,
    wake: Condvar,
    cancels: AtomicUsize,
}

impl Stalling {
    fn new(prefix: &'static str) -> Arc<Self> {
        Arc::new(Self {
            prefix,
            released: Mutex::new(false),
            wake: Condvar::new(),
            cancels: AtomicUsize::new(0),
        })
    }
}

impl StatementExecutor for Stalling {
    fn execute(&self, sql: &str) -> Result<(), Error> {
        if !sql.starts_with(self.prefix) {
            return Ok(());
        }
        let mut released = self.released.lock().expect("released");
        while !*released {
            released = self.wake.wait(released).expect("wait");
        }
        Err(Error::new(ErrorKind::SqlExecution).with_message("statement cancelled"))
    }

    fn cancel(&self) -> Result<(), Error> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        *self.released.lock().expect("released") = true;
        self.wake.notify_all();
        Ok(())
    }
}

struct Failing;

impl StatementExecutor for Failing {
    fn execute(&self, sql: &str) -> Result<(), Error> {
        if sql.starts_with("load data") {
            return Err(Error::new(ErrorKind::SqlExecution).with_message("table t1 does not exist"));
        }
        Ok(())
    }

    fn cancel(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("buf").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn fill(record: &mut Record, id: i64, name: Option<&str>) -> TestResult<()> {
    record.column_mut(0).ok_or("id")?.set_i64(id)?;
    let column = record.column_mut(1).ok_or("name")?;
    match name {
        Some(name) => column.set_str(name)?,
        None => column.set_null(true),
    }
    record.column_mut(2).ok_or("born")?.set_from_text("1888-02-29")?;
    Ok(())
}

fn decode_all(bytes: &[u8]) -> TestResult<Vec<(Option<i64>, Option<String>)>> {
    let mut record = Record::from_specs(&specs(), DataFormat::Binary, RecordOptions::default())?;
    let mut input = bytes;
    let mut rows = Vec::new();
    while record.read_binary(&mut input)? {
        let id = record.column(0).and_then(|c| c.as_i64());
        let name = record.column(1).and_then(|c| c.encode_text().ok().flatten());
        rows.push((id, name));
    }
    Ok(rows)
}

#[test]
fn local_fifo_session_streams_records_to_the_loader() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let registry = SessionRegistry::new();
    let loader = Arc::new(FifoLoader::default());
    let config = LoadConfig::new("t1").with_fifo_dir(temp.path());
    let mut session = LoadSession::with_factory(
        config,
        PipeFactory::local(temp.path()),
        false,
        loader.clone(),
        specs(),
        Arc::clone(&registry),
    )?;
    let tee = SharedBuf::default();
    session.set_debug_writer(Box::new(tee.clone()))?;
    let mut record = session.create_record()?;

    session.start()?;
    assert_eq!(session.state(), SessionState::Running);
    for (id, name) in [(1, Some("ann")), (2, None), (3, Some("o'brien"))] {
        fill(&mut record, id, name)?;
        session.write_record(&mut record)?;
    }
    session.stop()?;
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(registry.is_empty());

    let loaded = loader.loaded.lock().expect("loaded").clone();
    assert_eq!(loaded, *tee.0.lock().expect("tee"));
    let rows = decode_all(&loaded)?;
    assert_eq!(
        rows,
        vec![
            (Some(1), Some("ann".to_string())),
            (Some(2), None),
            (Some(3), Some("o'brien".to_string())),
        ]
    );

    let statements = loader.statements.lock().expect("statements").clone();
    assert_eq!(statements[0], "set @bh_dataformat='binary';");
    assert!(statements[1].starts_with("load data infile '"));
    assert!(statements[1].contains(session.pipe_name()));
    assert!(!temp.path().join(session.pipe_name()).exists());
    Ok(())
}

#[test]
fn startup_timeout_cancels_and_reports() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let registry = SessionRegistry::new();
    let executor = Stalling::new("set @bh_dataformat");
    let config = LoadConfig {
        poll_interval: Duration::from_millis(20),
        ..LoadConfig::new("t1")
            .with_fifo_dir(temp.path())
            .with_startup_timeout(Duration::from_millis(300))
    };
    let mut session = LoadSession::with_factory(
        config,
        PipeFactory::local(temp.path()),
        false,
        executor.clone(),
        specs(),
        Arc::clone(&registry),
    )?;

    let started = Instant::now();
    let err = session.start().expect_err("startup must time out");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(executor.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(registry.is_empty());
    assert!(!temp.path().join(session.pipe_name()).exists());
    Ok(())
}

#[test]
fn failing_load_statement_reaches_the_caller() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let mut session = LoadSession::with_factory(
        LoadConfig::new("t1").with_fifo_dir(temp.path()),
        PipeFactory::local(temp.path()),
        false,
        Arc::new(Failing),
        specs(),
        SessionRegistry::new(),
    )?;
    let err = match session.start() {
        Err(err) => err,
        Ok(()) => {
            let _ = session.write_bytes(b"\x00\x00");
            session.stop().expect_err("stop must report the load failure")
        }
    };
    assert_eq!(err.kind(), ErrorKind::SqlExecution);
    assert_eq!(err.message(), Some("table t1 does not exist"));
    assert_eq!(session.state(), SessionState::Stopped);
    Ok(())
}

#[test]
fn registry_shutdown_cancels_running_load_once() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let registry = SessionRegistry::new();
    let executor = Stalling::new("load data");
    let mut session = LoadSession::with_factory(
        LoadConfig::new("t1").with_fifo_dir(temp.path()),
        PipeFactory::local(temp.path()),
        false,
        executor.clone(),
        specs(),
        Arc::clone(&registry),
    )?;
    session.start()?;

    assert_eq!(registry.shutdown(), 1);
    assert_eq!(registry.shutdown(), 0);
    assert!(!session.kill_query()?);
    assert_eq!(executor.cancels.load(Ordering::SeqCst), 1);

    let err = session.stop().expect_err("cancelled load");
    assert_eq!(err.kind(), ErrorKind::SqlExecution);
    let err = LoadSession::with_factory(
        LoadConfig::new("t1").with_fifo_dir(temp.path()),
        PipeFactory::local(temp.path()),
        false,
        executor,
        specs(),
        registry,
    )
    .expect_err("registry is shut down");
    assert_eq!(err.kind(), ErrorKind::Usage);
    Ok(())
}

#[test]
fn route_selection_uses_local_infile_only_when_offered() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let registry = SessionRegistry::new();
    let config = LoadConfig::new("t1").with_fifo_dir(temp.path());

    let local = LoadSession::open(
        config.clone(),
        &LoadTarget::new("LOCALHOST"),
        Arc::new(FifoLoader::default()),
        &specs(),
        Arc::clone(&registry),
    )?;
    assert!(local.load_statement().starts_with("load data infile"));

    let remote = LoadSession::open(
        config.with_format(DataFormat::Text),
        &LoadTarget::new("db.invalid").with_local_infile(true),
        Arc::new(FifoLoader::default()),
        &specs(),
        Arc::clone(&registry),
    )?;
    assert!(remote.load_statement().starts_with("load data local infile"));
    assert!(remote.load_statement().ends_with("lines terminated by '\\n';"));
    assert_eq!(registry.len(), 2);
    Ok(())
}

#[test]
fn tunneled_session_streams_through_relay() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let server = RelayServer::bind(RelayConfig {
        bind: "127.0.0.1:0".parse()?,
        reap_interval: Duration::from_millis(100),
        fifo_dir: temp.path().to_path_buf(),
    })?;
    let addr = server.local_addr();
    let shutdown = server.shutdown_handle();
    let relay = thread::spawn(move || server.run());

    let proxy = Arc::new(ClientProxy::connect(addr, Duration::from_secs(5))?);
    let loader = Arc::new(FifoLoader::default());
    let mut session = LoadSession::with_factory(
        LoadConfig::new("t1").with_fifo_dir(temp.path()),
        PipeFactory::remote(proxy, temp.path()),
        false,
        loader.clone(),
        specs(),
        SessionRegistry::new(),
    )?;
    let mut record = session.create_record()?;
    session.start()?;
    for id in 0..100 {
        fill(&mut record, id, Some("tunnel"))?;
        session.write_record(&mut record)?;
    }
    session.stop()?;

    let rows = decode_all(&loader.loaded.lock().expect("loaded"))?;
    assert_eq!(rows.len(), 100);
    assert_eq!(rows[99], (Some(99), Some("tunnel".to_string())));

    shutdown.trigger();
    relay.join().expect("relay thread")?;
    Ok(())
}
