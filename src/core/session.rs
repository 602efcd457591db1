//! Purpose: Drive one bulk load from configuration through pipe setup, streaming and teardown.
//! Exports: `LoadConfig`, `LoadTarget`, `LoadSession`, `SessionState`.
//! Role: Public entry point; owns the endpoint, the SQL thread and the registry entry.
//! Invariants: States only advance: Created, Started, Running, Stopped.
//! Invariants: Errors raised on the SQL thread are captured there and surface on the caller
//! at the next synchronization point (startup poll or `stop`).
//! Invariants: The session never leaves its SQL thread unaccounted for; a thread that ignores
//! cancellation is logged as detached.
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::core::codec::{Charset, ColumnSpec};
use crate::core::error::{Error, ErrorKind};
use crate::core::pipe::{DEFAULT_FIFO_DIR, PipeEndpoint, PipeFactory, Platform};
use crate::core::record::{DataFormat, Record, RecordOptions};
use crate::core::registry::{SessionControl, SessionRegistry};
use crate::core::sql::{self, ColumnMetadataSource, StatementExecutor};
use crate::core::tunnel::DEFAULT_RELAY_PORT;
use crate::core::tunnel::client::{ClientProxy, DEFAULT_HANDSHAKE_TIMEOUT};

pub const DEFAULT_PIPE_PREFIX: &str = "bhnamedpipe";
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const CANCEL_GRACE: Duration = Duration::from_secs(5);

const PHASE_IDLE: u8 = 0;
const PHASE_CONNECTING: u8 = 1;
const PHASE_FINISHED: u8 = 2;

#[derive(Clone, Debug)]
pub struct LoadConfig {
    pub table: String,
    pub format: DataFormat,
    pub charset: Charset,
    pub pipe_prefix: String,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub strict: bool,
    pub fifo_dir: PathBuf,
    pub relay_port: u16,
    pub relay_timeout: Duration,
}

impl LoadConfig {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            format: DataFormat::Binary,
            charset: Charset::default(),
            pipe_prefix: DEFAULT_PIPE_PREFIX.to_string(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            strict: false,
            fifo_dir: PathBuf::from(DEFAULT_FIFO_DIR),
            relay_port: DEFAULT_RELAY_PORT,
            relay_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_format(mut self, format: DataFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_fifo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fifo_dir = dir.into();
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.table.trim().is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("load table name is empty"));
        }
        if self.pipe_prefix.is_empty() || self.pipe_prefix.contains(['/', '\\']) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("invalid pipe prefix \"{}\"", self.pipe_prefix)));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::new(ErrorKind::Usage).with_message("poll interval must be positive"));
        }
        Ok(())
    }
}

/// The database server a session loads into.
#[derive(Clone, Debug)]
pub struct LoadTarget {
    pub host: String,
    /// The server accepts `LOAD DATA LOCAL INFILE` from this client.
    pub supports_local_infile: bool,
}

impl LoadTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            supports_local_infile: false,
        }
    }

    pub fn with_local_infile(mut self, supported: bool) -> Self {
        self.supports_local_infile = supported;
        self
    }

    pub fn is_local(&self) -> bool {
        self.host.eq_ignore_ascii_case("localhost") || self.host == "127.0.0.1"
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Created,
    Started,
    Running,
    Stopped,
}

pub struct LoadSession {
    config: LoadConfig,
    factory: PipeFactory,
    executor: Arc<dyn StatementExecutor>,
    columns: Vec<ColumnSpec>,
    registry: Arc<SessionRegistry>,
    control: Arc<SessionControl>,
    pipe_name: String,
    load_sql: String,
    state: SessionState,
    endpoint: Option<PipeEndpoint>,
    debug: Option<Box<dyn Write + Send>>,
    worker: Option<JoinHandle<()>>,
    phase: Arc<AtomicU8>,
    issued: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<Error>>>,
}

impl std::fmt::Debug for LoadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadSession")
            .field("id", &self.control.id())
            .field("pipe", &self.pipe_name)
            .field("state", &self.state)
            .field("factory", &self.factory)
            .finish()
    }
}

impl LoadSession {
    /// Picks a route to `target` and builds the session.
    ///
    /// Local hosts get a local pipe. A Unix client loading into a server that accepts
    /// `LOCAL INFILE` gets a local FIFO read through the client connection. Everything
    /// else tunnels through the relay on `target.host`.
    pub fn open(
        config: LoadConfig,
        target: &LoadTarget,
        executor: Arc<dyn StatementExecutor>,
        metadata: &dyn ColumnMetadataSource,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let (factory, local_infile) = if target.is_local() {
            (PipeFactory::local(&config.fifo_dir), false)
        } else if Platform::local() == Platform::Unix && target.supports_local_infile {
            (PipeFactory::local(&config.fifo_dir), true)
        } else {
            let proxy = ClientProxy::connect((target.host.as_str(), config.relay_port), config.relay_timeout)?
                .with_handshake_timeout(config.relay_timeout);
            info!(host = %target.host, remote_os = proxy.remote_os(), "tunneling load through relay");
            (PipeFactory::remote(Arc::new(proxy), &config.fifo_dir), false)
        };
        let columns = metadata.columns(&config.table)?;
        Self::with_factory(config, factory, local_infile, executor, columns, registry)
    }

    pub fn with_factory(
        config: LoadConfig,
        factory: PipeFactory,
        local_infile: bool,
        executor: Arc<dyn StatementExecutor>,
        columns: Vec<ColumnSpec>,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, Error> {
        config.validate()?;
        if columns.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("table {} has no columns", config.table)));
        }
        let control = registry.register(Arc::clone(&executor))?;
        let pipe_name = pipe_name(&config.pipe_prefix, OffsetDateTime::now_utc(), control.id());
        let load_sql = sql::load_statement(
            config.format,
            local_infile,
            &factory.native_path(&pipe_name),
            &config.table,
            factory.platform().line_terminator(),
        );
        debug!(session = control.id(), pipe = %pipe_name, route = ?factory, "load session created");
        Ok(Self {
            config,
            factory,
            executor,
            columns,
            registry,
            control,
            pipe_name,
            load_sql,
            state: SessionState::Created,
            endpoint: None,
            debug: None,
            worker: None,
            phase: Arc::new(AtomicU8::new(PHASE_IDLE)),
            issued: Arc::new(AtomicBool::new(false)),
            failure: Arc::new(Mutex::new(None)),
        })
    }

    pub fn id(&self) -> u64 {
        self.control.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }

    /// The path the database opens, in the target platform's syntax.
    pub fn native_pipe_path(&self) -> String {
        self.factory.native_path(&self.pipe_name)
    }

    pub fn load_statement(&self) -> &str {
        &self.load_sql
    }

    pub fn record_options(&self) -> RecordOptions {
        RecordOptions {
            charset: self.config.charset,
            strict: self.config.strict,
            line_terminator: self.factory.platform().line_terminator(),
        }
    }

    fn require_state(&self, expected: SessionState, operation: &str) -> Result<(), Error> {
        if self.state == expected {
            return Ok(());
        }
        Err(Error::new(ErrorKind::Usage).with_message(format!(
            "cannot {operation} a load session in state {:?}",
            self.state
        )))
    }

    /// A blank record laid out for the target table.
    pub fn create_record(&self) -> Result<Record, Error> {
        self.require_state(SessionState::Created, "create records for")?;
        Record::from_specs(&self.columns, self.config.format, self.record_options())
    }

    /// Copies every byte written to the pipe into `writer` as well.
    pub fn set_debug_writer(&mut self, writer: Box<dyn Write + Send>) -> Result<(), Error> {
        self.require_state(SessionState::Created, "attach a debug writer to")?;
        self.debug = Some(writer);
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), Error> {
        self.require_state(SessionState::Created, "start")?;
        self.state = SessionState::Started;
        let strategy = self.factory.strategy();

        match strategy.before_execute_create(&self.factory, &self.pipe_name) {
            Ok(acquired) => self.endpoint = acquired.into_stream(),
            Err(err) => {
                self.finish_failed();
                return Err(err);
            }
        }

        if let Err(err) = self.spawn_statement() {
            self.finish_failed();
            return Err(err);
        }

        if let Err(err) = self.await_connecting() {
            self.abort_statement();
            self.finish_failed();
            return Err(err);
        }

        if self.endpoint.is_none() {
            match strategy.after_execute_create(&self.factory, &self.pipe_name) {
                Ok(acquired) => self.endpoint = acquired.into_stream(),
                Err(err) => {
                    self.abort_statement();
                    self.finish_failed();
                    return Err(err);
                }
            }
        }

        if self.endpoint.is_none() {
            self.abort_statement();
            self.finish_failed();
            return Err(Error::new(ErrorKind::Internal)
                .with_message("call strategy yielded no pipe in either phase"));
        }
        let phase = Arc::clone(&self.phase);
        if let Some(endpoint) = self.endpoint.as_mut() {
            endpoint.set_abort_hook(Arc::new(move || phase.load(Ordering::Acquire) == PHASE_FINISHED));
        }
        self.state = SessionState::Running;
        info!(session = self.control.id(), pipe = %self.pipe_name, "load session running");
        Ok(())
    }

    fn spawn_statement(&mut self) -> Result<(), Error> {
        let executor = Arc::clone(&self.executor);
        let control = Arc::clone(&self.control);
        let phase = Arc::clone(&self.phase);
        let issued = Arc::clone(&self.issued);
        let failure = Arc::clone(&self.failure);
        let strategy = self.factory.strategy();
        let proxy = self.factory.proxy().cloned();
        let format = self.config.format;
        let timeout = self.config.startup_timeout;
        let load_sql = self.load_sql.clone();
        let id = self.control.id();

        let handle = thread::Builder::new()
            .name(format!("pipeload-sql-{id}"))
            .spawn(move || {
                let result = (|| -> Result<(), Error> {
                    executor.execute(&sql::format_directive(format))?;
                    strategy.setup_for_load(executor.as_ref(), timeout)?;
                    control.set_statement_active(true);
                    issued.store(true, Ordering::Release);
                    phase.store(PHASE_CONNECTING, Ordering::Release);
                    debug!(session = id, sql = %load_sql, "executing load statement");
                    let outcome = executor.execute(&load_sql);
                    control.set_statement_active(false);
                    outcome
                })();
                if let Err(err) = result {
                    debug!(session = id, error = %err, "load statement failed");
                    let mut slot = failure.lock().unwrap_or_else(|poison| poison.into_inner());
                    slot.get_or_insert(err);
                }
                phase.store(PHASE_FINISHED, Ordering::Release);
                if let Some(proxy) = proxy {
                    if let Err(err) = proxy.disconnect() {
                        debug!(session = id, error = %err, "relay disconnect failed");
                    }
                }
            })
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to spawn load statement thread")
                    .with_source(err)
            })?;
        self.worker = Some(handle);
        Ok(())
    }

    fn await_connecting(&self) -> Result<(), Error> {
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            match self.phase.load(Ordering::Acquire) {
                PHASE_CONNECTING => return Ok(()),
                PHASE_FINISHED => {
                    if let Some(err) = self.take_failure() {
                        return Err(err);
                    }
                    if self.issued.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    return Err(Error::new(ErrorKind::SqlExecution)
                        .with_message("load statement did not start"));
                }
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                let err = Error::new(ErrorKind::Timeout).with_message(format!(
                    "load statement did not start within {}ms",
                    self.config.startup_timeout.as_millis()
                ));
                return Err(match self.take_failure() {
                    Some(cause) => err.with_source(cause),
                    None => err,
                });
            }
            thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }

    fn take_failure(&self) -> Option<Error> {
        self.failure
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take()
    }

    /// Cancels the statement and waits a bounded time for its thread.
    fn abort_statement(&mut self) {
        if self.phase.load(Ordering::Acquire) != PHASE_FINISHED {
            if let Err(err) = self.control.cancel() {
                warn!(session = self.control.id(), error = %err, "failed to cancel load statement");
            }
        }
        let Some(handle) = self.worker.take() else {
            return;
        };
        let deadline = Instant::now() + CANCEL_GRACE;
        while self.phase.load(Ordering::Acquire) != PHASE_FINISHED && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.phase.load(Ordering::Acquire) == PHASE_FINISHED {
            let _ = handle.join();
        } else {
            warn!(session = self.control.id(), "load statement ignored cancellation; detaching");
        }
    }

    fn finish_failed(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.discard();
        }
        if let Some(proxy) = self.factory.proxy() {
            let _ = proxy.disconnect();
        }
        self.registry.unregister(self.control.id());
        self.state = SessionState::Stopped;
    }

    pub fn write_record(&mut self, record: &mut Record) -> Result<(), Error> {
        let bytes = record.encode()?;
        self.write_bytes(bytes)
    }

    /// Writes to the pipe and the debug writer; the first failure is returned.
    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.require_state(SessionState::Running, "write to")?;
        let mut first = match self.endpoint.as_mut() {
            Some(endpoint) => endpoint.write(buf).err(),
            None => Some(Error::new(ErrorKind::Internal).with_message("running session has no pipe")),
        };
        if let Some(tee) = self.debug.as_mut() {
            if let Err(err) = tee.write_all(buf) {
                first.get_or_insert(
                    Error::new(ErrorKind::Transport)
                        .with_message("debug writer failed")
                        .with_source(err),
                );
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Closes the pipe, then waits for the load statement and reports its failure if any.
    pub fn stop(&mut self) -> Result<(), Error> {
        match self.state {
            SessionState::Stopped => return Ok(()),
            SessionState::Created => {
                self.finish_failed();
                return Ok(());
            }
            SessionState::Started | SessionState::Running => {}
        }
        let closed = match self.endpoint.take() {
            Some(mut endpoint) => endpoint.close(),
            None => Ok(()),
        };
        let flushed = match self.debug.as_mut() {
            Some(tee) => tee.flush().map_err(|err| {
                Error::new(ErrorKind::Transport)
                    .with_message("debug writer flush failed")
                    .with_source(err)
            }),
            None => Ok(()),
        };
        let joined = match self.worker.take() {
            Some(handle) => handle.join().map_err(|_| {
                Error::new(ErrorKind::Internal).with_message("load statement thread panicked")
            }),
            None => Ok(()),
        };
        self.registry.unregister(self.control.id());
        self.state = SessionState::Stopped;
        info!(session = self.control.id(), pipe = %self.pipe_name, "load session stopped");

        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        joined.and(closed).and(flushed)
    }

    /// Cancels the in-flight load statement. Returns false if it was already cancelled.
    pub fn kill_query(&self) -> Result<bool, Error> {
        self.control.cancel()
    }
}

impl Drop for LoadSession {
    fn drop(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.discard();
        }
        if let Err(err) = self.control.cancel_once() {
            warn!(session = self.control.id(), error = %err, "failed to cancel load statement on drop");
        }
        self.registry.unregister(self.control.id());
    }
}

/// `<prefix>_<HH>_<MM>_<SS>_<mmm>-<id>`
fn pipe_name(prefix: &str, now: OffsetDateTime, id: u64) -> String {
    format!(
        "{prefix}_{:02}_{:02}_{:02}_{:03}-{id}",
        now.hour(),
        now.minute(),
        now.second(),
        now.millisecond()
    )
}
