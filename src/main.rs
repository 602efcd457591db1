//! Purpose: `pipeload` CLI entry point: relay server, record codec tools and tunnel sender.
//! Role: Binary crate root; parses args, sets up logging, runs commands.
//! Invariants: Record streams go to stdout; logs and diagnostics go to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, IsTerminal, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

use pipeload::api::{
    Charset, ClientProxy, ColumnKind, ColumnSpec, DataFormat, Decimal, Error, ErrorKind,
    GenericValueConverter, LineTerminator, Record, RecordOptions, RelayConfig, RelayServer,
    RemotePipe, SourceValue, DEFAULT_RELAY_PORT, to_exit_code,
};

mod command_dispatch;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_REAP_INTERVAL_MS: u64 = 1000;
const SEND_BUFFER: usize = 64 * 1024;
const SIGNAL_POLL: Duration = Duration::from_millis(100);

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse_from(std::env::args_os()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Internal)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                let message = clap_error_summary(&err);
                let hint = clap_error_hint(&err);
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(message)
                        .with_hint(hint),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    init_tracing(cli.log_level);
    command_dispatch::dispatch_command(cli.command).map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "pipeload",
    version,
    about = "Stream bulk loads into a database through named pipes",
    long_about = None,
    after_help = r#"EXAMPLES
  $ pipeload relay --port 5555                         # on the database host
  $ pipeload encode --schema cols.json < rows.jsonl > rows.bin
  $ pipeload decode --schema cols.json < rows.bin
  $ pipeload send --host db1 --pipe load_1 < rows.bin

LEARN MORE
  $ pipeload <command> --help"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        default_value = "info",
        value_enum,
        help = "Log level when RUST_LOG is unset"
    )]
    log_level: LogLevel,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum FormatCli {
    Binary,
    Text,
}

impl From<FormatCli> for DataFormat {
    fn from(value: FormatCli) -> Self {
        match value {
            FormatCli::Binary => DataFormat::Binary,
            FormatCli::Text => DataFormat::Text,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CharsetCli {
    Latin1,
    Utf8,
}

impl From<CharsetCli> for Charset {
    fn from(value: CharsetCli) -> Self {
        match value {
            CharsetCli::Latin1 => Charset::Latin1,
            CharsetCli::Utf8 => Charset::Utf8,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum EolCli {
    Lf,
    Crlf,
}

impl From<EolCli> for LineTerminator {
    fn from(value: EolCli) -> Self {
        match value {
            EolCli::Lf => LineTerminator::Lf,
            EolCli::Crlf => LineTerminator::CrLf,
        }
    }
}

#[derive(clap::Args)]
struct CodecArgs {
    #[arg(
        long,
        help = "JSON file with the column list: [{\"name\":..,\"type\":..,\"precision\":..,\"scale\":..}]",
        value_hint = ValueHint::FilePath
    )]
    schema: PathBuf,
    #[arg(long, default_value = "binary", value_enum, help = "Record format")]
    format: FormatCli,
    #[arg(long, default_value = "latin1", value_enum, help = "Character set for CHAR/VARCHAR bytes")]
    charset: CharsetCli,
    #[arg(long, default_value = "lf", value_enum, help = "Text record line terminator")]
    eol: EolCli,
}

impl CodecArgs {
    fn record(&self, strict: bool) -> Result<(Vec<ColumnSpec>, Record), Error> {
        let specs = read_schema(&self.schema)?;
        let options = RecordOptions {
            charset: self.charset.into(),
            strict,
            line_terminator: self.eol.into(),
        };
        let record = Record::from_specs(&specs, self.format.into(), options)?;
        Ok((specs, record))
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Run the tunnel relay next to the database server",
        long_about = r#"Accept tunnel clients, create the pipe each one names, and copy its bytes into it.

Runs until SIGINT or SIGTERM. There is no authentication; run it on a trusted network."#
    )]
    Relay {
        #[arg(long, default_value_t = DEFAULT_RELAY_PORT, help = "TCP port to listen on")]
        port: u16,
        #[arg(long, default_value = "0.0.0.0", help = "Address to bind")]
        bind: String,
        #[arg(
            long,
            default_value = "/tmp",
            help = "Directory for unix FIFOs",
            value_hint = ValueHint::DirPath
        )]
        pipe_dir: PathBuf,
        #[arg(
            long,
            default_value_t = DEFAULT_REAP_INTERVAL_MS,
            help = "How often finished workers are joined (ms)"
        )]
        reap_interval_ms: u64,
    },
    #[command(
        about = "Encode JSON-lines rows from stdin into a record stream on stdout",
        after_help = r#"Each input line is either an object keyed by column name or an array in column order.

EXAMPLES
  $ echo '{"id": 1, "name": "ann"}' | pipeload encode --schema cols.json --format text"#
    )]
    Encode {
        #[command(flatten)]
        codec: CodecArgs,
        #[arg(long, help = "Fail on values that do not fit instead of truncating")]
        strict: bool,
    },
    #[command(about = "Decode a record stream from stdin into JSON lines on stdout")]
    Decode {
        #[command(flatten)]
        codec: CodecArgs,
    },
    #[command(about = "Stream stdin into a pipe on a remote relay")]
    Send {
        #[arg(long, help = "Relay host")]
        host: String,
        #[arg(long, default_value_t = DEFAULT_RELAY_PORT, help = "Relay port")]
        port: u16,
        #[arg(long, help = "Pipe name to create on the relay side")]
        pipe: String,
        #[arg(
            long,
            default_value_t = DEFAULT_CONNECT_TIMEOUT_MS,
            help = "Connect and handshake timeout (ms)"
        )]
        timeout_ms: u64,
    },
    #[command(about = "Print version info")]
    Version,
    #[command(
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ pipeload completion bash > ~/.local/share/bash-completion/completions/pipeload
  $ pipeload completion zsh > ~/.zfunc/_pipeload"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn init_tracing(level: LogLevel) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn io_error(message: &str, err: io::Error) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message(message.to_string())
        .with_source(err)
}

fn read_schema(path: &Path) -> Result<Vec<ColumnSpec>, Error> {
    let data = fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("failed to read schema file")
            .with_path(path)
            .with_source(err)
    })?;
    let specs: Vec<ColumnSpec> = serde_json::from_str(&data).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("schema file is not a JSON column list")
            .with_path(path)
            .with_hint(r#"Use [{"name": "id", "type": "INT"}, ...]."#)
            .with_source(err)
    })?;
    if specs.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("schema has no columns")
            .with_path(path));
    }
    Ok(specs)
}

fn json_to_source(value: Value) -> SourceValue {
    match value {
        Value::Null => SourceValue::Null,
        Value::Bool(value) => SourceValue::Bool(value),
        Value::Number(number) => match number.as_i64() {
            Some(value) => SourceValue::Int(value),
            None => match Decimal::parse(&number.to_string()) {
                Ok(decimal) => SourceValue::Decimal(decimal),
                Err(_) => SourceValue::Float(number.as_f64().unwrap_or(f64::NAN)),
            },
        },
        Value::String(text) => SourceValue::Text(text),
        other => SourceValue::Text(other.to_string()),
    }
}

/// Orders one JSON row by the schema's columns.
fn row_values(row: Value, specs: &[ColumnSpec]) -> Result<Vec<SourceValue>, Error> {
    match row {
        Value::Object(mut fields) => {
            let values = specs
                .iter()
                .map(|spec| json_to_source(fields.remove(&spec.name).unwrap_or(Value::Null)))
                .collect();
            if let Some(extra) = fields.keys().next() {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("row has unknown column \"{extra}\"")));
            }
            Ok(values)
        }
        Value::Array(items) => {
            if items.len() != specs.len() {
                return Err(Error::new(ErrorKind::Usage).with_message(format!(
                    "row has {} values, schema has {} columns",
                    items.len(),
                    specs.len()
                )));
            }
            Ok(items.into_iter().map(json_to_source).collect())
        }
        _ => Err(Error::new(ErrorKind::Usage).with_message("row must be a JSON object or array")),
    }
}

fn record_json(record: &Record) -> Result<Value, Error> {
    let mut row = Map::new();
    for column in record.columns() {
        let value = if column.is_null() {
            Value::Null
        } else {
            match column.kind() {
                kind if kind.is_integer() => json!(column.as_i64()),
                ColumnKind::Float | ColumnKind::Double => json!(column.as_f64()),
                _ => json!(column.encode_text()?),
            }
        };
        row.insert(column.name().to_string(), value);
    }
    Ok(Value::Object(row))
}

fn encode_rows<R: BufRead, W: Write>(
    input: R,
    out: &mut W,
    specs: &[ColumnSpec],
    record: &mut Record,
) -> Result<u64, Error> {
    let converter = GenericValueConverter;
    let mut count = 0;
    for (index, line) in input.lines().enumerate() {
        let line = line.map_err(|err| io_error("failed to read stdin", err))?;
        if line.trim().is_empty() {
            continue;
        }
        let at_line = |err: Error| err.with_hint(format!("Input line {}.", index + 1));
        let row: Value = serde_json::from_str(&line).map_err(|err| {
            at_line(
                Error::new(ErrorKind::Usage)
                    .with_message("input line is not valid JSON")
                    .with_source(err),
            )
        })?;
        let values = row_values(row, specs).map_err(at_line)?;
        record.clear();
        for (position, value) in values.iter().enumerate() {
            if let Some(column) = record.column_mut(position) {
                column.set_from_value(value, &converter).map_err(at_line)?;
            }
        }
        record.write_to(out)?;
        count += 1;
    }
    out.flush()
        .map_err(|err| io_error("failed to flush stdout", err))?;
    Ok(count)
}

fn decode_rows<R: BufRead, W: Write>(input: &mut R, out: &mut W, record: &mut Record) -> Result<u64, Error> {
    let mut count = 0;
    loop {
        let more = match record.format() {
            DataFormat::Binary => record.read_binary(input)?,
            DataFormat::Text => record.read_text(input)?,
        };
        if !more {
            break;
        }
        let row = record_json(record)?;
        let line = serde_json::to_string(&row).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("json encode failed")
                .with_source(err)
        })?;
        writeln!(out, "{line}").map_err(|err| io_error("failed to write stdout", err))?;
        count += 1;
    }
    out.flush()
        .map_err(|err| io_error("failed to flush stdout", err))?;
    Ok(count)
}

fn relay_config(bind: &str, port: u16, pipe_dir: PathBuf, reap_interval_ms: u64) -> Result<RelayConfig, Error> {
    let ip: IpAddr = bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid bind address \"{bind}\""))
            .with_hint("Use an IP address like 0.0.0.0 or 127.0.0.1.")
    })?;
    let config = RelayConfig {
        bind: SocketAddr::new(ip, port),
        reap_interval: Duration::from_millis(reap_interval_ms),
        fifo_dir: pipe_dir,
    };
    config.validate()?;
    Ok(config)
}

fn run_relay(config: RelayConfig) -> Result<(), Error> {
    let server = RelayServer::bind(config)?;
    let shutdown = server.shutdown_handle();
    let term = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&term)).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to install signal handler")
                .with_source(err)
        })?;
    }
    let watcher = shutdown.clone();
    thread::Builder::new()
        .name("pipeload-signals".to_string())
        .spawn(move || {
            while !watcher.is_triggered() {
                if term.load(Ordering::Acquire) {
                    tracing::info!("shutdown signal received");
                    watcher.trigger();
                    break;
                }
                thread::sleep(SIGNAL_POLL);
            }
        })
        .map_err(|err| io_error("failed to spawn signal watcher", err))?;
    server.run()
}

fn send_stdin(host: &str, port: u16, pipe: &str, timeout: Duration) -> Result<Value, Error> {
    let proxy = Arc::new(ClientProxy::connect((host, port), timeout)?.with_handshake_timeout(timeout));
    let mut remote = RemotePipe::new(pipe, Arc::clone(&proxy));
    remote.connect()?;
    let mut stdin = io::stdin().lock();
    let mut buf = vec![0u8; SEND_BUFFER];
    let mut total: u64 = 0;
    loop {
        let read = match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                remote.discard();
                return Err(io_error("failed to read stdin", err));
            }
        };
        remote.write(&buf[..read])?;
        total += read as u64;
    }
    remote.close()?;
    Ok(json!({
        "pipe": pipe,
        "relay": proxy.peer_addr().to_string(),
        "remote_os": proxy.remote_os(),
        "bytes": total,
    }))
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("pipeload {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(json!({
            "name": "pipeload",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Connection => "connection failed".to_string(),
        ErrorKind::Timeout => "timed out".to_string(),
        ErrorKind::Protocol => "protocol error".to_string(),
        ErrorKind::Transport => "pipe transport error".to_string(),
        ErrorKind::Serialization => "serialization error".to_string(),
        ErrorKind::SqlExecution => "load statement failed".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    use std::error::Error as _;
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));
    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);
    let Some(usage) = usage else {
        return "Try `pipeload --help`.".to_string();
    };
    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "pipeload") else {
        return "Try `pipeload --help`.".to_string();
    };
    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| !(token.starts_with('-') || token.starts_with('<') || token.starts_with('[')))
        .copied()
        .collect();
    if parts.is_empty() {
        return "Try `pipeload --help`.".to_string();
    }
    format!("Try `pipeload {} --help`.", parts.join(" "))
}
