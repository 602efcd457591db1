//! Purpose: Hold top-level CLI command dispatch for `pipeload`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Helpers in `main.rs` remain the source of command business logic.

use super::*;

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "pipeload", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Relay {
            port,
            bind,
            pipe_dir,
            reap_interval_ms,
        } => {
            let config = relay_config(&bind, port, pipe_dir, reap_interval_ms)?;
            run_relay(config)?;
            Ok(RunOutcome::ok())
        }
        Command::Encode { codec, strict } => {
            let (specs, mut record) = codec.record(strict)?;
            let stdin = io::stdin().lock();
            let mut out = BufWriter::new(io::stdout().lock());
            let count = encode_rows(stdin, &mut out, &specs, &mut record)?;
            tracing::debug!(records = count, "encoded rows");
            Ok(RunOutcome::ok())
        }
        Command::Decode { codec } => {
            let (_, mut record) = codec.record(false)?;
            let mut input = BufReader::new(io::stdin().lock());
            let mut out = BufWriter::new(io::stdout().lock());
            let count = decode_rows(&mut input, &mut out, &mut record)?;
            tracing::debug!(records = count, "decoded records");
            Ok(RunOutcome::ok())
        }
        Command::Send {
            host,
            port,
            pipe,
            timeout_ms,
        } => {
            let summary = send_stdin(&host, port, &pipe, Duration::from_millis(timeout_ms))?;
            emit_json(summary);
            Ok(RunOutcome::ok())
        }
    }
}
