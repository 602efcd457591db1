//! Purpose: SQL text for a named-pipe load and the database collaborator traits.
//! Exports: `StatementExecutor`, `ColumnMetadataSource`, statement builders.
//! Role: Only place that knows the load statement grammar and session variables.
//! Invariants: Pipe paths are embedded with backslashes and quotes escaped.
//! Invariants: Field/line clauses are appended only for the text format.
use std::time::Duration;

use crate::core::codec::ColumnSpec;
use crate::core::error::Error;
use crate::core::record::{DataFormat, LineTerminator};

/// Executes statements on one database connection.
///
/// `execute` may block for the whole load; `cancel` is called from another
/// thread and must abort the statement currently running on that connection.
pub trait StatementExecutor: Send + Sync {
    fn execute(&self, sql: &str) -> Result<(), Error>;
    fn cancel(&self) -> Result<(), Error>;
}

/// Ordered column descriptions of a load target.
pub trait ColumnMetadataSource {
    fn columns(&self, table: &str) -> Result<Vec<ColumnSpec>, Error>;
}

impl ColumnMetadataSource for Vec<ColumnSpec> {
    fn columns(&self, _table: &str) -> Result<Vec<ColumnSpec>, Error> {
        Ok(self.clone())
    }
}

pub fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            other => out.push(other),
        }
    }
    out
}

pub fn format_directive(format: DataFormat) -> String {
    format!("set @bh_dataformat='{}';", format.format_directive())
}

pub fn pipe_mode_server() -> &'static str {
    "set @bh_pipemode='server';"
}

pub fn pipe_timeout(timeout: Duration) -> String {
    format!("set @bh_timeout={};", timeout.as_secs().max(1))
}

pub fn load_statement(
    format: DataFormat,
    local: bool,
    pipe_path: &str,
    table: &str,
    line_terminator: LineTerminator,
) -> String {
    let local = if local { "local " } else { "" };
    let path = escape_literal(pipe_path);
    match format {
        DataFormat::Binary => format!("load data {local}infile '{path}' into table {table};"),
        DataFormat::Text => format!(
            "load data {local}infile '{path}' into table {table} fields terminated by ',' \
             optionally enclosed by '\"' escaped by '\\\\' lines terminated by '{}';",
            line_terminator.sql_literal()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_statement_has_no_field_clauses() {
        assert_eq!(
            load_statement(DataFormat::Binary, false, "/tmp/p_1", "sales", LineTerminator::Lf),
            "load data infile '/tmp/p_1' into table sales;"
        );
    }

    #[test]
    fn text_statement_carries_quoting_rules() {
        assert_eq!(
            load_statement(DataFormat::Text, true, "/tmp/p_1", "sales", LineTerminator::CrLf),
            "load data local infile '/tmp/p_1' into table sales fields terminated by ',' \
             optionally enclosed by '\"' escaped by '\\\\' lines terminated by '\\r\\n';"
        );
    }

    #[test]
    fn native_pipe_path_backslashes_are_doubled() {
        let sql = load_statement(
            DataFormat::Binary,
            false,
            r"\\.\pipe\bhnamedpipe_1",
            "t",
            LineTerminator::Lf,
        );
        assert!(sql.contains(r"'\\\\.\\pipe\\bhnamedpipe_1'"), "{sql}");
    }

    #[test]
    fn session_variables() {
        assert_eq!(format_directive(DataFormat::Text), "set @bh_dataformat='txt_variable';");
        assert_eq!(pipe_timeout(Duration::from_secs(15)), "set @bh_timeout=15;");
        assert_eq!(pipe_timeout(Duration::from_millis(10)), "set @bh_timeout=1;");
    }
}
