//! Purpose: Define the public Rust API boundary for pipeload.
//! Exports: Session, record, codec, tunnel and error types needed by callers and the CLI.
//! Role: Additive-only surface over `core`.
//! Invariants: Collaborator capabilities (executor, metadata, converters) are traits here.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::codec::{
    Charset, Column, ColumnKind, ColumnSpec, Decimal, GenericValueConverter, NullIndicator,
    SourceValue, ValueConverter,
};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::pipe::{
    CallStrategy, NativePipeBackend, PipeEndpoint, PipeFactory, Platform, RetryPolicy,
};
pub use crate::core::record::{DataFormat, LineTerminator, Record, RecordOptions};
pub use crate::core::registry::SessionRegistry;
pub use crate::core::session::{LoadConfig, LoadSession, LoadTarget, SessionState};
pub use crate::core::sql::{ColumnMetadataSource, StatementExecutor};
pub use crate::core::task::{TaskOutcome, run_with_deadline};
pub use crate::core::tunnel::DEFAULT_RELAY_PORT;
pub use crate::core::tunnel::client::{ClientProxy, RemotePipe};
pub use crate::core::tunnel::relay::{RelayConfig, RelayServer, RelayShutdown};
