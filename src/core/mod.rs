// Core modules: codecs, records, pipe transports, the relay tunnel and load sessions.
pub mod codec;
pub mod error;
pub mod pipe;
pub mod record;
pub mod registry;
pub mod session;
pub mod sql;
pub mod task;
pub mod tunnel;
