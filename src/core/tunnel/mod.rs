//! Purpose: Forward one pipe's bytes over TCP to a relay that owns the real pipe.
//! Exports: `client` (ClientProxy, RemotePipe), `relay` (RelayServer), `wire` (control frames).
//! Role: Used when the database host shares no filesystem or OS family with the loader.
//! Invariants: One transfer per connection: OS name, pipe name, ok/fail, payload, EOF.
//! Invariants: Payload bytes are relayed verbatim; socket EOF is the only end marker.
pub mod client;
pub mod relay;
pub mod wire;

pub const DEFAULT_RELAY_PORT: u16 = 5555;
pub const REPLY_OK: &str = "ok";
pub const REPLY_FAIL: &str = "fail";
