//! Purpose: Bulk-load library crate used by the `pipeload` CLI and tests.
//! Exports: `api` (stable surface), `core` (codecs, pipes, tunnel, sessions, errors).
//! Role: Streams encoded rows into a database load statement through a named pipe.
//! Invariants: Callers should go through `api`; `core` paths may move between releases.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
