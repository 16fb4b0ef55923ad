//! Purpose: Library crate behind the `nekobox-core` binary and its tests.
//! Exports: `core` (errors, cancellation, registry, probing, normalization),
//! `engine` ports and adapters, `control`, `rpc`, `client`, latency collaborators.
//! Role: Version-tolerant control plane for an external proxy/routing engine.
//! Invariants: Introspection paths (QueryStats, ListConnections) never fail.
//! Invariants: The library never installs a tracing subscriber; binaries do.
pub mod client;
pub mod control;
pub mod core;
pub mod engine;
pub mod fulltest;
pub mod rpc;
pub mod speedtest;
