//! Purpose: Library crate backing the `cracker-runner` host binary and its tests.
//! Exports: `core` (registry, body ingestion, plugin capability, loader, errors), `api`.
//! Role: Everything with real semantics lives here; the binary only wires HTTP and CLI.
//! Invariants: No ambient global state; the registry is constructed and injected explicitly.
pub mod api;
pub mod core;
