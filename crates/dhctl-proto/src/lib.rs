//! Protocol buffer definitions of the dhctl server.
//!
//! Three services are generated from `proto/dhctl.proto`:
//!
//! - `DHCTL`: one bidirectional stream per operation (check, bootstrap,
//!   destroy, abort, converge, commander attach and detach)
//! - `Validation`: unary validation of configuration documents
//! - `Status`: request counters of the server
//!
//! # Stream protocol
//!
//! ```text
//! client                         server
//!   │ ── Start ──────────────────► │  initial → running
//!   │ ◄──────────────── Logs ───── │
//!   │ ◄──────────── Progress ───── │
//!   │ ◄──────────── PhaseEnd ───── │  running → waiting
//!   │ ── Continue ───────────────► │  waiting → running
//!   │            ...               │
//!   │ ◄────────────── Result ───── │  stream closed
//! ```
//!
//! `Cancel` is accepted in every state after `Start`.

// Generated protobuf code doesn't have docs
#![allow(missing_docs)]

/// Generated types of the `dhctl` package
pub mod dhctl {
    tonic::include_proto!("dhctl");
}

pub use dhctl::*;
