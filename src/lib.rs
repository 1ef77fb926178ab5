#![forbid(unsafe_code)]
//! warp-graph: a distributed graph database over a content-addressed commit
//! DAG, materialized via CRDT join semantics, with a tamper-evident audit
//! chain running alongside the data chain.
//!
//! # Conventions
//!
//! - **Errors**: [`error::WarpError`] via `thiserror`, returned as
//!   `Result<T, WarpError>`; each variant carries a stable `error_code()`
//!   and a human `suggestion()`.
//! - **Logging**: `tracing` macros on every suspension point (ref reads,
//!   commit/CAS, sync attempts, audit commits, checkpoint creation).
//! - **Concurrency**: single-threaded cooperative model per [`Graph`]
//!   instance; all coordination across writers is CAS on refs, never a
//!   lock. See [`sync`] and [`builder`] for the suspension points.

pub mod audit;
pub mod builder;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod crdt;
pub mod error;
pub mod graph;
pub mod keycodec;
pub mod materializer;
pub mod model;
pub mod patch;
pub mod persistence;
pub mod provenance;
pub mod reducer;
pub mod state;
pub mod sync;
pub mod trust;
mod util;

pub use error::WarpError;
pub use graph::Graph;
