//! Crash dump and artifact ingestion.
//!
//! Uploaded binaries are staged and verified against their declared SHA-1 digest, classified by
//! container format, indexed by their embedded build identifiers and stored exactly once. Dumps
//! additionally get a placeholder for every module they loaded, which is linked up as soon as the
//! matching module is uploaded.

pub mod archive;
pub mod blobs;
pub mod config;
pub mod crosslink;
pub mod digest;
pub mod error;
pub mod formats;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod service;
pub mod stage;
pub mod store;
pub mod types;
