//! Dumpling.
//!
//! Dumpling ingests crash dumps and the modules they reference, deduplicates them by content and
//! indexes them by build id. This binary runs the ingestion pipeline against local files.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod logging;
mod upload;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
