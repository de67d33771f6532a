//! Coalescer.
//!
//! A command line host for the request-coalescing cache. It resolves request URIs against an
//! HTTP upstream, stores the responses in the configured backend and reports how every request
//! was served.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod fetch;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            coalescer::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
