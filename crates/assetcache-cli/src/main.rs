//! The `assetcache` command line tool.
//!
//! Fetches assets through an [`AssetCache`](assetcache::caching::AssetCache) and maintains the
//! cache directories.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
