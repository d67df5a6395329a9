//! Common engine for the `rdl` downloader
//!
//! This crate holds everything except the command line: the descriptor model, the storage
//! backends, the naming resolver and saver, progress tracking and the worker pool that ties them
//! together.
//!
//! # Pipeline
//!
//! ```text
//! enumerator --DescriptorStream--> Pool::enqueue_stream --queue--> worker x N
//!                                                                   |
//!                              Saver::create (naming::Resolver, fs::Filesystem)
//!                                                                   |
//!                                  Source::download --> TrackedWriter --> Saver
//! ```
//!
//! - [`manifest`] enumerates exported message histories and streams their files from disk
//! - [`pool`] runs the workers and orders shutdown
//! - [`saver`] decides where the bytes of one file go ([`naming`] picks collision-free names)
//! - [`progress`] counts and renders what the workers do
//!
//! # Bootstrap
//!
//! Binaries call [`run`], which sets up logging and the tokio runtime from explicit
//! configuration values, runs the async entry point and reports the outcome.

use std::future::Future;

use tracing_subscriber::prelude::*;

pub mod config;
pub mod descriptor;
pub mod fs;
pub mod manifest;
pub mod naming;
pub mod pool;
pub mod progress;
pub mod saver;
pub mod source;
pub mod tags;

pub use config::{BatchConfig, OutputConfig, PoolConfig, QueryFilter, RuntimeConfig, SaveOptions};
pub use descriptor::FileDescriptor;
pub use pool::{Pool, Summary};
pub use progress::{ProgressSettings, ProgressType, Tracker};

fn log_level(verbose: u8) -> tracing::Level {
    match verbose {
        0 => tracing::Level::ERROR,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

fn init_logging(output: &OutputConfig) {
    if output.quiet {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(log_level(output.verbose).as_str().to_lowercase())
    });
    // a subscriber may already be installed (tests), keep it
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(false),
        )
        .try_init();
}

fn build_runtime(runtime: &RuntimeConfig) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build()
}

/// Run `func` on a fresh tokio runtime configured by `runtime`.
///
/// Returns the summary on success (printed when requested by `output`), or `None` after
/// reporting the error. Callers exit with a non-zero status on `None`.
pub fn run<Fut, S, E>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<S>
where
    S: std::fmt::Display,
    E: std::fmt::Display,
    Fut: Future<Output = Result<S, E>>,
{
    init_logging(&output);
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start the tokio runtime: {error}");
            }
            return None;
        }
    };
    let res = runtime.block_on(func());
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{:#}", &error);
            }
            None
        }
    }
}
