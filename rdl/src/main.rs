use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rdl",
    version,
    about = "Download the files of exported conversations concurrently",
    long_about = "`rdl` downloads every file referenced by one or more exported conversations.

Files are saved under OUTPUT/<peer>/, where <peer> is the conversation's display name (or its id).
A name that is already taken is saved as name_1.ext, name_2.ext etc.

EXAMPLE:
    # Download two conversations with 8 parallel downloads, grouped by hashtag
    rdl alice.json bob.json --output downloads --workers 8 --group --progress --summary

Press Ctrl-C to cancel; partially downloaded files are removed."
)]
struct Args {
    // Download options
    /// Number of files downloaded in parallel
    #[arg(
        short = 'w',
        long,
        default_value = "4",
        value_name = "N",
        help_heading = "Download options"
    )]
    workers: usize,

    /// Save each file into one subdirectory per hashtag of its message
    ///
    /// A file with hashtags is saved under OUTPUT/<peer>/<tag>/ for every tag and not under
    /// OUTPUT/<peer>/. Files without hashtags are saved as usual.
    #[arg(short = 'g', long, help_heading = "Download options")]
    group: bool,

    /// Skip files whose destination already exists instead of saving them under a new name
    #[arg(long, help_heading = "Download options")]
    skip_same: bool,

    /// Size of the chunks files are read and written in
    #[arg(
        long,
        default_value = "128KiB",
        value_name = "SIZE",
        help_heading = "Download options"
    )]
    chunk_size: bytesize::ByteSize,

    // Filtering options
    /// Only download files sent by this user
    #[arg(long, value_name = "NAME", help_heading = "Filtering")]
    user: Option<String>,

    /// Download at most N files, 0 means no limit
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Filtering"
    )]
    limit: usize,

    /// Only download files of messages sent before this date
    ///
    /// Accepts RFC 3339 timestamps (2024-01-02T03:04:05Z) or dates (2024-01-02, midnight UTC).
    #[arg(long, value_name = "DATE", value_parser = parse_offset_date, help_heading = "Filtering")]
    offset_date: Option<chrono::DateTime<chrono::Utc>>,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bars), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Exported conversation(s) to download files from
    #[arg(required = true, value_name = "MANIFEST")]
    manifests: Vec<std::path::PathBuf>,

    /// Directory the files are saved into, created if missing
    #[arg(short = 'o', long, value_name = "DIR")]
    output: std::path::PathBuf,
}

fn parse_offset_date(value: &str) -> Result<chrono::DateTime<chrono::Utc>, String> {
    if let Ok(date) = chrono::DateTime::parse_from_rfc3339(value) {
        return Ok(date.with_timezone(&chrono::Utc));
    }
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|date| date.and_utc())
        .ok_or_else(|| format!("invalid date {value:?}, expected RFC 3339 or YYYY-MM-DD"))
}

/// Cancel the batch on Ctrl-C.
async fn cancel_on_interrupt(cancel: tokio_util::sync::CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::warn!("interrupted, cancelling downloads");
            cancel.cancel();
        }
        Err(error) => tracing::error!("failed listening for Ctrl-C: {}", &error),
    }
}

#[instrument(skip(progress))]
async fn async_main(
    args: Args,
    progress: Option<common::ProgressSettings>,
) -> Result<common::Summary> {
    let batch = common::BatchConfig {
        save: common::SaveOptions {
            fan_out_by_tag: args.group,
            skip_if_exists: args.skip_same,
        },
        query: common::QueryFilter {
            user_filter: args.user.clone(),
            limit: args.limit,
            offset_date: args.offset_date,
        },
    };
    let pool_config = common::PoolConfig {
        workers: args.workers,
        chunk_size: args.chunk_size.0 as usize,
    };
    pool_config.validate().map_err(|error| anyhow!(error))?;
    let tracker = Arc::new(common::Tracker::new(progress.as_ref())?);
    tokio::fs::create_dir_all(&args.output)
        .await
        .with_context(|| format!("failed creating output directory {:?}", &args.output))?;
    let fs = Arc::new(common::fs::LocalFs::new(&args.output));
    let source = Arc::new(common::manifest::FileSource::new(pool_config.chunk_size)?);
    let cancel = tokio_util::sync::CancellationToken::new();
    let mut pool = common::Pool::new(pool_config, fs, source, tracker, &cancel)?;
    let interrupt = tokio::spawn(cancel_on_interrupt(cancel.clone()));
    pool.start();
    let stream = common::manifest::enumerate(args.manifests.clone(), batch.query);
    let feeder = pool.enqueue_stream(&cancel, stream, batch.save);
    let res = pool.stop().await;
    interrupt.abort();
    let enumeration_errors = feeder.await?;
    match res {
        Ok(summary) => {
            if !enumeration_errors.is_empty() {
                let error = anyhow!(
                    "rdl encountered {} error(s) reading manifests",
                    enumeration_errors.len()
                );
                if args.summary {
                    return Err(anyhow!("{}\n\n{}", error, &summary));
                }
                return Err(error);
            }
            Ok(summary)
        }
        Err(error) => {
            if args.summary {
                return Err(anyhow!("{}\n\n{}", error, &error.summary));
            }
            Err(anyhow!("{}", error))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let progress = if args.progress || args.progress_type.is_some() || args.progress_delay.is_some()
    {
        Some(common::ProgressSettings {
            progress_type: args.progress_type.unwrap_or_default(),
            progress_delay: args.progress_delay.clone(),
        })
    } else {
        None
    };
    let func = {
        let args = args.clone();
        || async_main(args, progress)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
