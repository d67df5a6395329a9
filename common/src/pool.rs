//! Bounded pool of download workers.
//!
//! # Overview
//!
//! A [`Pool`] runs a fixed number of workers that share one bounded queue of jobs. For every job
//! a worker:
//! 1. opens the destinations ([`Saver`]) through the naming resolver
//! 2. skips the job if there is nothing to write (e.g. `skip_if_exists` hit an existing file)
//! 3. wraps the saver with a progress [`TrackedWriter`]
//! 4. streams the bytes from the [`Source`], checking for cancellation before every write
//! 5. closes the saver and marks the file done, or removes the destinations and marks it failed
//!
//! A failing file never stops its siblings; only cancellation or the queue closing ends a worker.
//!
//! # Shutdown
//!
//! [`Pool::stop`] first waits for every queue feeder ([`Pool::enqueue_stream`]) to finish, only
//! then closes the queue, then joins the workers and finally stops the progress renderer. Closing
//! the queue earlier could drop jobs a feeder is still forwarding. A feeder is finished as soon as
//! its descriptor channel closes; the enumerator's error channel does not hold up shutdown.
//!
//! The queue holds at most one job, so a producer blocks until a worker is ready to take more
//! work.

use std::sync::Arc;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::{PoolConfig, SaveOptions};
use crate::descriptor::FileDescriptor;
use crate::fs::Filesystem;
use crate::naming::Resolver;
use crate::progress::{TrackedWriter, Tracker};
use crate::saver::Saver;
use crate::source::{DescriptorStream, Sink, Source};

/// Returned by workers (and feeders) that observed cancellation.
#[derive(Debug, thiserror::Error)]
#[error("download cancelled")]
pub struct Cancelled;

/// Error type for a download batch that preserves the batch summary even on failure.
///
/// # Logging Convention
/// The Display implementation shows the full error chain, so it can be logged with `{}`.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }

    /// True if the batch ended because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.source.downcast_ref::<Cancelled>().is_some()
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub files_downloaded: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub bytes_downloaded: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_downloaded: self.files_downloaded + other.files_downloaded,
            files_skipped: self.files_skipped + other.files_skipped,
            files_failed: self.files_failed + other.files_failed,
            bytes_downloaded: self.bytes_downloaded + other.bytes_downloaded,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files downloaded: {}\n\
            files skipped: {}\n\
            files failed: {}\n\
            bytes downloaded: {}",
            self.files_downloaded,
            self.files_skipped,
            self.files_failed,
            bytesize::ByteSize(self.bytes_downloaded),
        )
    }
}

/// One unit of work: a file and the options of the batch it belongs to.
#[derive(Clone, Debug)]
struct Job {
    file: FileDescriptor,
    options: SaveOptions,
}

enum Outcome {
    Downloaded(u64),
    Skipped,
    Failed,
}

/// Write-through sink refusing to write once the batch is cancelled.
struct CancelSink<'a, W> {
    cancel: &'a CancellationToken,
    inner: &'a mut TrackedWriter<W>,
}

#[async_trait::async_trait]
impl<'a, W: Sink> Sink for CancelSink<'a, W> {
    async fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            self.inner.fail();
            return Err(Cancelled.into());
        }
        self.inner.write(chunk).await
    }
}

/// Dependencies shared by all workers.
struct Downloader {
    fs: Arc<dyn Filesystem>,
    source: Arc<dyn Source>,
    resolver: Resolver,
    tracker: Arc<Tracker>,
}

impl Downloader {
    #[instrument(skip_all, fields(file = %job.file.name, peer = job.file.peer_id))]
    async fn process(&self, job: Job, cancel: &CancellationToken) -> Result<Outcome, Cancelled> {
        let Job { file, options } = job;
        let saver = match Saver::create(self.fs.as_ref(), &self.resolver, &file, &options).await {
            Ok(saver) => saver,
            Err(error) => {
                tracing::error!("failed preparing destination for {:?}: {:#}", &file.name, &error);
                return Ok(Outcome::Failed);
            }
        };
        if !saver.is_valid() {
            tracing::debug!("nothing to do for {:?}", &file.name);
            return Ok(Outcome::Skipped);
        }
        let mut tracked = self.tracker.tracked_writer(&file.name, file.size, saver);
        let result = {
            let mut sink = CancelSink {
                cancel,
                inner: &mut tracked,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(anyhow::Error::from(Cancelled)),
                result = self.source.download(&file, &mut sink) => result,
            }
        };
        let result = match result {
            Ok(()) => tracked.get_mut().close().await,
            Err(error) => Err(error),
        };
        match result {
            Ok(()) => {
                tracked.done();
                tracing::info!("downloaded {:?}", &file.name);
                Ok(Outcome::Downloaded(tracked.bytes_written()))
            }
            Err(error) => {
                tracked.fail();
                if let Err(remove_error) = tracked.get_mut().remove(self.fs.as_ref()).await {
                    tracing::warn!(
                        "failed removing partial download of {:?}: {:#}",
                        &file.name,
                        &remove_error
                    );
                }
                if cancel.is_cancelled() {
                    tracing::debug!("download of {:?} cancelled", &file.name);
                    return Err(Cancelled);
                }
                tracing::error!("failed downloading {:?}: {:#}", &file.name, &error);
                Ok(Outcome::Failed)
            }
        }
    }
}

async fn run_worker(
    downloader: Arc<Downloader>,
    queue: async_channel::Receiver<Job>,
    cancel: CancellationToken,
) -> Result<Summary, Error> {
    let mut summary = Summary::default();
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::new(Cancelled.into(), summary)),
            job = queue.recv() => match job {
                Ok(job) => job,
                // queue closed and drained
                Err(_) => return Ok(summary),
            },
        };
        match downloader.process(job, &cancel).await {
            Ok(Outcome::Downloaded(bytes)) => {
                summary.files_downloaded += 1;
                summary.bytes_downloaded += bytes;
            }
            Ok(Outcome::Skipped) => summary.files_skipped += 1,
            Ok(Outcome::Failed) => summary.files_failed += 1,
            Err(cancelled) => {
                summary.files_failed += 1;
                return Err(Error::new(cancelled.into(), summary));
            }
        }
    }
}

/// Fixed-size pool of download workers.
pub struct Pool {
    config: PoolConfig,
    downloader: Arc<Downloader>,
    queue_tx: async_channel::Sender<Job>,
    queue_rx: async_channel::Receiver<Job>,
    feeders: tokio_util::task::TaskTracker,
    workers: tokio::task::JoinSet<Result<Summary, Error>>,
    cancel: CancellationToken,
    stopped: CancellationToken,
}

impl Pool {
    /// Create a pool writing into `fs` with bytes streamed from `source`.
    ///
    /// The pool is cancelled together with `cancel`. The backend is chosen by the caller; the pool
    /// keeps no global state.
    pub fn new(
        config: PoolConfig,
        fs: Arc<dyn Filesystem>,
        source: Arc<dyn Source>,
        tracker: Arc<Tracker>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Self> {
        config.validate().map_err(|error| anyhow!(error))?;
        let (queue_tx, queue_rx) = async_channel::bounded(1);
        let downloader = Downloader {
            resolver: Resolver::new(fs.clone()),
            fs,
            source,
            tracker,
        };
        Ok(Self {
            config,
            downloader: Arc::new(downloader),
            queue_tx,
            queue_rx,
            feeders: tokio_util::task::TaskTracker::new(),
            workers: tokio::task::JoinSet::new(),
            cancel: cancel.child_token(),
            stopped: CancellationToken::new(),
        })
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.downloader.tracker
    }

    /// Spawn the workers; they stop when the pool is cancelled or the queue is closed.
    ///
    /// Jobs enqueued earlier wait in the queue. Calling it again has no effect.
    pub fn start(&mut self) {
        if !self.workers.is_empty() {
            return;
        }
        self.downloader.tracker.start();
        tracing::debug!("starting {} download workers", self.config.workers);
        for _ in 0..self.config.workers {
            let downloader = self.downloader.clone();
            let queue = self.queue_rx.clone();
            let cancel = self.cancel.clone();
            self.workers.spawn(run_worker(downloader, queue, cancel));
        }
    }

    /// Submit one file, waiting until a worker can take it.
    pub async fn enqueue(&self, file: FileDescriptor, options: SaveOptions) -> anyhow::Result<()> {
        let job = Job { file, options };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Cancelled.into()),
            res = self.queue_tx.send(job) => res.map_err(|_| anyhow!("download queue is closed")),
        }
    }

    /// Forward every descriptor of `stream` into the queue from a background task.
    ///
    /// The task ends when the stream's descriptor channel closes or either `cancel` or the pool is
    /// cancelled. Errors reported by the enumerator are returned by the handle, which completes
    /// once the error channel closes or the pool is stopped.
    pub fn enqueue_stream(
        &self,
        cancel: &CancellationToken,
        stream: DescriptorStream,
        options: SaveOptions,
    ) -> tokio::task::JoinHandle<Vec<anyhow::Error>> {
        let DescriptorStream { files, errors } = stream;
        let errors = tokio::spawn(DescriptorStream::collect_errors_until(
            errors,
            self.stopped.clone(),
        ));
        let queue = self.queue_tx.clone();
        let cancel = cancel.clone();
        let pool_cancel = self.cancel.clone();
        self.feeders.spawn(async move {
            let mut forwarded = 0usize;
            loop {
                let file = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = pool_cancel.cancelled() => break,
                    file = files.recv() => match file {
                        Ok(file) => file,
                        Err(_) => break,
                    },
                };
                let job = Job { file, options };
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    _ = pool_cancel.cancelled() => false,
                    res = queue.send(job) => res.is_ok(),
                };
                if !sent {
                    break;
                }
                forwarded += 1;
            }
            tracing::debug!("queue feeder done after {} files", forwarded);
            // unblock an enumerator still sending into a stream nobody reads
            files.close();
        });
        errors
    }

    /// Orderly shutdown: wait for feeders, close the queue, join the workers, stop the renderer.
    ///
    /// Returns the summary of all workers, or the first error a worker returned (cancellation).
    pub async fn stop(mut self) -> Result<Summary, Error> {
        self.feeders.close();
        self.feeders.wait().await;
        self.stopped.cancel();
        self.queue_tx.close();
        let mut summary = Summary::default();
        let mut first_error: Option<anyhow::Error> = None;
        while let Some(res) = self.workers.join_next().await {
            match res {
                Ok(Ok(worker_summary)) => summary = summary + worker_summary,
                Ok(Err(error)) => {
                    summary = summary + error.summary;
                    first_error.get_or_insert(error.source);
                }
                Err(error) => {
                    first_error.get_or_insert(anyhow!("download worker failed: {error}"));
                }
            }
        }
        self.downloader.tracker.stop().await;
        match first_error {
            Some(error) => Err(Error::new(error, summary)),
            None => Ok(summary),
        }
    }
}
