//! Live progress of the files being downloaded.
//!
//! Every in-flight file gets a [`TrackedWriter`]: a write-through adapter that advances the file's
//! bar and the aggregate byte counter, and that ends either `Done` or `Failed`. A renderer task
//! redraws the aggregate view at a fixed interval, either as `indicatif` bars or as periodic text
//! reports (better suited for logs).

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::{event, instrument, Level};

use crate::source::Sink;

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<std::sync::Mutex<u64>>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| std::sync::Mutex::new(0));
        let mut guard = mutex.lock().unwrap();
        *guard += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| x + *y.lock().unwrap())
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate counters shared by all tracked files.
#[derive(Debug)]
pub struct Progress {
    pub started: TlsCounter,
    pub done: TlsCounter,
    pub failed: TlsCounter,
    pub bytes_downloaded: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            started: Default::default(),
            done: Default::default(),
            failed: Default::default(),
            bytes_downloaded: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    #[instrument]
    pub fn status(&self) -> Status {
        let started = self.started.get();
        let done = self.done.get();
        let failed = self.failed.get();
        let mut status = Status {
            started,
            done,
            failed,
            active: 0,
            bytes_downloaded: self.bytes_downloaded.get(),
        };
        if done + failed > started {
            // counters are read one by one, a file may finish between the reads
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, done: {}, failed: {}",
                started,
                done,
                failed
            );
            status.started = done + failed;
        }
        status.active = status.started - done - failed;
        status
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub started: u64,
    pub active: u64,
    pub done: u64,
    pub failed: u64,
    pub bytes_downloaded: u64,
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_done: u64,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        let status = progress.status();
        Self {
            progress,
            last_done: status.done,
            last_bytes: status.bytes_downloaded,
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let status = self.progress.status();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let average_files_rate = status.done as f64 / total_duration_secs;
        let current_files_rate =
            status.done.saturating_sub(self.last_done) as f64 / curr_duration_secs;
        let average_bytes_rate = status.bytes_downloaded as f64 / total_duration_secs;
        let current_bytes_rate =
            status.bytes_downloaded.saturating_sub(self.last_bytes) as f64 / curr_duration_secs;
        self.last_done = status.done;
        self.last_bytes = status.bytes_downloaded;
        self.last_update = time_now;
        format!(
            "---------------------\n\
            FILES:\n\
            active:  {:>10}\n\
            done:    {:>10}\n\
            failed:  {:>10}\n\
            average: {:>10.2} files/s\n\
            current: {:>10.2} files/s\n\
            -----------------------\n\
            DOWNLOADED:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}",
            status.active,
            status.done,
            status.failed,
            average_files_rate,
            current_files_rate,
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(status.bytes_downloaded),
        )
    }
}

/// How progress is presented.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// `ProgressBar` when stderr is a terminal, `TextUpdates` otherwise
    #[default]
    #[value(alias = "Auto")]
    Auto,
    /// Animated bars, one per file plus a summary line
    #[value(alias = "ProgressBar")]
    ProgressBar,
    /// Periodic text reports, appropriate for logging
    #[value(alias = "TextUpdates")]
    TextUpdates,
}

#[derive(Clone, Debug, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Human readable delay between updates, e.g. "200ms" or "10s"
    pub progress_delay: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mode {
    Hidden,
    Bars,
    Text,
}

/// Terminal state of a tracked file; `Active` is the only state that can change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileState {
    Active,
    Done,
    Failed,
}

fn file_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::with_template(
        "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} @ {bytes_per_sec} - {msg}",
    )
    .map(|style| style.progress_chars("━━╌"))
    .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
}

fn summary_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::with_template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner())
}

fn summary_line(status: &Status) -> String {
    format!(
        "active: {} | done: {} | failed: {} | downloaded: {}",
        status.active,
        status.done,
        status.failed,
        bytesize::ByteSize(status.bytes_downloaded)
    )
}

/// Tracks every in-flight file and renders the aggregate view.
pub struct Tracker {
    multi: indicatif::MultiProgress,
    mode: Mode,
    delay: std::time::Duration,
    progress: Arc<Progress>,
    cancel: tokio_util::sync::CancellationToken,
    renderer: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Tracker {
    /// Tracker that counts but never draws anything.
    pub fn hidden() -> Self {
        Self::with_mode(Mode::Hidden, std::time::Duration::from_secs(1))
    }

    /// Build a tracker from user settings; `None` means no progress output.
    pub fn new(settings: Option<&ProgressSettings>) -> anyhow::Result<Self> {
        let Some(settings) = settings else {
            return Ok(Self::hidden());
        };
        let mode = match settings.progress_type {
            ProgressType::Auto if std::io::stderr().is_terminal() => Mode::Bars,
            ProgressType::Auto => Mode::Text,
            ProgressType::ProgressBar => Mode::Bars,
            ProgressType::TextUpdates => Mode::Text,
        };
        let delay = match settings.progress_delay.as_deref() {
            Some(delay) => humantime::parse_duration(delay)
                .with_context(|| format!("invalid progress delay {delay:?}"))?,
            None if mode == Mode::Bars => std::time::Duration::from_millis(200),
            None => std::time::Duration::from_secs(10),
        };
        if delay.is_zero() {
            return Err(anyhow!("progress delay must be greater than zero"));
        }
        Ok(Self::with_mode(mode, delay))
    }

    fn with_mode(mode: Mode, delay: std::time::Duration) -> Self {
        let multi = match mode {
            Mode::Bars => indicatif::MultiProgress::new(),
            Mode::Hidden | Mode::Text => indicatif::MultiProgress::with_draw_target(
                indicatif::ProgressDrawTarget::hidden(),
            ),
        };
        Self {
            multi,
            mode,
            delay,
            progress: Arc::new(Progress::new()),
            cancel: tokio_util::sync::CancellationToken::new(),
            renderer: std::sync::Mutex::new(None),
        }
    }

    pub fn status(&self) -> Status {
        self.progress.status()
    }

    /// Start tracking one file; the returned adapter writes through to `inner`.
    pub fn tracked_writer<W: Sink>(&self, label: &str, total_size: u64, inner: W) -> TrackedWriter<W> {
        self.progress.started.inc();
        let bar = self.multi.add(indicatif::ProgressBar::new(total_size));
        bar.set_style(file_style());
        bar.set_message(label.to_string());
        TrackedWriter {
            inner,
            bar,
            progress: self.progress.clone(),
            state: FileState::Active,
            written: 0,
        }
    }

    /// Spawn the renderer. Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.mode == Mode::Hidden {
            return;
        }
        let mut renderer = self.renderer.lock().unwrap();
        if renderer.is_some() {
            return;
        }
        let progress = self.progress.clone();
        let cancel = self.cancel.clone();
        let delay = self.delay;
        let task = match self.mode {
            Mode::Bars => {
                let summary = self.multi.insert(0, indicatif::ProgressBar::new_spinner());
                summary.set_style(summary_style());
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(delay);
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                summary.set_message(summary_line(&progress.status()));
                                summary.tick();
                            }
                            _ = cancel.cancelled() => break,
                        }
                    }
                    summary.finish_and_clear();
                })
            }
            Mode::Text | Mode::Hidden => tokio::spawn(async move {
                let mut printer = ProgressPrinter::new(&progress);
                let mut interval = tokio::time::interval(delay);
                // the first tick completes immediately, nothing to report yet
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => eprintln!("{}", printer.print()),
                        _ = cancel.cancelled() => break,
                    }
                }
            }),
        };
        *renderer = Some(task);
    }

    /// Stop the renderer and clear whatever is still drawn.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let renderer = self.renderer.lock().unwrap().take();
        if let Some(renderer) = renderer {
            if let Err(error) = renderer.await {
                tracing::error!("progress renderer failed: {}", &error);
            }
        }
        if let Err(error) = self.multi.clear() {
            tracing::debug!("failed clearing progress bars: {}", &error);
        }
    }
}

/// Write-through adapter tracking the progress of one file.
///
/// Dropping an adapter that is still `Active` marks the file as failed.
pub struct TrackedWriter<W> {
    inner: W,
    bar: indicatif::ProgressBar,
    progress: Arc<Progress>,
    state: FileState,
    written: u64,
}

impl<W> TrackedWriter<W> {
    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Mark the file as successfully downloaded. Returns false if it already finished.
    pub fn done(&mut self) -> bool {
        self.finish(FileState::Done)
    }

    /// Mark the file as failed. Returns false if it already finished.
    pub fn fail(&mut self) -> bool {
        self.finish(FileState::Failed)
    }

    fn finish(&mut self, state: FileState) -> bool {
        if self.state != FileState::Active {
            return false;
        }
        self.state = state;
        match state {
            FileState::Done => self.progress.done.inc(),
            FileState::Failed => self.progress.failed.inc(),
            FileState::Active => {}
        }
        self.bar.finish_and_clear();
        true
    }
}

impl<W> Drop for TrackedWriter<W> {
    fn drop(&mut self) {
        self.fail();
    }
}

#[async_trait::async_trait]
impl<W: Sink> Sink for TrackedWriter<W> {
    async fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        if self.state != FileState::Active {
            return Err(anyhow!("write to a file that is already {:?}", self.state));
        }
        self.inner.write(chunk).await?;
        self.written += chunk.len() as u64;
        self.bar.inc(chunk.len() as u64);
        self.progress.bytes_downloaded.add(chunk.len() as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use clap::ValueEnum;

    #[derive(Default)]
    struct VecSink {
        data: Vec<u8>,
    }

    #[async_trait::async_trait]
    impl Sink for VecSink {
        async fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
            self.data.extend_from_slice(chunk);
            Ok(())
        }
    }

    #[test]
    fn basic_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        for _ in 0..10 {
            tls_counter.inc();
        }
        assert!(tls_counter.get() == 10);
        Ok(())
    }

    #[test]
    fn threaded_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        tls_counter.inc();
                    }
                });
            }
        });
        assert!(tls_counter.get() == 1000);
        Ok(())
    }

    #[tokio::test]
    async fn tracked_writer_counts_bytes() -> Result<()> {
        let tracker = Tracker::hidden();
        let mut writer = tracker.tracked_writer("a.jpg", 6, VecSink::default());
        writer.write(b"abc").await?;
        writer.write(b"def").await?;
        assert_eq!(writer.get_mut().data, b"abcdef");
        assert_eq!(writer.bytes_written(), 6);
        let status = tracker.status();
        assert_eq!(status.active, 1);
        assert_eq!(status.bytes_downloaded, 6);
        assert!(writer.done());
        assert_eq!(writer.state(), FileState::Done);
        let status = tracker.status();
        assert_eq!(status.active, 0);
        assert_eq!(status.done, 1);
        Ok(())
    }

    #[tokio::test]
    async fn terminal_states_are_final() -> Result<()> {
        let tracker = Tracker::hidden();
        let mut writer = tracker.tracked_writer("a.jpg", 3, VecSink::default());
        assert!(writer.fail());
        assert!(!writer.done());
        assert!(!writer.fail());
        assert_eq!(writer.state(), FileState::Failed);
        assert!(writer.write(b"abc").await.is_err());
        drop(writer);
        let status = tracker.status();
        assert_eq!(status.failed, 1);
        assert_eq!(status.done, 0);
        assert_eq!(status.bytes_downloaded, 0);
        Ok(())
    }

    #[test]
    fn dropping_active_writer_fails_it() {
        let tracker = Tracker::hidden();
        let writer = tracker.tracked_writer("a.jpg", 3, VecSink::default());
        drop(writer);
        let done_writer = {
            let mut writer = tracker.tracked_writer("b.jpg", 3, VecSink::default());
            writer.done();
            writer
        };
        drop(done_writer);
        let status = tracker.status();
        assert_eq!(status.failed, 1);
        assert_eq!(status.done, 1);
    }

    #[test]
    fn printer_reports_counts() {
        let progress = Progress::new();
        progress.started.add(3);
        progress.done.add(1);
        progress.failed.inc();
        progress.bytes_downloaded.add(2048);
        let report = ProgressPrinter::new(&progress).print();
        let value_of = |key: &str| {
            report
                .lines()
                .find(|line| line.starts_with(key))
                .map(|line| line[key.len()..].trim().to_string())
        };
        assert_eq!(value_of("active:").as_deref(), Some("1"));
        assert_eq!(value_of("done:").as_deref(), Some("1"));
        assert_eq!(value_of("failed:").as_deref(), Some("1"));
        assert!(report.contains("DOWNLOADED"));
    }

    #[test]
    fn progress_type_parsing() {
        assert_eq!(ProgressType::from_str("auto", false), Ok(ProgressType::Auto));
        assert_eq!(
            ProgressType::from_str("ProgressBar", false),
            Ok(ProgressType::ProgressBar)
        );
        assert_eq!(
            ProgressType::from_str("text-updates", false),
            Ok(ProgressType::TextUpdates)
        );
        assert!(ProgressType::from_str("fancy", false).is_err());
    }

    #[test]
    fn invalid_delay_is_rejected() {
        let settings = ProgressSettings {
            progress_type: ProgressType::TextUpdates,
            progress_delay: Some("soon".to_string()),
        };
        assert!(Tracker::new(Some(&settings)).is_err());
        let settings = ProgressSettings {
            progress_type: ProgressType::TextUpdates,
            progress_delay: Some("0s".to_string()),
        };
        assert!(Tracker::new(Some(&settings)).is_err());
    }

    #[tokio::test]
    async fn renderer_starts_and_stops() -> Result<()> {
        let settings = ProgressSettings {
            progress_type: ProgressType::TextUpdates,
            progress_delay: Some("10ms".to_string()),
        };
        let tracker = Tracker::new(Some(&settings))?;
        tracker.start();
        let mut writer = tracker.tracked_writer("a.jpg", 3, VecSink::default());
        writer.write(b"abc").await?;
        writer.done();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        tracker.stop().await;
        assert_eq!(tracker.status().done, 1);
        Ok(())
    }
}
