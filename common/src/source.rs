//! Boundary to the remote side: where descriptors come from and how their bytes are streamed.

use crate::descriptor::FileDescriptor;

/// Receives the bytes of one file, in the order the remote side delivers them.
#[async_trait::async_trait]
pub trait Sink: Send {
    /// Write the whole chunk. Any error must abort the download it belongs to.
    async fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()>;
}

/// Streams remote files.
#[async_trait::async_trait]
pub trait Source: Send + Sync {
    /// Push the bytes of `file` into `sink`, stopping at the first error the sink returns.
    async fn download(&self, file: &FileDescriptor, sink: &mut dyn Sink) -> anyhow::Result<()>;
}

/// Descriptors produced by an enumerator together with the errors it ran into.
///
/// The stream is exhausted once `files` is closed; `errors` may close earlier or later.
pub struct DescriptorStream {
    pub files: async_channel::Receiver<FileDescriptor>,
    pub errors: async_channel::Receiver<anyhow::Error>,
}

impl DescriptorStream {
    /// Build a stream from already known descriptors.
    pub fn from_vec(files: Vec<FileDescriptor>) -> Self {
        let (files_tx, files_rx) = async_channel::unbounded();
        let (_errors_tx, errors_rx) = async_channel::unbounded();
        for file in files {
            // unbounded channel with a live receiver, cannot fail
            let _ = files_tx.try_send(file);
        }
        Self {
            files: files_rx,
            errors: errors_rx,
        }
    }

    /// Collect every error the enumerator reports until it closes the error channel.
    pub async fn collect_errors(errors: async_channel::Receiver<anyhow::Error>) -> Vec<anyhow::Error> {
        Self::collect_errors_until(errors, tokio_util::sync::CancellationToken::new()).await
    }

    /// Like [`DescriptorStream::collect_errors`], but also stops once `done` is cancelled,
    /// keeping the errors that were already reported by then.
    pub async fn collect_errors_until(
        errors: async_channel::Receiver<anyhow::Error>,
        done: tokio_util::sync::CancellationToken,
    ) -> Vec<anyhow::Error> {
        let mut collected = vec![];
        loop {
            let error = tokio::select! {
                biased;
                error = errors.recv() => match error {
                    Ok(error) => error,
                    Err(_) => break,
                },
                _ = done.cancelled() => match errors.try_recv() {
                    Ok(error) => error,
                    Err(_) => break,
                },
            };
            tracing::error!("{:#}", &error);
            collected.push(error);
        }
        collected
    }
}
