//! Exported message histories as a source of downloads.
//!
//! A manifest is a JSON export of one conversation:
//!
//! ```json
//! { "peer_id": 100, "display_name": "alice",
//!   "messages": [ { "id": 1, "date": "2024-01-02T03:04:05Z", "from": "bob",
//!                   "text": "look #cats", "file": { "name": "a.jpg",
//!                   "path": "media/a.jpg", "size": 3 } } ] }
//! ```
//!
//! [`enumerate`] turns manifests into [`FileDescriptor`]s and [`FileSource`] streams the files
//! they reference from the local disk.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use tokio::io::AsyncReadExt;
use tracing::instrument;

use crate::config::QueryFilter;
use crate::descriptor::FileDescriptor;
use crate::source::{DescriptorStream, Sink, Source};

#[derive(Debug, serde::Deserialize)]
struct Manifest {
    peer_id: i64,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Debug, serde::Deserialize)]
struct Message {
    id: i64,
    date: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    file: Option<Attachment>,
}

#[derive(Debug, serde::Deserialize)]
struct Attachment {
    name: String,
    path: PathBuf,
    #[serde(default)]
    size: Option<u64>,
}

async fn read_manifest(path: &Path) -> anyhow::Result<Manifest> {
    let contents = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed reading manifest {:?}", path))?;
    serde_json::from_slice(&contents).with_context(|| format!("failed parsing manifest {:?}", path))
}

async fn describe(
    manifest: &Manifest,
    base_dir: &Path,
    message: &Message,
    attachment: &Attachment,
) -> anyhow::Result<FileDescriptor> {
    let location = base_dir.join(&attachment.path);
    let size = match attachment.size {
        Some(size) => size,
        None => tokio::fs::metadata(&location)
            .await
            .with_context(|| format!("failed reading size of {:?}", &location))?
            .len(),
    };
    Ok(FileDescriptor {
        id: message.id,
        name: attachment.name.clone(),
        size,
        peer_id: manifest.peer_id,
        display_name: manifest.display_name.clone(),
        tags: crate::tags::extract(&message.text),
        location: location.to_string_lossy().into_owned(),
    })
}

/// Enumerate the files of every manifest in `paths`, in order, applying `query`.
///
/// Runs in a background task. A manifest (or a file within it) that cannot be read is reported on
/// the error channel and enumeration continues with the next one. Must be called from within a
/// tokio runtime.
pub fn enumerate(paths: Vec<PathBuf>, query: QueryFilter) -> DescriptorStream {
    let (files_tx, files_rx) = async_channel::bounded(16);
    let (errors_tx, errors_rx) = async_channel::unbounded();
    tokio::spawn(async move {
        let mut produced = 0usize;
        'manifests: for path in paths {
            let manifest = match read_manifest(&path).await {
                Ok(manifest) => manifest,
                Err(error) => {
                    let _ = errors_tx.send(error).await;
                    continue;
                }
            };
            let base_dir = path.parent().unwrap_or(Path::new("")).to_path_buf();
            tracing::debug!(
                "manifest {:?}: peer {} with {} messages",
                &path,
                manifest.peer_id,
                manifest.messages.len()
            );
            for message in &manifest.messages {
                if query.limit > 0 && produced >= query.limit {
                    break 'manifests;
                }
                let Some(attachment) = message.file.as_ref() else {
                    continue;
                };
                if !query.matches(message.from.as_deref(), message.date) {
                    continue;
                }
                match describe(&manifest, &base_dir, message, attachment).await {
                    Ok(file) => {
                        if files_tx.send(file).await.is_err() {
                            tracing::debug!("descriptor receiver closed, stopping enumeration");
                            break 'manifests;
                        }
                        produced += 1;
                    }
                    Err(error) => {
                        let _ = errors_tx.send(error).await;
                    }
                }
            }
        }
        tracing::debug!("enumerated {} files", produced);
    });
    DescriptorStream {
        files: files_rx,
        errors: errors_rx,
    }
}

/// Streams files referenced by a manifest from the local disk.
#[derive(Debug, Clone, Copy)]
pub struct FileSource {
    chunk_size: usize,
}

impl FileSource {
    pub fn new(chunk_size: usize) -> anyhow::Result<Self> {
        if chunk_size == 0 {
            return Err(anyhow!("chunk size must be at least 1 byte"));
        }
        Ok(Self { chunk_size })
    }
}

#[async_trait::async_trait]
impl Source for FileSource {
    #[instrument(skip(self, sink), fields(file = %file.name))]
    async fn download(&self, file: &FileDescriptor, sink: &mut dyn Sink) -> anyhow::Result<()> {
        let mut reader = tokio::fs::File::open(&file.location)
            .await
            .with_context(|| format!("failed opening {:?}", &file.location))?;
        let mut buffer = vec![0u8; self.chunk_size];
        loop {
            let read = reader
                .read(&mut buffer)
                .await
                .with_context(|| format!("failed reading {:?}", &file.location))?;
            if read == 0 {
                return Ok(());
            }
            sink.write(&buffer[..read]).await?;
        }
    }
}
