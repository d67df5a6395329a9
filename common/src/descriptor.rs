//! Remote file descriptors as handed to the download pool.

use serde::{Deserialize, Serialize};

/// Metadata and streaming handle for one remote file.
///
/// Descriptors are produced by an enumerator and are immutable afterwards; the pool hands each
/// one to exactly one worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Remote file handle (unique within the owning peer)
    pub id: i64,
    /// File name as reported by the remote side
    pub name: String,
    /// Size in bytes, used for progress reporting
    pub size: u64,
    /// Identifier of the peer (chat, channel or user) the file belongs to
    pub peer_id: i64,
    /// Optional human readable peer name, preferred over `peer_id` for the output subdirectory
    pub display_name: Option<String>,
    /// Content tags of the enclosing message, without the leading `#`
    pub tags: Vec<String>,
    /// Opaque reference the remote source uses to stream the bytes
    pub location: String,
}

impl FileDescriptor {
    /// Name of the per-peer output subdirectory.
    pub fn peer_dir_name(&self) -> String {
        match self.display_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.peer_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(display_name: Option<&str>) -> FileDescriptor {
        FileDescriptor {
            id: 1,
            name: "a.jpg".to_string(),
            size: 3,
            peer_id: 4242,
            display_name: display_name.map(String::from),
            tags: vec![],
            location: "a.jpg".to_string(),
        }
    }

    #[test]
    fn peer_dir_prefers_display_name() {
        assert_eq!(descriptor(Some("alice")).peer_dir_name(), "alice");
    }

    #[test]
    fn peer_dir_falls_back_to_peer_id() {
        assert_eq!(descriptor(None).peer_dir_name(), "4242");
        assert_eq!(descriptor(Some("")).peer_dir_name(), "4242");
    }
}
