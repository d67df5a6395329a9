//! Configuration types for batches, the worker pool and the runtime

/// How downloaded files are laid out on the storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Write files into one subdirectory per content tag instead of the flat peer directory
    pub fan_out_by_tag: bool,
    /// Do nothing for files whose destination already exists (instead of renaming)
    pub skip_if_exists: bool,
}

/// Which messages an enumerator yields files for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    /// Only messages sent by this user (None = everyone)
    pub user_filter: Option<String>,
    /// Maximum number of files (0 = no limit)
    pub limit: usize,
    /// Only messages dated strictly before this instant (None = no bound)
    pub offset_date: Option<chrono::DateTime<chrono::Utc>>,
}

impl QueryFilter {
    pub fn matches(&self, from: Option<&str>, date: chrono::DateTime<chrono::Utc>) -> bool {
        if let Some(user) = self.user_filter.as_deref() {
            if from != Some(user) {
                return false;
            }
        }
        if let Some(offset_date) = self.offset_date {
            if date >= offset_date {
                return false;
            }
        }
        true
    }
}

/// Everything that applies to one download batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchConfig {
    pub save: SaveOptions,
    pub query: QueryFilter,
}

/// Worker pool sizing
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Number of files downloaded in parallel
    pub workers: usize,
    /// Read size used when streaming from a local source (bytes)
    pub chunk_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            chunk_size: 128 * 1024,
        }
    }
}

impl PoolConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be at least 1".to_string());
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be at least 1 byte".to_string());
        }
        Ok(())
    }
}

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}
