use std::time::SystemTime;

use anyhow::{bail, Result};
use async_trait::async_trait;

/// Entry metadata returned by stat operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub is_file: bool,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
    /// Last modification time (if available)
    pub modified: Option<SystemTime>,
    /// Unix permission bits (if the backend has them)
    pub mode: Option<u32>,
    pub readonly: bool,
}

impl FileStat {
    /// Plain file stat for backends without full metadata
    pub fn file(size: u64) -> Self {
        Self {
            is_file: true,
            is_dir: false,
            is_symlink: false,
            size,
            modified: None,
            mode: None,
            readonly: false,
        }
    }

    pub fn dir() -> Self {
        Self {
            is_file: false,
            is_dir: true,
            is_symlink: false,
            size: 0,
            modified: None,
            mode: None,
            readonly: false,
        }
    }

    #[must_use]
    pub fn with_modified(mut self, modified: Option<SystemTime>) -> Self {
        self.modified = modified;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: Option<u32>) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }
}

/// Chunk of data from streaming read
#[derive(Debug)]
pub struct ReadChunk {
    pub data: Vec<u8>,
    pub offset: u64,
    pub is_last: bool,
}

/// Streaming read handle
///
/// Reads large files in chunks without loading them into memory.
#[async_trait]
pub trait ReadHandle: Send + Sync {
    /// Read next chunk (chunk size is backend-dependent)
    async fn read_chunk(&mut self) -> Result<ReadChunk>;

    /// Total file size (if known)
    fn size(&self) -> Option<u64>;

    async fn close(&mut self) -> Result<()>;
}

/// Streaming write handle
#[async_trait]
pub trait WriteHandle: Send + Sync {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()>;

    /// Flush and close the handle
    async fn close(&mut self) -> Result<()>;

    fn bytes_written(&self) -> u64;
}

/// Storage backend trait - every file operation goes through this
///
/// Paths are slash-separated and relative to the backend's own root; a
/// leading `/` is accepted and ignored.
///
/// Default implementations return "not supported" for optional operations,
/// so backends implement only what they can express.
#[async_trait]
pub trait VfsBackend: Send + Sync {
    /// Read entire file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write entire file contents (create or overwrite)
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// List directory contents (basenames only)
    async fn list(&self, path: &str) -> Result<Vec<String>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Optional operations with default implementations
    // ─────────────────────────────────────────────────────────────────────────

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Create a directory (parent must exist)
    async fn create_dir(&self, _path: &str) -> Result<()> {
        bail!("create_dir not supported by this backend")
    }

    /// Create a directory and all parent directories
    async fn create_dir_all(&self, _path: &str) -> Result<()> {
        bail!("create_dir_all not supported by this backend")
    }

    /// Remove an empty directory
    async fn remove_dir(&self, _path: &str) -> Result<()> {
        bail!("remove_dir not supported by this backend")
    }

    async fn remove_file(&self, _path: &str) -> Result<()> {
        bail!("remove_file not supported by this backend")
    }

    /// Copy a file to a new location
    async fn copy(&self, _src: &str, _dest: &str) -> Result<()> {
        bail!("copy not supported by this backend")
    }

    /// Rename/move a file or directory
    async fn rename(&self, _src: &str, _dest: &str) -> Result<()> {
        bail!("rename not supported by this backend")
    }

    /// Set the modification time of an existing entry
    async fn set_modified(&self, _path: &str, _modified: SystemTime) -> Result<()> {
        bail!("set_modified not supported by this backend")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Streaming API (optional - for large file handling)
    // ─────────────────────────────────────────────────────────────────────────

    async fn open_read(&self, _path: &str) -> Result<Box<dyn ReadHandle>> {
        bail!("streaming read not supported by this backend")
    }

    /// Open a file for streaming write (create or overwrite)
    async fn open_write(&self, _path: &str) -> Result<Box<dyn WriteHandle>> {
        bail!("streaming write not supported by this backend")
    }

    fn supports_streaming(&self) -> bool {
        false
    }
}

/// Join a parent path and a child name with a single slash
pub fn join_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Split off the final path segment: `("a/b", "c")` for `"a/b/c"`
pub fn split_parent(path: &str) -> (&str, &str) {
    let path = path.trim_end_matches('/');
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}
