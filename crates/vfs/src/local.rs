use std::fs;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use filetime::FileTime;

use super::backend::{FileStat, ReadChunk, ReadHandle, VfsBackend, WriteHandle};

/// Default chunk size for streaming (64KB)
const CHUNK_SIZE: usize = 64 * 1024;

/// Local disk backend sandboxed to one root directory
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Create a backend rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root_path = root.into();
        let _ = fs::create_dir_all(&root_path);
        Self {
            root: root_path.canonicalize().unwrap_or(root_path),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject path syntax that means something else on other platforms
    fn validate(path: &str) -> Result<()> {
        if path.contains('\\') {
            bail!("Invalid path {path:?}: backslashes not allowed");
        }
        if path.contains(':') {
            bail!("Invalid path {path:?}: colon not allowed");
        }
        Ok(())
    }

    fn check_sandbox(&self, path: &str, resolved: PathBuf) -> Result<PathBuf> {
        if !resolved.starts_with(&self.root) {
            bail!(
                "Path traversal blocked: {} escapes sandbox {}",
                path,
                self.root.display()
            );
        }
        Ok(resolved)
    }

    /// Resolve a path that may not exist yet, creating its parent
    ///
    /// The canonical parent must stay inside the sandbox root.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        Self::validate(path)?;
        let target = self.root.join(path.trim_start_matches('/'));

        let resolved = if target.exists() {
            target.canonicalize()?
        } else {
            let parent = target
                .parent()
                .ok_or_else(|| anyhow!("Invalid path: no parent"))?;
            let name = target
                .file_name()
                .ok_or_else(|| anyhow!("Invalid path: no filename"))?;

            // Check before creating anything outside the root
            let lexical = parent
                .components()
                .all(|c| !matches!(c, std::path::Component::ParentDir));
            if !lexical {
                bail!("Path traversal blocked: {path} contains '..'");
            }
            fs::create_dir_all(parent)?;
            parent.canonicalize()?.join(name)
        };

        self.check_sandbox(path, resolved)
    }

    /// Resolve without creating parent directories (read/stat/remove)
    fn resolve_existing(&self, path: &str) -> Result<PathBuf> {
        Self::validate(path)?;
        let target = self.root.join(path.trim_start_matches('/'));
        let resolved = target
            .canonicalize()
            .with_context(|| format!("Not found: {path}"))?;
        self.check_sandbox(path, resolved)
    }
}

fn stat_path(path: &Path) -> Result<FileStat> {
    let link = fs::symlink_metadata(path)?;
    let meta = fs::metadata(path)?;
    Ok(FileStat {
        is_file: meta.is_file(),
        is_dir: meta.is_dir(),
        is_symlink: link.file_type().is_symlink(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        modified: meta.modified().ok(),
        mode: permission_bits(&meta),
        readonly: meta.permissions().readonly(),
    })
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn permission_bits(_meta: &fs::Metadata) -> Option<u32> {
    None
}

#[async_trait]
impl VfsBackend for LocalFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let resolved = self.resolve_existing(path)?;
        tokio::task::spawn_blocking(move || fs::read(resolved).map_err(Into::into)).await?
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let resolved = self.resolve(path)?;
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || fs::write(resolved, data).map_err(Into::into)).await?
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let resolved = self.resolve_existing(path)?;
        tokio::task::spawn_blocking(move || stat_path(&resolved)).await?
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let resolved = self.resolve_existing(path)?;
        tokio::task::spawn_blocking(move || {
            let mut entries = Vec::new();
            for entry in fs::read_dir(resolved)? {
                let entry = entry?;
                entries.push(entry.file_name().to_string_lossy().into_owned());
            }
            entries.sort();
            Ok(entries)
        })
        .await?
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Self::validate(path)?;
        Ok(self.resolve_existing(path).is_ok())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        tokio::task::spawn_blocking(move || fs::create_dir(resolved).map_err(Into::into)).await?
    }

    async fn create_dir_all(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        tokio::task::spawn_blocking(move || fs::create_dir_all(resolved).map_err(Into::into))
            .await?
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        let resolved = self.resolve_existing(path)?;
        tokio::task::spawn_blocking(move || fs::remove_dir(resolved).map_err(Into::into)).await?
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let resolved = self.resolve_existing(path)?;
        tokio::task::spawn_blocking(move || fs::remove_file(resolved).map_err(Into::into)).await?
    }

    async fn copy(&self, src: &str, dest: &str) -> Result<()> {
        let src_resolved = self.resolve_existing(src)?;
        let dest_resolved = self.resolve(dest)?;
        tokio::task::spawn_blocking(move || {
            fs::copy(src_resolved, dest_resolved)?;
            Ok(())
        })
        .await?
    }

    async fn rename(&self, src: &str, dest: &str) -> Result<()> {
        let src_resolved = self.resolve_existing(src)?;
        let dest_resolved = self.resolve(dest)?;
        tokio::task::spawn_blocking(move || {
            fs::rename(src_resolved, dest_resolved).map_err(Into::into)
        })
        .await?
    }

    async fn set_modified(&self, path: &str, modified: SystemTime) -> Result<()> {
        let resolved = self.resolve_existing(path)?;
        let mtime = FileTime::from_system_time(modified);
        tokio::task::spawn_blocking(move || {
            filetime::set_file_mtime(resolved, mtime).map_err(Into::into)
        })
        .await?
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn ReadHandle>> {
        let resolved = self.resolve_existing(path)?;
        let handle = tokio::task::spawn_blocking(move || FileReadHandle::new(&resolved)).await??;
        Ok(Box::new(handle))
    }

    async fn open_write(&self, path: &str) -> Result<Box<dyn WriteHandle>> {
        let resolved = self.resolve(path)?;
        let handle = tokio::task::spawn_blocking(move || FileWriteHandle::new(&resolved)).await??;
        Ok(Box::new(handle))
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

/// Streaming read handle for local files
pub struct FileReadHandle {
    reader: Arc<Mutex<BufReader<File>>>,
    size: u64,
    offset: u64,
}

impl FileReadHandle {
    fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            reader: Arc::new(Mutex::new(BufReader::with_capacity(CHUNK_SIZE, file))),
            size,
            offset: 0,
        })
    }
}

#[async_trait]
impl ReadHandle for FileReadHandle {
    async fn read_chunk(&mut self) -> Result<ReadChunk> {
        let reader = Arc::clone(&self.reader);
        let remaining = self.size.saturating_sub(self.offset);
        let want = usize::try_from(remaining).map_or(CHUNK_SIZE, |r| r.min(CHUNK_SIZE));

        let data = tokio::task::spawn_blocking(move || {
            let mut guard = reader.lock().map_err(|_| anyhow!("Lock poisoned"))?;
            let mut buffer = vec![0u8; want];
            let bytes_read = guard.read(&mut buffer)?;
            buffer.truncate(bytes_read);
            Ok::<_, anyhow::Error>(buffer)
        })
        .await??;

        let bytes_read = data.len() as u64;
        let chunk = ReadChunk {
            data,
            offset: self.offset,
            is_last: bytes_read == 0 || self.offset + bytes_read >= self.size,
        };
        self.offset += bytes_read;
        Ok(chunk)
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Streaming write handle for local files
pub struct FileWriteHandle {
    writer: Arc<Mutex<BufWriter<File>>>,
    bytes_written: u64,
}

impl FileWriteHandle {
    fn new(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(BufWriter::with_capacity(CHUNK_SIZE, file))),
            bytes_written: 0,
        })
    }
}

#[async_trait]
impl WriteHandle for FileWriteHandle {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        let bytes = data.len() as u64;

        tokio::task::spawn_blocking(move || {
            let mut guard = writer.lock().map_err(|_| anyhow!("Lock poisoned"))?;
            guard.write_all(&data)?;
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        self.bytes_written += bytes;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut guard = writer.lock().map_err(|_| anyhow!("Lock poisoned"))?;
            guard.flush()?;
            Ok::<_, anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
