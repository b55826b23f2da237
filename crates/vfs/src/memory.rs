//! In-memory backend
//!
//! An ephemeral tree that lives only as long as the backend. Used as a
//! scratch target for downloads and as a fixture in tests.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use super::backend::{FileStat, ReadChunk, ReadHandle, VfsBackend, WriteHandle};

#[derive(Clone, Debug)]
enum Node {
    File(Vec<u8>),
    Directory,
}

#[derive(Clone, Debug)]
struct MemoryEntry {
    node: Node,
    modified: SystemTime,
}

impl MemoryEntry {
    fn file(data: Vec<u8>) -> Self {
        Self {
            node: Node::File(data),
            modified: SystemTime::now(),
        }
    }

    fn dir() -> Self {
        Self {
            node: Node::Directory,
            modified: SystemTime::now(),
        }
    }

    fn stat(&self) -> FileStat {
        let stat = match &self.node {
            Node::File(data) => FileStat::file(data.len() as u64),
            Node::Directory => FileStat::dir(),
        };
        stat.with_modified(Some(self.modified))
    }
}

type Entries = Arc<RwLock<BTreeMap<String, MemoryEntry>>>;

/// In-memory filesystem backend
///
/// Thread-safe via an internal `RwLock`. Keys are normalized absolute paths.
pub struct MemoryFs {
    entries: Entries,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        // Root always exists
        entries.insert("/".to_string(), MemoryEntry::dir());
        Self {
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    /// Create with initial file contents; parents are implied
    pub fn with_files<P, C>(files: impl IntoIterator<Item = (P, C)>) -> Self
    where
        P: AsRef<str>,
        C: AsRef<[u8]>,
    {
        let fs = Self::new();
        if let Ok(mut entries) = fs.entries.write() {
            for (path, content) in files {
                let path = normalize_path(path.as_ref());
                insert_parents(&mut entries, &path);
                entries.insert(path, MemoryEntry::file(content.as_ref().to_vec()));
            }
        }
        fs
    }

    fn read_lock(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, MemoryEntry>>> {
        self.entries.read().map_err(|_| anyhow!("Lock poisoned"))
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, MemoryEntry>>> {
        self.entries.write().map_err(|_| anyhow!("Lock poisoned"))
    }
}

/// Leading `/`, no trailing `/`, no `.` segments
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .trim()
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    format!("/{}", segments.join("/"))
}

fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/')? {
        0 => Some("/"),
        idx => Some(&path[..idx]),
    }
}

fn insert_parents(entries: &mut BTreeMap<String, MemoryEntry>, path: &str) {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut current = String::new();
    for part in &parts[..parts.len().saturating_sub(1)] {
        current = format!("{current}/{part}");
        entries
            .entry(current.clone())
            .or_insert_with(MemoryEntry::dir);
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

#[async_trait]
impl VfsBackend for MemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize_path(path);
        let entries = self.read_lock()?;

        match entries.get(&path).map(|e| &e.node) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Directory) => bail!("Cannot read directory: {path}"),
            None => bail!("File not found: {path}"),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = normalize_path(path);
        let mut entries = self.write_lock()?;
        if matches!(entries.get(&path).map(|e| &e.node), Some(Node::Directory)) {
            bail!("Is a directory: {path}");
        }
        insert_parents(&mut entries, &path);
        entries.insert(path, MemoryEntry::file(data.to_vec()));
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = normalize_path(path);
        let entries = self.read_lock()?;
        entries
            .get(&path)
            .map(MemoryEntry::stat)
            .ok_or_else(|| anyhow!("Not found: {path}"))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let path = normalize_path(path);
        let entries = self.read_lock()?;

        match entries.get(&path).map(|e| &e.node) {
            Some(Node::Directory) => {}
            Some(Node::File(_)) => bail!("Not a directory: {path}"),
            None => bail!("Directory not found: {path}"),
        }

        let prefix = child_prefix(&path);
        Ok(entries
            .keys()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(String::from)
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path);
        Ok(self.read_lock()?.contains_key(&path))
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let mut entries = self.write_lock()?;

        if let Some(parent) = parent_path(&path) {
            if !entries.contains_key(parent) {
                bail!("Parent directory does not exist: {parent}");
            }
        }
        if entries.contains_key(&path) {
            bail!("Already exists: {path}");
        }
        entries.insert(path, MemoryEntry::dir());
        Ok(())
    }

    async fn create_dir_all(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let mut entries = self.write_lock()?;
        insert_parents(&mut entries, &path);
        match entries.get(&path).map(|e| &e.node) {
            Some(Node::File(_)) => bail!("Not a directory: {path}"),
            Some(Node::Directory) => {}
            None => {
                entries.insert(path, MemoryEntry::dir());
            }
        }
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        if path == "/" {
            bail!("Cannot remove root");
        }
        let mut entries = self.write_lock()?;

        let prefix = child_prefix(&path);
        if entries.keys().any(|key| key.starts_with(&prefix)) {
            bail!("Directory not empty: {path}");
        }
        match entries.get(&path).map(|e| &e.node) {
            Some(Node::Directory) => {
                entries.remove(&path);
                Ok(())
            }
            Some(Node::File(_)) => bail!("Not a directory: {path}"),
            None => bail!("Directory not found: {path}"),
        }
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let mut entries = self.write_lock()?;
        match entries.get(&path).map(|e| &e.node) {
            Some(Node::File(_)) => {
                entries.remove(&path);
                Ok(())
            }
            Some(Node::Directory) => bail!("Not a file: {path}"),
            None => bail!("File not found: {path}"),
        }
    }

    async fn copy(&self, src: &str, dest: &str) -> Result<()> {
        let src = normalize_path(src);
        let dest = normalize_path(dest);
        let mut entries = self.write_lock()?;

        let data = match entries.get(&src).map(|e| &e.node) {
            Some(Node::File(data)) => data.clone(),
            Some(Node::Directory) => bail!("Cannot copy directory: {src}"),
            None => bail!("File not found: {src}"),
        };
        insert_parents(&mut entries, &dest);
        entries.insert(dest, MemoryEntry::file(data));
        Ok(())
    }

    async fn rename(&self, src: &str, dest: &str) -> Result<()> {
        let src = normalize_path(src);
        let dest = normalize_path(dest);
        let mut entries = self.write_lock()?;

        // a directory moves together with everything below it
        let prefix = child_prefix(&src);
        let moved: Vec<String> = entries
            .keys()
            .filter(|key| **key == src || key.starts_with(&prefix))
            .cloned()
            .collect();
        if moved.is_empty() {
            bail!("Not found: {src}");
        }

        insert_parents(&mut entries, &dest);
        for key in moved {
            if let Some(entry) = entries.remove(&key) {
                let renamed = format!("{dest}{}", &key[src.len()..]);
                entries.insert(renamed, entry);
            }
        }
        Ok(())
    }

    async fn set_modified(&self, path: &str, modified: SystemTime) -> Result<()> {
        let path = normalize_path(path);
        let mut entries = self.write_lock()?;
        let entry = entries
            .get_mut(&path)
            .ok_or_else(|| anyhow!("Not found: {path}"))?;
        entry.modified = modified;
        Ok(())
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn ReadHandle>> {
        let data = self.read(path).await?;
        Ok(Box::new(MemoryReadHandle { data, offset: 0 }))
    }

    async fn open_write(&self, path: &str) -> Result<Box<dyn WriteHandle>> {
        let path = normalize_path(path);
        insert_parents(&mut *self.write_lock()?, &path);
        Ok(Box::new(MemoryWriteHandle {
            path,
            buffer: Vec::new(),
            entries: Arc::clone(&self.entries),
        }))
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

struct MemoryReadHandle {
    data: Vec<u8>,
    offset: usize,
}

#[async_trait]
impl ReadHandle for MemoryReadHandle {
    async fn read_chunk(&mut self) -> Result<ReadChunk> {
        const CHUNK_SIZE: usize = 64 * 1024;
        let remaining = self.data.len().saturating_sub(self.offset);
        let chunk_size = remaining.min(CHUNK_SIZE);

        let chunk = ReadChunk {
            data: self.data[self.offset..self.offset + chunk_size].to_vec(),
            offset: self.offset as u64,
            is_last: self.offset + chunk_size >= self.data.len(),
        };
        self.offset += chunk_size;
        Ok(chunk)
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Buffers everything and publishes the file on close
struct MemoryWriteHandle {
    path: String,
    buffer: Vec<u8>,
    entries: Entries,
}

#[async_trait]
impl WriteHandle for MemoryWriteHandle {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| anyhow!("Lock poisoned"))?;
        entries.insert(
            self.path.clone(),
            MemoryEntry::file(self.buffer.clone()),
        );
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.buffer.len() as u64
    }
}
