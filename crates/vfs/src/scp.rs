//! Remote-shell backend
//!
//! Every operation starts one `scp` session over the configured
//! [`CommandRunner`]. The protocol can only move entries in and out, so
//! delete and rename stay unsupported.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use omnistore_scp::{
    BoxError, CommandRunner, Flow, RemoteEntry, ScpConfig, Session, Uploader, Visitor,
};

use crate::backend::{join_path, split_parent, FileStat, VfsBackend};
use crate::ops;

/// Totals for a tree transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
}

pub struct ScpFs {
    runner: Arc<dyn CommandRunner>,
    config: ScpConfig,
    /// Remote directory that relative paths hang off; empty means the
    /// remote shell's working directory
    root: String,
}

impl ScpFs {
    pub fn new(runner: impl CommandRunner + 'static, config: ScpConfig) -> Self {
        Self {
            runner: Arc::new(runner),
            config,
            root: String::new(),
        }
    }

    #[must_use]
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    pub fn config(&self) -> &ScpConfig {
        &self.config
    }

    /// Path as the remote command should see it
    fn remote_path(&self, path: &str) -> String {
        let relative = path.trim_start_matches('/');
        if self.root.is_empty() {
            path.to_string()
        } else if relative.is_empty() {
            self.root.clone()
        } else {
            join_path(&self.root, relative)
        }
    }

    async fn pull<V: Visitor>(
        &self,
        path: &str,
        config: &ScpConfig,
        recursive: bool,
        visitor: &mut V,
    ) -> Result<()> {
        let remote = self.remote_path(path);
        Session::download(self.runner.as_ref(), config, &remote, recursive, visitor)
            .await
            .with_context(|| format!("scp download of {remote}"))
    }

    async fn uploader(&self, dir: &str, recursive: bool) -> Result<Uploader> {
        Session::upload(self.runner.as_ref(), &self.config, dir, recursive)
            .await
            .with_context(|| format!("scp upload into {dir}"))
    }

    /// Mirror the remote tree at `remote_dir` into `target` under `target_root`
    ///
    /// File modification times are applied when the target supports it.
    pub async fn download_tree(
        &self,
        remote_dir: &str,
        target: &dyn VfsBackend,
        target_root: &str,
    ) -> Result<TransferStats> {
        if !target_root.is_empty() {
            target.create_dir_all(target_root).await?;
        }
        let mut mirror = Mirror {
            target,
            root: target_root,
            stats: TransferStats::default(),
        };
        self.pull(remote_dir, &self.config, true, &mut mirror)
            .await?;
        tracing::info!(
            remote = %self.remote_path(remote_dir),
            files = mirror.stats.files,
            dirs = mirror.stats.dirs,
            bytes = mirror.stats.bytes,
            "download finished"
        );
        Ok(mirror.stats)
    }

    /// Push `source_root` from `source` into the remote directory `remote_dir`
    ///
    /// A directory root sends its children; a file root sends just that file.
    pub async fn upload_tree(
        &self,
        source: &dyn VfsBackend,
        source_root: &str,
        remote_dir: &str,
    ) -> Result<TransferStats> {
        let remote = self.remote_path(remote_dir);
        let root = source.stat(source_root).await?;
        let mut stats = TransferStats::default();

        if !root.is_dir {
            let (_, name) = split_parent(source_root);
            let data = source.read(source_root).await?;
            let entry = describe(name, &root, data.len() as u64);
            let mut uploader = self.uploader(&remote, false).await?;
            push_file(&mut uploader, "", &entry, &data).await?;
            uploader.finish().await?;
            stats.files = 1;
            stats.bytes = data.len() as u64;
            return Ok(stats);
        }

        let entries = ops::walk(source, source_root).await?;
        let mut uploader = self.uploader(&remote, true).await?;
        for entry in entries {
            let pushed = if entry.stat.is_dir {
                stats.dirs += 1;
                uploader
                    .push(&entry.parent, &describe(&entry.name, &entry.stat, 0), None)
                    .await
                    .map_err(anyhow::Error::from)
            } else {
                match source.read(&join_path(source_root, &entry.path())).await {
                    Ok(data) => {
                        stats.files += 1;
                        stats.bytes += data.len() as u64;
                        let described = describe(&entry.name, &entry.stat, data.len() as u64);
                        push_file(&mut uploader, &entry.parent, &described, &data).await
                    }
                    Err(e) => Err(e),
                }
            };

            if let Err(e) = pushed {
                let _ = uploader.close().await;
                return Err(e.context(format!("uploading {}", entry.path())));
            }
        }
        uploader.finish().await?;

        tracing::info!(
            %remote,
            files = stats.files,
            dirs = stats.dirs,
            bytes = stats.bytes,
            "upload finished"
        );
        Ok(stats)
    }
}

async fn push_file(
    uploader: &mut Uploader,
    parent: &str,
    entry: &RemoteEntry,
    data: &[u8],
) -> Result<()> {
    let mut content = data;
    uploader.push(parent, entry, Some(&mut content)).await?;
    Ok(())
}

/// Sink directory and entry name for a remote path
fn target_of(remote: &str) -> (&str, &str) {
    let (dir, name) = split_parent(remote);
    let dir = match (dir.is_empty(), remote.starts_with('/')) {
        (false, _) => dir,
        (true, true) => "/",
        (true, false) => ".",
    };
    (dir, name)
}

/// Wire descriptor for a local entry
fn describe(name: &str, stat: &FileStat, size: u64) -> RemoteEntry {
    let mut entry = if stat.is_dir {
        RemoteEntry::dir(name)
    } else {
        RemoteEntry::file(name, size)
    };
    if let Some(mode) = stat.mode {
        entry = entry.with_mode(mode);
    }
    if let Some(modified) = stat.modified {
        entry = entry.with_modified(modified);
    }
    entry
}

fn stat_of(entry: &RemoteEntry) -> FileStat {
    let stat = if entry.is_dir() {
        FileStat::dir()
    } else {
        FileStat::file(entry.size)
    };
    stat.with_mode(Some(entry.mode))
        .with_modified(Some(entry.modified))
}

/// Keeps the first file announced
#[derive(Default)]
struct FirstFile(Option<Vec<u8>>);

#[async_trait]
impl Visitor for FirstFile {
    async fn visit(
        &mut self,
        _parent: &str,
        entry: &RemoteEntry,
        content: &[u8],
    ) -> std::result::Result<Flow, BoxError> {
        if entry.is_dir() {
            return Ok(Flow::Continue);
        }
        self.0 = Some(content.to_vec());
        Ok(Flow::Stop)
    }
}

/// Keeps the first entry of any kind
#[derive(Default)]
struct FirstEntry(Option<RemoteEntry>);

#[async_trait]
impl Visitor for FirstEntry {
    async fn visit(
        &mut self,
        _parent: &str,
        entry: &RemoteEntry,
        _content: &[u8],
    ) -> std::result::Result<Flow, BoxError> {
        self.0 = Some(entry.clone());
        Ok(Flow::Stop)
    }
}

/// Names directly below the pulled root
#[derive(Default)]
struct TopLevel(Vec<String>);

#[async_trait]
impl Visitor for TopLevel {
    async fn visit(
        &mut self,
        parent: &str,
        entry: &RemoteEntry,
        _content: &[u8],
    ) -> std::result::Result<Flow, BoxError> {
        if parent.is_empty() {
            self.0.push(entry.name.clone());
        }
        Ok(Flow::Continue)
    }
}

/// Writes every pulled entry into another backend
struct Mirror<'a> {
    target: &'a dyn VfsBackend,
    root: &'a str,
    stats: TransferStats,
}

#[async_trait]
impl Visitor for Mirror<'_> {
    async fn visit(
        &mut self,
        parent: &str,
        entry: &RemoteEntry,
        content: &[u8],
    ) -> std::result::Result<Flow, BoxError> {
        let path = join_path(&join_path(self.root, parent), &entry.name);
        if entry.is_dir() {
            self.target.create_dir_all(&path).await?;
            self.stats.dirs += 1;
            return Ok(Flow::Continue);
        }

        self.target.write(&path, content).await?;
        if let Err(e) = self.target.set_modified(&path, entry.modified).await {
            tracing::debug!(%path, error = %e, "modification time not kept");
        }
        self.stats.files += 1;
        self.stats.bytes += content.len() as u64;
        Ok(Flow::Continue)
    }
}

#[async_trait]
impl VfsBackend for ScpFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let mut first = FirstFile::default();
        self.pull(path, &self.config, false, &mut first).await?;
        first
            .0
            .ok_or_else(|| anyhow!("remote sent no file for {path}"))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let remote = self.remote_path(path);
        let (dir, name) = target_of(&remote);
        if name.is_empty() {
            bail!("Invalid path: no filename in {path:?}");
        }

        let mut uploader = self.uploader(dir, false).await?;
        let entry = RemoteEntry::file(name, data.len() as u64);
        if let Err(e) = push_file(&mut uploader, "", &entry, data).await {
            let _ = uploader.close().await;
            return Err(e);
        }
        uploader.finish().await?;
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let config = self.config.clone().with_skip_root(false);
        let mut first = FirstEntry::default();
        self.pull(path, &config, true, &mut first).await?;
        first
            .0
            .as_ref()
            .map(stat_of)
            .ok_or_else(|| anyhow!("remote sent nothing for {path}"))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let mut top = TopLevel::default();
        self.pull(path, &self.config, true, &mut top).await?;
        let mut names = top.0;
        names.sort();
        Ok(names)
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let remote = self.remote_path(path);
        let (dir, name) = target_of(&remote);
        if name.is_empty() {
            bail!("Invalid path: no directory name in {path:?}");
        }

        let mut uploader = self.uploader(dir, true).await?;
        if let Err(e) = uploader.push("", &RemoteEntry::dir(name), None).await {
            let _ = uploader.close().await;
            return Err(e.into());
        }
        uploader.finish().await?;
        Ok(())
    }

    async fn create_dir_all(&self, path: &str) -> Result<()> {
        let remote = self.remote_path(path);
        let base = if remote.starts_with('/') { "/" } else { "." };
        let segments: Vec<&str> = remote
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        if segments.is_empty() {
            return Ok(());
        }

        let mut uploader = self.uploader(base, true).await?;
        for (depth, name) in segments.iter().enumerate() {
            let parent = segments[..depth].join("/");
            if let Err(e) = uploader
                .push(&parent, &RemoteEntry::dir(*name), None)
                .await
            {
                let _ = uploader.close().await;
                return Err(e.into());
            }
        }
        uploader.finish().await?;
        Ok(())
    }
}
