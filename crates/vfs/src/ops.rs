//! Tree operations that work across any pair of backends

use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};

use crate::backend::{join_path, FileStat, VfsBackend};

/// One entry found by [`walk`]
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Path of the containing directory relative to the walk root
    pub parent: String,
    pub name: String,
    pub stat: FileStat,
}

impl WalkEntry {
    /// Path relative to the walk root
    pub fn path(&self) -> String {
        join_path(&self.parent, &self.name)
    }
}

/// Every entry below `root` in pre-order
///
/// A directory always comes before its children and siblings are sorted by
/// name. `root` itself is not included.
pub async fn walk(backend: &dyn VfsBackend, root: &str) -> Result<Vec<WalkEntry>> {
    let mut entries = Vec::new();
    walk_into(backend, root, String::new(), &mut entries).await?;
    Ok(entries)
}

fn walk_into<'a>(
    backend: &'a dyn VfsBackend,
    root: &'a str,
    relative: String,
    out: &'a mut Vec<WalkEntry>,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let dir = join_path(root, &relative);
        let mut names = backend
            .list(&dir)
            .await
            .with_context(|| format!("listing {dir}"))?;
        names.sort();

        for name in names {
            let stat = backend.stat(&join_path(&dir, &name)).await?;
            let descend = stat.is_dir;
            let child = join_path(&relative, &name);
            out.push(WalkEntry {
                parent: relative.clone(),
                name,
                stat,
            });
            if descend {
                walk_into(backend, root, child, out).await?;
            }
        }
        Ok(())
    })
}

/// Copy one file, streaming when both ends support it
///
/// Returns the number of bytes copied.
pub async fn copy_file(
    src: &dyn VfsBackend,
    src_path: &str,
    dest: &dyn VfsBackend,
    dest_path: &str,
) -> Result<u64> {
    if !(src.supports_streaming() && dest.supports_streaming()) {
        let data = src.read(src_path).await?;
        dest.write(dest_path, &data).await?;
        return Ok(data.len() as u64);
    }

    let mut reader = src.open_read(src_path).await?;
    let mut writer = dest.open_write(dest_path).await?;
    loop {
        let chunk = reader.read_chunk().await?;
        if !chunk.data.is_empty() {
            writer.write_chunk(&chunk.data).await?;
        }
        if chunk.is_last {
            break;
        }
    }
    reader.close().await?;
    writer.close().await?;
    Ok(writer.bytes_written())
}

/// Recursively copy `src_root` on `src` to `dest_root` on `dest`
///
/// Modification times are carried over where the destination supports it.
pub async fn copy_tree(
    src: &dyn VfsBackend,
    src_root: &str,
    dest: &dyn VfsBackend,
    dest_root: &str,
) -> Result<()> {
    let root = src.stat(src_root).await?;
    if !root.is_dir {
        copy_file(src, src_root, dest, dest_root).await?;
        keep_modified(dest, dest_root, &root).await;
        return Ok(());
    }

    dest.create_dir_all(dest_root).await?;
    for entry in walk(src, src_root).await? {
        let relative = entry.path();
        let target = join_path(dest_root, &relative);
        if entry.stat.is_dir {
            dest.create_dir_all(&target).await?;
        } else {
            copy_file(src, &join_path(src_root, &relative), dest, &target)
                .await
                .with_context(|| format!("copying {relative}"))?;
            keep_modified(dest, &target, &entry.stat).await;
        }
    }
    Ok(())
}

async fn keep_modified(dest: &dyn VfsBackend, path: &str, stat: &FileStat) {
    if let Some(modified) = stat.modified {
        if let Err(e) = dest.set_modified(path, modified).await {
            tracing::debug!(path, error = %e, "modification time not kept");
        }
    }
}

/// Remove `path` and everything below it; missing paths are fine
pub async fn remove_tree(backend: &dyn VfsBackend, path: &str) -> Result<()> {
    if !backend.exists(path).await? {
        return Ok(());
    }
    if !backend.stat(path).await?.is_dir {
        return backend.remove_file(path).await;
    }

    // children before parents
    for entry in walk(backend, path).await?.iter().rev() {
        let target = join_path(path, &entry.path());
        if entry.stat.is_dir {
            backend.remove_dir(&target).await?;
        } else {
            backend.remove_file(&target).await?;
        }
    }
    backend.remove_dir(path).await
}

/// Copy then remove the source
pub async fn move_tree(
    src: &dyn VfsBackend,
    src_root: &str,
    dest: &dyn VfsBackend,
    dest_root: &str,
) -> Result<()> {
    copy_tree(src, src_root, dest, dest_root).await?;
    remove_tree(src, src_root).await
}
