//! Read-only views over tar and zip archives
//!
//! The archive is indexed once into memory; every member becomes an entry
//! addressable by its path inside the archive. Directories that are only
//! implied by member paths are filled in.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use tar::EntryType;

use super::{FileStat, VfsBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    Zip,
}

impl ArchiveFormat {
    /// Guess from the file name; anything that is not `.zip` is read as tar
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("zip") => Self::Zip,
            _ => Self::Tar,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::Zip => "zip",
        }
    }
}

#[derive(Debug, Clone)]
struct Member {
    stat: FileStat,
    data: Vec<u8>,
}

pub struct ArchiveFs {
    format: ArchiveFormat,
    members: BTreeMap<String, Member>,
}

impl ArchiveFs {
    /// Index the archive at `path`, picking the format from its extension
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let format = ArchiveFormat::from_path(&path);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading archive {}", path.display()))?;
        tokio::task::spawn_blocking(move || Self::from_bytes(format, &bytes)).await?
    }

    pub fn from_bytes(format: ArchiveFormat, bytes: &[u8]) -> Result<Self> {
        let mut fs = Self {
            format,
            members: BTreeMap::new(),
        };
        match format {
            ArchiveFormat::Tar => fs.index_tar(bytes)?,
            ArchiveFormat::Zip => fs.index_zip(bytes)?,
        }
        tracing::debug!(format = format.name(), members = fs.members.len(), "indexed archive");
        Ok(fs)
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    fn index_tar(&mut self, bytes: &[u8]) -> Result<()> {
        let mut archive = tar::Archive::new(Cursor::new(bytes));

        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = clean(&entry.path()?.to_string_lossy());
            if name.is_empty() {
                continue;
            }

            let header = entry.header();
            let modified = header.mtime().ok().and_then(unix_time);
            let mode = header.mode().ok();

            let (stat, data) = match header.entry_type() {
                EntryType::Directory => (FileStat::dir(), Vec::new()),
                EntryType::Symlink => {
                    let mut stat = FileStat::file(0);
                    stat.is_symlink = true;
                    (stat, Vec::new())
                }
                kind if kind.is_file() => {
                    let mut data = Vec::new();
                    entry.read_to_end(&mut data)?;
                    (FileStat::file(data.len() as u64), data)
                }
                other => {
                    tracing::debug!(member = %name, kind = ?other, "skipping archive member");
                    continue;
                }
            };
            self.insert(name, stat, data, modified, mode);
        }
        Ok(())
    }

    fn index_zip(&mut self, bytes: &[u8]) -> Result<()> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;

        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            let name = clean(file.name());
            if name.is_empty() {
                continue;
            }

            let modified = dos_time(&file.last_modified());
            let mode = file.unix_mode();
            let (stat, data) = if file.is_dir() {
                (FileStat::dir(), Vec::new())
            } else {
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                (FileStat::file(data.len() as u64), data)
            };
            self.insert(name, stat, data, modified, mode);
        }
        Ok(())
    }

    fn insert(
        &mut self,
        name: String,
        stat: FileStat,
        data: Vec<u8>,
        modified: Option<SystemTime>,
        mode: Option<u32>,
    ) {
        self.insert_parents(&name);
        let stat = stat
            .with_modified(modified)
            .with_mode(mode.map(|m| m & 0o7777))
            .read_only();
        self.members.insert(name, Member { stat, data });
    }

    fn insert_parents(&mut self, path: &str) {
        let mut current = String::new();
        let segments: Vec<&str> = path.split('/').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            current = if current.is_empty() {
                (*segment).to_string()
            } else {
                format!("{current}/{segment}")
            };
            self.members.entry(current.clone()).or_insert_with(|| Member {
                stat: FileStat::dir().read_only(),
                data: Vec::new(),
            });
        }
    }

    fn member(&self, path: &str) -> Result<&Member> {
        let path = clean(path);
        self.members
            .get(&path)
            .ok_or_else(|| anyhow!("Not found in archive: {path}"))
    }
}

/// Archive paths without `./` prefixes or trailing slashes
fn clean(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Seconds since the epoch, if representable
fn unix_time(secs: u64) -> Option<SystemTime> {
    UNIX_EPOCH.checked_add(Duration::from_secs(secs))
}

/// Zip stores local DOS time without a zone; it is read as UTC
fn dos_time(time: &zip::DateTime) -> Option<SystemTime> {
    let stamp = NaiveDate::from_ymd_opt(
        i32::from(time.year()),
        u32::from(time.month()),
        u32::from(time.day()),
    )?
    .and_hms_opt(
        u32::from(time.hour()),
        u32::from(time.minute()),
        u32::from(time.second()),
    )?
    .and_utc();
    Some(SystemTime::from(stamp))
}

#[async_trait]
impl VfsBackend for ArchiveFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let member = self.member(path)?;
        if member.stat.is_dir {
            bail!("Cannot read directory: {path}");
        }
        Ok(member.data.clone())
    }

    async fn write(&self, _path: &str, _data: &[u8]) -> Result<()> {
        bail!("{} archives are read-only", self.format.name())
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        if clean(path).is_empty() {
            return Ok(FileStat::dir().read_only());
        }
        Ok(self.member(path)?.stat.clone())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let dir = clean(path);
        if !dir.is_empty() && !self.member(&dir)?.stat.is_dir {
            bail!("Not a directory: {path}");
        }

        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        Ok(self
            .members
            .keys()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(String::from)
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = clean(path);
        Ok(path.is_empty() || self.members.contains_key(&path))
    }
}
