//! Wire encoding for control lines
//!
//! Pure functions only; nothing in here touches I/O.
//!
//! ```text
//! C<mode> <size> <name>\n     file announcement
//! D<mode> 0 <name>\n          directory push
//! E\n                         directory pop
//! T<mtime> 0 <atime> 0\n      timestamp for the next announcement
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Result, ScpError};

/// Control tokens and status bytes
pub mod token {
    pub const FILE: u8 = b'C';
    pub const DIR: u8 = b'D';
    pub const END_DIR: u8 = b'E';
    pub const TIME: u8 = b'T';

    pub const OK: u8 = 0x0;
    pub const WARNING: u8 = 0x1;
    pub const ERROR: u8 = 0x2;
}

/// Permission bits carried on the wire
pub const PERMISSION_MASK: u32 = 0o7777;

/// Substituted for entries whose mode has no wire representation
pub const DEFAULT_FILE_MODE: u32 = 0o644;
pub const DEFAULT_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Entry descriptor as announced on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
    /// Permission bits (type bits are tracked in `kind`)
    pub mode: u32,
    pub kind: EntryKind,
    pub modified: SystemTime,
}

impl RemoteEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            mode: DEFAULT_FILE_MODE,
            kind: EntryKind::File,
            modified: SystemTime::now(),
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            mode: DEFAULT_DIR_MODE,
            kind: EntryKind::Dir,
            modified: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = modified;
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    /// Permission bits to put on the wire
    ///
    /// Symlinks have no representation in this protocol; they are sent as
    /// regular files with a conservative default mode.
    pub const fn wire_mode(&self) -> u32 {
        match self.kind {
            EntryKind::Symlink => DEFAULT_FILE_MODE,
            EntryKind::File | EntryKind::Dir => self.mode & PERMISSION_MASK,
        }
    }
}

/// Which end of the exchange the remote command plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Remote receives (`-t`); used for uploads
    Sink,
    /// Remote sends (`-f`); used for downloads
    Source,
}

impl Direction {
    const fn flag(self) -> &'static str {
        match self {
            Self::Sink => "-t",
            Self::Source => "-f",
        }
    }
}

fn strip_eol(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

/// Decode a `C`/`D` line
///
/// `modified` is the timestamp from the preceding `T` line. The protocol
/// allows a create line without one, in which case the entry is stamped now.
pub fn decode_entry(line: &str, modified: Option<SystemTime>) -> Result<RemoteEntry> {
    let body = strip_eol(line);
    let kind = match body.as_bytes().first() {
        Some(&token::FILE) => EntryKind::File,
        Some(&token::DIR) => EntryKind::Dir,
        _ => return Err(ScpError::Malformed(body.to_string())),
    };

    let fields: Vec<&str> = body[1..].splitn(3, ' ').collect();
    let [mode, size, name] = fields.as_slice() else {
        return Err(ScpError::Malformed(body.to_string()));
    };
    if name.is_empty() {
        return Err(ScpError::Malformed(body.to_string()));
    }

    let mode =
        u32::from_str_radix(mode, 8).map_err(|_| ScpError::Malformed(body.to_string()))?;
    let size = size
        .parse::<u64>()
        .map_err(|_| ScpError::Malformed(body.to_string()))?;

    Ok(RemoteEntry {
        name: (*name).to_string(),
        size,
        mode,
        kind,
        modified: modified.unwrap_or_else(SystemTime::now),
    })
}

/// Decode a `T` line into the modification time it carries
pub fn decode_timestamp(line: &str) -> Result<SystemTime> {
    let body = strip_eol(line);
    let malformed = || ScpError::Malformed(body.to_string());

    let rest = body
        .strip_prefix(char::from(token::TIME))
        .ok_or_else(malformed)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let [mtime, mtime_us, atime, atime_us] = fields.as_slice() else {
        return Err(malformed());
    };

    let secs: u64 = mtime.parse().map_err(|_| malformed())?;
    let micros: u32 = mtime_us.parse().map_err(|_| malformed())?;
    // access time is validated but not kept
    atime.parse::<u64>().map_err(|_| malformed())?;
    atime_us.parse::<u32>().map_err(|_| malformed())?;

    Duration::from_secs(secs)
        .checked_add(Duration::from_micros(u64::from(micros)))
        .and_then(|since| UNIX_EPOCH.checked_add(since))
        .ok_or_else(malformed)
}

/// Encode the `C`/`D` line announcing `entry`
pub fn encode_create(entry: &RemoteEntry) -> String {
    let (kind, size) = if entry.is_dir() {
        (token::DIR, 0)
    } else {
        (token::FILE, entry.size)
    };
    format!(
        "{}{:04o} {} {}\n",
        char::from(kind),
        entry.wire_mode(),
        size,
        entry.name
    )
}

/// Encode the `T` line that precedes `entry`
pub fn encode_timestamp(entry: &RemoteEntry) -> String {
    let secs = entry
        .modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}{secs} 0 {secs} 0\n", char::from(token::TIME))
}

/// The end-of-directory line
pub const fn encode_end_dir() -> &'static str {
    "E\n"
}

/// Build the command line that starts the remote side
pub fn encode_command(
    program: &str,
    direction: Direction,
    preserve_times: bool,
    recursive: bool,
    path: &str,
) -> String {
    let mut cmd = format!("{program} {}", direction.flag());
    if preserve_times {
        cmd.push_str(" -p");
    }
    if recursive {
        cmd.push_str(" -r");
    }
    cmd.push(' ');
    cmd.push_str(&shell_quote(path));
    cmd
}

/// Quote a path for the remote shell
///
/// Plain paths pass through untouched; anything else is single-quoted.
pub fn shell_quote(path: &str) -> String {
    let plain = !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+~:@,=%".contains(c));
    if plain {
        path.to_string()
    } else {
        format!("'{}'", path.replace('\'', r"'\''"))
    }
}
