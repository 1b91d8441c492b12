use std::{fmt, io::Read};

use chrono::DateTime;

use crate::error::{Error, Result};

const WHITEOUT_PREFIX: &str = ".wh.";

const WHITEOUT_OPAQUE: &str = ".wh..opq";

/// Kind of an entry in a layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,

    /// Devices, FIFOs, and hard links.
    Other,

    /// `.wh.<name>`: `<name>` is deleted from lower layers.
    Whiteout,

    /// `.wh..wh..opq`: the directory hides its contents in lower layers.
    OpaqueWhiteout,
}

impl EntryKind {
    pub fn is_whiteout(self) -> bool {
        matches!(self, EntryKind::Whiteout | EntryKind::OpaqueWhiteout)
    }
}

/// Header of a single entry in a layer.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct LayerEntry {
    /// Permission bits (`0o7777`).
    pub mode: u32,

    pub uid: u64,
    pub gid: u64,
    pub size: u64,

    /// Seconds since the Unix epoch.
    pub mtime: u64,

    /// Name as found in the archive.
    pub name: String,

    /// Normalized absolute path, like `/etc/passwd`.
    pub path: String,

    pub kind: EntryKind,

    /// Target of symbolic and hard links.
    pub link_target: Option<String>,

    /// `true` for hard links.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub hard_link: bool,

    /// Payload of the entry, if it was requested.
    #[serde(skip)]
    pub content: Option<Vec<u8>>,
}

impl LayerEntry {
    pub(crate) fn from_tar<R: Read>(entry: &tar::Entry<'_, R>) -> Result<LayerEntry> {
        let header = entry.header();
        let invalid = |e: std::io::Error| Error::Tar(e.to_string());

        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let path = normalize_path(&name);

        let link_target = entry
            .link_name_bytes()
            .map(|l| String::from_utf8_lossy(&l).into_owned());

        let entry_type = header.entry_type();
        let mut kind = match entry_type {
            tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
                EntryKind::Regular
            }
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Symlink => EntryKind::Symlink,
            _ => EntryKind::Other,
        };

        if let Some(whiteout) = file_name(&path).strip_prefix(WHITEOUT_PREFIX) {
            kind = if whiteout == WHITEOUT_OPAQUE {
                EntryKind::OpaqueWhiteout
            } else {
                EntryKind::Whiteout
            };
        }

        // Empty numeric fields are read as 0.
        Ok(LayerEntry {
            mode: header.mode().map_err(invalid)? & 0o7777,
            uid: header.uid().unwrap_or(0),
            gid: header.gid().unwrap_or(0),
            size: entry.size(),
            mtime: header.mtime().unwrap_or(0),
            name,
            path,
            kind,
            link_target,
            hard_link: entry_type == tar::EntryType::Link,
            content: None,
        })
    }

    /// Name of the entry, without its parent directory.
    pub fn file_name(&self) -> &str {
        file_name(&self.path)
    }

    /// Parent directory of the entry. `/` for entries in the root.
    pub fn parent(&self) -> &str {
        parent(&self.path)
    }

    /// For whiteouts, the path of the hidden entry. For opaque
    /// whiteouts, the path of the directory.
    pub fn whiteout_target(&self) -> Option<String> {
        let parent = self.parent();
        match self.kind {
            EntryKind::OpaqueWhiteout => Some(parent.to_owned()),
            EntryKind::Whiteout => {
                let name = self.file_name().strip_prefix(WHITEOUT_PREFIX)?;
                Some(join(parent, name))
            }
            _ => None,
        }
    }

    /// Permissions in `ls -l` format, like `drwxr-xr-x`.
    pub fn permissions(&self) -> String {
        let type_char = match self.kind {
            EntryKind::Directory => 'd',
            EntryKind::Symlink => 'l',
            _ => '-',
        };

        let mut output = String::with_capacity(10);
        output.push(type_char);

        // (read, write, execute, special bit, special char)
        let classes = [
            (0o400, 0o200, 0o100, 0o4000, 's'),
            (0o040, 0o020, 0o010, 0o2000, 's'),
            (0o004, 0o002, 0o001, 0o1000, 't'),
        ];

        for (r, w, x, special, special_char) in classes {
            let mode = self.mode;
            output.push(if mode & r != 0 { 'r' } else { '-' });
            output.push(if mode & w != 0 { 'w' } else { '-' });
            output.push(match (mode & x != 0, mode & special != 0) {
                (true, true) => special_char,
                (false, true) => special_char.to_ascii_uppercase(),
                (true, false) => 'x',
                (false, false) => '-',
            });
        }

        output
    }

    /// Modification time in UTC, formatted as `YYYY-MM-DD HH:MM`.
    pub fn timestamp(&self) -> String {
        i64::try_from(self.mtime)
            .ok()
            .and_then(|t| DateTime::from_timestamp(t, 0))
            .unwrap_or_default()
            .format("%Y-%m-%d %H:%M")
            .to_string()
    }
}

/// Same format as `tar -tv`.
impl fmt::Display for LayerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} {} {} {}",
            self.permissions(),
            self.uid,
            self.gid,
            self.size,
            self.timestamp(),
            self.name
        )?;

        match (&self.link_target, self.kind, self.hard_link) {
            (Some(target), EntryKind::Symlink, _) => write!(f, " -> {target}"),
            (Some(target), _, true) => write!(f, " link to {target}"),
            _ => Ok(()),
        }
    }
}

/// Convert a name from an archive to an absolute path.
///
/// `.` components are removed, and `..` moves to the parent (never
/// above the root).
pub fn normalize_path(name: &str) -> String {
    let mut components = Vec::new();
    for component in name.split('/') {
        match component {
            "" | "." => (),
            ".." => {
                components.pop();
            }
            c => components.push(c),
        }
    }

    let mut path = String::with_capacity(name.len() + 1);
    for c in components {
        path.push('/');
        path.push_str(c);
    }

    if path.is_empty() {
        path.push('/');
    }

    path
}

pub(crate) fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

pub(crate) fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

pub(crate) fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}
