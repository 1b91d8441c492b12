//! Access to paths in a single layer, or in the overlay of an image.

use std::ops::ControlFlow;

use tracing::debug;

use crate::{
    digest::Digest,
    error::{Error, Result},
    layer::{self, normalize_path, EntryKind, ListOptions},
    overlay::{self, OverlayEntry, OverlayMap},
    Reference, RegistryContext,
};

/// Maximum number of hard links followed by [`read_file`].
const MAX_LINK_DEPTH: usize = 8;

/// Entry in a directory listing.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ChildEntry {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,

    /// Permissions, like `drwxr-xr-x`.
    pub mode: String,

    pub uid: u64,
    pub gid: u64,

    /// Modification time, in UTC.
    pub mtime: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,

    /// Layer that provides the entry.
    pub layer: Digest,
}

impl ChildEntry {
    fn new(path: &str, overlay_entry: &OverlayEntry) -> Self {
        let entry = &overlay_entry.entry;
        ChildEntry {
            name: layer::file_name(path).to_owned(),
            path: path.to_owned(),
            kind: entry.kind,
            size: entry.size,
            mode: entry.permissions(),
            uid: entry.uid,
            gid: entry.gid,
            mtime: entry.timestamp(),
            link_target: entry.link_target.clone(),
            layer: overlay_entry.owner.clone(),
        }
    }
}

/// Content of a path.
#[derive(Clone, Debug, PartialEq)]
pub enum PathContent {
    Directory(Vec<ChildEntry>),
    File(Vec<u8>),

    /// Symbolic links are not resolved. The target is returned as found
    /// in the archive.
    Symlink(String),
}

/// List the entries directly under `path`, in the layer `digest`.
///
/// If `filter` is present, only entries with names containing it
/// (ignoring case) are returned.
pub fn list_directory(
    ctx: &RegistryContext,
    reference: &Reference,
    digest: &Digest,
    path: &str,
    filter: Option<&str>,
) -> Result<Vec<ChildEntry>> {
    let map = layer_map(ctx, reference, digest)?;
    directory(&map, &normalize_path(path), filter)
}

/// Read the content of the file at `path` in the layer `digest`.
///
/// Hard links are followed inside the layer.
pub fn read_file(
    ctx: &RegistryContext,
    reference: &Reference,
    digest: &Digest,
    path: &str,
) -> Result<Vec<u8>> {
    let mut path = normalize_path(path);

    for _ in 0..MAX_LINK_DEPTH {
        match find_file(ctx, reference, digest, &path)? {
            FileLookup::Content(content) => return Ok(content),
            FileLookup::HardLink(target) => {
                debug!(path = %path, target = %target, "following hard link");
                path = normalize_path(&target);
            }
        }
    }

    Err(Error::NotAFile(format!("{path}: too many links")))
}

/// Read `path` in the layer `digest`.
pub fn read_path(
    ctx: &RegistryContext,
    reference: &Reference,
    digest: &Digest,
    path: &str,
    filter: Option<&str>,
) -> Result<PathContent> {
    let path = normalize_path(path);
    let map = layer_map(ctx, reference, digest)?;

    match content_kind(&map, &path)? {
        Kind::Directory => Ok(PathContent::Directory(directory(&map, &path, filter)?)),
        Kind::Symlink(target) => Ok(PathContent::Symlink(target)),
        Kind::File(_) => Ok(PathContent::File(read_file(ctx, reference, digest, &path)?)),
    }
}

/// List the entries directly under `path`, in the filesystem of the
/// image.
pub fn overlay_list(
    ctx: &RegistryContext,
    reference: &Reference,
    path: &str,
    filter: Option<&str>,
) -> Result<Vec<ChildEntry>> {
    let map = overlay::build_overlay(ctx, reference)?;
    directory(&map, &normalize_path(path), filter)
}

/// Read the file at `path` in the filesystem of the image, from the
/// top-most layer that contains it.
pub fn overlay_read(ctx: &RegistryContext, reference: &Reference, path: &str) -> Result<Vec<u8>> {
    let path = normalize_path(path);
    let map = overlay::build_overlay(ctx, reference)?;

    match content_kind(&map, &path)? {
        Kind::File(owner) => read_file(ctx, reference, &owner, &path),
        _ => Err(Error::NotAFile(path)),
    }
}

/// Read `path` in the filesystem of the image.
pub fn overlay_path(
    ctx: &RegistryContext,
    reference: &Reference,
    path: &str,
    filter: Option<&str>,
) -> Result<PathContent> {
    let path = normalize_path(path);
    let map = overlay::build_overlay(ctx, reference)?;

    match content_kind(&map, &path)? {
        Kind::Directory => Ok(PathContent::Directory(directory(&map, &path, filter)?)),
        Kind::Symlink(target) => Ok(PathContent::Symlink(target)),
        Kind::File(owner) => Ok(PathContent::File(read_file(ctx, reference, &owner, &path)?)),
    }
}

/// View of a single layer, without whiteouts.
fn layer_map(ctx: &RegistryContext, reference: &Reference, digest: &Digest) -> Result<OverlayMap> {
    let listing = layer::list_layer(ctx, reference, digest, &ListOptions::default())?;
    OverlayMap::from_listing(&listing)
}

enum Kind {
    Directory,
    Symlink(String),
    File(Digest),
}

fn content_kind(map: &OverlayMap, path: &str) -> Result<Kind> {
    if map.is_dir(path) {
        return Ok(Kind::Directory);
    }

    let entry = map
        .get(path)
        .ok_or_else(|| Error::NotFound(path.to_owned()))?;

    match (&entry.entry.kind, &entry.entry.link_target) {
        (EntryKind::Symlink, Some(target)) => Ok(Kind::Symlink(target.clone())),
        (EntryKind::Regular, _) => Ok(Kind::File(entry.owner.clone())),
        (EntryKind::Other, Some(_)) if entry.entry.hard_link => Ok(Kind::File(entry.owner.clone())),
        _ => Err(Error::NotAFile(path.to_owned())),
    }
}

fn directory(map: &OverlayMap, path: &str, filter: Option<&str>) -> Result<Vec<ChildEntry>> {
    if !map.is_dir(path) {
        return Err(match map.get(path) {
            Some(_) => Error::NotADirectory(path.to_owned()),
            None => Error::NotFound(path.to_owned()),
        });
    }

    let filter = filter.filter(|f| !f.is_empty()).map(str::to_lowercase);

    let children = map
        .children(path)
        .filter(|(child, _)| match &filter {
            Some(f) => layer::file_name(child).to_lowercase().contains(f),
            None => true,
        })
        .map(|(child, entry)| ChildEntry::new(child, entry))
        .collect();

    Ok(children)
}

enum FileLookup {
    Content(Vec<u8>),
    HardLink(String),
}

/// Scan the whole layer for `path`.
///
/// Archives can contain the same path more than once. The last entry
/// wins, like in the overlay.
fn find_file(
    ctx: &RegistryContext,
    reference: &Reference,
    digest: &Digest,
    path: &str,
) -> Result<FileLookup> {
    let mut found = None;

    layer::visit_layer(ctx, reference, digest, |entry, mut payload| {
        if entry.path == path && !entry.kind.is_whiteout() {
            found = Some(match (entry.kind, entry.link_target) {
                (EntryKind::Regular, _) => Ok(FileLookup::Content(payload.read_all()?)),
                (EntryKind::Other, Some(target)) if entry.hard_link => {
                    Ok(FileLookup::HardLink(target))
                }
                _ => Err(Error::NotAFile(path.to_owned())),
            });
        }

        Ok(ControlFlow::Continue(()))
    })?;

    found.unwrap_or_else(|| Err(Error::NotFound(path.to_owned())))
}
