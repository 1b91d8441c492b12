//! Compose the filesystem of an image from its layers.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::{
    digest::Digest,
    error::{Error, Result},
    layer::{self, EntryKind, LayerEntry, LayerListing, ListOptions},
    manifests, pool, Reference, RegistryContext,
};

/// Visible entry in an [`OverlayMap`].
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct OverlayEntry {
    /// Top-most layer that contains this path.
    pub owner: Digest,

    pub is_dir: bool,

    /// Header of the entry in `owner`. Directories created only to
    /// contain other entries have a synthetic header.
    pub entry: LayerEntry,
}

/// Map from absolute paths to the layer that provides them.
///
/// Paths deleted by whiteouts are not in the map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OverlayMap {
    entries: BTreeMap<String, OverlayEntry>,

    /// Layers applied to the map, from bottom to top.
    layers: Vec<Digest>,
}

impl OverlayMap {
    /// Build a map from a single layer. Whiteouts are ignored.
    pub fn from_listing(listing: &LayerListing) -> Result<Self> {
        let mut map = OverlayMap::default();
        map.apply(listing)?;
        Ok(map)
    }

    pub fn get(&self, path: &str) -> Option<&OverlayEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn layers(&self) -> &[Digest] {
        &self.layers
    }

    /// All visible paths, sorted.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OverlayEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// `true` if `path` is the root or a visible directory.
    pub fn is_dir(&self, path: &str) -> bool {
        path == "/" || self.entries.get(path).is_some_and(|e| e.is_dir)
    }

    /// Entries directly under the directory `path`.
    pub fn children<'a>(
        &'a self,
        path: &str,
    ) -> impl Iterator<Item = (&'a str, &'a OverlayEntry)> + 'a {
        let prefix = descendants_prefix(path);
        let skip = prefix.len();

        self.entries
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter(move |(k, _)| !k[skip..].contains('/'))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Apply the entries of a layer on top of the current map.
    ///
    /// Whiteouts only affect lower layers, so they are applied before
    /// any other entry in the listing.
    pub fn apply(&mut self, listing: &LayerListing) -> Result<()> {
        for entry in listing.entries.iter().filter(|e| e.kind.is_whiteout()) {
            if entry.kind == EntryKind::Whiteout {
                let hidden = entry.file_name().strip_prefix(".wh.").unwrap_or_default();
                if matches!(hidden, "" | "." | "..") {
                    return Err(Error::InvalidBlob(format!(
                        "{}: invalid whiteout {}",
                        listing.digest, entry.name
                    )));
                }
            }

            match (entry.kind, entry.whiteout_target()) {
                (EntryKind::OpaqueWhiteout, Some(dir)) => self.remove_below(&dir),

                (EntryKind::Whiteout, Some(path)) => {
                    self.entries.remove(&path);
                    self.remove_below(&path);
                }

                _ => (),
            }
        }

        for entry in listing.entries.iter().filter(|e| !e.kind.is_whiteout()) {
            if entry.path == "/" {
                continue;
            }

            self.create_parents(&listing.digest, entry.parent());

            let is_dir = entry.kind == EntryKind::Directory;
            if !is_dir {
                self.remove_below(&entry.path);
            }

            self.entries.insert(
                entry.path.clone(),
                OverlayEntry {
                    owner: listing.digest.clone(),
                    is_dir,
                    entry: entry.clone(),
                },
            );
        }

        self.layers.push(listing.digest.clone());

        Ok(())
    }

    /// Make sure that `path` and its ancestors are directories.
    fn create_parents(&mut self, owner: &Digest, path: &str) {
        if path == "/" || self.is_dir(path) {
            return;
        }

        self.create_parents(owner, layer::parent(path));

        let entry = LayerEntry {
            mode: 0o755,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            name: path.trim_start_matches('/').to_owned(),
            path: path.to_owned(),
            kind: EntryKind::Directory,
            link_target: None,
            hard_link: false,
            content: None,
        };

        self.entries.insert(
            path.to_owned(),
            OverlayEntry {
                owner: owner.clone(),
                is_dir: true,
                entry,
            },
        );
    }

    /// Remove every path strictly below `path`.
    fn remove_below(&mut self, path: &str) {
        let prefix = descendants_prefix(path);

        let removed: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();

        for key in removed {
            self.entries.remove(&key);
        }
    }
}

fn descendants_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_owned()
    } else {
        format!("{path}/")
    }
}

/// Build the filesystem of the image in `reference`.
///
/// Layers are listed in parallel, and applied in the order of the
/// manifest.
pub fn build_overlay(ctx: &RegistryContext, reference: &Reference) -> Result<OverlayMap> {
    let resolved = manifests::resolve_to_leaf(ctx, reference, ctx.config().platform.as_ref())?;
    let layers = &resolved.manifest.layers;

    let options = ListOptions {
        include_whiteouts: true,
        ..ListOptions::default()
    };

    let listings = pool::try_map_ordered(layers, ctx.config().max_parallel_requests, |layer| {
        layer::list_layer(ctx, reference, &layer.digest, &options)
    })?;

    let mut map = OverlayMap::default();
    for listing in &listings {
        if listing.truncated {
            warn!(digest = %listing.digest, "overlay built from a truncated layer");
        }

        map.apply(listing)?;
    }

    info!(
        reference = %reference,
        digest = %resolved.descriptor.digest,
        layers = listings.len(),
        paths = map.len(),
        "overlay built"
    );

    Ok(map)
}
