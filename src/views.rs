//! Serializable views returned to the HTTP surface.

use serde::ser::{SerializeMap, Serializer};

use crate::{
    digest::Digest,
    layer::LayerListing,
    manifests::{ManifestDocument, Platform},
    tags::TagSet,
};

/// Manifest (or index) found for a reference.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ManifestView {
    /// Normalized reference.
    pub reference: String,

    pub digest: Digest,

    #[serde(rename = "mediaType")]
    pub media_type: String,

    /// Size of the manifest document.
    pub size: u64,

    /// Platforms available in an index.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<Platform>,

    /// Sum of the sizes of the layers, for image manifests.
    #[serde(rename = "layersSize", skip_serializing_if = "Option::is_none")]
    pub layers_size: Option<String>,

    pub manifest: ManifestDocument,
}

impl ManifestView {
    pub fn new(reference: String, document: ManifestDocument, descriptor: crate::Descriptor) -> Self {
        let (platforms, layers_size) = match &document {
            ManifestDocument::Index(index) => (
                index
                    .manifests
                    .iter()
                    .filter_map(|m| m.platform.clone())
                    .collect(),
                None,
            ),

            ManifestDocument::Manifest(manifest) => {
                (Vec::new(), Some(human_readable_size(manifest.total_size())))
            }
        };

        ManifestView {
            reference,
            digest: descriptor.digest,
            media_type: descriptor.media_type,
            size: descriptor.size,
            platforms,
            layers_size,
            manifest: document,
        }
    }
}

/// Tags of a repository.
#[derive(Clone, Debug, serde::Serialize)]
pub struct RepositoryView {
    pub name: String,

    /// Tags, in the order listed by the registry.
    pub tags: Vec<String>,

    /// Tags grouped by digest: `{"sha256:…": {"tag": ["1", "latest"]}}`.
    #[serde(rename = "manifest", serialize_with = "serialize_groups")]
    pub manifests: TagSet,
}

fn serialize_groups<S: Serializer>(set: &TagSet, serializer: S) -> Result<S::Ok, S::Error> {
    #[derive(serde::Serialize)]
    struct Group<'a> {
        tag: &'a [String],
    }

    let mut map = serializer.serialize_map(Some(set.groups.len()))?;
    for group in &set.groups {
        map.serialize_entry(&group.digest, &Group { tag: &group.tags })?;
    }
    map.end()
}

/// Listing of a layer, formatted like `tar -tv`, with its total size.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SizeView {
    pub digest: Digest,
    pub lines: Vec<String>,
    pub total: u64,

    #[serde(rename = "totalHuman")]
    pub total_human: String,

    pub truncated: bool,
}

impl From<&LayerListing> for SizeView {
    fn from(listing: &LayerListing) -> Self {
        let total = listing.total_size();
        SizeView {
            digest: listing.digest.clone(),
            lines: listing.entries.iter().map(|e| e.to_string()).collect(),
            total,
            total_human: human_readable_size(total),
            truncated: listing.truncated,
        }
    }
}

/// Format `size` with one decimal, like `1.5 MB`.
pub fn human_readable_size(size: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    let mut size = size as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }

    format!("{size:.1} TB")
}
