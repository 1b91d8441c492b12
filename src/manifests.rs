//! Manifests and image indexes.
//!
//! Refs:
//!
//! * <https://distribution.github.io/distribution/spec/manifest-v2-2/>
//! * <https://github.com/opencontainers/image-spec/blob/main/manifest.md>
//! * <https://github.com/opencontainers/image-spec/blob/main/image-index.md>

use std::{collections::BTreeMap, fmt, str::FromStr};

use tracing::{debug, info};

use crate::{
    digest::Digest,
    error::{Error, Result},
    http::read_body,
    MediaType, Reference, RegistryContext,
};

/// Operating system and architecture of an image.
///
/// # Examples
///
/// ```
/// # use layerpeek::*;
/// let platform: Platform = "linux/arm64/v8".parse().unwrap();
/// assert_eq!(platform.os, "linux");
/// assert_eq!(platform.architecture, "arm64");
/// assert_eq!(platform.variant.as_deref(), Some("v8"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Platform {
    pub architecture: String,

    pub os: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Platform {
            architecture: architecture.into(),
            os: os.into(),
            variant: None,
        }
    }

    /// Check if `other` satisfies this platform.
    ///
    /// The variant is compared only if this instance has one.
    pub fn matches(&self, other: &Platform) -> bool {
        self.os == other.os
            && self.architecture == other.architecture
            && (self.variant.is_none() || self.variant == other.variant)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("Invalid platform: {0:?}. Expected os/arch[/variant].")]
pub struct InvalidPlatform(String);

impl FromStr for Platform {
    type Err = InvalidPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');

        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(os), Some(arch), variant, None) if !os.is_empty() && !arch.is_empty() => {
                Ok(Platform {
                    architecture: arch.to_owned(),
                    os: os.to_owned(),
                    variant: variant.filter(|v| !v.is_empty()).map(str::to_owned),
                })
            }

            _ => Err(InvalidPlatform(s.to_owned())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

/// Reference to a blob or a manifest.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,

    pub digest: Digest,

    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// Return the media type, if it is one of the known types.
    pub fn known_media_type(&self) -> Option<MediaType> {
        MediaType::from_header(&self.media_type)
    }
}

/// Image manifest for a single platform.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Manifest {
    /// Size of the config and the layers.
    pub fn total_size(&self) -> u64 {
        self.layers
            .iter()
            .fold(self.config.size, |a, l| a.saturating_add(l.size))
    }
}

/// Image index, or Docker manifest list.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestIndex {
    pub schema_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    pub manifests: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ManifestIndex {
    /// Pick the first child whose platform matches `platform`. If there
    /// is no match, or no `platform`, the first child is returned.
    pub fn select(&self, platform: Option<&Platform>) -> Option<&Descriptor> {
        platform
            .and_then(|p| {
                self.manifests
                    .iter()
                    .find(|d| d.platform.as_ref().is_some_and(|dp| p.matches(dp)))
            })
            .or_else(|| self.manifests.first())
    }
}

/// Document returned by the `/manifests/` endpoint.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum ManifestDocument {
    Manifest(Manifest),
    Index(ManifestIndex),
}

impl ManifestDocument {
    /// Parse a manifest body.
    ///
    /// The type is taken from the `Content-Type` header. If it is
    /// missing or unknown, the `mediaType` field of the document is
    /// used, and then the presence of the `manifests` or `layers` keys.
    pub fn parse(body: &[u8], content_type: Option<&str>) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)?;

        let declared = content_type
            .and_then(MediaType::from_header)
            .filter(|m| m.is_index() || m.is_manifest())
            .or_else(|| {
                value
                    .get("mediaType")
                    .and_then(|m| m.as_str())
                    .and_then(MediaType::from_header)
            });

        let is_index = match declared {
            Some(m) if m.is_index() => true,
            Some(m) if m.is_manifest() => false,
            Some(m) => return Err(Error::Unsupported(format!("Manifest type {m}"))),
            None if value.get("manifests").is_some() => true,
            None if value.get("layers").is_some() && value.get("config").is_some() => false,
            None => {
                return Err(Error::Unsupported(format!(
                    "Manifest type {}",
                    content_type.unwrap_or("(none)")
                )))
            }
        };

        Ok(if is_index {
            ManifestDocument::Index(serde_json::from_value(value)?)
        } else {
            ManifestDocument::Manifest(serde_json::from_value(value)?)
        })
    }

    pub fn is_index(&self) -> bool {
        matches!(self, ManifestDocument::Index(_))
    }

    /// Media type of this document, if it is declared in the JSON.
    fn declared_media_type(&self) -> Option<&str> {
        match self {
            ManifestDocument::Manifest(m) => m.media_type.as_deref(),
            ManifestDocument::Index(i) => i.media_type.as_deref(),
        }
    }
}

/// Download the manifest for `reference`.
///
/// If `digest_override` is present, it is used instead of the tag or
/// digest in `reference`. When the manifest is requested by digest, the
/// body is verified against it.
///
/// Returns the document and a descriptor for it.
pub fn get_manifest(
    ctx: &RegistryContext,
    reference: &Reference,
    digest_override: Option<&Digest>,
) -> Result<(ManifestDocument, Descriptor)> {
    let expected = digest_override.or(reference.digest.as_ref());
    let target = match expected {
        Some(d) => d.source(),
        None => &reference.tag,
    };

    let accept = MediaType::manifests_accept();
    let response = ctx.transport().get(
        ctx.scope(),
        reference,
        &format!("manifests/{target}"),
        &[("Accept", &accept)],
    )?;

    let content_type = response.header("Content-Type").map(str::to_owned);
    let header_digest = response
        .header("Docker-Content-Digest")
        .and_then(|d| Digest::from_str(d.trim()).ok());

    let body = read_body(ctx.scope(), response)?;

    let digest = match (expected, header_digest) {
        (Some(expected), _) => {
            if !expected.matches(&body) {
                return Err(Error::Protocol(format!(
                    "Manifest does not match digest {expected}"
                )));
            }
            expected.clone()
        }

        (None, Some(d)) => d,

        (None, None) => Digest::sha256(&body),
    };

    let document = ManifestDocument::parse(&body, content_type.as_deref())?;

    let media_type = match content_type.as_deref().and_then(MediaType::from_header) {
        Some(m) => m.as_str().to_owned(),
        None => document.declared_media_type().unwrap_or_default().to_owned(),
    };

    debug!(
        reference = %reference,
        digest = %digest,
        media_type = %media_type,
        "manifest downloaded"
    );

    let descriptor = Descriptor {
        media_type,
        digest,
        size: body.len() as u64,
        platform: None,
        annotations: None,
    };

    Ok((document, descriptor))
}

/// Get the digest of the manifest for `reference`.
///
/// It uses the `Docker-Content-Digest` header from a `HEAD` request. If
/// the registry does not send it, the manifest is downloaded and its
/// SHA256 is computed.
pub fn get_digest(ctx: &RegistryContext, reference: &Reference) -> Result<Digest> {
    if let Some(digest) = &reference.digest {
        return Ok(digest.clone());
    }

    let digest = match ctx
        .transport()
        .head_digest(ctx.scope(), reference, reference.target())?
    {
        Some(d) => d,
        None => {
            debug!(reference = %reference, "missing Docker-Content-Digest");
            get_manifest(ctx, reference, None)?.1.digest
        }
    };

    Ok(digest)
}

/// Manifest for a single platform.
#[derive(Clone, Debug)]
pub struct ResolvedManifest {
    pub manifest: Manifest,

    /// Descriptor of `manifest`. If it was selected from an index,
    /// it contains the platform from the index.
    pub descriptor: Descriptor,

    /// Index used to find the manifest, if any.
    pub index: Option<(ManifestIndex, Descriptor)>,
}

/// Get the manifest for `reference`. If it is an index, the child
/// for `platform` is downloaded.
pub fn resolve_to_leaf(
    ctx: &RegistryContext,
    reference: &Reference,
    platform: Option<&Platform>,
) -> Result<ResolvedManifest> {
    let (document, descriptor) = get_manifest(ctx, reference, None)?;

    let index = match document {
        ManifestDocument::Manifest(manifest) => {
            return Ok(ResolvedManifest {
                manifest,
                descriptor,
                index: None,
            })
        }

        ManifestDocument::Index(index) => index,
    };

    let child = index
        .select(platform)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("{reference}: empty index")))?;

    info!(
        reference = %reference,
        digest = %child.digest,
        platform = ?child.platform,
        "selected manifest from index"
    );

    let (document, mut leaf) = get_manifest(ctx, reference, Some(&child.digest))?;

    match document {
        ManifestDocument::Manifest(manifest) => {
            leaf.platform = child.platform;
            leaf.annotations = child.annotations;

            Ok(ResolvedManifest {
                manifest,
                descriptor: leaf,
                index: Some((index, descriptor)),
            })
        }

        ManifestDocument::Index(_) => Err(Error::Unsupported(format!(
            "Nested index in {}",
            child.digest
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(digest: u8, platform: Option<&str>) -> Descriptor {
        Descriptor {
            media_type: MediaType::OciManifestV1.to_string(),
            digest: Digest::sha256(&[digest]),
            size: 1,
            platform: platform.map(|p| p.parse().unwrap()),
            annotations: None,
        }
    }

    #[test]
    fn select_platform() {
        let index = ManifestIndex {
            schema_version: 2,
            media_type: None,
            manifests: vec![
                descriptor(0, Some("linux/arm64/v8")),
                descriptor(1, Some("linux/amd64")),
                descriptor(2, None),
            ],
            annotations: None,
        };

        let amd64 = Platform::new("linux", "amd64");
        assert_eq!(index.select(Some(&amd64)), Some(&index.manifests[1]));

        let arm64: Platform = "linux/arm64".parse().unwrap();
        assert_eq!(index.select(Some(&arm64)), Some(&index.manifests[0]));

        let arm64v7: Platform = "linux/arm64/v7".parse().unwrap();
        assert_eq!(index.select(Some(&arm64v7)), Some(&index.manifests[0]));

        assert_eq!(index.select(None), Some(&index.manifests[0]));

        let empty = ManifestIndex {
            manifests: vec![],
            ..index
        };
        assert_eq!(empty.select(Some(&amd64)), None);
    }

    #[test]
    fn parse_platforms() {
        assert_eq!(
            "linux/amd64".parse::<Platform>().unwrap(),
            Platform::new("linux", "amd64")
        );

        assert_eq!(
            "linux/arm/v7".parse::<Platform>().unwrap().to_string(),
            "linux/arm/v7"
        );

        assert!("linux".parse::<Platform>().is_err());
        assert!("linux/".parse::<Platform>().is_err());
        assert!("a/b/c/d".parse::<Platform>().is_err());
    }

    #[test]
    fn dispatch_documents() {
        let digest = Digest::sha256(b"x");

        let manifest = format!(
            r#"{{
                "schemaVersion": 2,
                "config": {{"mediaType": "{}", "digest": "{digest}", "size": 1}},
                "layers": [{{"mediaType": "{}", "digest": "{digest}", "size": 1}}]
            }}"#,
            MediaType::OciConfig,
            MediaType::OciFsTarGzip,
        );

        let index = format!(
            r#"{{
                "schemaVersion": 2,
                "mediaType": "{}",
                "manifests": [{{
                    "mediaType": "{}",
                    "digest": "{digest}",
                    "size": 1,
                    "platform": {{"os": "linux", "architecture": "amd64"}}
                }}]
            }}"#,
            MediaType::DockerManifestList,
            MediaType::DockerManifestV2,
        );

        // From Content-Type.
        let doc = ManifestDocument::parse(
            manifest.as_bytes(),
            Some("application/vnd.oci.image.manifest.v1+json"),
        )
        .unwrap();
        assert!(matches!(doc, ManifestDocument::Manifest(m) if m.layers.len() == 1));

        // From the `mediaType` field.
        let doc = ManifestDocument::parse(index.as_bytes(), Some("application/json")).unwrap();
        assert!(doc.is_index());

        // From the keys.
        let doc = ManifestDocument::parse(manifest.as_bytes(), None).unwrap();
        assert!(!doc.is_index());

        assert!(matches!(
            ManifestDocument::parse(br#"{"schemaVersion": 1, "fsLayers": []}"#, None),
            Err(Error::Unsupported(_))
        ));

        assert!(matches!(
            ManifestDocument::parse(
                format!(r#"{{"mediaType": "{}"}}"#, MediaType::DockerManifestV1).as_bytes(),
                None
            ),
            Err(Error::Unsupported(_))
        ));

        assert!(matches!(
            ManifestDocument::parse(b"not json", None),
            Err(Error::Protocol(_))
        ));
    }
}
