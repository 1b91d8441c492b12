use std::{fmt, str::FromStr};

/// Generate the `MediaType` enum, and its `FromStr` and `Display`
/// implementations.
macro_rules! media_types {
    ($($variant:ident = $mediatype:expr,)*) => {
        /// Known media types.
        #[non_exhaustive]
        #[derive(Copy, Clone, PartialEq, Eq, Debug)]
        pub enum MediaType {
            $(
                #[doc = concat!("Variant for `", $mediatype, "`.")]
                $variant,
            )*
        }

        impl MediaType {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(MediaType::$variant => $mediatype,)*
                }
            }
        }

        impl FromStr for MediaType {
            type Err = InvalidMediaType;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($mediatype => Ok(MediaType::$variant),)*
                    _ => Err(InvalidMediaType),
                }
            }
        }

        impl fmt::Display for MediaType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    }
}

media_types!(
    DockerFsTarGzip = "application/vnd.docker.image.rootfs.diff.tar.gzip",
    DockerForeignFsTarGzip = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip",
    DockerImageV1 = "application/vnd.docker.container.image.v1+json",
    DockerManifestList = "application/vnd.docker.distribution.manifest.list.v2+json",
    DockerManifestV1 = "application/vnd.docker.distribution.manifest.v1+json",
    DockerManifestV1Signed = "application/vnd.docker.distribution.manifest.v1+prettyjws",
    DockerManifestV2 = "application/vnd.docker.distribution.manifest.v2+json",
    OciConfig = "application/vnd.oci.image.config.v1+json",
    OciFsTar = "application/vnd.oci.image.layer.v1.tar",
    OciFsTarGzip = "application/vnd.oci.image.layer.v1.tar+gzip",
    OciFsTarZstd = "application/vnd.oci.image.layer.v1.tar+zstd",
    OciImageIndex = "application/vnd.oci.image.index.v1+json",
    OciManifestV1 = "application/vnd.oci.image.manifest.v1+json",
);

impl MediaType {
    /// Media types sent in the `Accept` header of manifest requests.
    pub const MANIFESTS: [MediaType; 4] = [
        MediaType::OciImageIndex,
        MediaType::OciManifestV1,
        MediaType::DockerManifestList,
        MediaType::DockerManifestV2,
    ];

    /// Parse the value of a `Content-Type` header, ignoring any
    /// parameter after `;`.
    pub fn from_header(value: &str) -> Option<MediaType> {
        let essence = value.split(';').next().unwrap_or_default().trim();
        MediaType::from_str(essence).ok()
    }

    /// `true` for manifest lists and image indexes.
    pub fn is_index(&self) -> bool {
        matches!(self, MediaType::DockerManifestList | MediaType::OciImageIndex)
    }

    /// `true` for single-platform image manifests.
    pub fn is_manifest(&self) -> bool {
        matches!(self, MediaType::DockerManifestV2 | MediaType::OciManifestV1)
    }

    /// Value for the `Accept` header of manifest requests.
    pub fn manifests_accept() -> String {
        let types: Vec<_> = Self::MANIFESTS.iter().map(|m| m.as_str()).collect();
        types.join(", ")
    }
}

#[derive(Debug)]
pub struct InvalidMediaType;

struct MediaTypeVisitor;

impl<'de> serde::de::Visitor<'de> for MediaTypeVisitor {
    type Value = MediaType;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("Media type for OCI/Docker objects.")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        MediaType::from_str(v).map_err(|_| E::custom(format!("Unknown type: {v}")))
    }
}

impl<'de> serde::Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(MediaTypeVisitor)
    }
}

impl serde::Serialize for MediaType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

#[test]
fn media_type_in_json() {
    #[derive(serde::Deserialize, Debug)]
    struct Example {
        mt: MediaType,
    }

    assert!(matches!(
        serde_json::from_str(r#"{"mt": "application/vnd.oci.image.index.v1+json"}"#),
        Ok(Example {
            mt: MediaType::OciImageIndex
        })
    ));
}

#[test]
fn media_type_from_header() {
    assert_eq!(
        MediaType::from_header("application/vnd.oci.image.manifest.v1+json; charset=utf-8"),
        Some(MediaType::OciManifestV1)
    );

    assert_eq!(MediaType::from_header("text/html"), None);

    let accept = MediaType::manifests_accept();
    assert!(accept.starts_with("application/vnd.oci.image.index.v1+json, "));
    assert_eq!(accept.matches(", ").count(), 3);
}
