mod mediatype;
mod parser;

use std::fmt;

use crate::digest::Digest;

pub use mediatype::{InvalidMediaType, MediaType};
pub use parser::Defaults;

/// Errors from [`Reference::try_from`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Empty reference.")]
    Empty,

    #[error("Missing repository.")]
    MissingRepository,

    #[error("Invalid tag: {0:?}")]
    InvalidTag(String),

    #[error("Invalid repository name: {0:?}")]
    InvalidRepository(String),

    #[error("{0}")]
    InvalidDigest(#[from] crate::digest::DigestError),
}

/// Reference to an image in an OCI registry.
///
/// The parser tries to be close to what `docker pull` does:
///
/// * If the reference does not include the hostname of the registry,
///   it uses Docker Hub, and the repository namespace defaults to
///   `library` if there is none. For example:
///
///   * `debian` is parsed as `registry-1.docker.io/library/debian`.
///   * `nixos/nix` is parsed as `registry-1.docker.io/nixos/nix`.
///   * `docker.io/debian` and `index.docker.io/debian` are the same
///     as `debian`.
/// * The tag is the value after the last `:` character, if it is not
///   followed by a `/`. If no tag is given, it uses `latest`.
/// * It accepts a fixed digest (the last part after a `@` character), but
///   only SHA256 and SHA512.
///
/// The `Display` implementation always writes the registry and the tag,
/// so its output is parsed back to the same value.
///
/// # Examples
///
/// ```
/// # use layerpeek::*;
/// const REFERENCE: &str = "registry.example.com/foo/bar:1.23.4@sha256:123456789012345678901234567890123456789012345678901234567890abcd";
///
/// let reference = Reference::try_from(REFERENCE).unwrap();
/// assert_eq!(reference.registry, "registry.example.com");
/// assert_eq!(reference.repository.namespace(), Some("foo"));
/// assert_eq!(reference.repository.name(), "bar");
/// assert_eq!(reference.tag, "1.23.4");
///
/// let digest = reference.digest.as_ref().unwrap();
/// assert_eq!(digest.algorithm(), DigestAlgorithm::SHA256);
/// assert_eq!(digest.hash_value(), "123456789012345678901234567890123456789012345678901234567890abcd");
/// ```
///
/// ```
/// # use layerpeek::*;
/// let reference = Reference::try_from("debian:stable").unwrap();
///
/// assert_eq!(reference.repository.to_string(), "library/debian");
/// assert_eq!(reference.tag, "stable");
/// assert_eq!(reference.to_string(), "registry-1.docker.io/library/debian:stable");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Address of the registry server.
    pub registry: String,

    /// Repository name.
    pub repository: Repository,

    /// Image tag.
    pub tag: String,

    /// Manifest digest, if present.
    pub digest: Option<Digest>,
}

impl Reference {
    /// Parse `reference`, using `defaults` when the registry or
    /// the namespace are missing.
    pub fn parse_with(reference: &str, defaults: &Defaults) -> Result<Self, ParseError> {
        parser::parse(reference, defaults)
    }

    /// Value to use in `/manifests/<ref>` requests: the digest, if any,
    /// or the tag.
    pub fn target(&self) -> &str {
        match &self.digest {
            Some(d) => d.source(),
            None => &self.tag,
        }
    }

    /// Return a copy of this reference with its digest replaced.
    pub fn pinned(&self, digest: Digest) -> Reference {
        Reference {
            digest: Some(digest),
            ..self.clone()
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)?;

        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }

        Ok(())
    }
}

impl TryFrom<&str> for Reference {
    type Error = ParseError;

    fn try_from(reference: &str) -> Result<Self, Self::Error> {
        parser::parse(reference, &Defaults::default())
    }
}

impl std::str::FromStr for Reference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::try_from(s)
    }
}

/// Represents a repository name, like `library/debian`
/// or `nixos/nix`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Repository(String);

impl Repository {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Repository(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the last component of this repository.
    ///
    /// # Examples
    ///
    /// ```
    /// # use layerpeek::*;
    /// let reference = Reference::try_from("foo/bar:stable").unwrap();
    /// assert_eq!(reference.repository.name(), "bar");
    /// ```
    pub fn name(&self) -> &str {
        self.0.rsplit_once('/').map(|s| s.1).unwrap_or(&self.0)
    }

    /// Return the namespace of this repository, or `None` if
    /// the repository does not contain a `/` character.
    ///
    /// # Examples
    ///
    /// ```
    /// # use layerpeek::*;
    /// let reference = Reference::try_from("quay.io/foo/bar/baz").unwrap();
    /// assert_eq!(reference.repository.namespace(), Some("foo/bar"));
    /// ```
    pub fn namespace(&self) -> Option<&str> {
        self.0.rsplit_once('/').map(|s| s.0)
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
