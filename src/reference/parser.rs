//! Parse a reference to an image in an OCI registry.
//!
//! It tries to be close to what `docker pull` does, but it does not try
//! to be bug-for-bug compatible.

use super::*;

use crate::config::{DEFAULT_NAMESPACE, DEFAULT_REGISTRY};

const DEFAULT_TAG: &str = "latest";

/// Hostnames from Docker Hub that are replaced by [`DEFAULT_REGISTRY`].
const DOCKER_HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io"];

const MAX_TAG_LENGTH: usize = 128;

/// Registry and namespace to use when a reference does not
/// include them.
#[derive(Clone, Debug)]
pub struct Defaults<'a> {
    pub registry: &'a str,
    pub namespace: &'a str,
}

impl Default for Defaults<'_> {
    fn default() -> Self {
        Defaults {
            registry: DEFAULT_REGISTRY,
            namespace: DEFAULT_NAMESPACE,
        }
    }
}

type Result<T> = std::result::Result<T, ParseError>;

pub(super) fn parse(reference: &str, defaults: &Defaults) -> Result<Reference> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(ParseError::Empty);
    }

    // Extract the digest after the last `@`.
    let (base, digest) = match reference.rsplit_once('@') {
        None => (reference, None),
        Some((base, d)) => (base, Some(Digest::try_from(d.to_owned())?)),
    };

    // Extract the tag after the last `:`.
    //
    // If the value contains a `/`, it assumes that the value after `:`
    // is a port number, and not a tag.
    let (base, tag) = match base.rsplit_once(':') {
        Some((base, tag)) if !tag.contains('/') => (base, check_tag(tag)?),
        _ => (base, DEFAULT_TAG),
    };

    // Imitate the logic from `docker pull` to get the registry.
    let (registry, path) = match base.split_once('/') {
        Some((first, path)) if is_registry(first, defaults) => (first, path),
        _ => (defaults.registry, base),
    };

    let registry = match registry {
        r if DOCKER_HUB_ALIASES.contains(&r) => DEFAULT_REGISTRY,
        r => r,
    };

    if path.is_empty() {
        return Err(ParseError::MissingRepository);
    }

    check_repository(path)?;

    // Single-component repositories in the default registry are
    // in the `library` namespace.
    let is_default = registry == defaults.registry || registry == DEFAULT_REGISTRY;
    let repository = if is_default && !path.contains('/') {
        Repository::new(format!("{}/{path}", defaults.namespace))
    } else {
        Repository::new(path)
    };

    Ok(Reference {
        registry: registry.to_owned(),
        repository,
        tag: tag.to_owned(),
        digest,
    })
}

/// Check if the first component of a reference is a hostname.
fn is_registry(component: &str, defaults: &Defaults) -> bool {
    component.contains(['.', ':']) || component == "localhost" || component == defaults.registry
}

/// Tags are limited to `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
fn check_tag(tag: &str) -> Result<&str> {
    let mut chars = tag.chars();

    let valid = tag.len() <= MAX_TAG_LENGTH
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(tag)
    } else {
        Err(ParseError::InvalidTag(tag.to_owned()))
    }
}

/// Every component must be lowercase alphanumeric, with `.`, `_` or `-`
/// as separators.
fn check_repository(path: &str) -> Result<()> {
    let valid_component = |c: &str| {
        let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();

        c.starts_with(alnum)
            && c.ends_with(alnum)
            && c.chars().all(|c| alnum(c) || matches!(c, '.' | '_' | '-'))
    };

    if path.split('/').all(valid_component) {
        Ok(())
    } else {
        Err(ParseError::InvalidRepository(path.to_owned()))
    }
}

#[test]
fn parse_valid_references() {
    use crate::digest::HexString;
    use sha2::{Digest as _, Sha256, Sha512};

    macro_rules! check {
        ($reference:expr, [ $registry:expr, $repository:expr, $tag:expr, $digest:expr ]) => {
            let reference = $reference;
            assert_eq!(
                Reference::try_from(<_ as AsRef<str>>::as_ref(&reference)).unwrap(),
                Reference {
                    registry: $registry.to_owned(),
                    repository: Repository::new($repository),
                    tag: $tag.to_owned(),
                    digest: $digest,
                }
            )
        };
    }

    let sha256 = HexString(Sha256::digest(b"\x00\x01"));
    let sha512 = HexString(Sha512::digest(b"\x01\x02"));

    check!("foo", [DEFAULT_REGISTRY, "library/foo", DEFAULT_TAG, None]);

    check!("foo/bar", [DEFAULT_REGISTRY, "foo/bar", DEFAULT_TAG, None]);

    check!(
        "index.docker.io/foo",
        [DEFAULT_REGISTRY, "library/foo", DEFAULT_TAG, None]
    );

    check!(
        "docker.io/library/foo:1",
        [DEFAULT_REGISTRY, "library/foo", "1", None]
    );

    check!(
        "localhost/foo:dev",
        ["localhost", "foo", "dev", None]
    );

    check!(
        "example.com:5678/foo/bar:1.2.3",
        ["example.com:5678", "foo/bar", "1.2.3", None]
    );

    check!(
        &format!("example.com/foo/bar:1.2.3@sha256:{sha256}"),
        [
            "example.com",
            "foo/bar",
            "1.2.3",
            Digest::try_from(format!("sha256:{sha256}")).ok()
        ]
    );

    check!(
        &format!("example.com:1234/foo/bar@sha512:{sha512}"),
        [
            "example.com:1234",
            "foo/bar",
            DEFAULT_TAG,
            Digest::try_from(format!("sha512:{sha512}")).ok()
        ]
    );
}

#[test]
fn normalize_default_registry() {
    let reference = Reference::try_from("ubuntu").unwrap();

    assert_eq!(reference.registry, "registry-1.docker.io");
    assert_eq!(reference.repository.namespace(), Some("library"));
    assert_eq!(reference.repository.name(), "ubuntu");
    assert_eq!(reference.target(), "latest");
}

#[test]
fn custom_defaults() {
    let defaults = Defaults {
        registry: "mirror",
        namespace: "base",
    };

    let reference = Reference::parse_with("alpine:3", &defaults).unwrap();
    assert_eq!(reference.to_string(), "mirror/base/alpine:3");

    // The configured registry is detected in the output of `Display`.
    let again = Reference::parse_with(&reference.to_string(), &defaults).unwrap();
    assert_eq!(again, reference);
}

#[test]
fn format_round_trip() {
    let digest = format!("sha256:{:064}", 7);

    for text in [
        "ubuntu".to_owned(),
        "nixos/nix:2.3".to_owned(),
        "127.0.0.1:5000/a/b/c".to_owned(),
        format!("ghcr.io/org/tool:v1@{digest}"),
        format!("quay.io/x/y@{digest}"),
    ] {
        let reference = Reference::try_from(text.as_str()).unwrap();
        let formatted = reference.to_string();
        assert_eq!(Reference::try_from(formatted.as_str()).unwrap(), reference);
    }
}

#[test]
fn reject_invalid_references() {
    use crate::digest::DigestError;

    assert_eq!(Reference::try_from("  "), Err(ParseError::Empty));

    assert_eq!(
        Reference::try_from("example.com/"),
        Err(ParseError::MissingRepository)
    );

    assert!(matches!(
        Reference::try_from("debian:-stable"),
        Err(ParseError::InvalidTag(_))
    ));

    assert!(matches!(
        Reference::try_from("debian:sta+ble"),
        Err(ParseError::InvalidTag(_))
    ));

    assert!(matches!(
        Reference::try_from(format!("debian:{}", "x".repeat(129)).as_str()),
        Err(ParseError::InvalidTag(_))
    ));

    assert!(matches!(
        Reference::try_from("Foo/Bar"),
        Err(ParseError::InvalidRepository(_))
    ));

    assert!(matches!(
        Reference::try_from("debian:stable@md5:0000"),
        Err(ParseError::InvalidDigest(DigestError::InvalidAlgorithm)),
    ));

    assert!(matches!(
        Reference::try_from("debian:stable@sha256:0000"),
        Err(ParseError::InvalidDigest(DigestError::InvalidValue)),
    ));

    assert!(matches!(
        Reference::try_from(format!("debian:stable@sha256:{:064}", "x").as_str()),
        Err(ParseError::InvalidDigest(DigestError::InvalidValue)),
    ));
}
