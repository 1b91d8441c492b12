//! Tag enumeration.

use serde::ser::SerializeMap;
use tracing::{debug, info, warn};

use crate::{
    digest::Digest,
    error::{Error, Result},
    http::read_body,
    manifests, pool, Reference, RegistryContext,
};

/// Tags of a repository, grouped by the digest of their manifests.
///
/// Groups are kept in the order their first tag was listed by the
/// registry, and tags keep the listing order inside each group.
///
/// It is serialized as a JSON object, with the digests as keys.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TagSet {
    pub groups: Vec<TagGroup>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct TagGroup {
    pub digest: Digest,
    pub tags: Vec<String>,
}

impl TagSet {
    /// Add `tag` to the group for `digest`.
    pub fn insert(&mut self, digest: Digest, tag: String) {
        match self.groups.iter_mut().find(|g| g.digest == digest) {
            Some(group) => group.tags.push(tag),
            None => self.groups.push(TagGroup {
                digest,
                tags: vec![tag],
            }),
        }
    }

    pub fn get(&self, digest: &Digest) -> Option<&[String]> {
        self.groups
            .iter()
            .find(|g| g.digest == *digest)
            .map(|g| g.tags.as_slice())
    }

    /// Number of tags in all groups.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.tags.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl serde::Serialize for TagSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.groups.len()))?;
        for group in &self.groups {
            map.serialize_entry(&group.digest, &group.tags)?;
        }
        map.end()
    }
}

/// Get all tags of the repository in `reference`.
///
/// The registry may split the list in multiple pages. The next page
/// is found in the `Link` header.
pub fn list_tag_names(ctx: &RegistryContext, reference: &Reference) -> Result<Vec<String>> {
    #[derive(serde::Deserialize)]
    struct TagList {
        #[serde(default)]
        tags: Option<Vec<String>>,
    }

    let mut tags = Vec::new();
    let mut response = ctx
        .transport()
        .get(ctx.scope(), reference, "tags/list", &[])?;

    loop {
        let next = response
            .header("Link")
            .and_then(next_page)
            .map(|link| resolve_link(response.get_url(), link))
            .transpose()?;

        let list: TagList = serde_json::from_slice(&read_body(ctx.scope(), response)?)?;
        tags.extend(list.tags.unwrap_or_default());

        match next {
            Some(url) => {
                debug!(url = %url, "next page of tags");
                response = ctx.transport().get_url(ctx.scope(), reference, &url)?;
            }
            None => break,
        }
    }

    Ok(tags)
}

/// List the tags of a repository, and group them by the digest of
/// their manifests.
///
/// Tags removed between the listing and the `HEAD` request are ignored.
pub fn list_tags(ctx: &RegistryContext, reference: &Reference) -> Result<(Vec<String>, TagSet)> {
    let names = list_tag_names(ctx, reference)?;

    let digests = pool::try_map_ordered(&names, ctx.config().max_parallel_requests, |tag| {
        let tagged = Reference {
            tag: tag.clone(),
            digest: None,
            ..reference.clone()
        };

        match manifests::get_digest(ctx, &tagged) {
            Ok(d) => Ok(Some(d)),
            Err(Error::NotFound(_)) => {
                warn!(reference = %tagged, "tag disappeared");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    })?;

    let mut set = TagSet::default();
    for (tag, digest) in names.iter().zip(digests) {
        if let Some(digest) = digest {
            set.insert(digest, tag.clone());
        }
    }

    info!(
        repository = %reference.repository,
        tags = names.len(),
        digests = set.groups.len(),
        "tags listed"
    );

    Ok((names, set))
}

/// Extract the URL with `rel="next"` from a `Link` header.
fn next_page(header: &str) -> Option<&str> {
    header.split(',').find_map(|link| {
        let (url, params) = link.trim().split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| matches!(p.trim(), r#"rel="next""# | "rel=next"));

        if is_next {
            url.trim().strip_prefix('<')?.strip_suffix('>')
        } else {
            None
        }
    })
}

/// Links are usually relative to the registry host.
fn resolve_link(base: &str, link: &str) -> Result<String> {
    let base = url::Url::parse(base).map_err(|e| Error::Protocol(format!("Invalid URL: {e}")))?;
    let url = base
        .join(link)
        .map_err(|e| Error::Protocol(format!("Invalid Link header: {e}")))?;

    Ok(url.into())
}

#[test]
fn parse_link_headers() {
    assert_eq!(
        next_page(r#"</v2/foo/tags/list?last=b&n=2>; rel="next""#),
        Some("/v2/foo/tags/list?last=b&n=2")
    );

    assert_eq!(
        next_page(r#"<http://a/prev>; rel="prev", <http://a/next>; rel="next""#),
        Some("http://a/next")
    );

    assert_eq!(next_page(r#"</x>; rel="prev""#), None);

    assert_eq!(
        resolve_link("http://127.0.0.1:5000/v2/foo/tags/list", "/v2/foo/tags/list?last=b").unwrap(),
        "http://127.0.0.1:5000/v2/foo/tags/list?last=b"
    );
}

#[test]
fn group_tags() {
    let a = Digest::sha256(b"a");
    let b = Digest::sha256(b"b");

    let mut set = TagSet::default();
    set.insert(a.clone(), "1".into());
    set.insert(b.clone(), "2".into());
    set.insert(a.clone(), "latest".into());

    assert_eq!(set.get(&a), Some(&["1".to_owned(), "latest".to_owned()][..]));
    assert_eq!(set.len(), 3);

    let json = serde_json::to_string(&set).unwrap();
    assert_eq!(json, format!(r#"{{"{a}":["1","latest"],"{b}":["2"]}}"#));
}
