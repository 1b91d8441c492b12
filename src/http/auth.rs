//! Token authentication for registries.
//!
//! See <https://distribution.github.io/distribution/spec/auth/token/>
//! for more details.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

use super::credentials::{Credential, Scope};

/// Parameters from a `WWW-Authenticate: Bearer ...` header.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct Challenge {
    realm: String,
    params: Vec<(String, String)>,
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header.
    ///
    /// Return `None` if the header can't be parsed, or if its scheme
    /// is not `Bearer`.
    pub fn parse(auth_spec: &str) -> Option<Challenge> {
        let mut realm = None;
        let mut params = vec![];

        // The first token must be `Bearer`
        let mut tail = auth_spec.trim_ascii().strip_prefix("Bearer ")?;

        loop {
            let (key, value) = tail.split_once('=')?;
            let key = key.trim_ascii();
            let (value, after) = value.strip_prefix('"')?.split_once('"')?;

            if key == "realm" {
                realm = Some(value.to_owned());
            } else {
                params.push((key.to_owned(), value.to_owned()));
            }

            tail = match after.trim_ascii_start() {
                "" => break,
                t => t.strip_prefix(',')?,
            };
        }

        Some(Challenge {
            realm: realm?,
            params,
        })
    }

    /// Build the request to get a token for `scope`.
    ///
    /// The `scope` parameter from the challenge is replaced with a pull
    /// scope for the repository.
    pub fn token_request(&self, agent: &ureq::Agent, scope: &Scope) -> ureq::Request {
        self.params
            .iter()
            .filter(|(k, _)| k != "scope")
            .fold(agent.get(&self.realm), |r, (k, v)| r.query(k, v))
            .query("scope", &scope.pull_scope())
    }
}

/// Body of a response from the token server.
///
/// It must include either `token` or `access_token`.
#[derive(serde::Deserialize, Debug)]
struct Tokens {
    token: Option<String>,
    access_token: Option<String>,

    /// Some servers send non-numeric values, so it is
    /// parsed manually.
    expires_in: Option<serde_json::Value>,
}

/// Read a token from the body of a response to a token request.
pub(super) fn parse_tokens(body: &[u8], now: Instant) -> Result<Credential> {
    let tokens: Tokens = serde_json::from_slice(body)?;

    let expires = tokens
        .expires_in
        .as_ref()
        .and_then(|e| e.as_u64())
        .map(|secs| now + Duration::from_secs(secs));

    match tokens {
        Tokens { token: Some(t), .. } | Tokens { access_token: Some(t), .. } if !t.is_empty() => {
            Ok(Credential::Bearer { token: t, expires })
        }

        _ => Err(Error::AuthFailure("Missing authentication tokens.".into())),
    }
}

#[test]
fn parse_challenges() {
    let challenge = Challenge::parse(
        r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:foo/bar:pull""#,
    )
    .unwrap();

    assert_eq!(challenge.realm, "https://auth.example.com/token");
    assert_eq!(
        challenge.params,
        [
            ("service".to_owned(), "registry.example.com".to_owned()),
            ("scope".to_owned(), "repository:foo/bar:pull".to_owned()),
        ]
    );

    // Parameters before the realm.
    let challenge = Challenge::parse(r#"Bearer service="x", realm="http://y/t""#).unwrap();
    assert_eq!(challenge.realm, "http://y/t");

    assert_eq!(Challenge::parse(r#"Basic realm="x""#), None);
    assert_eq!(Challenge::parse(r#"Bearer service="x""#), None);
    assert_eq!(Challenge::parse("Bearer realm=x"), None);
}

#[test]
fn token_responses() {
    let now = Instant::now();

    let credential = parse_tokens(br#"{"token": "A", "expires_in": 60}"#, now).unwrap();
    assert_eq!(
        credential,
        Credential::Bearer {
            token: "A".into(),
            expires: Some(now + Duration::from_secs(60)),
        }
    );

    let credential = parse_tokens(br#"{"access_token": "B", "expires_in": "X"}"#, now).unwrap();
    assert_eq!(credential.bearer(), Some("B"));

    assert!(matches!(
        parse_tokens(b"{}", now),
        Err(Error::AuthFailure(_))
    ));

    assert!(matches!(
        parse_tokens(b"<html>", now),
        Err(Error::Protocol(_))
    ));
}
