mod auth;
pub(crate) mod credentials;
mod tls;


use std::{
    io::{self, Read},
    net::SocketAddr,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    config::Config,
    digest::Digest,
    error::{Error, Result},
    scope::OperationScope,
    EventHandler, MediaType, Reference,
};

use auth::Challenge;
use credentials::{Credential, CredentialCache, Scope};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Response to a request with a `Range` header.
#[derive(Debug)]
pub(crate) enum RangeResponse {
    /// `206`. The body contains the requested window.
    Partial(Vec<u8>),

    /// `200`. The registry ignored the range, and sent the whole blob.
    Whole(Vec<u8>),

    /// `416`, or an empty `206`. The start of the range is past the end.
    Exhausted,
}

/// HTTP client shared by every operation.
///
/// It owns the `ureq` agent and the credential cache. Requests for
/// a repository are authorized with the credential for its
/// `(registry, repository)` scope.
pub(crate) struct Transport {
    agent: ureq::Agent,
    credentials: CredentialCache,
    event_handler: Arc<dyn EventHandler>,
    timeout: Duration,
}

impl Transport {
    pub fn new(config: &Config, event_handler: Arc<dyn EventHandler>) -> Result<Self> {
        let mut builder = ureq::AgentBuilder::new()
            .user_agent(USER_AGENT)
            .timeout(config.registry_timeout);

        if config.insecure_tls {
            builder = builder.tls_config(Arc::new(tls::insecure_client_config()?));
        }

        Ok(Transport {
            agent: builder.build(),
            credentials: CredentialCache::new(),
            event_handler,
            timeout: config.registry_timeout,
        })
    }

    pub fn event_handler(&self) -> &dyn EventHandler {
        &*self.event_handler
    }

    /// Send a `GET` request for `path`, relative to `/v2/<repository>/`.
    pub fn get(
        &self,
        scope: &OperationScope,
        reference: &Reference,
        path: &str,
        headers: &[(&str, &str)],
    ) -> Result<ureq::Response> {
        self.send(scope, reference, "GET", &self.url(reference, path), headers)
    }

    /// Send a `GET` request to an absolute URL, like the ones found in
    /// `Link` headers.
    pub fn get_url(
        &self,
        scope: &OperationScope,
        reference: &Reference,
        url: &str,
    ) -> Result<ureq::Response> {
        self.send(scope, reference, "GET", url, &[])
    }

    pub fn head(
        &self,
        scope: &OperationScope,
        reference: &Reference,
        path: &str,
        headers: &[(&str, &str)],
    ) -> Result<ureq::Response> {
        self.send(scope, reference, "HEAD", &self.url(reference, path), headers)
    }

    /// Send a `HEAD` request for a manifest, and return the value of
    /// its `Docker-Content-Digest` header.
    pub fn head_digest(
        &self,
        scope: &OperationScope,
        reference: &Reference,
        target: &str,
    ) -> Result<Option<Digest>> {
        let accept = MediaType::manifests_accept();
        let response = self.head(
            scope,
            reference,
            &format!("manifests/{target}"),
            &[("Accept", &accept)],
        )?;

        match response.header("Docker-Content-Digest") {
            None => Ok(None),
            Some(d) => match Digest::from_str(d.trim()) {
                Ok(d) => Ok(Some(d)),
                Err(e) => {
                    warn!(header = d, "invalid Docker-Content-Digest");
                    Err(Error::Protocol(format!("Invalid Docker-Content-Digest: {e}")))
                }
            },
        }
    }

    /// Download a blob, and verify its digest.
    pub fn get_bytes(
        &self,
        scope: &OperationScope,
        reference: &Reference,
        digest: &Digest,
    ) -> Result<Vec<u8>> {
        let response = self.get(
            scope,
            reference,
            &format!("blobs/{digest}"),
            &[("Accept", "*/*")],
        )?;

        let mut body = Vec::new();
        digest
            .wrap_reader(scope.guard(response.into_reader()))
            .read_to_end(&mut body)
            .map_err(|e| match e.kind() {
                io::ErrorKind::InvalidData => Error::Protocol(format!("Blob {digest}: {e}")),
                _ => Error::from_io(e),
            })?;

        Ok(body)
    }

    /// Request the bytes `start..start + length` of a blob.
    pub fn get_range(
        &self,
        scope: &OperationScope,
        reference: &Reference,
        digest: &Digest,
        start: u64,
        length: u64,
    ) -> Result<RangeResponse> {
        let end = start + length.max(1) - 1;
        let url = self.url(reference, &format!("blobs/{digest}"));

        self.event_handler.range_request(&url, start, end);

        let range = format!("bytes={start}-{end}");
        let response = self.send(
            scope,
            reference,
            "GET",
            &url,
            &[("Accept", "*/*"), ("Range", &range)],
        )?;

        match response.status() {
            206 => {
                let body = read_body(scope, response)?;
                if body.is_empty() {
                    Ok(RangeResponse::Exhausted)
                } else {
                    Ok(RangeResponse::Partial(body))
                }
            }

            416 => Ok(RangeResponse::Exhausted),

            _ => Ok(RangeResponse::Whole(read_body(scope, response)?)),
        }
    }

    fn url(&self, reference: &Reference, path: &str) -> String {
        format!(
            "{}{}/v2/{}/{}",
            guess_scheme(&reference.registry),
            reference.registry,
            reference.repository,
            path
        )
    }

    /// Send a request to the registry.
    ///
    /// The request is authorized with the credential for the scope of
    /// `reference`. If the registry responds with a `401`, the
    /// credential is replaced and the request is sent once more.
    fn send(
        &self,
        scope: &OperationScope,
        reference: &Reference,
        method: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<ureq::Response> {
        let key = Scope::new(&reference.registry, reference.repository.as_str());

        let mut hint = None;
        let mut refreshed = false;

        loop {
            let credential = self
                .credentials
                .authorize(&key, || self.acquire(scope, &key, hint.take()))?;

            let mut request = self
                .agent
                .request(method, url)
                .timeout(scope.request_timeout(self.timeout)?);

            for (name, value) in headers {
                request = request.set(name, value);
            }

            if let Some(token) = credential.bearer() {
                request = request.set("Authorization", &format!("Bearer {token}"));
            }

            self.event_handler.registry_request(method, url);
            debug!(method, url, "registry request");

            match request.call() {
                Ok(response) => return Ok(response),

                Err(ureq::Error::Status(401, response)) if !refreshed => {
                    refreshed = true;

                    // Use the challenge from this response to get
                    // a new token.
                    hint = response.header("www-authenticate").and_then(Challenge::parse);
                    if hint.is_none() {
                        return Err(Error::AuthFailure(format!("{method} {url}: 401")));
                    }

                    debug!(url, "credential rejected");
                    self.credentials.invalidate_stale(&key, &credential);
                }

                Err(ureq::Error::Status(401, _)) => {
                    return Err(Error::AuthFailure(format!(
                        "{method} {url}: 401 after refreshing the token"
                    )));
                }

                Err(ureq::Error::Status(404, _)) => return Err(Error::NotFound(url.to_owned())),

                Err(ureq::Error::Status(416, response)) => return Ok(response),

                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Get a credential for `scope`.
    ///
    /// Without a `hint`, it sends an anonymous request to `/v2/` to
    /// get the authentication challenge.
    fn acquire(
        &self,
        op: &OperationScope,
        scope: &Scope,
        hint: Option<Challenge>,
    ) -> Result<Credential> {
        let challenge = match hint {
            Some(c) => c,
            None => {
                let url = format!("{}{}/v2/", guess_scheme(&scope.registry), scope.registry);

                self.event_handler.registry_request("GET", &url);

                let request = self
                    .agent
                    .get(&url)
                    .timeout(op.request_timeout(self.timeout)?);

                match request.call() {
                    Ok(_) => return Ok(Credential::Anonymous),

                    Err(ureq::Error::Status(401, response)) => {
                        match response.header("www-authenticate").and_then(Challenge::parse) {
                            Some(c) => c,
                            None => {
                                return Err(Error::AuthFailure(format!(
                                    "{url}: unsupported authentication challenge"
                                )))
                            }
                        }
                    }

                    // Registries without `/v2/` are assumed to be public.
                    Err(ureq::Error::Status(404, _)) => return Ok(Credential::Anonymous),

                    Err(e) => return Err(e.into()),
                }
            }
        };

        let request = challenge
            .token_request(&self.agent, scope)
            .timeout(op.request_timeout(self.timeout)?);

        self.event_handler.registry_auth(request.url());
        debug!(
            registry = %scope.registry,
            repository = %scope.repository,
            "requesting token"
        );

        let response = match request.call() {
            Ok(r) => r,
            Err(ureq::Error::Status(code, _)) => {
                return Err(Error::AuthFailure(format!(
                    "Token request for {} failed with status {code}",
                    scope.repository
                )))
            }
            Err(e) => return Err(e.into()),
        };

        auth::parse_tokens(&read_body(op, response)?, Instant::now())
    }
}

/// Read the full body of a response.
pub(crate) fn read_body(scope: &OperationScope, response: ureq::Response) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    scope
        .guard(response.into_reader())
        .read_to_end(&mut body)
        .map_err(Error::from_io)?;

    Ok(body)
}

/// Guess the URI scheme for the registry:
///
/// * If it is a loopback IP (like `127.0.0.1`), or if the port
///   is `:80`, it uses `http://`.
/// * In any other case, it uses `https://`.
fn guess_scheme(registry: &str) -> &'static str {
    const HTTP: &str = "http://";
    const HTTPS: &str = "https://";

    if registry.ends_with(":80") {
        return HTTP;
    }

    if let Ok(address) = SocketAddr::from_str(registry) {
        let loopback = match address {
            SocketAddr::V4(v4) => v4.ip().is_loopback(),
            SocketAddr::V6(v6) => v6.ip().is_loopback(),
        };

        return if loopback { HTTP } else { HTTPS };
    }

    HTTPS
}
