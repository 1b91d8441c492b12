use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use layerpeek::{Digest, MediaType};
use tiny_http::{Header, Method, Request, Response, Server};

use super::blobs::Blob;

/// Request received by the registry.
#[derive(Clone, Debug)]
pub struct Logged {
    pub method: String,
    pub path: String,
    pub range: Option<String>,
    pub authorization: Option<String>,
}

/// Builder for a fake registry with a single repository.
pub struct Registry {
    repository: String,
    manifests: Vec<(Digest, MediaType, Vec<u8>)>,
    tags: Vec<(String, Digest)>,
    blobs: HashMap<Digest, Vec<u8>>,
    token_uses: Option<Option<usize>>,
    ignore_ranges: bool,
    omit_digest_header: bool,
    tags_page: Option<usize>,
}

/// Registry running in a background thread.
pub struct Running {
    pub port: u16,
    pub repository: String,
    log: Arc<Mutex<Vec<Logged>>>,
}

impl Running {
    /// Reference to `suffix` (like `:tag` or `@digest`) in the repository.
    pub fn reference(&self, suffix: &str) -> String {
        format!("127.0.0.1:{}/{}{suffix}", self.port, self.repository)
    }

    pub fn requests(&self) -> Vec<Logged> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, filter: impl Fn(&Logged) -> bool) -> usize {
        self.log.lock().unwrap().iter().filter(|r| filter(r)).count()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }
}

impl Registry {
    pub fn new(repository: &str) -> Registry {
        Registry {
            repository: repository.to_owned(),
            manifests: Vec::new(),
            tags: Vec::new(),
            blobs: HashMap::new(),
            token_uses: None,
            ignore_ranges: false,
            omit_digest_header: false,
            tags_page: None,
        }
    }

    pub fn blob(&mut self, blob: &Blob) {
        self.blobs.insert(blob.digest.clone(), blob.data.clone());
    }

    /// Add an image manifest, and return its digest.
    pub fn image(&mut self, tag: Option<&str>, config: Blob, layers: &[Blob]) -> Digest {
        #[derive(serde::Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Manifest<'a> {
            schema_version: u32,
            media_type: &'static str,
            config: &'a Blob,
            layers: &'a [Blob],
        }

        self.blob(&config);
        for layer in layers {
            self.blob(layer);
        }

        let body = serde_json::to_vec(&Manifest {
            schema_version: 2,
            media_type: MediaType::OciManifestV1.as_str(),
            config: &config,
            layers,
        })
        .unwrap();

        self.manifest(tag, MediaType::OciManifestV1, body)
    }

    /// Add an index with the manifests for each platform.
    pub fn index(&mut self, tag: Option<&str>, manifests: &[(&str, &Digest)]) -> Digest {
        let manifests: Vec<_> = manifests
            .iter()
            .map(|(platform, digest)| {
                let (_, _, body) = self.manifests.iter().find(|m| m.0 == **digest).unwrap();
                let mut parts = platform.split('/');
                serde_json::json!({
                    "mediaType": MediaType::OciManifestV1.as_str(),
                    "digest": digest,
                    "size": body.len(),
                    "platform": {
                        "os": parts.next().unwrap(),
                        "architecture": parts.next().unwrap(),
                    },
                })
            })
            .collect();

        let body = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MediaType::OciImageIndex.as_str(),
            "manifests": manifests,
        }))
        .unwrap();

        self.manifest(tag, MediaType::OciImageIndex, body)
    }

    pub fn manifest(&mut self, tag: Option<&str>, media_type: MediaType, body: Vec<u8>) -> Digest {
        let digest = Digest::sha256(&body);
        self.manifests.push((digest.clone(), media_type, body));

        if let Some(tag) = tag {
            self.tags.push((tag.to_owned(), digest.clone()));
        }

        digest
    }

    pub fn tag(&mut self, tag: &str, digest: &Digest) {
        self.tags.push((tag.to_owned(), digest.clone()));
    }

    /// Require bearer tokens. Every token from `/token` is accepted
    /// `uses` times, or forever if `None`.
    pub fn with_tokens(mut self, uses: Option<usize>) -> Self {
        self.token_uses = Some(uses);
        self
    }

    /// Send the whole blob for requests with a `Range` header.
    pub fn ignore_ranges(mut self) -> Self {
        self.ignore_ranges = true;
        self
    }

    pub fn omit_digest_header(mut self) -> Self {
        self.omit_digest_header = true;
        self
    }

    /// Split the tag list in pages.
    pub fn tags_page(mut self, size: usize) -> Self {
        self.tags_page = Some(size);
        self
    }

    pub fn start(self) -> Running {
        let server = Server::http("127.1:0").expect("start registry server");
        let port = server.server_addr().to_ip().unwrap().port();

        let log = Arc::new(Mutex::new(Vec::new()));
        let running = Running {
            port,
            repository: self.repository.clone(),
            log: Arc::clone(&log),
        };

        let mut state = State {
            registry: self,
            port,
            log,
            issued: Vec::new(),
        };

        std::thread::spawn(move || {
            let timeout = Duration::from_secs(60);
            while let Ok(Some(request)) = server.recv_timeout(timeout) {
                state.handle(request);
            }
        });

        running
    }
}

struct State {
    registry: Registry,
    port: u16,
    log: Arc<Mutex<Vec<Logged>>>,

    /// Tokens, and how many times they have been used.
    issued: Vec<(String, usize)>,
}

fn header(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
        .map(|h| h.value.to_string())
}

impl State {
    fn handle(&mut self, request: Request) {
        let range = header(&request, "range");
        let authorization = header(&request, "authorization");

        let (path, query) = match request.url().split_once('?') {
            Some((p, q)) => (p.to_owned(), q.to_owned()),
            None => (request.url().to_owned(), String::new()),
        };

        self.log.lock().unwrap().push(Logged {
            method: request.method().to_string(),
            path: path.clone(),
            range: range.clone(),
            authorization: authorization.clone(),
        });

        if path == "/token" {
            let token = format!("T{}", self.issued.len() + 1);
            self.issued.push((token.clone(), 0));
            let body = format!(r#"{{"token": "{token}", "expires_in": 300}}"#);
            return respond(request, Response::from_string(body));
        }

        if self.registry.token_uses.is_some() && !self.authorized(authorization.as_deref()) {
            let challenge = format!(
                r#"Bearer realm="http://127.0.0.1:{}/token",service="fake",scope="repository:{}:pull""#,
                self.port, self.registry.repository
            );

            let response = Response::from_data(vec![])
                .with_status_code(401)
                .with_header(Header::from_bytes("WWW-Authenticate", challenge).unwrap());

            return respond(request, response);
        }

        if path == "/v2/" {
            return respond(request, Response::from_string("{}"));
        }

        let Some(rest) = path.strip_prefix(&format!("/v2/{}/", self.registry.repository)) else {
            return not_found(request);
        };

        if rest == "tags/list" {
            return self.tags(request, &query);
        }

        if let Some(target) = rest.strip_prefix("manifests/") {
            return self.manifest(request, target);
        }

        if let Some(digest) = rest.strip_prefix("blobs/") {
            return self.blob(request, digest, range.as_deref());
        }

        not_found(request)
    }

    fn authorized(&mut self, authorization: Option<&str>) -> bool {
        let Some(token) = authorization.and_then(|a| a.strip_prefix("Bearer ")) else {
            return false;
        };

        let max_uses = self.registry.token_uses.flatten().unwrap_or(usize::MAX);

        match self.issued.iter_mut().find(|(t, _)| t == token) {
            Some((_, uses)) if *uses < max_uses => {
                *uses += 1;
                true
            }
            _ => false,
        }
    }

    fn tags(&self, request: Request, query: &str) {
        let names: Vec<&str> = self.registry.tags.iter().map(|(t, _)| t.as_str()).collect();

        let last = url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == "last")
            .map(|(_, v)| v.into_owned());

        let start = match &last {
            Some(last) => names.iter().position(|n| n == last).map_or(names.len(), |p| p + 1),
            None => 0,
        };

        let page_size = self.registry.tags_page.unwrap_or(usize::MAX);
        let end = start.saturating_add(page_size).min(names.len());
        let page = &names[start..end];

        let body = serde_json::to_vec(&serde_json::json!({
            "name": self.registry.repository,
            "tags": page,
        }))
        .unwrap();

        let mut response = Response::from_data(body);
        if end < names.len() {
            let link = format!(
                r#"</v2/{}/tags/list?n={page_size}&last={}>; rel="next""#,
                self.registry.repository,
                names[end - 1]
            );
            response.add_header(Header::from_bytes("Link", link).unwrap());
        }

        respond(request, response);
    }

    fn manifest(&self, request: Request, target: &str) {
        let digest = match self.registry.tags.iter().find(|(t, _)| t == target) {
            Some((_, d)) => d.clone(),
            None => match target.parse::<Digest>() {
                Ok(d) => d,
                Err(_) => return not_found(request),
            },
        };

        let Some((digest, media_type, body)) = self.registry.manifests.iter().find(|m| m.0 == digest) else {
            return not_found(request);
        };

        let mut response = Response::from_data(body.clone())
            .with_header(Header::from_bytes("Content-Type", media_type.as_str()).unwrap());

        if !self.registry.omit_digest_header {
            response.add_header(
                Header::from_bytes("Docker-Content-Digest", digest.to_string()).unwrap(),
            );
        }

        respond(request, response);
    }

    fn blob(&self, request: Request, digest: &str, range: Option<&str>) {
        let Some(data) = digest
            .parse::<Digest>()
            .ok()
            .and_then(|d| self.registry.blobs.get(&d))
        else {
            return not_found(request);
        };

        let range = range
            .filter(|_| !self.registry.ignore_ranges && request.method() == &Method::Get)
            .and_then(|r| r.strip_prefix("bytes="))
            .and_then(|r| r.split_once('-'))
            .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));

        let response = match range {
            None => Response::from_data(data.clone()),

            Some((start, _)) if start >= data.len() => Response::from_data(vec![]).with_status_code(416),

            Some((start, end)) => {
                let end = end.min(data.len() - 1);
                let content_range = format!("bytes {start}-{end}/{}", data.len());
                Response::from_data(data[start..=end].to_vec())
                    .with_status_code(206)
                    .with_header(Header::from_bytes("Content-Range", content_range).unwrap())
            }
        };

        respond(request, response);
    }
}

fn respond<R: std::io::Read>(request: Request, response: Response<R>) {
    request.respond(response).expect("Send response");
}

fn not_found(request: Request) {
    respond(request, Response::from_string("Not Found").with_status_code(404));
}
