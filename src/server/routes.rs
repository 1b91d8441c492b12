use std::{borrow::Cow, io::Cursor, str::FromStr, time::Instant};

use percent_encoding::percent_decode_str;
use tiny_http::{Header, Method, Request, Response};
use tracing::{debug, info};

use crate::{
    digest::Digest,
    error::{Error, ErrorKind, Result},
    hex::hexdump,
    layer::ListOptions,
    resolver::PathContent,
    views::SizeView,
    Reference, RegistryContext,
};

type HttpResponse = Response<Cursor<Vec<u8>>>;

/// Routes of the HTTP surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// `/repo/<name>`
    Repository(String),

    /// `/image/<reference>`
    Image(String),

    /// `/fs/<repo>@<digest>[/path]`
    Layer {
        repository: String,
        digest: String,
        path: String,
    },

    /// `/size/<repo>@<digest>`
    Size { repository: String, digest: String },

    /// `/layers/<image>@<digest>[/path]`
    Overlay {
        image: String,
        digest: String,
        path: String,
    },
}

impl Route {
    /// Parse the path of a request. It must be percent-decoded.
    pub fn parse(path: &str) -> Result<Route> {
        let trimmed = path.trim_start_matches('/');
        let (prefix, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));

        if !matches!(prefix, "repo" | "image" | "fs" | "size" | "layers") {
            return Err(Error::NotFound(path.to_owned()));
        }

        if rest.is_empty() {
            return Err(Error::BadRequest(format!("Missing reference in {path}")));
        }

        let route = match prefix {
            "repo" => Route::Repository(rest.to_owned()),

            "image" => Route::Image(rest.to_owned()),

            "fs" => {
                let (repository, digest, path) = split_pinned(rest)?;
                Route::Layer {
                    repository,
                    digest,
                    path,
                }
            }

            "size" => {
                let (repository, digest, _) = split_pinned(rest)?;
                Route::Size { repository, digest }
            }

            "layers" => {
                let (image, digest, path) = split_pinned(rest)?;
                Route::Overlay {
                    image,
                    digest,
                    path,
                }
            }

            _ => return Err(Error::NotFound(path.to_owned())),
        };

        Ok(route)
    }
}

/// Split `<name>@<digest>[/path]`.
fn split_pinned(text: &str) -> Result<(String, String, String)> {
    let (name, pinned) = text
        .split_once('@')
        .ok_or_else(|| Error::BadRequest(format!("Missing digest in {text}")))?;

    let (digest, path) = match pinned.split_once('/') {
        Some((digest, path)) => (digest, format!("/{path}")),
        None => (pinned, "/".to_owned()),
    };

    if name.is_empty() || digest.is_empty() {
        return Err(Error::BadRequest(format!("Missing reference in {text}")));
    }

    Ok((name.to_owned(), digest.to_owned(), path))
}

/// Query parameters used by the routes.
#[derive(Debug, Default)]
struct Query {
    filter: Option<String>,
    render: Option<String>,
}

impl Query {
    fn parse(query: &str) -> Self {
        let mut parsed = Query::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match &*key {
                "filter" => parsed.filter = Some(value.into_owned()),
                "render" => parsed.render = Some(value.into_owned()),
                _ => (),
            }
        }

        parsed
    }
}

pub(super) fn handle(ctx: &RegistryContext, request: &Request) -> HttpResponse {
    let start = Instant::now();
    let method = request.method().clone();

    let response = if method == Method::Get {
        dispatch(ctx, request.url()).unwrap_or_else(error_response)
    } else {
        json_response(
            405,
            &serde_json::json!({
                "error": "MethodNotAllowed",
                "details": format!("{method} is not supported"),
            }),
        )
    };

    info!(
        method = %method,
        url = %request.url(),
        status = response.status_code().0,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );

    response
}

fn dispatch(ctx: &RegistryContext, url: &str) -> Result<HttpResponse> {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let path: Cow<str> = percent_decode_str(path).decode_utf8_lossy();
    let query = Query::parse(query);
    let filter = query.filter.as_deref();

    let route = Route::parse(&path)?;
    debug!(?route, "dispatch");

    match route {
        Route::Repository(name) => {
            let reference = ctx.parse(&name)?;
            Ok(json_response(200, &ctx.resolve_repository(&reference)?))
        }

        Route::Image(image) => {
            let reference = ctx.parse(&image)?;
            Ok(json_response(200, &ctx.resolve_image(&reference)?))
        }

        Route::Layer {
            repository,
            digest,
            path,
        } => {
            let reference = ctx.parse(&repository)?;
            let digest = Digest::from_str(&digest)?;
            let content = ctx.read_path(&reference, &digest, &path, filter)?;
            Ok(content_response(&path, content, query.render.as_deref()))
        }

        Route::Size { repository, digest } => {
            let reference = ctx.parse(&repository)?;
            let digest = Digest::from_str(&digest)?;
            let listing = ctx.fetch_layer_listing(&reference, &digest, &ListOptions::default())?;
            Ok(json_response(200, &SizeView::from(&listing)))
        }

        Route::Overlay {
            image,
            digest,
            path,
        } => {
            let reference = pinned_reference(ctx, &image, &digest)?;
            let content = ctx.overlay_path(&reference, &path, filter)?;
            Ok(content_response(&path, content, query.render.as_deref()))
        }
    }
}

fn pinned_reference(ctx: &RegistryContext, image: &str, digest: &str) -> Result<Reference> {
    let reference = ctx.parse(image)?;
    Ok(reference.pinned(Digest::from_str(digest)?))
}

fn content_response(path: &str, content: PathContent, render: Option<&str>) -> HttpResponse {
    match content {
        PathContent::Directory(entries) => json_response(
            200,
            &serde_json::json!({
                "path": path,
                "entries": entries,
            }),
        ),

        PathContent::Symlink(target) => json_response(
            200,
            &serde_json::json!({
                "path": path,
                "target": target,
            }),
        ),

        PathContent::File(data) if render == Some("hex") => {
            with_content_type(Response::from_data(hexdump(data)), "text/plain; charset=utf-8")
        }

        PathContent::File(data) => {
            with_content_type(Response::from_data(data), "application/octet-stream")
        }
    }
}

fn error_response(error: Error) -> HttpResponse {
    let kind = error.kind();
    json_response(
        kind.status_code(),
        &serde_json::json!({
            "error": kind.as_str(),
            "details": error.to_string(),
        }),
    )
}

fn json_response<T: serde::Serialize>(status: u16, value: &T) -> HttpResponse {
    let (status, body) = match serde_json::to_vec(value) {
        Ok(body) => (status, body),
        Err(e) => (
            500,
            format!(r#"{{"error":"{}","details":"{e}"}}"#, ErrorKind::Protocol.as_str()).into_bytes(),
        ),
    };

    with_content_type(Response::from_data(body), "application/json").with_status_code(status)
}

fn with_content_type(response: HttpResponse, value: &str) -> HttpResponse {
    match Header::from_bytes("Content-Type", value) {
        Ok(header) => response.with_header(header),
        Err(_) => response,
    }
}
