use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    config::Config,
    digest::Digest,
    error::Result,
    http::Transport,
    layer::{self, LayerListing, ListOptions},
    manifests,
    overlay::{self, OverlayMap},
    reference::Defaults,
    resolver::{self, ChildEntry, PathContent},
    scope::{CancelHandle, OperationScope},
    tags,
    views::{ManifestView, RepositoryView},
    EventHandler, NoEventHandler, Reference,
};

/// Shared state for every operation against registries.
///
/// It contains the configuration, the HTTP client, and the credential
/// cache. Cloning a context is cheap, and every clone uses the same
/// credentials.
///
/// Operations started from the methods of this type run with a
/// deadline from [`Config::operation_timeout`].
///
/// # Examples
///
/// ```no_run
/// # use layerpeek::*;
/// let ctx = RegistryContext::new(Config::default())?;
///
/// let reference = ctx.parse("debian:stable")?;
/// let view = ctx.resolve_image(&reference)?;
///
/// println!("{} {}", view.digest, view.media_type);
/// # Ok::<(), Error>(())
/// ```
#[derive(Clone)]
pub struct RegistryContext {
    shared: Arc<Shared>,
    scope: OperationScope,
}

struct Shared {
    config: Config,
    transport: Transport,
}

impl RegistryContext {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_event_handler(config, NoEventHandler)
    }

    pub fn with_event_handler(config: Config, event_handler: impl EventHandler) -> Result<Self> {
        let transport = Transport::new(&config, Arc::new(event_handler))?;

        Ok(RegistryContext {
            shared: Arc::new(Shared { config, transport }),
            scope: OperationScope::unbounded(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.shared.transport
    }

    /// Scope for the requests sent with this context.
    pub fn scope(&self) -> &OperationScope {
        &self.scope
    }

    /// Handle to cancel every operation running with this context,
    /// or with a context derived from it.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.scope.cancel_handle()
    }

    /// Copy of this context that runs its requests in `scope`.
    pub fn with_scope(&self, scope: OperationScope) -> Self {
        RegistryContext {
            shared: Arc::clone(&self.shared),
            scope,
        }
    }

    /// Copy of this context with a new deadline for a single operation.
    pub fn scoped(&self) -> Self {
        self.with_scope(self.scope.narrowed(self.config().operation_timeout))
    }

    /// Parse a reference, using the default registry and namespace
    /// from the configuration.
    pub fn parse(&self, reference: &str) -> Result<Reference> {
        let defaults = Defaults {
            registry: &self.config().default_registry,
            namespace: &self.config().default_namespace,
        };

        Ok(Reference::parse_with(reference, &defaults)?)
    }

    /// Get the manifest or the index for `reference`.
    pub fn resolve_image(&self, reference: &Reference) -> Result<ManifestView> {
        let ctx = self.scoped();
        let result = manifests::get_manifest(&ctx, reference, None)
            .map(|(document, descriptor)| ManifestView::new(reference.to_string(), document, descriptor));

        log_result("resolve_image", reference, None, result)
    }

    /// Get the tags of the repository in `reference`, grouped by
    /// digest.
    pub fn resolve_repository(&self, reference: &Reference) -> Result<RepositoryView> {
        let ctx = self.scoped();
        let result = tags::list_tags(&ctx, reference).map(|(tags, manifests)| RepositoryView {
            name: reference.repository.to_string(),
            tags,
            manifests,
        });

        log_result("resolve_repository", reference, None, result)
    }

    /// List the entries in the layer `digest`.
    pub fn fetch_layer_listing(
        &self,
        reference: &Reference,
        digest: &Digest,
        options: &ListOptions,
    ) -> Result<LayerListing> {
        let ctx = self.scoped();
        let result = layer::list_layer(&ctx, reference, digest, options);
        log_result("fetch_layer_listing", reference, Some(digest), result)
    }

    /// Get the content of `path` in the layer `digest`.
    pub fn read_path(
        &self,
        reference: &Reference,
        digest: &Digest,
        path: &str,
        filter: Option<&str>,
    ) -> Result<PathContent> {
        let ctx = self.scoped();
        let result = resolver::read_path(&ctx, reference, digest, path, filter);
        log_result("read_path", reference, Some(digest), result)
    }

    /// Read a regular file in the layer `digest`.
    pub fn read_file(&self, reference: &Reference, digest: &Digest, path: &str) -> Result<Vec<u8>> {
        let ctx = self.scoped();
        let result = resolver::read_file(&ctx, reference, digest, path);
        log_result("read_file", reference, Some(digest), result)
    }

    pub fn list_directory(
        &self,
        reference: &Reference,
        digest: &Digest,
        path: &str,
        filter: Option<&str>,
    ) -> Result<Vec<ChildEntry>> {
        let ctx = self.scoped();
        let result = resolver::list_directory(&ctx, reference, digest, path, filter);
        log_result("list_directory", reference, Some(digest), result)
    }

    /// Build the filesystem of the image in `reference`.
    pub fn build_overlay(&self, reference: &Reference) -> Result<OverlayMap> {
        let ctx = self.scoped();
        let result = overlay::build_overlay(&ctx, reference);
        log_result("build_overlay", reference, reference.digest.as_ref(), result)
    }

    pub fn overlay_list(
        &self,
        reference: &Reference,
        path: &str,
        filter: Option<&str>,
    ) -> Result<Vec<ChildEntry>> {
        let ctx = self.scoped();
        let result = resolver::overlay_list(&ctx, reference, path, filter);
        log_result("overlay_list", reference, reference.digest.as_ref(), result)
    }

    pub fn overlay_read(&self, reference: &Reference, path: &str) -> Result<Vec<u8>> {
        let ctx = self.scoped();
        let result = resolver::overlay_read(&ctx, reference, path);
        log_result("overlay_read", reference, reference.digest.as_ref(), result)
    }

    /// Get the content of `path` in the filesystem of the image.
    pub fn overlay_path(
        &self,
        reference: &Reference,
        path: &str,
        filter: Option<&str>,
    ) -> Result<PathContent> {
        let ctx = self.scoped();
        let result = resolver::overlay_path(&ctx, reference, path, filter);
        log_result("overlay_path", reference, reference.digest.as_ref(), result)
    }
}

fn log_result<T>(
    operation: &str,
    reference: &Reference,
    digest: Option<&Digest>,
    result: Result<T>,
) -> Result<T> {
    let digest = digest.map(Digest::to_string).unwrap_or_default();

    match &result {
        Ok(_) => info!(operation, reference = %reference, digest = %digest, "operation completed"),
        Err(e) => warn!(
            operation,
            reference = %reference,
            digest = %digest,
            kind = %e.kind(),
            error = %e,
            "operation failed"
        ),
    }

    result
}
