use crate::digest::Digest;

/// Handler to receive notifications for requests sent to registries,
/// and for layers scanned by the explorer.
///
/// All methods are optional.
#[expect(unused_variables)]
pub trait EventHandler: Send + Sync + 'static {
    /// HTTP request to the registry.
    fn registry_request(&self, method: &str, url: &str) {}

    /// Registry requires an [authentication token][token].
    ///
    /// [token]: https://distribution.github.io/distribution/spec/auth/token/
    fn registry_auth(&self, url: &str) {}

    /// Request for the bytes `start..=end` of a blob.
    fn range_request(&self, url: &str, start: u64, end: u64) {}

    /// The listing of a layer is ready.
    fn layer_listed(&self, digest: &Digest, entries: usize) {}
}

/// [`EventHandler`] instance to ignore all events.
pub struct NoEventHandler;

impl EventHandler for NoEventHandler {}
