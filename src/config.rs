use std::time::Duration;

use crate::manifests::Platform;

/// Hostname used when a reference does not include a registry,
/// like `debian` or `nixos/nix`.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Namespace for single-component repositories in the default registry.
pub const DEFAULT_NAMESPACE: &str = "library";

/// Settings for a [`RegistryContext`](crate::RegistryContext).
///
/// # Examples
///
/// ```
/// # use layerpeek::*;
/// # use std::time::Duration;
/// let config = Config::default()
///     .registry_timeout(Duration::from_secs(30))
///     .range_window_bytes(0);
///
/// assert!(!config.ranged_mode());
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Total timeout for a single request to a registry.
    pub registry_timeout: Duration,

    /// Deadline for a top-level operation.
    pub operation_timeout: Duration,

    /// Size of every ranged request. `0` or less disables ranged reads.
    pub range_window_bytes: i64,

    /// Bytes shared by two consecutive range windows.
    pub range_back_overlap_bytes: u64,

    /// Skip TLS certificate verification.
    pub insecure_tls: bool,

    pub default_registry: String,

    pub default_namespace: String,

    /// Preferred platform when a reference points to an index.
    pub platform: Option<Platform>,

    /// Maximum number of concurrent requests in a single operation.
    pub max_parallel_requests: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            registry_timeout: Duration::from_secs(120),
            operation_timeout: Duration::from_secs(300),
            range_window_bytes: 2 * 1024 * 1024,
            range_back_overlap_bytes: 32 * 1024,
            insecure_tls: false,
            default_registry: DEFAULT_REGISTRY.to_owned(),
            default_namespace: DEFAULT_NAMESPACE.to_owned(),
            platform: None,
            max_parallel_requests: 8,
        }
    }
}

impl Config {
    pub fn registry_timeout(mut self, timeout: Duration) -> Self {
        self.registry_timeout = timeout;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn range_window_bytes(mut self, bytes: i64) -> Self {
        self.range_window_bytes = bytes;
        self
    }

    pub fn range_back_overlap_bytes(mut self, bytes: u64) -> Self {
        self.range_back_overlap_bytes = bytes;
        self
    }

    pub fn insecure_tls(mut self, insecure: bool) -> Self {
        self.insecure_tls = insecure;
        self
    }

    pub fn default_registry(mut self, registry: impl Into<String>) -> Self {
        self.default_registry = registry.into();
        self
    }

    pub fn default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = namespace.into();
        self
    }

    pub fn platform(mut self, platform: Option<Platform>) -> Self {
        self.platform = platform;
        self
    }

    pub fn max_parallel_requests(mut self, n: usize) -> Self {
        self.max_parallel_requests = n.max(1);
        self
    }

    /// `true` if blobs are read with `Range` requests.
    pub fn ranged_mode(&self) -> bool {
        self.range_window_bytes > 0
    }

    /// Size of each range window, if ranged reads are enabled.
    pub(crate) fn window(&self) -> Option<u64> {
        u64::try_from(self.range_window_bytes)
            .ok()
            .filter(|w| *w > 0)
    }

    /// Overlap between windows, clamped to half of the window.
    pub(crate) fn overlap(&self, window: u64) -> u64 {
        self.range_back_overlap_bytes.min(window / 2)
    }
}

#[test]
fn window_and_overlap() {
    let config = Config::default();
    assert_eq!(config.window(), Some(2097152));
    assert_eq!(config.overlap(2097152), 32768);
    assert_eq!(config.overlap(1000), 500);

    let config = Config::default().range_window_bytes(-1);
    assert_eq!(config.window(), None);
    assert!(!config.ranged_mode());
}
