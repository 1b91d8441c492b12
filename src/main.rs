use std::{process::ExitCode, time::Duration};

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use layerpeek::{config, server::Server, Config, Platform, RegistryContext};

/// HTTP server to explore images in OCI registries.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address to listen for HTTP connections.
    #[arg(long, env = "LAYERPEEK_LISTEN", default_value = "127.0.0.1:8080")]
    listen: String,

    /// Timeout, in seconds, for a single request to a registry.
    #[arg(long, env = "REGISTRY_TIMEOUT_SECONDS", default_value_t = 120)]
    registry_timeout: u64,

    /// Deadline, in seconds, for a single operation.
    #[arg(long, env = "OPERATION_TIMEOUT_SECONDS", default_value_t = 300)]
    operation_timeout: u64,

    /// Size of the ranges to read layers. `0` downloads whole blobs.
    #[arg(long, env = "RANGE_WINDOW_BYTES", default_value_t = 2 * 1024 * 1024, allow_negative_numbers = true)]
    range_window_bytes: i64,

    /// Bytes shared between consecutive ranges.
    #[arg(long, env = "RANGE_BACK_OVERLAP_BYTES", default_value_t = 32 * 1024)]
    range_back_overlap_bytes: u64,

    /// Skip verification of TLS certificates.
    #[arg(long, env = "INSECURE_TLS")]
    insecure_tls: bool,

    /// Registry for references without a registry.
    #[arg(long, env = "DEFAULT_REGISTRY", default_value = config::DEFAULT_REGISTRY)]
    default_registry: String,

    /// Namespace for single-component repositories in the default registry.
    #[arg(long, env = "DEFAULT_NAMESPACE", default_value = config::DEFAULT_NAMESPACE)]
    default_namespace: String,

    /// Preferred platform for multi-platform images, like `linux/amd64`.
    #[arg(long, env = "LAYERPEEK_PLATFORM")]
    platform: Option<Platform>,

    /// Number of threads to process requests.
    #[arg(long, env = "LAYERPEEK_WORKERS", default_value_t = 8)]
    workers: usize,
}

impl Args {
    fn config(&self) -> Config {
        Config::default()
            .registry_timeout(Duration::from_secs(self.registry_timeout))
            .operation_timeout(Duration::from_secs(self.operation_timeout))
            .range_window_bytes(self.range_window_bytes)
            .range_back_overlap_bytes(self.range_back_overlap_bytes)
            .insecure_tls(self.insecure_tls)
            .default_registry(&self.default_registry)
            .default_namespace(&self.default_namespace)
            .platform(self.platform.clone())
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("layerpeek=info")),
        )
        .init();

    let ctx = match RegistryContext::new(args.config()) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::http(&args.listen, ctx, args.workers) {
        Ok(s) => s,
        Err(e) => {
            error!(address = %args.listen, error = %e, "unable to listen");
            return ExitCode::FAILURE;
        }
    };

    server.run();
    ExitCode::SUCCESS
}
