//! HTTP surface.
//!
//! A fixed number of worker threads receive requests from the same
//! [`tiny_http::Server`]. Every request runs as a single operation of
//! the [`RegistryContext`].

mod routes;

use std::{io, net::SocketAddr, thread};

use tracing::{info, warn};

use crate::RegistryContext;

pub use routes::Route;

pub struct Server {
    http: tiny_http::Server,
    ctx: RegistryContext,
    workers: usize,
}

impl Server {
    /// Listen for connections in `address`.
    pub fn http(address: &str, ctx: RegistryContext, workers: usize) -> io::Result<Self> {
        let http = tiny_http::Server::http(address).map_err(io::Error::other)?;

        Ok(Server {
            http,
            ctx,
            workers: workers.max(1),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.http.server_addr().to_ip()
    }

    /// Process requests until [`Server::stop`] is called.
    pub fn run(&self) {
        info!(address = ?self.local_addr(), workers = self.workers, "server started");

        thread::scope(|scope| {
            for _ in 0..self.workers {
                scope.spawn(|| {
                    for request in self.http.incoming_requests() {
                        let response = routes::handle(&self.ctx, &request);
                        if let Err(e) = request.respond(response) {
                            warn!(error = %e, "unable to send response");
                        }
                    }
                });
            }
        });

        info!("server stopped");
    }

    /// Stop every worker blocked in [`Server::run`].
    pub fn stop(&self) {
        for _ in 0..self.workers {
            self.http.unblock();
        }
    }
}
