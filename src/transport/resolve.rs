//! Host name resolution seam for `connect_host`.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

/// Resolves a host name to socket addresses.
pub trait Resolve {
    /// Every address `host` resolves to, with `port` applied.
    fn resolve(&self, host: &str, port: u16)
    -> impl Future<Output = io::Result<Vec<SocketAddr>>> + Send;
}

/// Resolver backed by the operating system (`getaddrinfo` via tokio).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, host: &str, port: u16)
    -> impl Future<Output = io::Result<Vec<SocketAddr>>> + Send {
        let host = host.to_string();
        async move { Ok(tokio::net::lookup_host((host.as_str(), port)).await?.collect()) }
    }
}
