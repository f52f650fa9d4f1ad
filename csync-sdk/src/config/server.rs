use std::net::SocketAddr;

/// Where the health, readiness and contact endpoints are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}
