//! Server configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Configuration for a session server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Server identifier used in logs
    pub name: String,
    /// Maximum number of live sessions (ids 1..=max_session)
    pub max_session: u16,
    /// TCP listen address
    pub tcp_address: IpAddr,
    /// TCP listen port
    pub tcp_port: u16,
    /// Whether the UDP plane is enabled
    pub service_udp: bool,
    /// UDP bind address
    pub udp_address: IpAddr,
    /// UDP bind port
    pub udp_port: u16,
    /// Request address reuse on the UDP socket
    pub udp_reuse_address: bool,
    /// Interval between session update sweeps
    pub session_update_interval: Duration,
    /// Close a session after this long without traffic
    pub idle_timeout: Duration,
    /// Send a keepalive ping after this long without traffic
    pub ping_interval: Duration,
    /// Largest accepted packet payload
    pub max_payload_size: usize,
}

impl ServerConfig {
    /// TCP listen socket address.
    pub fn tcp_listen_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.tcp_address, self.tcp_port)
    }

    /// UDP bind socket address.
    pub fn udp_listen_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.udp_address, self.udp_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "relay".to_string(),
            max_session: 1024,
            tcp_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: 9000,
            service_udp: false,
            udp_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port: 9001,
            udp_reuse_address: false,
            session_update_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            max_payload_size: relay_wire::DEFAULT_MAX_PAYLOAD,
        }
    }
}
