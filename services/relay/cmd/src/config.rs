//! Configuration handling for the relay daemon.
//!
//! Reads the optional YAML configuration file, then applies `RELAY_*`
//! environment overrides. CLI flags are applied on top by `main`, which
//! also consults `RELAY_LOG_LEVEL` when building the log filter.

use anyhow::Result;
use relay_session::ServerConfig;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Root configuration structure (matches the YAML layout)
#[derive(Debug, Default, Deserialize)]
struct RootConfig {
    server: Option<ServerSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerSection {
    name: Option<String>,
    max_session: Option<u16>,
    tcp_address: Option<IpAddr>,
    tcp_port: Option<u16>,
    session_update_interval_ms: Option<u64>,
    idle_timeout_secs: Option<u64>,
    ping_interval_secs: Option<u64>,
    max_payload_size: Option<usize>,
    udp: Option<UdpSection>,
}

#[derive(Debug, Default, Deserialize)]
struct UdpSection {
    enabled: Option<bool>,
    address: Option<IpAddr>,
    port: Option<u16>,
    reuse_address: Option<bool>,
}

/// Load configuration from an optional file plus environment overrides.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<ServerConfig> {
    let mut config = ServerConfig::default();

    if let Some(path) = path {
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    apply_file_config(&mut config, root);
                    info!("loaded configuration from {:?}", path.as_ref());
                }
                Err(err) => {
                    warn!(
                        "failed to parse config file {:?}: {err}; using defaults",
                        path.as_ref()
                    );
                }
            },
            Err(_) => {
                warn!("config file {:?} not found, using defaults", path.as_ref());
            }
        }
    }

    apply_environment_overrides(&mut config);

    info!(
        "final configuration: name={}, max_session={}, tcp={}:{}, udp_enabled={}",
        config.name, config.max_session, config.tcp_address, config.tcp_port, config.service_udp
    );
    Ok(config)
}

fn apply_file_config(config: &mut ServerConfig, root: RootConfig) {
    let Some(server) = root.server else {
        return;
    };

    if let Some(name) = server.name {
        config.name = name;
    }
    if let Some(max_session) = server.max_session {
        config.max_session = max_session;
    }
    if let Some(address) = server.tcp_address {
        config.tcp_address = address;
    }
    if let Some(port) = server.tcp_port {
        config.tcp_port = port;
    }
    if let Some(interval_ms) = server.session_update_interval_ms {
        config.session_update_interval = Duration::from_millis(interval_ms);
    }
    if let Some(idle_secs) = server.idle_timeout_secs {
        config.idle_timeout = Duration::from_secs(idle_secs);
    }
    if let Some(ping_secs) = server.ping_interval_secs {
        config.ping_interval = Duration::from_secs(ping_secs);
    }
    if let Some(max_payload) = server.max_payload_size {
        config.max_payload_size = max_payload;
    }

    if let Some(udp) = server.udp {
        if let Some(enabled) = udp.enabled {
            config.service_udp = enabled;
        }
        if let Some(address) = udp.address {
            config.udp_address = address;
        }
        if let Some(port) = udp.port {
            config.udp_port = port;
        }
        if let Some(reuse) = udp.reuse_address {
            config.udp_reuse_address = reuse;
        }
    }
}

fn apply_environment_overrides(config: &mut ServerConfig) {
    if let Ok(max_session) = std::env::var("RELAY_MAX_SESSION") {
        if let Ok(value) = max_session.parse::<u16>() {
            config.max_session = value;
            info!("max_session overridden by environment: {value}");
        }
    }

    if let Ok(tcp_port) = std::env::var("RELAY_TCP_PORT") {
        if let Ok(value) = tcp_port.parse::<u16>() {
            config.tcp_port = value;
            info!("tcp port overridden by environment: {value}");
        }
    }

    if let Ok(udp_port) = std::env::var("RELAY_UDP_PORT") {
        if let Ok(value) = udp_port.parse::<u16>() {
            config.udp_port = value;
            info!("udp port overridden by environment: {value}");
        }
    }

    if let Ok(udp_enabled) = std::env::var("RELAY_UDP_ENABLED") {
        config.service_udp = udp_enabled.to_lowercase() == "true";
        info!("udp plane overridden by environment: {}", config.service_udp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_without_file() {
        let config = load_config(None::<&str>).unwrap();
        assert_eq!(config.max_session, 1024);
        assert!(!config.service_udp);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
server:
  name: arena-eu
  max_session: 64
  tcp_address: 127.0.0.1
  tcp_port: 19000
  session_update_interval_ms: 25
  idle_timeout_secs: 60
  udp:
    enabled: true
    address: 127.0.0.1
    port: 19001
    reuse_address: true
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = load_config(Some(temp_file.path())).unwrap();
        assert_eq!(config.name, "arena-eu");
        assert_eq!(config.max_session, 64);
        assert_eq!(config.tcp_port, 19000);
        assert_eq!(config.session_update_interval, Duration::from_millis(25));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert!(config.service_udp);
        assert_eq!(config.udp_port, 19001);
        assert!(config.udp_reuse_address);
    }

    #[test]
    fn test_unparsable_file_falls_back_to_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"server: [not a mapping").unwrap();

        let config = load_config(Some(temp_file.path())).unwrap();
        assert_eq!(config.max_session, 1024);
    }
}
