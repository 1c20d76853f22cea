use crate::utils::types::Port;
use log::LevelFilter;
use serde::Deserialize;
use std::{fs::read_to_string, path::Path, path::PathBuf};

/// The server version extracted from the Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// File the configuration is loaded from
const CONFIG_FILE: &str = "config.yml";

/// Attempts to load the configuration from disk. Missing or malformed
/// files fall back to the defaults; this runs before logging is set up
/// so failures go to stderr.
pub fn load_config() -> Option<Config> {
    let file = Path::new(CONFIG_FILE);
    if !file.exists() {
        return None;
    }

    let data = match read_to_string(file) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("Failed to load config file (Using defaults): {:?}", err);
            return None;
        }
    };

    let config: Config = match serde_yaml::from_str(&data) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("Failed to parse config file (Using defaults): {:?}", err);
            return None;
        }
    };

    Some(config)
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the QUIC listener binds to
    pub host: String,
    pub port: Port,
    /// Address advertised to clients and cluster peers
    pub public_host: String,
    pub public_port: Port,
    /// TLS material served to clients and presented to backends
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    /// Hard cap on concurrent client connections
    pub max_connections: usize,
    /// QUIC idle timeout in seconds
    pub timeout_secs: u64,
    pub debug: bool,
    /// Forward frames without interception (handled by the extension layer)
    pub passthrough: bool,
    /// Shared referral secret, base64 or raw 32 bytes. Overridden by the
    /// NUMDRASSL_SECRET environment variable when that is set.
    pub secret: Option<String>,
    /// Base URL of the external session service
    pub session_service: String,
    pub logging: LevelFilter,
    /// Statically configured backend servers
    pub servers: Vec<ServerConfig>,
    pub cluster: ClusterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 27015,
            public_host: String::new(),
            public_port: 27015,
            certificate: PathBuf::from("data/cert.pem"),
            private_key: PathBuf::from("data/key.pem"),
            max_connections: 1000,
            timeout_secs: 30,
            debug: false,
            passthrough: false,
            secret: None,
            session_service: "https://sessions.numdrassl.net".to_string(),
            logging: LevelFilter::Info,
            servers: Vec::new(),
            cluster: Default::default(),
        }
    }
}

impl Config {
    /// Effective logging level; the debug flag forces debug logging
    pub fn logging_level(&self) -> LevelFilter {
        if self.debug {
            LevelFilter::Debug
        } else {
            self.logging
        }
    }

    /// Host peers and clients should use to reach this proxy
    pub fn advertised_host(&self) -> &str {
        if self.public_host.is_empty() {
            &self.host
        } else {
            &self.public_host
        }
    }
}

/// A statically configured backend server
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: Port,
    /// Whether this server receives players that carry no referral
    #[serde(default)]
    pub default: bool,
    /// Hostname to present for SNI based routing, if any
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,
    /// Identifier of this proxy within the cluster, at most 32 characters
    pub proxy_id: String,
    pub region: String,
    pub broker: BrokerConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxy_id: String::new(),
            region: "global".to_string(),
            broker: Default::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: Port,
    pub password: Option<String>,
    pub database: i64,
    pub ssl: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: 0,
            ssl: false,
        }
    }
}

impl BrokerConfig {
    /// Connection URL for the broker client
    pub fn url(&self) -> String {
        let scheme = if self.ssl { "rediss" } else { "redis" };
        let auth = match &self.password {
            Some(password) => format!(":{}@", password),
            None => String::new(),
        };
        format!(
            "{}://{}{}:{}/{}",
            scheme, auth, self.host, self.port, self.database
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Partial config files keep defaults for everything unset
    #[test]
    fn test_partial_config() {
        let config: Config = serde_yaml::from_str(
            r#"
port: 28000
servers:
  - name: lobby
    host: 10.0.0.5
    port: 28001
    default: true
  - name: arena
    host: 10.0.0.6
    port: 28002
cluster:
  enabled: true
  proxy_id: eu-proxy-1
  region: eu
"#,
        )
        .unwrap();

        assert_eq!(config.port, 28000);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.servers.len(), 2);
        assert!(config.servers[0].default);
        assert!(!config.servers[1].default);
        assert!(config.cluster.enabled);
        assert_eq!(config.cluster.proxy_id, "eu-proxy-1");
        assert_eq!(config.cluster.broker.port, 6379);
    }

    /// Broker URLs carry scheme, auth and database index
    #[test]
    fn test_broker_url() {
        let mut broker = BrokerConfig::default();
        assert_eq!(broker.url(), "redis://127.0.0.1:6379/0");

        broker.password = Some("hunter2".to_string());
        broker.ssl = true;
        broker.database = 3;
        assert_eq!(broker.url(), "rediss://:hunter2@127.0.0.1:6379/3");
    }
}
