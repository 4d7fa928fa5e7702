//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`MURMUR_CONFIG`, or the default search path)
//! - Environment variables (`MURMUR_HOST`, `MURMUR_PORT`), which win over the file

use anyhow::{Context, Result};
use murmur_core::{BroadcasterConfig, RelayConfig, RouterConfig};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Relay behaviour.
    #[serde(default)]
    pub relay: RelaySection,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Timeouts.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Enable the raw TCP transport.
    #[serde(default = "default_true")]
    pub tcp: bool,

    /// Enable the WebSocket transport.
    #[serde(default = "default_true")]
    pub websocket: bool,

    /// Port for the HTTP/WebSocket listener.
    #[serde(default = "default_ws_port")]
    pub websocket_port: u16,

    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Relay behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Send chat messages back to their sender.
    #[serde(default)]
    pub echo_to_sender: bool,

    /// Confirm whispers to their sender.
    #[serde(default = "default_true")]
    pub confirm_whispers: bool,

    /// Announce arrivals, departures and renames to peers.
    #[serde(default = "default_true")]
    pub announce_presence: bool,

    /// Require a `username` command before anything else.
    #[serde(default = "default_true")]
    pub require_username: bool,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections across all transports.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Outbound queue capacity per client.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Consecutive full-queue failures before a client is dropped.
    #[serde(default = "default_max_strikes")]
    pub max_strikes: u32,
}

/// Timeouts, in milliseconds. Zero disables a timeout where noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Time allowed between accept and registration (0 = unlimited).
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,

    /// Time allowed for a single outbound write.
    #[serde(default = "default_write_ms")]
    pub write_ms: u64,

    /// Close connections with no inbound frame for this long (0 = never).
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7878
}

fn default_true() -> bool {
    true
}

fn default_ws_port() -> u16 {
    8080
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_frame_size() -> usize {
    murmur_protocol::MAX_FRAME_SIZE
}

fn default_outbound_queue() -> usize {
    murmur_core::DEFAULT_OUTBOUND_QUEUE
}

fn default_max_strikes() -> u32 {
    murmur_core::DEFAULT_MAX_STRIKES
}

fn default_handshake_ms() -> u64 {
    10_000 // 10 seconds
}

fn default_write_ms() -> u64 {
    5_000 // 5 seconds
}

fn default_idle_ms() -> u64 {
    120_000 // 2 minutes
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            relay: RelaySection::default(),
            limits: LimitsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp: true,
            websocket: true,
            websocket_port: default_ws_port(),
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            echo_to_sender: false,
            confirm_whispers: true,
            announce_presence: true,
            require_username: true,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            outbound_queue: default_outbound_queue(),
            max_strikes: default_max_strikes(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            handshake_ms: default_handshake_ms(),
            write_ms: default_write_ms(),
            idle_ms: default_idle_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl TimeoutsConfig {
    /// Handshake timeout, if any.
    #[must_use]
    pub fn handshake(&self) -> Option<Duration> {
        non_zero_millis(self.handshake_ms)
    }

    /// Per-write timeout.
    #[must_use]
    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms.max(1))
    }

    /// Idle timeout, if any.
    #[must_use]
    pub fn idle(&self) -> Option<Duration> {
        non_zero_millis(self.idle_ms)
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Config {
    /// Load configuration from file or defaults, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// an override is malformed.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("MURMUR_CONFIG") {
            Ok(path) => Self::from_file(shellexpand::tilde(&path).as_ref())?,
            Err(_) => Self::search()?,
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn search() -> Result<Self> {
        let config_paths = [
            "murmur.toml",
            "/etc/murmur/murmur.toml",
            "~/.config/murmur/murmur.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply `MURMUR_HOST` / `MURMUR_PORT` overrides from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if `MURMUR_PORT` is not a valid port.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("MURMUR_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("MURMUR_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("Invalid MURMUR_PORT: {port}"))?;
        }
        Ok(())
    }

    fn host_ip(&self) -> Result<IpAddr> {
        self.host
            .parse()
            .with_context(|| format!("Invalid host: {}", self.host))
    }

    /// Socket address for the TCP transport.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.host_ip()?, self.port))
    }

    /// Socket address for the HTTP/WebSocket listener.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn websocket_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.host_ip()?, self.transport.websocket_port))
    }

    /// Relay configuration derived from this config.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            router: RouterConfig {
                echo_to_sender: self.relay.echo_to_sender,
                confirm_whispers: self.relay.confirm_whispers,
                announce_presence: self.relay.announce_presence,
            },
            broadcaster: BroadcasterConfig {
                max_strikes: self.limits.max_strikes.max(1),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 7878);
        assert!(config.transport.tcp);
        assert!(config.transport.websocket);
        assert!(!config.relay.echo_to_sender);
        assert!(config.relay.require_username);
        assert_eq!(config.limits.outbound_queue, 256);
        assert_eq!(config.limits.max_strikes, 8);
        assert_eq!(config.timeouts.write(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 7878);
        assert_eq!(config.websocket_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [relay]
            echo_to_sender = true

            [limits]
            max_connections = 50000

            [timeouts]
            idle_ms = 0
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert!(config.relay.echo_to_sender);
        // Unset fields in a present section keep their defaults.
        assert!(config.relay.confirm_whispers);
        assert_eq!(config.timeouts.idle(), None);
        assert!(config.timeouts.handshake().is_some());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [("MURMUR_HOST", "0.0.0.0"), ("MURMUR_PORT", "9999")]
            .into_iter()
            .collect();
        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9999);

        let mut config = Config::default();
        assert!(config
            .apply_overrides(|key| (key == "MURMUR_PORT").then(|| "nope".to_string()))
            .is_err());
    }

    #[test]
    fn test_relay_config_mapping() {
        let mut config = Config::default();
        config.relay.confirm_whispers = false;
        config.limits.max_strikes = 3;

        let relay = config.relay_config();
        assert!(!relay.router.confirm_whispers);
        assert_eq!(relay.broadcaster.max_strikes, 3);
    }
}
