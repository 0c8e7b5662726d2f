//! veild configuration system.
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./veild.yaml` (current directory - highest priority)
//! 2. `~/.config/veild/veild.yaml` (user config directory)
//! 3. `/etc/veild/veild.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority files.
//!
//! # YAML Structure
//!
//! ```yaml
//! socks:
//!   proxy: "127.0.0.1:9050"
//!   mode: socks5
//! naming:
//!   domain: ".onion"
//!   hosts_lookup: true
//! node:
//!   virtual_addr: "fd87:d87e:eb43::1"
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config filename.
const CONFIG_FILENAME: &str = "veild.yaml";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// How outbound connections to peers are established.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMode {
    /// SOCKS4a handshake (hostname carried after the user id).
    Socks4a,
    /// SOCKS5 handshake, no authentication, DOMAIN address type.
    #[default]
    Socks5,
    /// No proxy; resolve the hostname and connect to it directly.
    Direct,
}

impl fmt::Display for ConnectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectMode::Socks4a => "socks4a",
            ConnectMode::Socks5 => "socks5",
            ConnectMode::Direct => "direct",
        };
        write!(f, "{}", s)
    }
}

/// SOCKS proxy configuration (`socks.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SocksConfig {
    /// Socket address of the local SOCKS proxy (`socks.proxy`).
    /// When absent the connector is disabled and enqueues are no-ops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<SocketAddr>,

    /// Connection mode (`socks.mode`): socks4a, socks5, or direct.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ConnectMode>,

    /// Destination TCP port carried in SOCKS requests (`socks.dest_port`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_port: Option<u16>,

    /// User id string sent in SOCKS4a requests (`socks.username`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// UDP port of peer nameservers used by the DNS lookup path
    /// (`socks.ns_port`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ns_port: Option<u16>,
}

impl SocksConfig {
    /// Whether the connector is enabled at all.
    ///
    /// SOCKS modes need a proxy address; direct mode resolves targets
    /// itself and works without one.
    pub fn enabled(&self) -> bool {
        self.proxy.is_some() || self.mode() == ConnectMode::Direct
    }

    pub fn mode(&self) -> ConnectMode {
        self.mode.unwrap_or_default()
    }

    pub fn dest_port(&self) -> u16 {
        self.dest_port.unwrap_or(8060)
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or("veild")
    }

    pub fn ns_port(&self) -> u16 {
        self.ns_port.unwrap_or(8060)
    }
}

/// Name translation configuration (`naming.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamingConfig {
    /// Suffix appended to derived hostnames (`naming.domain`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Consult the hosts file before deriving a hostname
    /// (`naming.hosts_lookup`).
    #[serde(default)]
    pub hosts_lookup: bool,

    /// Send a reverse DNS query for unknown addresses (`naming.dns_lookup`).
    #[serde(default)]
    pub dns_lookup: bool,

    /// Path of the hosts file (`naming.hosts_path`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts_path: Option<PathBuf>,
}

impl NamingConfig {
    pub fn domain(&self) -> &str {
        self.domain.as_deref().unwrap_or(".onion")
    }
}

/// Retry/backoff configuration (`retry.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts before a temporary request is dropped (`retry.max_retries`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Backoff in seconds after a failed connect attempt
    /// (`retry.connect_backoff_secs`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_backoff_secs: Option<u64>,

    /// Reverse-DNS query retransmissions (`retry.dns_retries`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_retries: Option<u32>,

    /// Seconds between reverse-DNS retransmissions; also bounds the
    /// connector's wait so idle requests are re-examined
    /// (`retry.dns_retry_timeout_secs`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_retry_timeout_secs: Option<u64>,

    /// Seconds between startup probe attempts (`retry.probe_backoff_secs`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_backoff_secs: Option<u64>,
}

impl RetryConfig {
    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3)
    }

    pub fn connect_backoff_secs(&self) -> u64 {
        self.connect_backoff_secs.unwrap_or(30)
    }

    pub fn dns_retries(&self) -> u32 {
        self.dns_retries.unwrap_or(3)
    }

    pub fn dns_retry_timeout_secs(&self) -> u64 {
        self.dns_retry_timeout_secs.unwrap_or(10)
    }

    pub fn probe_backoff_secs(&self) -> u64 {
        self.probe_backoff_secs.unwrap_or(10)
    }
}

/// Internal channel capacities (`node.buffers.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuffersConfig {
    /// Control channel capacity (`node.buffers.control_channel`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_channel: Option<usize>,

    /// Step-event channel capacity (`node.buffers.event_channel`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_channel: Option<usize>,
}

impl BuffersConfig {
    pub fn control_channel(&self) -> usize {
        self.control_channel.unwrap_or(64)
    }

    pub fn event_channel(&self) -> usize {
        self.event_channel.unwrap_or(64)
    }
}

/// Node configuration (`node.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Our own virtual IPv6 address (`node.virtual_addr`). Used as the
    /// startup probe target and as the keepalive source address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_addr: Option<Ipv6Addr>,

    /// Verify proxy reachability at startup (`node.probe`).
    #[serde(default)]
    pub probe: bool,

    /// Virtual addresses to hold permanent connections to (`node.peers`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<Ipv6Addr>,

    /// Internal channel capacities (`node.buffers.*`).
    #[serde(default)]
    pub buffers: BuffersConfig,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// SOCKS proxy settings (`socks.*`).
    #[serde(default)]
    pub socks: SocksConfig,

    /// Name translation settings (`naming.*`).
    #[serde(default)]
    pub naming: NamingConfig,

    /// Retry and backoff settings (`retry.*`).
    #[serde(default)]
    pub retry: RetryConfig,

    /// Node settings (`node.*`).
    #[serde(default)]
    pub node: NodeConfig,
}

/// Replace `slot` with `value` when the latter is set.
fn overlay<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

impl SocksConfig {
    fn overlay_with(&mut self, other: SocksConfig) {
        overlay(&mut self.proxy, other.proxy);
        overlay(&mut self.mode, other.mode);
        overlay(&mut self.dest_port, other.dest_port);
        overlay(&mut self.username, other.username);
        overlay(&mut self.ns_port, other.ns_port);
    }
}

impl NamingConfig {
    fn overlay_with(&mut self, other: NamingConfig) {
        overlay(&mut self.domain, other.domain);
        overlay(&mut self.hosts_path, other.hosts_path);
        self.hosts_lookup |= other.hosts_lookup;
        self.dns_lookup |= other.dns_lookup;
    }
}

impl RetryConfig {
    fn overlay_with(&mut self, other: RetryConfig) {
        overlay(&mut self.max_retries, other.max_retries);
        overlay(&mut self.connect_backoff_secs, other.connect_backoff_secs);
        overlay(&mut self.dns_retries, other.dns_retries);
        overlay(&mut self.dns_retry_timeout_secs, other.dns_retry_timeout_secs);
        overlay(&mut self.probe_backoff_secs, other.probe_backoff_secs);
    }
}

impl BuffersConfig {
    fn overlay_with(&mut self, other: BuffersConfig) {
        overlay(&mut self.control_channel, other.control_channel);
        overlay(&mut self.event_channel, other.event_channel);
    }
}

impl NodeConfig {
    fn overlay_with(&mut self, other: NodeConfig) {
        overlay(&mut self.virtual_addr, other.virtual_addr);
        self.probe |= other.probe;
        // A peer list is all-or-nothing; partial lists don't compose
        if !other.peers.is_empty() {
            self.peers = other.peers;
        }
        self.buffers.overlay_with(other.buffers);
    }
}

impl Config {
    /// Create a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and merge every config file found in the standard search
    /// paths. More specific files win over less specific ones. Returns
    /// the merged configuration and the files that contributed to it.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        Self::load_from_paths(&Self::search_paths())
    }

    /// Load and merge config files from an explicit path list, in order.
    ///
    /// Missing files are skipped; unreadable or malformed ones are errors.
    /// Starts from the built-in defaults.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut merged = Config::default();
        let mut sources = Vec::new();

        for path in paths.iter().filter(|p| p.exists()) {
            merged.merge(Self::load_file(path)?);
            sources.push(path.clone());
        }

        Ok((merged, sources))
    }

    /// Parse a single YAML config file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&yaml).map_err(|source| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Where veild looks for `veild.yaml`, least to most specific: the
    /// system directory, the user's config directory, the working
    /// directory.
    pub fn search_paths() -> Vec<PathBuf> {
        let system = Some(PathBuf::from("/etc/veild"));
        let user = dirs::config_dir().map(|d| d.join("veild"));
        let local = Some(PathBuf::from("."));

        [system, user, local]
            .into_iter()
            .flatten()
            .map(|dir| dir.join(CONFIG_FILENAME))
            .collect()
    }

    /// Fold `other` over this configuration, section by section. Set
    /// fields win; everything else keeps its current value.
    pub fn merge(&mut self, other: Config) {
        self.socks.overlay_with(other.socks);
        self.naming.overlay_with(other.naming);
        self.retry.overlay_with(other.retry);
        self.node.overlay_with(other.node);
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config() {
        let config = Config::new();
        assert!(!config.socks.enabled());
        assert_eq!(config.socks.mode(), ConnectMode::Socks5);
        assert_eq!(config.socks.dest_port(), 8060);
        assert_eq!(config.naming.domain(), ".onion");
        assert_eq!(config.retry.max_retries(), 3);
        assert_eq!(config.retry.connect_backoff_secs(), 30);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
socks:
  proxy: "127.0.0.1:9050"
  mode: socks4a
  dest_port: 8060
naming:
  domain: ".b32.i2p"
  hosts_lookup: true
node:
  virtual_addr: "fd87:d87e:eb43::1"
  peers:
    - "fd87:d87e:eb43::2"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.socks.enabled());
        assert_eq!(config.socks.mode(), ConnectMode::Socks4a);
        assert_eq!(config.naming.domain(), ".b32.i2p");
        assert!(config.naming.hosts_lookup);
        assert_eq!(config.node.peers.len(), 1);
        assert_eq!(
            config.node.virtual_addr,
            Some("fd87:d87e:eb43::1".parse().unwrap())
        );
    }

    #[test]
    fn test_merge_overrides() {
        let mut base: Config = serde_yaml::from_str(
            r#"
socks:
  proxy: "127.0.0.1:9050"
  dest_port: 8060
"#,
        )
        .unwrap();
        let overlay: Config = serde_yaml::from_str(
            r#"
socks:
  proxy: "127.0.0.1:9150"
retry:
  max_retries: 5
"#,
        )
        .unwrap();

        base.merge(overlay);
        assert_eq!(base.socks.proxy, Some("127.0.0.1:9150".parse().unwrap()));
        // Not overridden, keeps base value
        assert_eq!(base.socks.dest_port(), 8060);
        assert_eq!(base.retry.max_retries(), 5);
    }

    #[test]
    fn test_load_from_paths() {
        let dir = TempDir::new().unwrap();
        let low = dir.path().join("low.yaml");
        let high = dir.path().join("high.yaml");
        fs::write(&low, "socks:\n  proxy: \"127.0.0.1:9050\"\n").unwrap();
        fs::write(&high, "socks:\n  mode: direct\n").unwrap();

        let (config, loaded) =
            Config::load_from_paths(&[low.clone(), high.clone(), dir.path().join("missing.yaml")])
                .unwrap();
        assert_eq!(loaded, vec![low, high]);
        assert!(config.socks.enabled());
        assert_eq!(config.socks.mode(), ConnectMode::Direct);
    }

    #[test]
    fn test_load_file_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "socks: [not, a, mapping]").unwrap();

        let err = Config::load_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseYaml { .. }));
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut config = Config::new();
        config.socks.proxy = Some("127.0.0.1:9050".parse().unwrap());
        config.socks.mode = Some(ConnectMode::Socks5);
        config.naming.hosts_lookup = true;

        let yaml = config.to_yaml().unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.socks.proxy, config.socks.proxy);
        assert_eq!(parsed.socks.mode(), ConnectMode::Socks5);
        assert!(parsed.naming.hosts_lookup);
    }
}
