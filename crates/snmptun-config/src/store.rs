//! Persistent JSON configuration
//!
//! Lives in ~/.snmptun/config.json unless `SNMPTUN_CONFIG_PATH` points
//! elsewhere. Sections this crate does not know about are kept as-is.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use snmptun_lease::{
    TunnelManagerConfig, DEFAULT_CLEANUP_INTERVAL, DEFAULT_LEASE_TTL, DEFAULT_TUNNEL_PORTS,
};
use snmptun_proxy::ForwarderConfig;

use crate::error::ConfigError;
use crate::ports::{parse_ports_str, parse_ports_value};

/// Overrides the config file location
pub const CONFIG_PATH_ENV: &str = "SNMPTUN_CONFIG_PATH";

/// Overrides the configured tunnel ports (comma-separated)
pub const TUNNEL_PORTS_ENV: &str = "SNMPTUN_TUNNEL_PORTS";

/// The `TunnelManager` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelManagerSection {
    /// Kept raw so a bad value degrades to the defaults instead of
    /// making the whole file unreadable
    #[serde(default = "default_ports")]
    pub ports: Value,

    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_ports() -> Value {
    Value::from(DEFAULT_TUNNEL_PORTS.to_vec())
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_ttl_secs() -> u64 {
    DEFAULT_LEASE_TTL.as_secs()
}

fn default_cleanup_interval_secs() -> u64 {
    DEFAULT_CLEANUP_INTERVAL.as_secs()
}

impl Default for TunnelManagerSection {
    fn default() -> Self {
        Self {
            ports: default_ports(),
            listen_host: default_listen_host(),
            default_ttl_secs: default_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

/// Whole config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnmptunConfig {
    #[serde(rename = "TunnelManager", default)]
    pub tunnel_manager: TunnelManagerSection,

    #[serde(rename = "Forwarder", default)]
    pub forwarder: ForwarderConfig,

    /// Any other top-level sections, written back untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SnmptunConfig {
    pub fn listen_host(&self) -> Result<IpAddr, ConfigError> {
        self.tunnel_manager
            .listen_host
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidListenHost(self.tunnel_manager.listen_host.clone()))
    }

    /// Build the manager settings around an already-resolved port list
    pub fn manager_config(&self, ports: Vec<u16>) -> Result<TunnelManagerConfig, ConfigError> {
        Ok(TunnelManagerConfig {
            listen_host: self.listen_host()?,
            ports,
            default_ttl: Duration::from_secs(self.tunnel_manager.default_ttl_secs),
            cleanup_interval: Duration::from_secs(self.tunnel_manager.cleanup_interval_secs),
        })
    }
}

/// Resolve tunnel ports: environment override, then the file, then defaults.
///
/// A malformed override is an error; a malformed file entry only falls back.
pub fn resolve_tunnel_ports(
    env_value: Option<&str>,
    config: Option<&SnmptunConfig>,
) -> Result<Vec<u16>, ConfigError> {
    if let Some(raw) = env_value.filter(|v| !v.is_empty()) {
        return parse_ports_str(raw).map_err(|e| ConfigError::InvalidEnv {
            var: TUNNEL_PORTS_ENV,
            source: Box::new(e),
        });
    }

    if let Some(config) = config {
        let ports = &config.tunnel_manager.ports;
        let empty = match ports {
            Value::Null => true,
            Value::Array(items) => items.is_empty(),
            Value::String(s) => s.is_empty(),
            _ => false,
        };
        if !empty {
            match parse_ports_value(ports) {
                Ok(ports) => return Ok(ports),
                Err(e) => warn!("Ignoring invalid TunnelManager.ports ({}), using defaults", e),
            }
        }
    }

    Ok(DEFAULT_TUNNEL_PORTS.to_vec())
}

/// Reads and writes the config file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `SNMPTUN_CONFIG_PATH`, or ~/.snmptun/config.json
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
            return Ok(Self::new(path));
        }
        Ok(Self::new(Self::default_path()?))
    }

    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".snmptun").join("config.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the config, creating it with defaults when missing.
    ///
    /// A file that cannot be parsed is replaced by the defaults.
    pub fn load(&self) -> Result<SnmptunConfig, ConfigError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("Creating default config at {:?}", self.path);
                let config = SnmptunConfig::default();
                self.save(&config)?;
                return Ok(config);
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        match serde_json::from_str::<SnmptunConfig>(&json) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(
                    "Config file {:?} is corrupt ({}), replacing with defaults",
                    self.path, e
                );
                let config = SnmptunConfig::default();
                self.save(&config)?;
                Ok(config)
            }
        }
    }

    /// Write the config through a temporary file and a rename
    pub fn save(&self, config: &SnmptunConfig) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let json = serde_json::to_string_pretty(config)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;

        debug!("Saved config to {:?}", self.path);
        Ok(())
    }

    /// Effective tunnel ports, honouring `SNMPTUN_TUNNEL_PORTS`
    pub fn tunnel_ports(&self) -> Result<Vec<u16>, ConfigError> {
        let env_value = std::env::var(TUNNEL_PORTS_ENV).ok();

        let config = match self.load() {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Failed to load config ({}), using default tunnel ports", e);
                None
            }
        };

        resolve_tunnel_ports(env_value.as_deref(), config.as_ref())
    }

    /// Validate and persist a new port list; returns the normalised list
    pub fn set_tunnel_ports(&self, ports: &str) -> Result<Vec<u16>, ConfigError> {
        let ports = parse_ports_str(ports)?;

        let mut config = self.load()?;
        config.tunnel_manager.ports = Value::from(ports.clone());
        self.save(&config)?;

        info!("Tunnel ports set to {:?}", ports);
        Ok(ports)
    }

    /// Manager settings for `config`, with ports resolved the same way as
    /// [`Self::tunnel_ports`]
    pub fn tunnel_manager_config(
        &self,
        config: &SnmptunConfig,
    ) -> Result<TunnelManagerConfig, ConfigError> {
        let env_value = std::env::var(TUNNEL_PORTS_ENV).ok();
        let ports = resolve_tunnel_ports(env_value.as_deref(), Some(config))?;
        config.manager_config(ports)
    }
}
