//! Configuration for the SNMP tunnel service
pub mod error;
pub mod ports;
pub mod store;

pub use error::ConfigError;
pub use ports::{parse_ports_str, parse_ports_value};
pub use store::{
    resolve_tunnel_ports, ConfigStore, SnmptunConfig, TunnelManagerSection, CONFIG_PATH_ENV,
    TUNNEL_PORTS_ENV,
};
