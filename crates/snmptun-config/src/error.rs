use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid port value: {0}")]
    InvalidPort(String),

    #[error("port out of range: {0}")]
    PortOutOfRange(String),

    #[error("port list cannot be empty")]
    EmptyPortList,

    #[error("{var} is invalid: {source}")]
    InvalidEnv {
        var: &'static str,
        #[source]
        source: Box<ConfigError>,
    },

    #[error("invalid listen host: {0}")]
    InvalidListenHost(String),

    #[error("failed to determine home directory")]
    NoHomeDir,

    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}
