//! Tunnel port list parsing
//!
//! Port lists arrive as JSON arrays of numbers or numeric strings, or as a
//! comma-separated string from the environment.

use serde_json::Value;

use crate::error::ConfigError;

/// Parse a comma-separated port list such as `"1161, 21161"`
pub fn parse_ports_str(value: &str) -> Result<Vec<u16>, ConfigError> {
    parse_items(value.split(',').map(|s| Value::String(s.to_string())))
}

/// Parse a port list stored in the config file
pub fn parse_ports_value(value: &Value) -> Result<Vec<u16>, ConfigError> {
    match value {
        Value::Array(items) => parse_items(items.iter().cloned()),
        Value::String(s) => parse_ports_str(s),
        Value::Number(_) => parse_items(std::iter::once(value.clone())),
        other => Err(ConfigError::InvalidPort(other.to_string())),
    }
}

fn parse_items(items: impl IntoIterator<Item = Value>) -> Result<Vec<u16>, ConfigError> {
    let mut ports: Vec<u16> = Vec::new();

    for item in items {
        let port = match item {
            Value::String(s) => {
                let s = s.trim();
                if s.is_empty() {
                    continue;
                }
                if !s.chars().all(|c| c.is_ascii_digit()) {
                    return Err(ConfigError::InvalidPort(s.to_string()));
                }
                check_range(s.parse::<u64>().ok(), s)?
            }
            Value::Number(n) => {
                let raw = n.to_string();
                check_range(n.as_u64(), &raw)?
            }
            other => return Err(ConfigError::InvalidPort(other.to_string())),
        };

        if !ports.contains(&port) {
            ports.push(port);
        }
    }

    if ports.is_empty() {
        return Err(ConfigError::EmptyPortList);
    }

    Ok(ports)
}

fn check_range(value: Option<u64>, raw: &str) -> Result<u16, ConfigError> {
    match value {
        Some(n) if (1..=u16::MAX as u64).contains(&n) => Ok(n as u16),
        _ => Err(ConfigError::PortOutOfRange(raw.to_string())),
    }
}
