//! Configuration surface: a `config.ini` file next to the executable with
//! `[Settings]` (identity + tunables) and `[Network]` (ip family) sections.
//!
//! Mirrors `original_source/config_parser.py`: missing or invalid values
//! are repaired with defaults and written back; a missing file is created
//! populated with defaults.

use std::path::{Path, PathBuf};

use ini::Ini;
use lazy_static::lazy_static;
use thiserror::Error;
use tracing::info;

use crate::identity::{generate_uuid, AgentIdentity};

lazy_static! {
    static ref EXE_DIR: PathBuf = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."));
}

/// The path `load_config` resolves to when the caller doesn't override it
/// with `--config`.
pub fn default_config_path() -> PathBuf {
    EXE_DIR.join("config.ini")
}

const DEFAULT_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_QUEUE: u64 = 10;
const DEFAULT_ROOM_CAP: u64 = 1000;
const DEFAULT_NAME: &str = "DD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("config.ini was just created; please edit it and restart")]
    JustCreated,
}

/// IP family used for the HTTP job worker's outbound connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
    Both,
}

impl IpFamily {
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "ipv4" => IpFamily::V4,
            "ipv6" => IpFamily::V6,
            _ => IpFamily::Both,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            IpFamily::V4 => "ipv4",
            IpFamily::V6 => "ipv6",
            IpFamily::Both => "both",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub identity: AgentIdentity,
    pub interval_ms: u64,
    pub max_queue: u64,
    pub room_cap: u64,
    pub ip_family: IpFamily,
}

/// Load the config from `path` (or [`default_config_path`] if `None`),
/// creating it with defaults if absent, and repairing any invalid values
/// (writing the repaired values back to disk).
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);

    if !path.exists() {
        write_default_config(&path)?;
        info!(path = %path.display(), "Generated default config.ini. Please edit it then restart this program.");
        return Err(ConfigError::JustCreated);
    }

    let mut doc = read_ini(&path)?;
    let mut dirty = false;

    let uuid = doc
        .get_from(Some("Settings"), "uuid")
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            dirty = true;
            generate_uuid()
        });

    let name = doc
        .get_from(Some("Settings"), "name")
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            dirty = true;
            DEFAULT_NAME.to_string()
        });

    let interval_ms = doc
        .get_from(Some("Settings"), "interval")
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or_else(|| {
            dirty = true;
            DEFAULT_INTERVAL_MS
        });

    let max_queue = doc
        .get_from(Some("Settings"), "max_size")
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or_else(|| {
            dirty = true;
            DEFAULT_MAX_QUEUE
        });

    let room_cap = doc
        .get_from(Some("Settings"), "ws_limit")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or_else(|| {
            dirty = true;
            DEFAULT_ROOM_CAP
        });

    let ip_family = doc
        .get_from(Some("Network"), "ip")
        .map(IpFamily::parse)
        .unwrap_or_else(|| {
            dirty = true;
            IpFamily::Both
        });

    let config = Config {
        identity: AgentIdentity::new(uuid.clone(), name.clone()),
        interval_ms,
        max_queue,
        room_cap,
        ip_family,
    };

    if dirty {
        doc.with_section(Some("Settings"))
            .set("uuid", uuid)
            .set("name", name)
            .set("interval", interval_ms.to_string())
            .set("max_size", max_queue.to_string())
            .set("ws_limit", room_cap.to_string());
        doc.with_section(Some("Network"))
            .set("ip", ip_family.as_str());
        write_ini(&path, &doc)?;
    }

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<(), ConfigError> {
    let mut doc = Ini::new();
    doc.with_section(Some("Settings"))
        .set("uuid", "")
        .set("name", DEFAULT_NAME)
        .set("interval", DEFAULT_INTERVAL_MS.to_string())
        .set("max_size", DEFAULT_MAX_QUEUE.to_string())
        .set("ws_limit", DEFAULT_ROOM_CAP.to_string());
    doc.with_section(Some("Network")).set("ip", "both");
    write_ini(path, &doc)
}

/// Read `config.ini` as UTF-8, falling back to GBK for files left over from
/// older releases that were saved with a non-UTF-8 locale encoding.
fn read_ini(path: &PathBuf) -> Result<Ini, ConfigError> {
    let bytes = std::fs::read(path).map_err(|e| ConfigError::Read(path.clone(), e))?;
    let text = match std::str::from_utf8(&bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, had_errors) = encoding_rs::GBK.decode(&bytes);
            if had_errors {
                return Err(ConfigError::Read(
                    path.clone(),
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "not valid UTF-8 or GBK"),
                ));
            }
            decoded.into_owned()
        }
    };
    Ini::load_from_str(&text).map_err(|e| {
        ConfigError::Read(
            path.clone(),
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })
}

fn write_ini(path: &Path, doc: &Ini) -> Result<(), ConfigError> {
    doc.write_to_file(path)
        .map_err(|e| ConfigError::Write(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_family_parses_known_values() {
        assert_eq!(IpFamily::parse("ipv4"), IpFamily::V4);
        assert_eq!(IpFamily::parse("ipv6"), IpFamily::V6);
        assert_eq!(IpFamily::parse("both"), IpFamily::Both);
        assert_eq!(IpFamily::parse("garbage"), IpFamily::Both);
    }

    #[test]
    fn invalid_interval_repairs_to_default_in_memory() {
        let mut doc = Ini::new();
        doc.with_section(Some("Settings"))
            .set("uuid", "X")
            .set("name", "n")
            .set("interval", "-5")
            .set("max_size", "10")
            .set("ws_limit", "1000");
        let interval_ms = doc
            .get_from(Some("Settings"), "interval")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_INTERVAL_MS);
        assert_eq!(interval_ms, DEFAULT_INTERVAL_MS);
    }
}
