//! Controller Configuration
//!
//! Runtime settings come from three layers, later layers winning:
//!
//! 1. Built-in defaults (`ControllerConfig::default()`)
//! 2. An optional TOML file
//! 3. Environment variables (`POLL_INTERVAL`, `FIREWALL_RULES`,
//!    `TELEM_LOG_DIR`, `FLOWCTL_LISTEN`)
//!
//! The service binary applies CLI flags on top of the result.
//!
//! ## Usage
//!
//! Call `load_environment()` early in main() so values from
//! `/etc/flowctl/environment` (or `.env`) are visible to the env layer:
//!
//! ```rust,no_run
//! use flowctl_core::config::{load_environment, ControllerConfig};
//!
//! load_environment();
//! let config = ControllerConfig::load(None).expect("readable configuration");
//! config.validate().expect("valid configuration");
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::MacAddr;

/// Alternative paths to check (in order of priority)
pub const ENV_FILE_PATHS: &[&str] = &["/etc/flowctl/environment", "/etc/flowctl.env", ".env"];

pub const ENV_POLL_INTERVAL: &str = "POLL_INTERVAL";
pub const ENV_FIREWALL_RULES: &str = "FIREWALL_RULES";
pub const ENV_TELEMETRY_DIR: &str = "TELEM_LOG_DIR";
pub const ENV_LISTEN: &str = "FLOWCTL_LISTEN";

/// Load environment variables from the canonical configuration file.
///
/// This function:
/// 1. Checks `FLOWCTL_ENV_FILE` if set
/// 2. Checks `/etc/flowctl/environment` (system-wide)
/// 3. Falls back to `.env` in current directory (development)
/// 4. Does NOT override existing environment variables
///
/// Returns the path that was loaded, or None if no file was found.
pub fn load_environment() -> Option<String> {
    if let Some(custom_path) = get_config_opt("FLOWCTL_ENV_FILE") {
        if let Some(path) = try_load_env_file(&custom_path) {
            return Some(path);
        }
    }

    for path in ENV_FILE_PATHS {
        if let Some(loaded_path) = try_load_env_file(path) {
            return Some(loaded_path);
        }
    }

    debug!("No environment file found, using existing environment");
    None
}

fn try_load_env_file(path: &str) -> Option<String> {
    let path_obj = Path::new(path);

    if !path_obj.exists() {
        return None;
    }

    match fs::read_to_string(path_obj) {
        Ok(content) => {
            let mut loaded_count = 0;
            let mut skipped_count = 0;

            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }

                if let Some((key, value)) = parse_env_line(line) {
                    if std::env::var(&key).is_err() {
                        std::env::set_var(&key, &value);
                        loaded_count += 1;
                        debug!("Loaded: {}={}", key, masked(&key, &value));
                    } else {
                        skipped_count += 1;
                        debug!("Skipped (already set): {}", key);
                    }
                }
            }

            info!(
                "Loaded {} environment variables from {} ({} skipped - already set)",
                loaded_count, path, skipped_count
            );

            Some(path.to_string())
        }
        Err(e) => {
            warn!("Failed to read environment file {}: {}", path, e);
            None
        }
    }
}

/// Value as it may appear in logs: credentials are replaced by `***`
fn masked<'a>(key: &str, value: &'a str) -> &'a str {
    if key.contains("KEY") || key.contains("TOKEN") || key.contains("SECRET") {
        "***"
    } else {
        value
    }
}

/// Parse a single environment line into key-value pair.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    // Handle: KEY=VALUE, KEY="VALUE", KEY='VALUE'
    let mut parts = line.splitn(2, '=');
    let key = parts.next()?.trim();
    let value = parts.next()?.trim();

    if key.is_empty() {
        return None;
    }

    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}

/// Get an optional configuration value.
pub fn get_config_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

// ============================================================================
// Controller configuration
// ============================================================================

/// Runtime configuration of the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Address the switch-facing listener binds to
    pub listen: SocketAddr,

    /// Seconds between telemetry polls
    pub poll_interval_secs: f64,

    /// Firewall rule document (JSON array of match objects)
    pub rules_source: Option<PathBuf>,

    /// Directory receiving telemetry CSV files
    pub sink_location: PathBuf,

    /// Virtual IPs served by the load balancer
    pub vips: Vec<VipConfig>,
}

/// One load-balanced virtual IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VipConfig {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// A backend of a VIP pool. `mac` may be left out and resolved at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub mac: Option<MacAddr>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 6653))
}

fn default_vips() -> Vec<VipConfig> {
    vec![VipConfig {
        ip: Ipv4Addr::new(10, 0, 1, 100),
        mac: MacAddr::new(0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee),
        backends: vec![
            BackendConfig {
                ip: Ipv4Addr::new(10, 0, 1, 1),
                mac: None,
            },
            BackendConfig {
                ip: Ipv4Addr::new(10, 0, 1, 2),
                mac: None,
            },
        ],
    }]
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            poll_interval_secs: 2.0,
            rules_source: None,
            sink_location: PathBuf::from("./logs"),
            vips: default_vips(),
        }
    }
}

impl ControllerConfig {
    /// Defaults, then the optional TOML file, then environment overrides.
    /// Not validated: callers layer their own overrides and call `validate`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Parse a TOML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        info!("Loaded controller configuration from {}", path.display());
        Ok(config)
    }

    /// Apply environment variable overrides. Unparsable values are logged and ignored.
    pub fn apply_env(&mut self) {
        if let Some(raw) = get_config_opt(ENV_POLL_INTERVAL) {
            match raw.parse::<f64>() {
                Ok(secs) => self.poll_interval_secs = secs,
                Err(e) => warn!("Ignoring {}={}: {}", ENV_POLL_INTERVAL, raw, e),
            }
        }
        if let Some(path) = get_config_opt(ENV_FIREWALL_RULES) {
            self.rules_source = Some(PathBuf::from(path));
        }
        if let Some(dir) = get_config_opt(ENV_TELEMETRY_DIR) {
            self.sink_location = PathBuf::from(dir);
        }
        if let Some(raw) = get_config_opt(ENV_LISTEN) {
            match raw.parse::<SocketAddr>() {
                Ok(addr) => self.listen = addr,
                Err(e) => warn!("Ignoring {}={}: {}", ENV_LISTEN, raw, e),
            }
        }
    }

    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.poll_interval_secs.is_finite() || self.poll_interval_secs <= 0.0 {
            return Err(Error::config(format!(
                "poll interval must be a positive number of seconds, got {}",
                self.poll_interval_secs
            )));
        }
        for (i, vip) in self.vips.iter().enumerate() {
            if self.vips[..i].iter().any(|other| other.ip == vip.ip) {
                return Err(Error::config(format!("VIP {} configured twice", vip.ip)));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_env_line_simple() {
        let (k, v) = parse_env_line("POLL_INTERVAL=5").unwrap();
        assert_eq!(k, "POLL_INTERVAL");
        assert_eq!(v, "5");
    }

    #[test]
    fn test_parse_env_line_quoted() {
        let (k, v) = parse_env_line("TELEM_LOG_DIR=\"/var/log/flow ctl\"").unwrap();
        assert_eq!(k, "TELEM_LOG_DIR");
        assert_eq!(v, "/var/log/flow ctl");

        let (_, v) = parse_env_line("FIREWALL_RULES='rules.json'").unwrap();
        assert_eq!(v, "rules.json");
    }

    #[test]
    fn test_parse_env_line_empty() {
        assert!(parse_env_line("").is_none());
        assert!(parse_env_line("=value").is_none());
    }

    #[test]
    fn test_credentials_are_masked() {
        assert_eq!(masked("API_KEY", "abc123"), "***");
        assert_eq!(masked("SWITCH_TOKEN", "abc123"), "***");
        assert_eq!(masked("SINK_SECRET", "abc123"), "***");
        assert_eq!(masked(ENV_POLL_INTERVAL, "5"), "5");
    }

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.listen.port(), 6653);
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert!(config.rules_source.is_none());
        assert_eq!(config.sink_location, PathBuf::from("./logs"));
        assert_eq!(config.vips.len(), 1);
        assert_eq!(config.vips[0].ip, Ipv4Addr::new(10, 0, 1, 100));
        assert_eq!(config.vips[0].backends.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
poll_interval_secs = 0.5
rules_source = "/etc/flowctl/rules.json"
sink_location = "/tmp/telemetry"

[[vips]]
ip = "192.168.10.10"
mac = "02:00:00:00:00:10"
backends = [
    {{ ip = "192.168.10.1" }},
    {{ ip = "192.168.10.2", mac = "02:00:00:00:00:02" }},
]
"#
        )
        .unwrap();

        let config = ControllerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(
            config.rules_source,
            Some(PathBuf::from("/etc/flowctl/rules.json"))
        );
        assert_eq!(config.vips.len(), 1);
        assert_eq!(config.vips[0].backends[0].mac, None);
        assert_eq!(
            config.vips[0].backends[1].mac,
            Some(MacAddr::new(2, 0, 0, 0, 0, 2))
        );
        // listen was not in the file and keeps its default
        assert_eq!(config.listen.port(), 6653);
    }

    #[test]
    fn test_load_leaves_validation_to_the_caller() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "poll_interval_secs = 0.0").unwrap();

        let mut config = ControllerConfig::load(Some(file.path())).unwrap();
        assert!(config.validate().is_err());

        // a later override repairs the value before validation
        config.poll_interval_secs = 2.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_rejects_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "poll_interval = 3").unwrap();
        assert!(ControllerConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = ControllerConfig::default();
        config.poll_interval_secs = 0.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = ControllerConfig::default();
        let dup = config.vips[0].clone();
        config.vips.push(dup);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
