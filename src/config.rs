//! Runtime configuration.
//!
//! Everything is environment-driven (optionally via a `.env` file): the
//! control-plane API key, the SSH key path, the listen address, and the
//! managed label, plus the timing knobs with their spec defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Resolved configuration for the daemon.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane API key.
    pub api_key: String,
    /// SSH private key used for tunnels.
    pub key_path: PathBuf,
    /// Address the proxy listens on.
    pub listen_addr: String,
    /// Label written to claimed instances; `None` disables labelling.
    pub managed_label: Option<String>,
    /// Control-plane poll interval.
    pub poll_interval: Duration,
    /// Supervisor tick interval.
    pub health_interval: Duration,
    /// Minimum spacing between indirect→direct tunnel upgrade attempts.
    pub upgrade_interval: Duration,
    /// Prometheus metrics port; 0 disables the exporter endpoint.
    pub metrics_port: u16,
}

impl Config {
    /// Interpret the configured label value: the literal string `none`
    /// disables labelling.
    pub fn parse_label(raw: &str) -> Option<String> {
        match raw.trim() {
            "" | "none" => None,
            label => Some(label.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_none_disables_labelling() {
        assert_eq!(Config::parse_label("none"), None);
        assert_eq!(Config::parse_label(""), None);
        assert_eq!(Config::parse_label("  none  "), None);
    }

    #[test]
    fn label_value_is_kept() {
        assert_eq!(Config::parse_label("vastmux"), Some("vastmux".to_string()));
    }
}
