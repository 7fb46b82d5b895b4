//! Core configuration: ports, timeouts, and the persistence directory.
//!
//! Follows the teacher's `Config::load_from_dir` pattern
//! (`GUI/src/runtime/config.rs`): on first run, write a commented default
//! template instead of failing, so the host can inspect and edit it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_discovery_port() -> u16 {
    1716
}

fn default_tcp_port_range() -> (u16, u16) {
    (1714, 1764)
}

fn default_payload_port_range() -> (u16, u16) {
    (1739, 1764)
}

fn default_discovery_interval_secs() -> u64 {
    30
}

fn default_peer_rate_limit_secs() -> u64 {
    5
}

fn default_pairing_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_payload_accept_timeout_secs() -> u64 {
    30
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub device_name: String,

    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    #[serde(default = "default_tcp_port_range")]
    pub tcp_port_range: (u16, u16),

    #[serde(default = "default_payload_port_range")]
    pub payload_port_range: (u16, u16),

    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,

    #[serde(default = "default_peer_rate_limit_secs")]
    pub peer_rate_limit_secs: u64,

    #[serde(default = "default_pairing_timeout_secs")]
    pub pairing_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_payload_accept_timeout_secs")]
    pub payload_accept_timeout_secs: u64,

    /// Upper bound on a single JSON packet frame, excluding payload bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            device_name: hostname_fallback(),
            discovery_port: default_discovery_port(),
            tcp_port_range: default_tcp_port_range(),
            payload_port_range: default_payload_port_range(),
            discovery_interval_secs: default_discovery_interval_secs(),
            peer_rate_limit_secs: default_peer_rate_limit_secs(),
            pairing_timeout_secs: default_pairing_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            payload_accept_timeout_secs: default_payload_accept_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl CoreConfig {
    /// Load `config.toml` from `base_dir`, writing a commented default
    /// template and returning it unmodified if the file doesn't exist yet.
    pub fn load_from_dir(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir)
            .with_context(|| format!("creating config dir {:?}", base_dir))?;
        let config_path = base_dir.join("config.toml");
        if !config_path.exists() {
            let default = Self::default();
            let template = format!(
                "# cosmic-connect-core configuration\n\
                 device_name = \"{}\"\n\
                 discovery_port = {}\n\
                 # tcp_port_range = [1714, 1764]\n\
                 # payload_port_range = [1739, 1764]\n\
                 # discovery_interval_secs = {}\n\
                 # peer_rate_limit_secs = {}\n\
                 # pairing_timeout_secs = {}\n\
                 # connect_timeout_secs = {}\n\
                 # payload_accept_timeout_secs = {}\n\
                 # max_frame_bytes = {}\n",
                default.device_name,
                default.discovery_port,
                default.discovery_interval_secs,
                default.peer_rate_limit_secs,
                default.pairing_timeout_secs,
                default.connect_timeout_secs,
                default.payload_accept_timeout_secs,
                default.max_frame_bytes,
            );
            fs::write(&config_path, template)
                .with_context(|| format!("writing default config to {:?}", config_path))?;
            return Ok(default);
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("reading config file {:?}", config_path))?;
        toml::from_str(&content).with_context(|| format!("parsing config file {:?}", config_path))
    }

    pub fn save_to_dir(&self, base_dir: &Path) -> Result<()> {
        fs::create_dir_all(base_dir)?;
        let config_path = base_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        let tmp_path = base_dir.join("config.toml.tmp");
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }

    /// The default persistence directory used when the host doesn't supply
    /// one explicitly (`~/.local/share/cosmic-connect` on Linux, etc., via
    /// the `dirs` crate — same resolution strategy the teacher uses for its
    /// own app config directory).
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("cosmic-connect")
    }
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "cosmic-connect-device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.discovery_port, 1716);
        assert_eq!(cfg.tcp_port_range, (1714, 1764));
        assert_eq!(cfg.payload_port_range, (1739, 1764));
        assert_eq!(cfg.pairing_timeout_secs, 30);
        assert_eq!(cfg.connect_timeout_secs, 10);
        assert_eq!(cfg.payload_accept_timeout_secs, 30);
        assert_eq!(cfg.max_frame_bytes, 1024 * 1024);
    }

    #[test]
    fn load_from_dir_writes_template_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CoreConfig::load_from_dir(dir.path()).unwrap();
        assert!(dir.path().join("config.toml").exists());
        assert_eq!(cfg.discovery_port, 1716);

        // Second load reads back what was written, not a fresh default.
        let mut edited = cfg.clone();
        edited.device_name = "edited".into();
        edited.save_to_dir(dir.path()).unwrap();
        let reloaded = CoreConfig::load_from_dir(dir.path()).unwrap();
        assert_eq!(reloaded.device_name, "edited");
    }
}