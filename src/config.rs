use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{RelayError, Result};

/// Gateway configuration, loaded from a TOML file. Every field has a default
/// so a minimal config only needs the key lists.
#[derive(Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub vertex_api_keys: Vec<String>,
    /// Caller tokens accepted on the API surface. Empty means open access.
    #[serde(default)]
    pub allowed_tokens: Vec<String>,
    /// Token for the admin endpoints; admin routes are not mounted without it.
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_vertex_base_url")]
    pub vertex_base_url: String,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_test_model")]
    pub test_model: String,
    #[serde(default)]
    pub url_normalization_enabled: bool,
    #[serde(default)]
    pub stream_pacing: PacingSettings,
    #[serde(default)]
    pub key_check: KeyCheckSettings,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            vertex_api_keys: Vec::new(),
            allowed_tokens: Vec::new(),
            admin_token: None,
            base_url: default_base_url(),
            vertex_base_url: default_vertex_base_url(),
            max_failures: default_max_failures(),
            max_retries: default_max_retries(),
            timeout_seconds: default_timeout_seconds(),
            test_model: default_test_model(),
            url_normalization_enabled: false,
            stream_pacing: PacingSettings::default(),
            key_check: KeyCheckSettings::default(),
        }
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("api_keys", &format!("<{} keys>", self.api_keys.len()))
            .field(
                "vertex_api_keys",
                &format!("<{} keys>", self.vertex_api_keys.len()),
            )
            .field(
                "allowed_tokens",
                &format!("<{} tokens>", self.allowed_tokens.len()),
            )
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("vertex_base_url", &self.vertex_base_url)
            .field("max_failures", &self.max_failures)
            .field("max_retries", &self.max_retries)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("test_model", &self.test_model)
            .field("url_normalization_enabled", &self.url_normalization_enabled)
            .field("stream_pacing", &self.stream_pacing)
            .field("key_check", &self.key_check)
            .finish()
    }
}

impl RelayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| RelayError::Config(err.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PacingSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_short_text_threshold")]
    pub short_text_threshold: usize,
    #[serde(default = "default_long_text_threshold")]
    pub long_text_threshold: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for PacingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            short_text_threshold: default_short_text_threshold(),
            long_text_threshold: default_long_text_threshold(),
            chunk_size: default_chunk_size(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyCheckSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_check_interval_seconds")]
    pub interval_seconds: u64,
}

impl Default for KeyCheckSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: default_check_interval_seconds(),
        }
    }
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_vertex_base_url() -> String {
    "https://aiplatform.googleapis.com/v1beta1/publishers/google".to_string()
}

fn default_max_failures() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_test_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_min_delay_ms() -> u64 {
    16
}

fn default_max_delay_ms() -> u64 {
    24
}

fn default_short_text_threshold() -> usize {
    10
}

fn default_long_text_threshold() -> usize {
    50
}

fn default_chunk_size() -> usize {
    5
}

fn default_check_interval_seconds() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = RelayConfig::from_toml_str("api_keys = [\"k1\", \"k2\"]").expect("parse");
        assert_eq!(config.api_keys.len(), 2);
        assert_eq!(config.max_failures, 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.stream_pacing.min_delay_ms, 16);
        assert_eq!(config.stream_pacing.chunk_size, 5);
        assert!(!config.url_normalization_enabled);
        assert!(!config.key_check.enabled);
    }

    #[test]
    fn nested_sections_override_defaults() {
        let raw = concat!(
            "api_keys = [\"k1\"]\n",
            "url_normalization_enabled = true\n",
            "[stream_pacing]\n",
            "enabled = true\n",
            "min_delay_ms = 1\n",
            "max_delay_ms = 2\n",
            "[key_check]\n",
            "enabled = true\n",
            "interval_seconds = 60\n",
        );
        let config = RelayConfig::from_toml_str(raw).expect("parse");
        assert!(config.url_normalization_enabled);
        assert!(config.stream_pacing.enabled);
        assert_eq!(config.stream_pacing.min_delay_ms, 1);
        assert_eq!(config.stream_pacing.max_delay_ms, 2);
        assert_eq!(config.stream_pacing.long_text_threshold, 50);
        assert!(config.key_check.enabled);
        assert_eq!(config.key_check.interval_seconds, 60);
    }

    #[test]
    fn loads_from_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "api_keys = [\"k1\"]\nmax_retries = 5\n").expect("write config");
        let config = RelayConfig::from_path(&path).expect("load");
        assert_eq!(config.max_retries, 5);
        assert!(RelayConfig::from_path(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = RelayConfig {
            api_keys: vec!["secret-key".to_string()],
            admin_token: Some("secret-admin".to_string()),
            ..RelayConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret-key"));
        assert!(!rendered.contains("secret-admin"));
    }
}
