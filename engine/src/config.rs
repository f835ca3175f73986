//! Engine configuration.
//!
//! Parsed from TOML by the embedder and handed to [`Decoder`] and
//! [`VideoOutput`] at creation time. Every field has a default so an empty
//! document is a valid configuration.
//!
//! [`Decoder`]: crate::decoder::Decoder
//! [`VideoOutput`]: crate::vout::VideoOutput

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Dolby-Surround handling for stereo audio streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DolbyOverride {
    /// Trust the stream's own signalling.
    #[default]
    Auto,
    /// Force Dolby-Surround decoding of stereo pairs.
    On,
    /// Force plain stereo.
    Off,
}

/// Engine-wide tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Dolby-Surround override applied when a stereo audio sink is
    /// negotiated.
    #[serde(default)]
    pub force_dolby_surround: DolbyOverride,

    /// Rewrite the broken 1088-line HDTV geometry to 1080 visible lines.
    #[serde(default = "default_hdtv_fix")]
    pub hdtv_fix: bool,

    /// Scale pictures up to the output size. When off, smaller pictures are
    /// centred unscaled.
    #[serde(default = "default_scale")]
    pub scale: bool,

    /// Overlay playback statistics on the output.
    #[serde(default)]
    pub show_stats: bool,

    /// Overlay the interface band on the output.
    #[serde(default)]
    pub show_interface: bool,

    /// Seconds between periodic statistics log lines.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            force_dolby_surround: DolbyOverride::default(),
            hdtv_fix: default_hdtv_fix(),
            scale: default_scale(),
            show_stats: false,
            show_interface: false,
            stats_interval_secs: default_stats_interval(),
        }
    }
}

fn default_hdtv_fix() -> bool {
    true
}
fn default_scale() -> bool {
    true
}
fn default_stats_interval() -> u64 {
    3
}

impl EngineConfig {
    /// Parse a configuration from a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse engine configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.force_dolby_surround, DolbyOverride::Auto);
        assert!(config.hdtv_fix);
        assert!(config.scale);
        assert!(!config.show_stats);
        assert_eq!(config.stats_interval_secs, 3);
    }

    #[test]
    fn test_parse_overrides() {
        let text = r#"
            force_dolby_surround = "on"
            hdtv_fix = false
            show_stats = true
            stats_interval_secs = 10
        "#;
        let config = EngineConfig::from_toml_str(text).unwrap();
        assert_eq!(config.force_dolby_surround, DolbyOverride::On);
        assert!(!config.hdtv_fix);
        assert!(config.show_stats);
        assert_eq!(config.stats_interval_secs, 10);
    }

    #[test]
    fn test_invalid_document_is_rejected() {
        assert!(EngineConfig::from_toml_str("force_dolby_surround = 3").is_err());
    }
}
