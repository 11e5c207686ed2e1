//! Session configuration
//!
//! One [`SessionConfig`] bundles the settings of every layer a session
//! drives. All sections default, so a TOML document only names what it
//! changes:
//!
//! ```toml
//! close_grace_ms = 250
//!
//! [ice]
//! stun_servers = ["stun.example.org:3478"]
//!
//! [media]
//! report_interval_ms = 500
//! ```

use std::path::Path;
use std::time::Duration;

use ice_core::IceConfig;
use infra_common::config::{from_toml_str, load_config, DEFAULT_ENV_PREFIX};
use infra_common::errors::ErrorExt;
use media_core::MediaConfig;
use rtp_core::DtlsConfig;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SessionError};
use crate::sdp::CodecPreferences;

/// Configuration of one peer session. Durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ice: IceConfig,
    pub dtls: DtlsConfig,
    pub media: MediaConfig,
    pub codecs: CodecPreferences,

    /// Grace period for session tasks to stop on close
    pub close_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice: IceConfig::default(),
            dtls: DtlsConfig::default(),
            media: MediaConfig::default(),
            codecs: CodecPreferences::default(),
            close_grace_ms: 500,
        }
    }
}

impl SessionConfig {
    /// Sessions talking to each other over the loopback interface
    pub fn loopback() -> Self {
        Self {
            ice: IceConfig::loopback(),
            ..Default::default()
        }
    }

    /// Parse an inline TOML document
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let config: Self = from_toml_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional TOML file with `PEERLINK__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = load_config::<Self>(path, DEFAULT_ENV_PREFIX).with_context("session", "load_config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_ice(mut self, ice: IceConfig) -> Self {
        self.ice = ice;
        self
    }

    pub fn with_dtls(mut self, dtls: DtlsConfig) -> Self {
        self.dtls = dtls;
        self
    }

    pub fn with_media(mut self, media: MediaConfig) -> Self {
        self.media = media;
        self
    }

    pub fn with_codecs(mut self, codecs: CodecPreferences) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.ice.validate()?;
        self.media.validate()?;
        if self.dtls.srtp_profiles.is_empty() {
            return Err(SessionError::config("At least one SRTP profile is required"));
        }
        if self.codecs.audio.is_empty() && self.codecs.video.is_empty() {
            return Err(SessionError::config("No codecs configured"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_core::Codec;

    #[test]
    fn test_defaults_are_valid() {
        SessionConfig::default().validate().unwrap();
        SessionConfig::loopback().validate().unwrap();
        assert_eq!(SessionConfig::default().close_grace(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_toml() {
        let config = SessionConfig::from_toml_str(
            r#"
            close_grace_ms = 250

            [ice]
            stun_servers = ["stun.example.org:3478"]

            [media]
            report_interval_ms = 500

            [[codecs.audio]]
            payload_type = 0
            name = "PCMU"
            clock_rate = 8000
            "#,
        )
        .unwrap();

        assert_eq!(config.close_grace(), Duration::from_millis(250));
        assert_eq!(config.ice.stun_servers, vec!["stun.example.org:3478".to_string()]);
        assert_eq!(config.media.report_interval_ms, 500);
        assert_eq!(config.codecs.audio, vec![Codec::pcmu()]);
        assert_eq!(config.codecs.video, Codec::defaults_for(media_core::MediaKind::Video));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = SessionConfig::from_toml_str("[dtls]\nsrtp_profiles = []\n");
        assert!(matches!(result, Err(SessionError::Config(_))));

        let result = SessionConfig::from_toml_str("close_grace_ms = \"soon\"");
        assert!(matches!(result, Err(SessionError::Config(_))));
    }
}
