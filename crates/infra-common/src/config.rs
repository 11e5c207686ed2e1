//! Layered configuration loading.
//!
//! Configuration structs across the workspace derive `Deserialize` with
//! `#[serde(default)]`, so any source may specify only the keys it cares about.
//! Layers are applied in order: optional TOML file, then environment variables
//! (`<PREFIX>__SECTION__KEY=value`).

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::errors::types::Result;

/// Default environment prefix for peerlink configuration overrides
pub const DEFAULT_ENV_PREFIX: &str = "PEERLINK";

/// Load a configuration value from an optional TOML file plus environment overrides
pub fn load_config<T: DeserializeOwned>(path: Option<&Path>, env_prefix: &str) -> Result<T> {
    let mut builder = Config::builder();

    if let Some(path) = path {
        debug!("Loading configuration file {}", path.display());
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(env_prefix)
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}

/// Parse a configuration value from an inline TOML document
pub fn from_toml_str<T: DeserializeOwned>(document: &str) -> Result<T> {
    Ok(toml::from_str(document)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        name: String,
        retries: u32,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self { name: "default".into(), retries: 3 }
        }
    }

    #[test]
    fn inline_toml_fills_missing_keys_from_default() {
        let sample: Sample = from_toml_str("retries = 9").unwrap();
        assert_eq!(sample, Sample { name: "default".into(), retries: 9 });
    }

    #[test]
    fn file_layer_is_loaded() {
        let path = std::env::temp_dir().join(format!("peerlink-config-{}.toml", std::process::id()));
        std::fs::write(&path, "name = \"from-file\"\n").unwrap();

        let sample: Sample = load_config(Some(&path), "PEERLINK_CONFIG_TEST_UNUSED").unwrap();
        assert_eq!(sample.name, "from-file");
        assert_eq!(sample.retries, 3);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = std::env::temp_dir().join("peerlink-config-does-not-exist.toml");
        let result: Result<Sample> = load_config(Some(&path), DEFAULT_ENV_PREFIX);
        assert!(result.is_err());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let result: Result<Sample> = from_toml_str("retries = [");
        assert!(result.is_err());
    }
}
