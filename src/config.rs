//! Pipeline configuration loaded from YAML.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::decrypt::CounterPolicy;
use crate::error::{Error, Result};
use crate::license::{DEFAULT_LICENSE_URL, DEFAULT_MAX_ATTEMPTS};

/// Download settings. Every field is optional in the YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// License server used when the stream does not name one.
    pub license_url: Option<String>,
    /// `Origin` header for manifest, segment and license requests.
    pub origin: Option<String>,
    pub user_agent: Option<String>,
    pub license_timeout_secs: u64,
    pub max_license_attempts: u32,
    pub counter_policy: CounterPolicy,
    /// Decrypt the samples of a fragment on the rayon pool.
    pub parallel_decrypt: bool,
    /// Encrypt the client id with the license server's service certificate.
    pub privacy_mode: bool,
    /// Device bundle; discovered when unset.
    pub device_path: Option<PathBuf>,
    /// Accept a manual key even when the stream declares no key id.
    pub accept_unbound_manual_key: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            license_url: None,
            origin: None,
            user_agent: None,
            license_timeout_secs: 30,
            max_license_attempts: DEFAULT_MAX_ATTEMPTS,
            counter_policy: CounterPolicy::default(),
            parallel_decrypt: true,
            privacy_mode: false,
            device_path: None,
            accept_unbound_manual_key: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        // an empty document deserializes as unit, not as a map
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_license_attempts == 0 {
            return Err(Error::Config(
                "max_license_attempts must be at least 1".to_string(),
            ));
        }
        if self.license_timeout_secs == 0 {
            return Err(Error::Config(
                "license_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn license_timeout(&self) -> Duration {
        Duration::from_secs(self.license_timeout_secs)
    }

    #[must_use]
    pub fn license_url(&self) -> &str {
        self.license_url.as_deref().unwrap_or(DEFAULT_LICENSE_URL)
    }
}
