use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trust::{TrustConfig, VerifyMode};
use crate::types::ProxySettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read settings {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("cannot write settings {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("settings {} are not valid TOML: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("cannot serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    /// Extra root certificate; empty means none.
    pub certificate_path: String,
    pub target_verify: VerifyMode,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            certificate_path: String::new(),
            target_verify: VerifyMode::Peer,
        }
    }
}

/// Everything that survives between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub proxy: ProxySection,
    pub tls: TlsSection,
    pub last_url: String,
    pub timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            proxy: ProxySection::default(),
            tls: TlsSection::default(),
            last_url: "https://example.com".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Like [`Settings::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("no settings at {}, using defaults", path.display());
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source: io::Error| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(write_err)?;
        debug!("saved settings to {}", path.display());
        Ok(())
    }

    pub fn reset_to_defaults(&mut self) {
        *self = Self::default();
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        let proxy = ProxySettings::new(&self.proxy.host, self.proxy.port);
        if self.proxy.username.is_empty() {
            proxy
        } else {
            proxy.with_credentials(&self.proxy.username, &self.proxy.password)
        }
    }

    pub fn trust_config(&self) -> TrustConfig {
        let custom_root = Some(self.tls.certificate_path.trim())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        TrustConfig {
            target_verify: self.tls.target_verify,
            ..TrustConfig::default()
        }
        .with_custom_root(custom_root)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
