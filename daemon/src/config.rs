//! Configuration management (TOML)

use crate::monitor::DEFAULT_SAMPLE_INTERVAL;
use crate::notifier::{Recipient, SecurityMode, TransportConfig, DEFAULT_TIMEOUT};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub notifiers: NotifiersConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub sample_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifiersConfig {
    pub mail: MailConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
    /// `""` (plain), `"tls"` (STARTTLS) or `"ssl"` (implicit TLS).
    pub smtp_crypto: String,
    pub timeout_secs: u64,
    pub accept_invalid_certs: bool,
    pub helo_name: String,
    pub destinations: Vec<Destination>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Destination {
    #[serde(default)]
    pub name: String,
    pub email: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            sample_interval_secs: DEFAULT_SAMPLE_INTERVAL.as_secs(),
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        MailConfig {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: 25,
            smtp_user: String::new(),
            smtp_password: String::new(),
            smtp_crypto: String::new(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            accept_invalid_certs: false,
            helo_name: "localhost".to_string(),
            destinations: vec![],
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.sample_interval_secs == 0 {
            return Err(invalid("general.sample_interval_secs must be at least 1"));
        }
        self.notifiers.mail.validate()
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.general.sample_interval_secs)
    }

    pub fn config_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "hogwatch")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }
}

impl MailConfig {
    /// Only an enabled notifier is checked.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        self.smtp_crypto
            .parse::<SecurityMode>()
            .map_err(|e| invalid(&format!("notifiers.mail.smtp_crypto: {e}")))?;
        if self.smtp_host.trim().is_empty() {
            return Err(invalid("notifiers.mail.smtp_host is empty"));
        }
        if self.smtp_port == 0 {
            return Err(invalid("notifiers.mail.smtp_port must be non-zero"));
        }
        if self.smtp_user.chars().any(char::is_control) {
            return Err(invalid("notifiers.mail.smtp_user contains control characters"));
        }
        if self.helo_name.is_empty()
            || self
                .helo_name
                .chars()
                .any(|c| c.is_control() || c.is_whitespace())
        {
            return Err(invalid(
                "notifiers.mail.helo_name must be a single word without control characters",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(invalid("notifiers.mail.timeout_secs must be at least 1"));
        }
        if self.destinations.is_empty() {
            return Err(invalid("notifiers.mail.destinations is empty"));
        }
        for dest in &self.destinations {
            if !is_plausible_address(&dest.email) {
                return Err(invalid(&format!(
                    "notifiers.mail.destinations: bad email address {:?}",
                    dest.email
                )));
            }
        }
        Ok(())
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            host: self.smtp_host.clone(),
            port: self.smtp_port,
            username: self.smtp_user.clone(),
            password: self.smtp_password.clone(),
            security: self.smtp_crypto.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            accept_invalid_certs: self.accept_invalid_certs,
            helo_name: self.helo_name.clone(),
        }
    }

    pub fn recipients(&self) -> Vec<Recipient> {
        self.destinations
            .iter()
            .map(|d| Recipient {
                name: d.name.clone(),
                email: d.email.clone(),
            })
            .collect()
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}

/// Addresses end up in SMTP commands and headers, so anything that could
/// break a line or an angle-bracket path is refused.
fn is_plausible_address(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !email.chars().any(|c| {
                    c.is_whitespace() || c.is_control() || c == '<' || c == '>' || c == ','
                })
        }
        None => false,
    }
}
