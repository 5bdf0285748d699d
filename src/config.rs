//! Daemon settings, read from `configuration/configuration.json`:
//!
//! ```json
//! { "settings": { "ip": "192.168.0.3", "port": 8443, "token": "...", ... } }
//! ```

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Deserializer};

use crate::scheduler::ThresholdPolicy;

const MAX_SETTINGS_FILE_BYTES: u64 = 20 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is larger than {} bytes", .path.display(), MAX_SETTINGS_FILE_BYTES)]
    TooLarge { path: PathBuf },
    #[error("invalid settings JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Deserialize)]
struct SettingsFile {
    settings: Settings,
}

#[derive(Clone, Deserialize)]
pub struct Settings {
    pub ip: IpAddr,
    pub port: u16,
    /// Public base URL of this service, always ending in `/`.
    pub external_url: String,
    pub https_private_key: PathBuf,
    pub https_public_cert: PathBuf,
    pub token: String,

    pub gitlab_url: String,
    pub gitlab_api_token: String,
    /// CA certificate for a self-signed GitLab instance.
    #[serde(default)]
    pub gitlab_https_public_cert: Option<PathBuf>,
    #[serde(default = "default_gitlab_group")]
    pub gitlab_group: String,

    #[serde(default = "default_feed_title")]
    pub feed_title: String,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_feed_state_path")]
    pub feed_state_path: PathBuf,
    #[serde(default = "default_resources_dir")]
    pub resources_dir: PathBuf,

    #[serde(default = "default_poll_interval_minutes")]
    pub poll_interval_minutes: u64,
    #[serde(default = "default_startup_delay_seconds")]
    pub startup_delay_seconds: u64,
    #[serde(default)]
    pub threshold_policy: ThresholdPolicy,
    #[serde(default = "default_timezone", deserialize_with = "deserialize_tz")]
    pub timezone: Tz,

    #[serde(default = "default_max_connections_per_peer")]
    pub max_connections_per_peer: usize,
    /// Relaxes connection limits so test harnesses can reconnect rapidly.
    #[serde(default)]
    pub fuzzing: bool,
}

fn default_gitlab_group() -> String {
    "home".to_string()
}

fn default_feed_title() -> String {
    "My Feed".to_string()
}

fn default_author_name() -> String {
    "My Name".to_string()
}

fn default_feed_state_path() -> PathBuf {
    PathBuf::from("feed_data/feed.json")
}

fn default_resources_dir() -> PathBuf {
    PathBuf::from("resources")
}

fn default_poll_interval_minutes() -> u64 {
    30
}

fn default_startup_delay_seconds() -> u64 {
    30
}

fn default_timezone() -> Tz {
    Tz::UTC
}

fn default_max_connections_per_peer() -> usize {
    10
}

fn deserialize_tz<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Tz, D::Error> {
    let name = String::deserialize(deserializer)?;
    name.parse::<Tz>()
        .map_err(|e| serde::de::Error::custom(format!("unknown timezone {name:?}: {e}")))
}

const REDACTED: &str = "<redacted>";

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("external_url", &self.external_url)
            .field("https_private_key", &self.https_private_key)
            .field("https_public_cert", &self.https_public_cert)
            .field("token", &REDACTED)
            .field("gitlab_url", &self.gitlab_url)
            .field("gitlab_api_token", &REDACTED)
            .field("gitlab_https_public_cert", &self.gitlab_https_public_cert)
            .field("gitlab_group", &self.gitlab_group)
            .field("feed_title", &self.feed_title)
            .field("author_name", &self.author_name)
            .field("feed_state_path", &self.feed_state_path)
            .field("resources_dir", &self.resources_dir)
            .field("poll_interval_minutes", &self.poll_interval_minutes)
            .field("startup_delay_seconds", &self.startup_delay_seconds)
            .field("threshold_policy", &self.threshold_policy)
            .field("timezone", &self.timezone)
            .field("max_connections_per_peer", &self.max_connections_per_peer)
            .field("fuzzing", &self.fuzzing)
            .finish()
    }
}

impl Settings {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let read_err = |source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(read_err)?;
        let mut contents = String::new();
        file.take(MAX_SETTINGS_FILE_BYTES + 1)
            .read_to_string(&mut contents)
            .map_err(read_err)?;
        if contents.len() as u64 > MAX_SETTINGS_FILE_BYTES {
            return Err(ConfigError::TooLarge {
                path: path.to_path_buf(),
            });
        }

        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: SettingsFile = serde_json::from_str(json)?;
        let mut settings = file.settings;
        settings.validate()?;

        if !settings.external_url.ends_with('/') {
            settings.external_url.push('/');
        }
        if !settings.gitlab_url.ends_with('/') {
            settings.gitlab_url.push('/');
        }
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("external_url", self.external_url.is_empty()),
            ("https_private_key", self.https_private_key.as_os_str().is_empty()),
            ("https_public_cert", self.https_public_cert.as_os_str().is_empty()),
            ("token", self.token.is_empty()),
            ("gitlab_url", self.gitlab_url.is_empty()),
            ("gitlab_api_token", self.gitlab_api_token.is_empty()),
            ("gitlab_group", self.gitlab_group.is_empty()),
        ];
        if let Some((name, _)) = required.iter().find(|(_, empty)| *empty) {
            return Err(ConfigError::Invalid(format!("{name} must not be empty")));
        }

        if self.port == 0 {
            return Err(ConfigError::Invalid("port must not be 0".to_string()));
        }
        if self.poll_interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_minutes must be at least 1".to_string(),
            ));
        }
        if self.max_connections_per_peer == 0 {
            return Err(ConfigError::Invalid(
                "max_connections_per_peer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Link advertised by the feed itself.
    pub fn feed_link(&self) -> String {
        format!("{}feed/atom.xml", self.external_url)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_minutes * 60)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_seconds)
    }
}
