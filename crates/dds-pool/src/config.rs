//! Pool and grooming configuration.

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Credentials presented in the authenticate exchange.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(default = "Credentials::default_algorithm")]
    pub algorithm: String,
}

impl Credentials {
    pub const DEFAULT_ALGORITHM: &'static str = "sha256";

    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            algorithm: Self::DEFAULT_ALGORITHM.to_string(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = algorithm.into();
        self
    }

    fn default_algorithm() -> String {
        Self::DEFAULT_ALGORITHM.to_string()
    }

    /// Body of the `IdAuthHello` request.
    pub(crate) fn auth_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "algorithm": self.algorithm,
            "password": self.password,
            "username": self.username,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "PoolConfig::default_num_slots")]
    pub num_slots: usize,
    #[serde(flatten)]
    pub credentials: Credentials,
}

impl PoolConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            num_slots: Self::default_num_slots(),
            credentials,
        }
    }

    pub fn with_num_slots(mut self, n: usize) -> Self {
        self.num_slots = n;
        self
    }

    fn default_num_slots() -> usize {
        1
    }

    /// Read configuration from `DDS_*` environment variables.
    ///
    /// `DDS_USER` and `DDS_PASS` are required; `DDS_ALGORITHM` and
    /// `DDS_NUM_SLOTS` fall back to their defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let username = std::env::var("DDS_USER").context("DDS_USER is not set")?;
        let password = std::env::var("DDS_PASS").context("DDS_PASS is not set")?;

        let mut credentials = Credentials::new(username, password);
        if let Ok(algorithm) = std::env::var("DDS_ALGORITHM") {
            credentials = credentials.with_algorithm(algorithm);
        }

        let mut config = Self::new(credentials);
        if let Some(n) = env_parse::<usize>("DDS_NUM_SLOTS")? {
            config = config.with_num_slots(n);
        }
        Ok(config)
    }
}

/// Idle-session reclamation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct GroomingConfig {
    /// Sessions idle for longer than this are disconnected.
    #[serde(rename = "lifetime_seconds", with = "seconds", default = "GroomingConfig::default_lifetime")]
    pub lifetime: Duration,
    /// Delay between grooming runs.
    #[serde(rename = "timer_seconds", with = "seconds", default = "GroomingConfig::default_interval")]
    pub interval: Duration,
}

impl Default for GroomingConfig {
    fn default() -> Self {
        Self {
            lifetime: Self::default_lifetime(),
            interval: Self::default_interval(),
        }
    }
}

impl GroomingConfig {
    fn default_lifetime() -> Duration {
        Duration::from_secs(60)
    }

    fn default_interval() -> Duration {
        Duration::from_secs(60)
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(secs) = env_parse::<u64>("DDS_GROOMING_LIFETIME_SECONDS")? {
            config = config.with_lifetime(Duration::from_secs(secs));
        }
        if let Some(secs) = env_parse::<u64>("DDS_GROOMING_INTERVAL_SECONDS")? {
            config = config.with_interval(Duration::from_secs(secs));
        }
        Ok(config)
    }
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(None),
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
