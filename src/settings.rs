//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment
//! variables. An example configuration file lives at `configs/coordinator.toml`
//! in the repository root.

use std::{fmt, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationErrors};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named
/// settings field.
pub struct Settings {
    #[serde(default)]
    pub log: LoggingSettings,
    #[validate]
    #[serde(default)]
    pub protocol: ProtocolSettings,
    #[validate]
    #[serde(default)]
    pub pricing: PricingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation
    /// failed.
    pub fn new(path: PathBuf) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: PathBuf) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("fedmarket").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Round-orchestration protocol settings.
pub struct ProtocolSettings {
    #[validate(range(min = 1))]
    /// How often, in seconds, a session coordinator re-reads the store while
    /// waiting for a predicate to hold.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// poll_interval_secs = 5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMARKET_PROTOCOL__POLL_INTERVAL_SECS=5
    /// ```
    #[serde(default = "defaults::poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[validate(range(min = 1))]
    /// How long, in seconds, the coordinator waits for the admin's price
    /// decision before aborting the session. This is the only bounded wait of
    /// the protocol.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// price_timeout_secs = 300
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMARKET_PROTOCOL__PRICE_TIMEOUT_SECS=300
    /// ```
    #[serde(default = "defaults::price_timeout_secs")]
    pub price_timeout_secs: u64,

    /// Length, in minutes, of the join-decision window granted to invited
    /// clients, measured from session creation.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// join_window_mins = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMARKET_PROTOCOL__JOIN_WINDOW_MINS=10
    /// ```
    #[serde(default = "defaults::join_window_mins")]
    pub join_window_mins: i64,

    #[validate(range(min = 1))]
    /// Number of training rounds a new session runs.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// max_round = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMARKET_PROTOCOL__MAX_ROUND=3
    /// ```
    #[serde(default = "defaults::max_round")]
    pub max_round: u32,
}

impl ProtocolSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn price_timeout(&self) -> Duration {
        Duration::from_secs(self.price_timeout_secs)
    }

    pub fn join_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.join_window_mins)
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: defaults::poll_interval_secs(),
            price_timeout_secs: defaults::price_timeout_secs(),
            join_window_mins: defaults::join_window_mins(),
            max_round: defaults::max_round(),
        }
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Statistical parameters of the sample-size pricing.
pub struct PricingSettings {
    #[validate(range(min = 0.0001, max = 0.5))]
    /// Significance level of the two-sample comparison, before the Bonferroni
    /// correction by the number of predictors.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [pricing]
    /// alpha = 0.05
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMARKET_PRICING__ALPHA=0.05
    /// ```
    #[serde(default = "defaults::alpha")]
    pub alpha: f64,

    #[validate(range(min = 0.5, max = 0.9999))]
    /// Statistical power the required sample size must achieve.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [pricing]
    /// power = 0.80
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMARKET_PRICING__POWER=0.80
    /// ```
    #[serde(default = "defaults::power")]
    pub power: f64,
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            alpha: defaults::alpha(),
            power: defaults::power(),
        }
    }
}

mod defaults {
    pub fn poll_interval_secs() -> u64 {
        5
    }
    pub fn price_timeout_secs() -> u64 {
        300
    }
    pub fn join_window_mins() -> i64 {
        10
    }
    pub fn max_round() -> u32 {
        3
    }
    pub fn alpha() -> f64 {
        0.05
    }
    pub fn power() -> f64 {
        0.80
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMARKET_LOG__FILTER=info
    /// ```
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: EnvFilter::new("info"),
        }
    }
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
