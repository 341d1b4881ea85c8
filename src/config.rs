//! Module for configuring how guests are hosted.

use anyhow::{bail, Context, Result};
use log::{trace, warn};
use serde::{
    de::{self, Deserializer},
    Deserialize,
};
use std::fmt::Debug;
use std::fs;
use std::path::Path;
use std::time::Duration;

// wrapped, so we have a named section in the file
#[derive(serde_derive::Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    faaslet: Config,
}

/// Settings shared by every module hosted in this process.
#[derive(serde_derive::Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(
        default = "default_capture_stdout",
        rename = "capture-stdout",
        deserialize_with = "deserialize_on_off"
    )]
    capture_stdout: bool,
    #[serde(default = "default_thread_pool_size", rename = "thread-pool-size")]
    thread_pool_size: usize,
    #[serde(
        default = "default_thread_result_timeout",
        rename = "thread-result-timeout",
        deserialize_with = "deserialize_millis"
    )]
    thread_result_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture_stdout: default_capture_stdout(),
            thread_pool_size: default_thread_pool_size(),
            thread_result_timeout: default_thread_result_timeout(),
        }
    }
}

const fn default_capture_stdout() -> bool {
    false
}

fn default_thread_pool_size() -> usize {
    num_cpus::get()
}

const fn default_thread_result_timeout() -> Duration {
    Duration::from_millis(60_000)
}

fn parse_on_off(text: &str) -> Option<bool> {
    match text.trim() {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

fn deserialize_on_off<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_on_off(&text).ok_or_else(|| de::Error::custom("expected \"on\" or \"off\""))
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

impl Config {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from the TOML file at `path`.
    ///
    /// The file must contain a `[faaslet]` table; missing keys take their
    /// defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        trace!("loading config from {}", path.display());
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config = toml::from_str::<ConfigFile>(contents)?.faaslet;
        config.validate()?;
        Ok(config)
    }

    /// Builds configuration from `CAPTURE_STDOUT`, `THREAD_POOL_SIZE` and
    /// `CHAINED_CALL_TIMEOUT` (milliseconds), defaulting whatever is unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup("CAPTURE_STDOUT") {
            match parse_on_off(&value) {
                Some(on) => config.capture_stdout = on,
                None => warn!("ignoring CAPTURE_STDOUT={value:?}, expected on or off"),
            }
        }
        if let Some(value) = lookup("THREAD_POOL_SIZE") {
            config.thread_pool_size = value
                .trim()
                .parse()
                .with_context(|| format!("invalid THREAD_POOL_SIZE {value:?}"))?;
        }
        if let Some(value) = lookup("CHAINED_CALL_TIMEOUT") {
            let millis: u64 = value
                .trim()
                .parse()
                .with_context(|| format!("invalid CHAINED_CALL_TIMEOUT {value:?}"))?;
            config.thread_result_timeout = Duration::from_millis(millis);
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.thread_pool_size == 0 {
            bail!("thread-pool-size must be at least 1");
        }
        Ok(())
    }

    /// Whether guest stdout is captured and returned with the output.
    pub fn capture_stdout(&self) -> bool {
        self.capture_stdout
    }

    /// Number of guest thread stacks each module provisions.
    pub fn thread_pool_size(&self) -> usize {
        self.thread_pool_size
    }

    /// How long to wait on the scheduler for a thread's result.
    pub fn thread_result_timeout(&self) -> Duration {
        self.thread_result_timeout
    }

    /// Enables or disables stdout capture.
    pub fn with_capture_stdout(&mut self, enable: bool) -> &mut Self {
        self.capture_stdout = enable;
        self
    }

    /// Sets the number of guest thread stacks. Zero is clamped to one.
    pub fn with_thread_pool_size(&mut self, size: usize) -> &mut Self {
        self.thread_pool_size = size.max(1);
        self
    }

    /// Sets the thread result timeout.
    pub fn with_thread_result_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.thread_result_timeout = timeout;
        self
    }
}
