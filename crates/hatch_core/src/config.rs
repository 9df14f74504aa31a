//! Loader configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(120);

pub const ENV_CHUNK_TIMEOUT_MS: &str = "HATCH_CHUNK_TIMEOUT_MS";
pub const ENV_SCRIPT_NONCE: &str = "HATCH_SCRIPT_NONCE";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoaderConfig {
    /// How long a chunk script may take before the load fails.
    pub chunk_timeout_ms: u64,
    pub script_charset: String,
    /// CSP nonce handed to the script transport.
    pub script_nonce: Option<String>,
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            chunk_timeout_ms: millis(DEFAULT_CHUNK_TIMEOUT),
            script_charset: "utf-8".to_string(),
            script_nonce: None,
        }
    }
}

impl LoaderConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout_ms = millis(timeout);
        self
    }

    pub fn with_script_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.script_nonce = Some(nonce.into());
        self
    }

    /// Defaults overridden by `HATCH_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            match key.as_ref() {
                ENV_CHUNK_TIMEOUT_MS => {
                    let value: String = value.into();
                    config.chunk_timeout_ms = value
                        .trim()
                        .parse()
                        .with_context(|| format!("{}={:?} is not a millisecond count", ENV_CHUNK_TIMEOUT_MS, value))?;
                }
                ENV_SCRIPT_NONCE => config.script_nonce = Some(value.into()),
                _ => {}
            }
        }
        Ok(config)
    }
}
