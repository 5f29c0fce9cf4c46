//! Run configuration
//!
//! Settings come from two layers: an optional JSON5 file and the command
//! line. The file supplies defaults, CLI flags win. Secrets (password, API
//! key, token) are only accepted from the command line; a config file that
//! names one is rejected.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::fuzz::{FuzzSettings, DEFAULT_DURATION, DEFAULT_EXCLUDE, DEFAULT_TIMEOUT};
use crate::logging::{LogFormat, DEFAULT_LOG_LEVEL};
use crate::request::Credentials;

pub const DEFAULT_OUTPUT_DIR: &str = "fuzzer_output";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Invalid duration '{0}' (expected e.g. 500ms, 30s, 15m, 1h30m)")]
    InvalidDuration(String),

    #[error("Invalid exclusion pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),
}

/// One settings layer. Every field is optional so layers can be stacked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<PathBuf>,

    /// Target base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Artifact directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detailed: Option<bool>,

    /// Wall-clock budget, e.g. `30m`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// Per-request timeout, e.g. `10s`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Regex over path templates that are never fuzzed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<bool>,
}

impl FileConfig {
    /// Read a JSON5 config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&raw).map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })?;
        debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        json5::from_str(raw).map_err(|e| e.to_string())
    }

    /// Stack `over` on top of `self`; fields set in `over` win
    pub fn merge(self, over: FileConfig) -> FileConfig {
        FileConfig {
            spec: over.spec.or(self.spec),
            url: over.url.or(self.url),
            username: over.username.or(self.username),
            output: over.output.or(self.output),
            detailed: over.detailed.or(self.detailed),
            duration: over.duration.or(self.duration),
            timeout: over.timeout.or(self.timeout),
            exclude: over.exclude.or(self.exclude),
            login_path: over.login_path.or(self.login_path),
            seed: over.seed.or(self.seed),
            log_level: over.log_level.or(self.log_level),
            log_format: over.log_format.or(self.log_format),
            progress: over.progress.or(self.progress),
        }
    }

    /// Apply defaults and validate
    pub fn resolve(self, secrets: Secrets) -> Result<RunConfig, ConfigError> {
        let spec = self.spec.ok_or(ConfigError::Missing("spec"))?;
        let url = self
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::Missing("url"))?;

        let duration = match self.duration.as_deref() {
            Some(raw) => parse_duration(raw)?,
            None => DEFAULT_DURATION,
        };
        let timeout = match self.timeout.as_deref() {
            Some(raw) => parse_duration(raw)?,
            None => DEFAULT_TIMEOUT,
        };
        let pattern = self.exclude.unwrap_or_else(|| DEFAULT_EXCLUDE.to_string());
        let exclude = Regex::new(&pattern).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;

        Ok(RunConfig {
            spec,
            url,
            credentials: Credentials {
                username: self.username,
                password: secrets.password,
                api_key: secrets.api_key,
                token: secrets.token,
            },
            output: self
                .output
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            login_path: self.login_path,
            log_level: self
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            log_format: self.log_format.unwrap_or_default(),
            settings: FuzzSettings {
                duration,
                detailed: self.detailed.unwrap_or(false),
                exclude,
                timeout,
                progress: self.progress.unwrap_or(true),
                seed: self.seed,
            },
        })
    }
}

/// Command-line-only settings
#[derive(Clone, Default)]
pub struct Secrets {
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub token: Option<String>,
}

/// Fully resolved settings for one run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub spec: PathBuf,
    pub url: String,
    pub credentials: Credentials,
    pub output: PathBuf,
    pub login_path: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
    pub settings: FuzzSettings,
}

/// Parse `500ms`, `30s`, `15m`, `2h`, compounds like `1h30m`, or a bare
/// number of seconds
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let input = raw.trim();
    let invalid = || ConfigError::InvalidDuration(raw.to_string());

    if input.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            _ => return Err(invalid()),
        };
        total = total.saturating_add(part);
        rest = &rest[unit_len..];
    }

    Ok(total)
}
