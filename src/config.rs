//! Application configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `PUBMED_MCP__<SECTION>__<KEY>` environment overrides. The legacy
//! `ABSTRACT_MODE` variable is honoured on top of that.

use crate::client::RequestIntervals;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "pubmed-mcp.toml";

/// Prefix for structured environment overrides
pub const ENV_PREFIX: &str = "PUBMED_MCP";

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub rate_limiting: RateLimitingConfig,
    pub cache: CacheConfig,
    pub abstract_mode: AbstractMode,
    pub logging: LoggingConfig,
    /// Directory searched for `api-keys.json` and `config/api-keys.json`
    pub credentials_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// E-utilities base URL
    pub base_url: String,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// `tool` parameter sent with every request
    pub tool_name: String,
    /// Contact address used when no credential is selected
    pub default_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// Spacing between calls while at least one key is healthy
    pub keyed_interval_ms: u64,
    /// Spacing between calls in anonymous or degraded mode
    pub anonymous_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Root cache directory
    pub directory: PathBuf,
    /// Maximum number of search results held in memory
    pub memory_max_entries: usize,
    /// Lifetime of an in-memory search result
    pub memory_ttl_secs: u64,
    pub paper_expiry_days: u64,
    pub fulltext_expiry_days: u64,
    pub max_fulltext_bytes: u64,
}

/// Abstract retrieval depth
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AbstractMode {
    /// Use whatever the summary endpoint returns
    #[default]
    Quick,
    /// Fetch the full abstract text for short or missing abstracts
    Deep,
}

impl AbstractMode {
    /// Anything other than `deep` means quick
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("deep") {
            Self::Deep
        } else {
            Self::Quick
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
            cache: CacheConfig::default(),
            abstract_mode: AbstractMode::default(),
            logging: LoggingConfig::default(),
            credentials_dir: PathBuf::from("."),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://eutils.ncbi.nlm.nih.gov/entrez/eutils".to_string(),
            timeout_secs: 30,
            tool_name: "mcp-pubmed-server".to_string(),
            default_email: "user@example.com".to_string(),
        }
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            keyed_interval_ms: 100,
            anonymous_interval_ms: 334,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("cache"),
            memory_max_entries: 100,
            memory_ttl_secs: 5 * 60,
            paper_expiry_days: 30,
            fulltext_expiry_days: 90,
            max_fulltext_bytes: 50 * 1024 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl UpstreamConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RateLimitingConfig {
    #[must_use]
    pub const fn keyed_interval(&self) -> Duration {
        Duration::from_millis(self.keyed_interval_ms)
    }

    #[must_use]
    pub const fn anonymous_interval(&self) -> Duration {
        Duration::from_millis(self.anonymous_interval_ms)
    }
}

impl From<&RateLimitingConfig> for RequestIntervals {
    fn from(config: &RateLimitingConfig) -> Self {
        Self {
            keyed: config.keyed_interval(),
            anonymous: config.anonymous_interval(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }

    #[must_use]
    pub const fn paper_expiry(&self) -> Duration {
        Duration::from_secs(self.paper_expiry_days * DAY_SECS)
    }

    #[must_use]
    pub const fn fulltext_expiry(&self) -> Duration {
        Duration::from_secs(self.fulltext_expiry_days * DAY_SECS)
    }
}

/// Legacy variables kept for deployments that predate the structured overrides
#[derive(Debug, Default, Deserialize)]
struct LegacyEnv {
    abstract_mode: Option<String>,
}

impl Config {
    /// Load configuration from defaults, an optional file and the process environment.
    ///
    /// With `path == None` the default file in the working directory is used if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, std::env::vars())
    }

    /// Same as [`Config::load`] with an explicit environment
    pub fn load_from<I>(path: Option<&Path>, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: Vec<(String, String)> = vars.into_iter().collect();

        let file = path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), Path::to_path_buf);
        let required = path.is_some();
        debug!("Loading configuration from {} (required: {})", file.display(), required);

        let overrides: std::collections::HashMap<String, String> = vars
            .iter()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .cloned()
            .collect();

        let mut config: Self = ::config::Config::builder()
            .add_source(::config::File::from(file.as_path()).required(required))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .source(Some(overrides)),
            )
            .build()?
            .try_deserialize()?;

        let legacy: LegacyEnv = envy::from_iter(vars)?;
        if let Some(mode) = legacy.abstract_mode {
            config.abstract_mode = AbstractMode::parse(&mode);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the access layer cannot operate with
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.upstream.base_url).map_err(|e| Error::InvalidInput {
            field: "upstream.base_url".to_string(),
            reason: e.to_string(),
        })?;

        if self.upstream.timeout_secs == 0 {
            return Err(invalid("upstream.timeout_secs", "must be greater than zero"));
        }
        if self.rate_limiting.keyed_interval_ms == 0 || self.rate_limiting.anonymous_interval_ms == 0
        {
            return Err(invalid("rate_limiting", "intervals must be greater than zero"));
        }
        if self.rate_limiting.keyed_interval_ms > self.rate_limiting.anonymous_interval_ms {
            return Err(invalid(
                "rate_limiting.keyed_interval_ms",
                "must not exceed anonymous_interval_ms",
            ));
        }
        if self.cache.memory_max_entries == 0 {
            return Err(invalid("cache.memory_max_entries", "must be greater than zero"));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> Error {
    Error::InvalidInput {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn no_env() -> Vec<(String, String)> {
        Vec::new()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.paper_expiry(), Duration::from_secs(30 * DAY_SECS));
        assert_eq!(config.rate_limiting.keyed_interval(), Duration::from_millis(100));
        assert_eq!(config.rate_limiting.anonymous_interval(), Duration::from_millis(334));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.upstream.base_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidInput { .. })));

        let mut config = Config::default();
        config.cache.memory_max_entries = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidInput { .. })));

        let mut config = Config::default();
        config.rate_limiting.keyed_interval_ms = 1000;
        assert!(matches!(config.validate(), Err(Error::InvalidInput { .. })));
    }

    #[test]
    fn test_file_and_env_layering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pubmed.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[cache]\nmemory_max_entries = 7\n\n[upstream]\ntimeout_secs = 5").unwrap();

        let env = vec![
            ("PUBMED_MCP__UPSTREAM__TOOL_NAME".to_string(), "tests".to_string()),
            ("ABSTRACT_MODE".to_string(), "DEEP".to_string()),
        ];
        let config = Config::load_from(Some(&path), env).unwrap();

        assert_eq!(config.cache.memory_max_entries, 7);
        assert_eq!(config.upstream.timeout_secs, 5);
        assert_eq!(config.upstream.tool_name, "tests");
        assert_eq!(config.abstract_mode, AbstractMode::Deep);
        // untouched sections keep their defaults
        assert_eq!(config.rate_limiting, RateLimitingConfig::default());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            Config::load_from(Some(&missing), no_env()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_abstract_mode_parse() {
        assert_eq!(AbstractMode::parse("deep"), AbstractMode::Deep);
        assert_eq!(AbstractMode::parse("quick"), AbstractMode::Quick);
        assert_eq!(AbstractMode::parse("whatever"), AbstractMode::Quick);
    }
}
