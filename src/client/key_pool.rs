//! API key pool with per-key health tracking and rotation strategies.
//!
//! Health is tracked per key so one failing key degrades the pool instead of
//! taking it down. When every key is unhealthy the key with the oldest failure
//! is revived, so a non-empty pool always yields a key.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Consecutive failures after which a key is taken out of rotation
pub const MAX_FAILURES_BEFORE_UNHEALTHY: u32 = 3;

/// Time after the last failure before an unhealthy key is eligible again
pub const KEY_COOLDOWN: Duration = Duration::from_secs(60);

/// Key files checked in order, relative to the credentials directory
pub const KEY_FILE_LOCATIONS: [&str; 2] = ["api-keys.json", "config/api-keys.json"];

const KEY_PREFIX_LEN: usize = 8;

/// An API key and the contact address registered with it
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub api_key: String,
    pub email: String,
}

impl Credential {
    #[must_use]
    pub fn new(api_key: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            email: email.into(),
        }
    }

    /// First characters of the key, safe to log
    #[must_use]
    pub fn key_prefix(&self) -> String {
        let prefix: String = self.api_key.chars().take(KEY_PREFIX_LEN).collect();
        format!("{prefix}...")
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("api_key", &self.key_prefix())
            .field("email", &self.email)
            .finish()
    }
}

/// Key selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", from = "String")]
pub enum KeyStrategy {
    #[default]
    RoundRobin,
    Failover,
    Random,
    Single,
    /// Anonymous mode, no key is ever selected
    None,
}

impl KeyStrategy {
    /// Parse a strategy tag. Unknown tags fall back to failover.
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Self::RoundRobin,
            "failover" => Self::Failover,
            "random" => Self::Random,
            "single" => Self::Single,
            "none" => Self::None,
            other => {
                warn!("Unknown key strategy '{}', using failover", other);
                Self::Failover
            }
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::Failover => "failover",
            Self::Random => "random",
            Self::Single => "single",
            Self::None => "none",
        }
    }
}

impl From<String> for KeyStrategy {
    fn from(tag: String) -> Self {
        Self::parse(&tag)
    }
}

impl std::fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound request spacing for keyed and anonymous operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestIntervals {
    pub keyed: Duration,
    pub anonymous: Duration,
}

impl Default for RequestIntervals {
    fn default() -> Self {
        // ~10 req/s with a key, ~3 req/s without
        Self {
            keyed: Duration::from_millis(100),
            anonymous: Duration::from_millis(334),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeyHealth {
    failures: u32,
    last_failure: Option<Instant>,
    healthy: bool,
}

impl KeyHealth {
    const fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            healthy: true,
        }
    }

    fn revive(&mut self) {
        self.healthy = true;
        self.failures = 0;
    }
}

#[derive(Debug)]
struct PoolState {
    health: HashMap<String, KeyHealth>,
    cursor: usize,
}

/// Per-key entry of [`PoolStatus`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatus {
    pub key_prefix: String,
    pub email: String,
    pub healthy: bool,
    pub failures: u32,
}

/// Read-only snapshot of the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub total_keys: usize,
    pub strategy: KeyStrategy,
    pub healthy_keys: usize,
    pub unhealthy_keys: usize,
    /// Current spacing between upstream requests in milliseconds
    pub rate_limit_delay: u64,
    pub keys: Vec<KeyStatus>,
}

/// Shape of `api-keys.json`
#[derive(Debug, Deserialize)]
struct KeyFile {
    #[serde(default)]
    keys: Vec<Credential>,
    strategy: Option<KeyStrategy>,
}

/// `PUBMED_API_KEY` / `PUBMED_EMAIL`
#[derive(Debug, Deserialize)]
struct KeyEnv {
    api_key: Option<String>,
    email: Option<String>,
}

/// Pool of API keys shared by every upstream call of the process
#[derive(Debug)]
pub struct ApiKeyPool {
    keys: Vec<Credential>,
    strategy: KeyStrategy,
    intervals: RequestIntervals,
    state: Mutex<PoolState>,
}

impl ApiKeyPool {
    /// Create a pool from explicit keys.
    ///
    /// An empty pool always runs with [`KeyStrategy::None`]; a non-empty pool
    /// configured with `None` is switched to failover so it still yields keys.
    #[must_use]
    pub fn new(keys: Vec<Credential>, strategy: KeyStrategy) -> Self {
        let strategy = match (keys.is_empty(), strategy) {
            (true, _) => KeyStrategy::None,
            (false, KeyStrategy::None) => {
                warn!("Strategy 'none' configured with {} keys, using failover", keys.len());
                KeyStrategy::Failover
            }
            (false, strategy) => strategy,
        };

        let health = keys
            .iter()
            .map(|key| (key.api_key.clone(), KeyHealth::new()))
            .collect();

        Self {
            keys,
            strategy,
            intervals: RequestIntervals::default(),
            state: Mutex::new(PoolState { health, cursor: 0 }),
        }
    }

    /// Pool without keys
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new(Vec::new(), KeyStrategy::None)
    }

    #[must_use]
    pub fn with_intervals(mut self, intervals: RequestIntervals) -> Self {
        self.intervals = intervals;
        self
    }

    /// Load keys from the key file locations under `dir`, falling back to the
    /// process environment and then to anonymous mode.
    #[must_use]
    pub fn load(dir: &Path) -> Self {
        Self::load_from(dir, std::env::vars())
    }

    /// Same as [`ApiKeyPool::load`] with an explicit environment
    #[must_use]
    pub fn load_from<I>(dir: &Path, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for location in KEY_FILE_LOCATIONS {
            let path = dir.join(location);
            if !path.exists() {
                continue;
            }
            match read_key_file(&path) {
                Ok(file) if !file.keys.is_empty() => {
                    let strategy = file.strategy.unwrap_or(KeyStrategy::RoundRobin);
                    info!(
                        "Loaded {} API keys from {} (strategy: {})",
                        file.keys.len(),
                        path.display(),
                        strategy
                    );
                    return Self::new(file.keys, strategy);
                }
                Ok(_) => warn!("No keys listed in {}", path.display()),
                Err(e) => warn!("Error reading {}: {}", path.display(), e),
            }
        }

        match envy::prefixed("PUBMED_").from_iter::<_, KeyEnv>(vars) {
            Ok(KeyEnv {
                api_key: Some(api_key),
                email,
            }) if !api_key.trim().is_empty() => {
                info!("Using single API key from PUBMED_API_KEY");
                let email = email.unwrap_or_else(|| "user@example.com".to_string());
                return Self::new(vec![Credential::new(api_key, email)], KeyStrategy::Single);
            }
            Ok(_) => {}
            Err(e) => warn!("Could not read API key environment: {}", e),
        }

        info!("No API keys configured, running in anonymous mode");
        Self::anonymous()
    }

    #[must_use]
    pub const fn strategy(&self) -> KeyStrategy {
        self.strategy
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick the key for the next request, or `None` in anonymous mode
    pub fn select(&self) -> Option<Credential> {
        if self.keys.is_empty() || self.strategy == KeyStrategy::None {
            return None;
        }

        let mut state = self.state();
        recover_cooled_down(&mut state.health, Instant::now());

        let healthy: Vec<&Credential> = self
            .keys
            .iter()
            .filter(|key| is_healthy(&state.health, key))
            .collect();

        if healthy.is_empty() {
            warn!("All API keys unhealthy, forcing recovery of the oldest failure");
            return force_recover_oldest(&self.keys, &mut state.health);
        }

        let chosen = match self.strategy {
            KeyStrategy::RoundRobin => {
                let index = state.cursor % healthy.len();
                state.cursor = (state.cursor + 1) % healthy.len();
                healthy[index]
            }
            KeyStrategy::Random => healthy[rand::thread_rng().gen_range(0..healthy.len())],
            KeyStrategy::Failover | KeyStrategy::Single | KeyStrategy::None => healthy[0],
        };

        Some(chosen.clone())
    }

    /// Reset a key's failure count after a successful request
    pub fn report_success(&self, credential: &Credential) {
        if let Some(health) = self.state().health.get_mut(&credential.api_key) {
            health.revive();
        }
    }

    /// Count a failed request against a key
    pub fn report_failure(&self, credential: &Credential) {
        let mut state = self.state();
        let Some(health) = state.health.get_mut(&credential.api_key) else {
            return;
        };

        health.failures += 1;
        health.last_failure = Some(Instant::now());
        if health.failures >= MAX_FAILURES_BEFORE_UNHEALTHY && health.healthy {
            health.healthy = false;
            warn!(
                "Key {} marked unhealthy after {} failures",
                credential.key_prefix(),
                health.failures
            );
        }
    }

    /// Request spacing implied by the current pool health
    #[must_use]
    pub fn rate_limit_delay(&self) -> Duration {
        let state = self.state();
        if self.keys.iter().any(|key| is_healthy(&state.health, key)) {
            self.intervals.keyed
        } else {
            self.intervals.anonymous
        }
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let keys: Vec<KeyStatus> = {
            let state = self.state();
            self.keys
                .iter()
                .map(|key| {
                    let health = state.health.get(&key.api_key);
                    KeyStatus {
                        key_prefix: key.key_prefix(),
                        email: key.email.clone(),
                        healthy: health.is_some_and(|h| h.healthy),
                        failures: health.map_or(0, |h| h.failures),
                    }
                })
                .collect()
        };

        let healthy_keys = keys.iter().filter(|key| key.healthy).count();
        PoolStatus {
            total_keys: keys.len(),
            strategy: self.strategy,
            healthy_keys,
            unhealthy_keys: keys.len() - healthy_keys,
            rate_limit_delay: u64::try_from(self.rate_limit_delay().as_millis()).unwrap_or(u64::MAX),
            keys,
        }
    }
}

fn read_key_file(path: &Path) -> crate::Result<KeyFile> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn is_healthy(health: &HashMap<String, KeyHealth>, key: &Credential) -> bool {
    health.get(&key.api_key).is_some_and(|h| h.healthy)
}

fn recover_cooled_down(health: &mut HashMap<String, KeyHealth>, now: Instant) {
    for (api_key, key_health) in health.iter_mut() {
        let cooled_down = key_health
            .last_failure
            .map_or(true, |at| now.duration_since(at) > KEY_COOLDOWN);
        if !key_health.healthy && cooled_down {
            key_health.revive();
            let prefix: String = api_key.chars().take(KEY_PREFIX_LEN).collect();
            info!("Key {}... recovered after cooldown", prefix);
        }
    }
}

/// Revive the key whose last failure is the oldest. Ties go to the key listed
/// first in the pool.
fn force_recover_oldest(
    keys: &[Credential],
    health: &mut HashMap<String, KeyHealth>,
) -> Option<Credential> {
    let oldest = keys
        .iter()
        .min_by_key(|key| health.get(&key.api_key).and_then(|h| h.last_failure))?;
    if let Some(key_health) = health.get_mut(&oldest.api_key) {
        key_health.revive();
    }
    Some(oldest.clone())
}
