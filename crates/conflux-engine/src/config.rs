//! Runtime configuration for the execution engine.
//!
//! Limits and policy knobs are explicit and environment-driven so deployments
//! are reproducible. Values that the specification leaves to policy (join
//! depth bound, per-flow error cap, retry bounds) live here rather than being
//! hard-coded at call sites.

use std::time::Duration;

use crate::error::{Error, Result};

const ENV_CACHE_VARIANT: &str = "CONFLUX_CACHE_VARIANT";
const ENV_CACHE_SYNC_SECS: &str = "CONFLUX_CACHE_SYNC_SECS";
const ENV_CACHE_MAX_AGE_SECS: &str = "CONFLUX_CACHE_MAX_AGE_SECS";
const ENV_MAX_SAVE_ATTEMPTS: &str = "CONFLUX_MAX_SAVE_ATTEMPTS";
const ENV_QUEUE_RETRY_ATTEMPTS: &str = "CONFLUX_QUEUE_RETRY_ATTEMPTS";
const ENV_HEARTBEAT_SECS: &str = "CONFLUX_HEARTBEAT_SECS";
const ENV_MAX_JOIN_DEPTH: &str = "CONFLUX_MAX_JOIN_DEPTH";
const ENV_MAX_FLOW_ERRORS: &str = "CONFLUX_MAX_FLOW_ERRORS";
const ENV_COLD_QUEUE_THRESHOLD: &str = "CONFLUX_COLD_QUEUE_THRESHOLD";

const DEFAULT_CACHE_SYNC_SECS: u64 = 30;
const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 300;
const DEFAULT_MAX_SAVE_ATTEMPTS: u32 = 10;
const DEFAULT_QUEUE_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_HEARTBEAT_SECS: u64 = 10;
const DEFAULT_MAX_JOIN_DEPTH: u32 = 32;
const DEFAULT_COLD_QUEUE_THRESHOLD: usize = 5000;

/// Which cache implementation the deployment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheVariant {
    /// Every save goes straight to the durable store.
    PassThrough,
    /// Saves land in memory first; a scheduled flush writes them through.
    WriteBack,
}

impl std::fmt::Display for CacheVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PassThrough => write!(f, "pass-through"),
            Self::WriteBack => write!(f, "write-back"),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Which cache variant the deployment runs.
    pub cache_variant: CacheVariant,
    /// Cadence of the scheduled write-back flush.
    pub cache_sync_interval: Duration,
    /// Age past which untouched cache entries are evicted.
    pub cache_max_age: Duration,
    /// Bound on optimistic-lock reload-and-retry cycles per event.
    pub max_save_attempts: u32,
    /// Bound on queue publish retries before surfacing QueueUnavailable.
    pub queue_retry_attempts: u32,
    /// Fixed interval of the dispatcher heartbeat.
    pub heartbeat_interval: Duration,
    /// Join depth policy bound; aggregation beyond it is rejected.
    pub max_join_depth: u32,
    /// Per-flow error cap; 0 means unbounded. When exceeded the flow is
    /// cancelled instead of left resumable.
    pub max_flow_errors: u32,
    /// Queue depth past which new work is parked COLD_QUEUED.
    pub cold_queue_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_variant: CacheVariant::WriteBack,
            cache_sync_interval: Duration::from_secs(DEFAULT_CACHE_SYNC_SECS),
            cache_max_age: Duration::from_secs(DEFAULT_CACHE_MAX_AGE_SECS),
            max_save_attempts: DEFAULT_MAX_SAVE_ATTEMPTS,
            queue_retry_attempts: DEFAULT_QUEUE_RETRY_ATTEMPTS,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            max_join_depth: DEFAULT_MAX_JOIN_DEPTH,
            max_flow_errors: 0,
            cold_queue_threshold: DEFAULT_COLD_QUEUE_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the process environment with strict validation.
    ///
    /// # Errors
    ///
    /// Returns a validation error when a value is present but not a positive
    /// integer (or, for the cache variant, not a known name).
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a validation error when a value is present but malformed.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let cache_variant = match get_env(ENV_CACHE_VARIANT).as_deref() {
            None => defaults.cache_variant,
            Some("write-back") => CacheVariant::WriteBack,
            Some("pass-through") => CacheVariant::PassThrough,
            Some(other) => {
                return Err(Error::validation(format!(
                    "{ENV_CACHE_VARIANT} must be 'write-back' or 'pass-through', got '{other}'"
                )));
            }
        };

        Ok(Self {
            cache_variant,
            cache_sync_interval: Duration::from_secs(parse_positive_u64(
                &get_env,
                ENV_CACHE_SYNC_SECS,
                DEFAULT_CACHE_SYNC_SECS,
            )?),
            cache_max_age: Duration::from_secs(parse_positive_u64(
                &get_env,
                ENV_CACHE_MAX_AGE_SECS,
                DEFAULT_CACHE_MAX_AGE_SECS,
            )?),
            max_save_attempts: parse_positive_u32(
                &get_env,
                ENV_MAX_SAVE_ATTEMPTS,
                DEFAULT_MAX_SAVE_ATTEMPTS,
            )?,
            queue_retry_attempts: parse_positive_u32(
                &get_env,
                ENV_QUEUE_RETRY_ATTEMPTS,
                DEFAULT_QUEUE_RETRY_ATTEMPTS,
            )?,
            heartbeat_interval: Duration::from_secs(parse_positive_u64(
                &get_env,
                ENV_HEARTBEAT_SECS,
                DEFAULT_HEARTBEAT_SECS,
            )?),
            max_join_depth: parse_positive_u32(
                &get_env,
                ENV_MAX_JOIN_DEPTH,
                DEFAULT_MAX_JOIN_DEPTH,
            )?,
            // Zero is meaningful here: unbounded.
            max_flow_errors: parse_u32(&get_env, ENV_MAX_FLOW_ERRORS, 0)?,
            cold_queue_threshold: usize::try_from(parse_positive_u64(
                &get_env,
                ENV_COLD_QUEUE_THRESHOLD,
                DEFAULT_COLD_QUEUE_THRESHOLD as u64,
            )?)
            .map_err(|_| {
                Error::validation(format!("{ENV_COLD_QUEUE_THRESHOLD} exceeds supported range"))
            })?,
        })
    }
}

fn parse_u32<F>(get_env: &F, key: &str, default: u32) -> Result<u32>
where
    F: Fn(&str) -> Option<String>,
{
    match get_env(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .map_err(|_| Error::validation(format!("{key} must be an integer, got '{raw}'"))),
    }
}

fn parse_positive_u32<F>(get_env: &F, key: &str, default: u32) -> Result<u32>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_u32(get_env, key, default)?;
    if value == 0 {
        return Err(Error::validation(format!("{key} must be positive")));
    }
    Ok(value)
}

fn parse_positive_u64<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match get_env(key) {
        None => Ok(default),
        Some(raw) => {
            let value = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::validation(format!("{key} must be an integer, got '{raw}'")))?;
            if value == 0 {
                return Err(Error::validation(format!("{key} must be positive")));
            }
            Ok(value)
        }
    }
}
