use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::{
    dispatch::{ChannelLimits, DispatcherSettings, HumanizeSettings},
    flow::{ExecutorSettings, TimerSettings},
    logger::LogConfig,
};

/// Prefix of per-channel daily limit overrides, e.g. `CHATFLOW_DAILY_LIMIT_WA_MAIN`.
pub const DAILY_LIMIT_PREFIX: &str = "CHATFLOW_DAILY_LIMIT_";

/// A flat key/value source of settings.
#[async_trait]
pub trait ConfigManagerType: Send + Sync + std::fmt::Debug {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment, after loading an optional `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: impl Into<PathBuf>) -> Self {
        let env_file = env_file.into();
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!(path = %env_file.display(), "loaded .env"),
                Err(e) => warn!(path = %env_file.display(), error = %e, "could not parse .env"),
            }
        }
        Self { env_file }
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

/// In-memory settings, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }
}

/// Every tunable of the engine, with defaults for anything unset.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub humanize: HumanizeSettings,
    pub limits: ChannelLimits,
    pub dispatcher: DispatcherSettings,
    pub executor: ExecutorSettings,
    pub timer: TimerSettings,
    pub retention_days: u32,
    pub cleanup_interval: Duration,
    /// Directory of flow definition files to load and watch.
    pub flow_dir: Option<PathBuf>,
    /// Where file-backed stores keep their snapshots; in-memory when unset.
    pub data_dir: Option<PathBuf>,
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            humanize: HumanizeSettings::default(),
            limits: ChannelLimits::default(),
            dispatcher: DispatcherSettings::default(),
            executor: ExecutorSettings::default(),
            timer: TimerSettings::default(),
            retention_days: 30,
            cleanup_interval: Duration::from_secs(3_600),
            flow_dir: None,
            data_dir: None,
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    pub async fn from_manager(config: &dyn ConfigManagerType) -> Self {
        let d = EngineConfig::default();
        let reader = Reader { config };

        let humanize = HumanizeSettings {
            min_delay_ms: reader.parse("CHATFLOW_MIN_DELAY_MS", d.humanize.min_delay_ms).await,
            max_delay_ms: reader.parse("CHATFLOW_MAX_DELAY_MS", d.humanize.max_delay_ms).await,
            typing_chars_per_second: reader
                .parse("CHATFLOW_TYPING_CPS", d.humanize.typing_chars_per_second)
                .await,
        };

        let mut limits = ChannelLimits::new(reader.parse("CHATFLOW_DAILY_LIMIT", d.limits.default_limit()).await);
        let mut override_keys: Vec<String> = config
            .keys()
            .await
            .into_iter()
            .filter(|k| k.starts_with(DAILY_LIMIT_PREFIX) && k.len() > DAILY_LIMIT_PREFIX.len())
            .collect();
        override_keys.sort();
        for key in override_keys {
            let channel = &key[DAILY_LIMIT_PREFIX.len()..];
            match config.get(&key).await.map(|v| v.trim().parse::<u32>()) {
                Some(Ok(limit)) => limits = limits.with_override(channel, limit),
                Some(Err(e)) => warn!(key, error = %e, "ignoring unparseable channel limit"),
                None => {}
            }
        }

        let send_timeout = at_least(
            "CHATFLOW_SEND_TIMEOUT_SECS",
            reader.secs("CHATFLOW_SEND_TIMEOUT_SECS", d.dispatcher.send_timeout).await,
            Duration::from_secs(1),
        );
        let dispatcher = DispatcherSettings {
            interval: at_least(
                "CHATFLOW_DISPATCH_INTERVAL_MS",
                reader.millis("CHATFLOW_DISPATCH_INTERVAL_MS", d.dispatcher.interval).await,
                MIN_POLL_INTERVAL,
            ),
            batch_size: at_least(
                "CHATFLOW_DISPATCH_BATCH",
                reader.parse("CHATFLOW_DISPATCH_BATCH", d.dispatcher.batch_size).await,
                1,
            ),
            max_attempts: reader.parse("CHATFLOW_MAX_ATTEMPTS", d.dispatcher.max_attempts).await.max(1),
            retry_backoff: reader.secs("CHATFLOW_RETRY_BACKOFF_SECS", d.dispatcher.retry_backoff).await,
            claim_lease: at_least(
                "CHATFLOW_CLAIM_LEASE_SECS",
                reader.secs("CHATFLOW_CLAIM_LEASE_SECS", d.dispatcher.claim_lease).await,
                send_timeout.saturating_mul(2),
            ),
            send_timeout,
        };

        let executor = ExecutorSettings {
            max_steps: reader.parse("CHATFLOW_MAX_STEPS", d.executor.max_steps).await.max(1),
            ai_timeout: reader.secs("CHATFLOW_AI_TIMEOUT_SECS", d.executor.ai_timeout).await,
            integration_timeout: reader
                .secs("CHATFLOW_INTEGRATION_TIMEOUT_SECS", d.executor.integration_timeout)
                .await,
            ai_fallback_message: config
                .get("CHATFLOW_AI_FALLBACK_MESSAGE")
                .await
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(d.executor.ai_fallback_message),
        };

        let timer = TimerSettings {
            interval: at_least(
                "CHATFLOW_TIMER_INTERVAL_MS",
                reader.millis("CHATFLOW_TIMER_INTERVAL_MS", d.timer.interval).await,
                MIN_POLL_INTERVAL,
            ),
            batch_size: d.timer.batch_size,
        };

        EngineConfig {
            humanize,
            limits,
            dispatcher,
            executor,
            timer,
            retention_days: reader.parse("CHATFLOW_RETENTION_DAYS", d.retention_days).await,
            cleanup_interval: at_least(
                "CHATFLOW_CLEANUP_INTERVAL_SECS",
                reader.secs("CHATFLOW_CLEANUP_INTERVAL_SECS", d.cleanup_interval).await,
                Duration::from_secs(1),
            ),
            flow_dir: reader.path("CHATFLOW_FLOW_DIR").await,
            data_dir: reader.path("CHATFLOW_DATA_DIR").await,
            log: LogConfig::from_manager(config).await,
        }
    }
}

/// Shortest sleep between polling passes.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn at_least<T: PartialOrd + std::fmt::Debug>(key: &str, value: T, floor: T) -> T {
    if value < floor {
        warn!(key, value = ?value, floor = ?floor, "setting below its minimum, raised");
        return floor;
    }
    value
}

struct Reader<'a> {
    config: &'a dyn ConfigManagerType,
}

impl Reader<'_> {
    async fn parse<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + Copy,
        T::Err: std::fmt::Display,
    {
        match self.config.get(key).await {
            None => default,
            Some(raw) if raw.trim().is_empty() => default,
            Some(raw) => raw.trim().parse().unwrap_or_else(|e: T::Err| {
                warn!(key, value = %raw, error = %e, "unparseable setting, using default");
                default
            }),
        }
    }

    async fn secs(&self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parse(key, default.as_secs()).await)
    }

    async fn millis(&self, key: &str, default: Duration) -> Duration {
        Duration::from_millis(self.parse(key, default.as_millis() as u64).await)
    }

    async fn path(&self, key: &str) -> Option<PathBuf> {
        self.config
            .get(key)
            .await
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
    }
}
