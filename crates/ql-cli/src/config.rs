//! Configuration loading and management.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use ql_core::EventType;
use ql_engine::{
    ArchiveSettings, EngineOptions, LocalDirSink, PruneSettings, RetentionPolicy, RollupSettings,
    WorkerSettings,
};
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// Policy document activated by `ql run` and `ql evaluate`.
    pub policy_path: Option<PathBuf>,
    pub writer_id: String,
    /// Usage points kept per pool for forecasting.
    pub forecast_window: usize,
    /// Reset horizon assumed for pools that never reported a reset time.
    pub default_reset_horizon_secs: i64,
    /// Proportional gain for dynamic delays.
    pub delay_kp: f64,
    pub snapshot: SnapshotConfig,
    pub retention: RetentionConfig,
    pub archive: ArchiveConfig,
    pub rollup: RollupConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub enabled: bool,
    /// TTL for event types without their own entry. Unset keeps them forever.
    pub default_ttl_secs: Option<u64>,
    /// Per event type TTLs, keyed by the type's wire name.
    pub by_type: BTreeMap<String, u64>,
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    /// Events younger than this are never archived.
    pub retention_secs: u64,
    pub batch_size: usize,
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("ql.db"),
            policy_path: None,
            writer_id: ql_engine::DEFAULT_WRITER_ID.to_string(),
            forecast_window: ql_core::projection::DEFAULT_WINDOW,
            default_reset_horizon_secs: ql_engine::DEFAULT_RESET_HORIZON_SECS,
            delay_kp: ql_engine::DEFAULT_DELAY_KP,
            snapshot: SnapshotConfig { interval_secs: 300 },
            retention: RetentionConfig {
                enabled: false,
                default_ttl_secs: None,
                by_type: BTreeMap::new(),
                check_interval_secs: 3600,
            },
            archive: ArchiveConfig {
                enabled: false,
                directory: data_dir.join("archive"),
                retention_secs: 7 * 24 * 3600,
                batch_size: 1000,
                check_interval_secs: 3600,
            },
            rollup: RollupConfig {
                interval_secs: 60,
                batch_size: 1000,
            },
        }
    }
}

fn seconds(secs: u64, field: &str) -> Result<TimeDelta> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .with_context(|| format!("{field} is out of range: {secs}"))
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    ///
    /// Later sources win: defaults, the user config file, `config_path`,
    /// then `QL_*` environment variables (`QL_SNAPSHOT__INTERVAL_SECS`
    /// sets `snapshot.interval_secs`).
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("QL_").split("__"));

        figment.extract()
    }

    pub fn engine_options(&self) -> Result<EngineOptions> {
        let horizon = TimeDelta::try_seconds(self.default_reset_horizon_secs)
            .context("default_reset_horizon_secs is out of range")?;
        Ok(EngineOptions {
            writer_id: self.writer_id.clone(),
            forecast_window: self.forecast_window.max(2),
            default_reset_horizon: horizon,
            delay_kp: self.delay_kp,
        })
    }

    /// The configured TTLs. Unknown event type names are an error.
    pub fn retention_policy(&self) -> Result<RetentionPolicy> {
        let default_ttl = self
            .retention
            .default_ttl_secs
            .map(|secs| seconds(secs, "retention.default_ttl_secs"))
            .transpose()?;
        let mut by_type = BTreeMap::new();
        for (name, secs) in &self.retention.by_type {
            let event_type: EventType = name
                .parse()
                .with_context(|| format!("retention.by_type has an unknown event type '{name}'"))?;
            by_type.insert(event_type, seconds(*secs, "retention.by_type")?);
        }
        Ok(RetentionPolicy {
            default_ttl,
            by_type,
        })
    }

    pub fn worker_settings(&self) -> Result<WorkerSettings> {
        let prune = if self.retention.enabled {
            Some(PruneSettings {
                interval: Duration::from_secs(self.retention.check_interval_secs),
                policy: self.retention_policy()?,
            })
        } else {
            None
        };
        let archive = if self.archive.enabled {
            Some(ArchiveSettings {
                interval: Duration::from_secs(self.archive.check_interval_secs),
                sink: Arc::new(LocalDirSink::new(&self.archive.directory)),
                retention: seconds(self.archive.retention_secs, "archive.retention_secs")?,
                batch_size: self.archive.batch_size,
            })
        } else {
            None
        };
        Ok(WorkerSettings {
            snapshot_interval: Duration::from_secs(self.snapshot.interval_secs),
            prune,
            archive,
            rollup: Some(RollupSettings {
                interval: Duration::from_secs(self.rollup.interval_secs),
                batch_size: self.rollup.batch_size,
            }),
        })
    }
}

/// Returns the platform-specific config directory for ql.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ql"))
}

/// Returns the platform-specific data directory for ql.
///
/// On Linux: `~/.local/share/ql`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("ql"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_data_dir_for_db() {
        let config = Config::default();
        let data_dir = dirs_data_path().unwrap();
        assert_eq!(config.database_path, data_dir.join("ql.db"));
        assert_eq!(config.snapshot.interval_secs, 300);
    }

    #[test]
    fn test_file_overrides_nested_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
database_path = "/var/lib/ql/ledger.db"
writer_id = "node-a"

[retention]
enabled = true
default_ttl_secs = 86400

[retention.by_type]
intent_decided = 3600
"#,
        )
        .unwrap();

        let config = Config::load_from(Some(&path)).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/ql/ledger.db"));
        assert_eq!(config.writer_id, "node-a");
        assert_eq!(config.rollup.batch_size, 1000);

        let policy = config.retention_policy().unwrap();
        assert_eq!(policy.default_ttl, Some(TimeDelta::days(1)));
        assert_eq!(policy.by_type[&EventType::IntentDecided], TimeDelta::hours(1));
        assert!(config.worker_settings().unwrap().prune.is_some());
    }

    #[test]
    fn test_unknown_event_type_in_retention_is_rejected() {
        let mut config = Config::default();
        config.retention.by_type.insert("coffee_brewed".into(), 60);
        let err = config.retention_policy().unwrap_err();
        assert!(err.to_string().contains("coffee_brewed"));
    }
}
