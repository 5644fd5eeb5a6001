//! Nudge configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{NudgeError, Result};
use crate::types::OFFSET_MAX_MINUTES;

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NudgeConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_database_path() -> String { "~/.nudge/nudge.db".into() }

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            scheduler: SchedulerConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl NudgeConfig {
    /// Load config from the default path (~/.nudge/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NudgeError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| NudgeError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| NudgeError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Nudge home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nudge")
    }

    /// Database path with `~` expanded.
    pub fn resolved_database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()
    }
}

/// Scan cadence and window parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Due-routine scan period. Must not exceed the 60s schedule granularity.
    #[serde(default = "default_due_scan_interval")]
    pub due_scan_interval_secs: u64,
    #[serde(default = "default_snooze_scan_interval")]
    pub snooze_scan_interval_secs: u64,
    #[serde(default = "default_retention_sweep_interval")]
    pub retention_sweep_interval_secs: u64,
    /// Half-width of the duplicate-suppression window around a fire time.
    #[serde(default = "default_dedup_window")]
    pub dedup_window_minutes: i64,
    /// How long a due pending notification may sit before the sweep dispatches it.
    #[serde(default)]
    pub pending_grace_secs: i64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Fixed offset of the wall clock that schedule entries are written in.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_snooze_minutes")]
    pub default_snooze_minutes: u32,
    #[serde(default = "default_max_snooze_minutes")]
    pub max_snooze_minutes: u32,
    #[serde(default = "bool_true")]
    pub enforce_max_snoozes: bool,
}

fn bool_true() -> bool { true }
fn default_due_scan_interval() -> u64 { 60 }
fn default_snooze_scan_interval() -> u64 { 30 }
fn default_retention_sweep_interval() -> u64 { 24 * 60 * 60 }
fn default_dedup_window() -> i64 { 20 }
fn default_retention_days() -> i64 { 30 }
fn default_snooze_minutes() -> u32 { 5 }
fn default_max_snooze_minutes() -> u32 { 24 * 60 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            due_scan_interval_secs: default_due_scan_interval(),
            snooze_scan_interval_secs: default_snooze_scan_interval(),
            retention_sweep_interval_secs: default_retention_sweep_interval(),
            dedup_window_minutes: default_dedup_window(),
            pending_grace_secs: 0,
            retention_days: default_retention_days(),
            utc_offset_minutes: 0,
            default_snooze_minutes: default_snooze_minutes(),
            max_snooze_minutes: default_max_snooze_minutes(),
            enforce_max_snoozes: true,
        }
    }
}

impl SchedulerConfig {
    /// Largest adaptive offset plus the due-scan latency, in whole minutes.
    pub fn min_dedup_window_minutes(&self) -> i64 {
        i64::from(OFFSET_MAX_MINUTES) + self.due_scan_interval_secs.div_ceil(60) as i64
    }

    pub fn validate(&self) -> Result<()> {
        if self.due_scan_interval_secs == 0 || self.due_scan_interval_secs > 60 {
            return Err(NudgeError::Config(format!(
                "scheduler.due_scan_interval_secs must be within 1..=60, got {}",
                self.due_scan_interval_secs
            )));
        }
        if self.snooze_scan_interval_secs == 0 || self.retention_sweep_interval_secs == 0 {
            return Err(NudgeError::Config("scan intervals must be positive".into()));
        }
        if self.dedup_window_minutes < self.min_dedup_window_minutes() {
            return Err(NudgeError::Config(format!(
                "scheduler.dedup_window_minutes ({}) must cover the maximum adaptive offset ({OFFSET_MAX_MINUTES}) \
                 plus one due-scan period, i.e. at least {}",
                self.dedup_window_minutes,
                self.min_dedup_window_minutes()
            )));
        }
        if self.retention_days <= 0 {
            return Err(NudgeError::Config("scheduler.retention_days must be positive".into()));
        }
        if self.pending_grace_secs < 0 {
            return Err(NudgeError::Config("scheduler.pending_grace_secs must not be negative".into()));
        }
        if self.utc_offset_minutes.abs() > 14 * 60 {
            return Err(NudgeError::Config(format!(
                "scheduler.utc_offset_minutes {} is outside ±14h",
                self.utc_offset_minutes
            )));
        }
        if self.default_snooze_minutes == 0 || self.default_snooze_minutes > self.max_snooze_minutes {
            return Err(NudgeError::Config(
                "scheduler.default_snooze_minutes must be within 1..=max_snooze_minutes".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP/WebSocket gateway settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 3077 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}
