/*!
 * Configuration for the hub and pipeline manifests
 */

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::pipe::PipeOptions;
use crate::error::{ManufactoryError, Result};
use crate::model::{ManufactureRecord, MinerSchedule};

/// Hub configuration, usually read from a TOML file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Maximum number of buildings running at once
    #[serde(default = "default_facility_capacity")]
    pub facility_capacity: usize,

    /// Loop steps per processor slice before yielding to the runtime
    #[serde(default = "default_loop_step_budget")]
    pub loop_step_budget: usize,

    /// Heap scans only look at pieces created within this many days
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Upper bound on pieces fetched by percentage and unbounded batches
    #[serde(default = "default_percentage_ceiling")]
    pub percentage_ceiling: usize,

    #[serde(default)]
    pub log: LogConfig,

    /// Periodic miner triggers
    #[serde(default)]
    pub schedules: Vec<MinerSchedule>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            facility_capacity: default_facility_capacity(),
            loop_step_budget: default_loop_step_budget(),
            lookback_days: default_lookback_days(),
            percentage_ceiling: default_percentage_ceiling(),
            log: LogConfig::default(),
            schedules: Vec::new(),
        }
    }
}

impl HubConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: HubConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.facility_capacity == 0 {
            return Err(ManufactoryError::Config(
                "facility_capacity must be at least 1".to_string(),
            ));
        }
        if self.loop_step_budget == 0 {
            return Err(ManufactoryError::Config(
                "loop_step_budget must be at least 1".to_string(),
            ));
        }
        if self.percentage_ceiling == 0 {
            return Err(ManufactoryError::Config(
                "percentage_ceiling must be at least 1".to_string(),
            ));
        }
        if let Some(schedule) = self.schedules.iter().find(|s| s.every_secs == 0) {
            return Err(ManufactoryError::Config(format!(
                "schedule for building {} has a zero interval",
                schedule.building_id
            )));
        }
        Ok(())
    }

    /// Pipe tuning derived from this configuration
    pub fn pipe_options(&self) -> PipeOptions {
        PipeOptions {
            lookback: chrono::Duration::days(i64::from(self.lookback_days)),
            percentage_ceiling: self.percentage_ceiling,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Pipeline manifest: the graphs and miner schedules to seed a store with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    #[serde(default)]
    pub manufactures: Vec<ManufactureRecord>,

    #[serde(default)]
    pub schedules: Vec<MinerSchedule>,
}

impl ManifestFile {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ManufactoryError::Manifest(e.to_string()))
    }
}

// Default value functions for serde
fn default_facility_capacity() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .max(2)
}

fn default_loop_step_budget() -> usize {
    1000
}

fn default_lookback_days() -> u32 {
    90
}

fn default_percentage_ceiling() -> usize {
    1000
}
