use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Errors detected while validating or parsing scheduler configuration.
///
/// All of these are fatal at construction time: a scheduler is never built
/// from an invalid configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown scheduler kind {0:?} (expected queue, heap, or ucb-tree)")]
    UnknownSchedulerKind(String),
    #[error("unknown priority mode {0:?} (expected avg-score or last-score)")]
    UnknownPriorityMode(String),
    #[error("invalid energy bounds: min-energy {min} must be >= 1 and <= max-energy {max}")]
    InvalidEnergyBounds { min: u32, max: u32 },
    #[error("ucb-c must be a positive finite number, got {0}")]
    InvalidUcbConstant(f64),
    #[error("max-seeds-per-leaf must be >= 1")]
    InvalidLeafCapacity,
    #[error(
        "hybrid windows must be >= 1 (plateau-k {plateau_k}, fast-window-w {fast_window_w}, breakthrough-b {breakthrough_b})"
    )]
    InvalidHybridWindows {
        plateau_k: u32,
        fast_window_w: u32,
        breakthrough_b: u32,
    },
}

/// Which seed scheduler backend to construct.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    Queue,
    Heap,
    UcbTree,
}

impl SchedulerKind {
    /// Stable identifier used in stats dumps.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::Queue => "queue",
            SchedulerKind::Heap => "heap",
            SchedulerKind::UcbTree => "ucb_tree",
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "queue" => Ok(SchedulerKind::Queue),
            "heap" => Ok(SchedulerKind::Heap),
            "ucb-tree" | "ucb_tree" => Ok(SchedulerKind::UcbTree),
            other => Err(ConfigError::UnknownSchedulerKind(other.to_string())),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the heap backend derives a seed's priority from reported scores.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityMode {
    AvgScore,
    LastScore,
}

impl PriorityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityMode::AvgScore => "avg_score",
            PriorityMode::LastScore => "last_score",
        }
    }
}

impl FromStr for PriorityMode {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "avg-score" | "avg_score" => Ok(PriorityMode::AvgScore),
            "last-score" | "last_score" => Ok(PriorityMode::LastScore),
            other => Err(ConfigError::UnknownPriorityMode(other.to_string())),
        }
    }
}

/// Per-seed energy bounds for the power scheduler.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EnergyBounds {
    #[serde(default = "default_min_energy")]
    pub min_energy: u32,
    #[serde(default = "default_max_energy")]
    pub max_energy: u32,
}

fn default_min_energy() -> u32 {
    1
}
fn default_max_energy() -> u32 {
    128
}

impl Default for EnergyBounds {
    fn default() -> Self {
        Self {
            min_energy: default_min_energy(),
            max_energy: default_max_energy(),
        }
    }
}

impl EnergyBounds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_energy < 1 || self.min_energy > self.max_energy {
            return Err(ConfigError::InvalidEnergyBounds {
                min: self.min_energy,
                max: self.max_energy,
            });
        }
        Ok(())
    }

    /// Midpoint of the bounds; the uniform schedule scales weights so the
    /// mean energy lands here.
    pub fn target_mean(&self) -> f64 {
        (self.min_energy as f64 + self.max_energy as f64) / 2.0
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_kind")]
    pub kind: SchedulerKind,
    #[serde(default = "default_priority_mode")]
    pub priority_mode: PriorityMode,
    #[serde(default = "default_ucb_c")]
    pub ucb_c: f64,
    #[serde(default = "default_max_seeds_per_leaf")]
    pub max_seeds_per_leaf: usize,
}

fn default_scheduler_kind() -> SchedulerKind {
    SchedulerKind::Heap
}
fn default_priority_mode() -> PriorityMode {
    PriorityMode::AvgScore
}
fn default_ucb_c() -> f64 {
    1.0
}
fn default_max_seeds_per_leaf() -> usize {
    8
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: default_scheduler_kind(),
            priority_mode: default_priority_mode(),
            ucb_c: default_ucb_c(),
            max_seeds_per_leaf: default_max_seeds_per_leaf(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ucb_c.is_finite() || self.ucb_c <= 0.0 {
            return Err(ConfigError::InvalidUcbConstant(self.ucb_c));
        }
        if self.max_seeds_per_leaf < 1 {
            return Err(ConfigError::InvalidLeafCapacity);
        }
        Ok(())
    }
}

/// Parameters of the two-phase (Exploration/FAST) power scheduler.
#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HybridConfig {
    /// Consecutive no-gain cycles before switching to FAST.
    #[serde(default = "default_plateau_k")]
    pub plateau_k: u32,
    /// Length of one FAST observation window, in cycles.
    #[serde(default = "default_fast_window_w")]
    pub fast_window_w: u32,
    /// New paths within one FAST window needed to return to Exploration.
    #[serde(default = "default_breakthrough_b")]
    pub breakthrough_b: u32,
    /// Base energy constant; defaults to `min-energy * 8` when unset.
    #[serde(default)]
    pub alpha: Option<u32>,
    /// Cap on the generation-depth exponent in the FAST formula.
    #[serde(default = "default_s_cap")]
    pub s_cap: u32,
}

fn default_plateau_k() -> u32 {
    8
}
fn default_fast_window_w() -> u32 {
    16
}
fn default_breakthrough_b() -> u32 {
    5
}
fn default_s_cap() -> u32 {
    14
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            plateau_k: default_plateau_k(),
            fast_window_w: default_fast_window_w(),
            breakthrough_b: default_breakthrough_b(),
            alpha: None,
            s_cap: default_s_cap(),
        }
    }
}

impl HybridConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plateau_k < 1 || self.fast_window_w < 1 || self.breakthrough_b < 1 {
            return Err(ConfigError::InvalidHybridWindows {
                plateau_k: self.plateau_k,
                fast_window_w: self.fast_window_w,
                breakthrough_b: self.breakthrough_b,
            });
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_iterations")]
    pub max_iterations: u64,
    /// RNG seed for the owner loop; unset means entropy-derived.
    pub rng_seed: Option<u64>,
}

pub fn default_iterations() -> u64 {
    100_000
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_iterations(),
            rng_seed: None,
        }
    }
}

/// Top-level configuration for the scheduling core.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub power: EnergyBounds,
    #[serde(default)]
    pub hybrid: HybridConfig,
    pub fuzzer: Option<FuzzerSettings>,
}

impl CoreConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: CoreConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        self.power.validate()?;
        self.hybrid.validate()?;
        Ok(())
    }
}
