use crate::config::{EnergyBounds, HybridConfig};
use crate::seed::Seed;
use std::collections::HashMap;

/// Path id assigned to corpus seeds before any execution has been observed.
const INITIAL_PATH: &str = "initial";

/// Power-scheduling phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Constant per-seed energy; avoids starving easy-to-reach paths
    /// whose sub-branches are still undiscovered.
    Exploration,
    /// Exponential (AFL-FAST style) energy that amplifies rare paths once
    /// the low-hanging fruit is exhausted.
    Fast,
}

/// Two-phase power scheduler driven by the owner loop's discovery stream.
///
/// Starts in Exploration. A coverage plateau (`plateau_k` completed cycles
/// without a new path) switches to FAST; a breakthrough (more than
/// `breakthrough_b` new paths inside one `fast_window_w`-cycle window)
/// switches back. All counters reset on transition.
#[derive(Debug)]
pub struct HybridPowerScheduler {
    config: HybridConfig,
    bounds: EnergyBounds,
    alpha: u32,
    mode: ScheduleMode,
    cycles_since_new_path: u32,
    fast_window_cycles: u32,
    breakthroughs_in_window: u32,
    paths_discovered: u64,
    /// f(i): executions observed per path id.
    path_freq: HashMap<String, u64>,
    /// s(i): generation depth per seed (0 for corpus seeds).
    seed_depth: HashMap<u64, u32>,
    seed_path: HashMap<u64, String>,
}

impl HybridPowerScheduler {
    pub fn new(config: HybridConfig, bounds: EnergyBounds) -> Self {
        let alpha = config
            .alpha
            .unwrap_or_else(|| bounds.min_energy.saturating_mul(8))
            .max(1);
        Self {
            config,
            bounds,
            alpha,
            mode: ScheduleMode::Exploration,
            cycles_since_new_path: 0,
            fast_window_cycles: 0,
            breakthroughs_in_window: 0,
            paths_discovered: 0,
            path_freq: HashMap::new(),
            seed_depth: HashMap::new(),
            seed_path: HashMap::new(),
        }
    }

    pub fn mode(&self) -> ScheduleMode {
        self.mode
    }

    pub fn paths_discovered(&self) -> u64 {
        self.paths_discovered
    }

    /// Registers a corpus seed with generation depth 0.
    pub fn register_corpus_seed(&mut self, seed_id: u64) {
        self.seed_depth.entry(seed_id).or_insert(0);
        self.seed_path
            .entry(seed_id)
            .or_insert_with(|| INITIAL_PATH.to_string());
    }

    /// Registers a derived seed against the path it was discovered on.
    /// The child's depth is its parent's plus one.
    pub fn add_new_seed(&mut self, seed: &Seed, path_id: &str) {
        let depth = seed
            .parent_id
            .and_then(|parent| self.seed_depth.get(&parent))
            .copied()
            .unwrap_or(0)
            + 1;
        self.seed_depth.insert(seed.id, depth);
        self.seed_path.insert(seed.id, path_id.to_string());
        self.path_freq.entry(path_id.to_string()).or_insert(0);
    }

    /// Records `count` executions that exercised `path_id`. The owner
    /// typically reports a whole lease's energy here once, matching how
    /// many inputs were generated against the path.
    pub fn record_executions(&mut self, path_id: &str, count: u64) {
        *self.path_freq.entry(path_id.to_string()).or_insert(0) += count;
    }

    /// Feeds one new-path discovery into the state machine. Resets the
    /// plateau counter; in FAST mode it also advances the breakthrough
    /// counter and may trigger the switch back to Exploration.
    pub fn on_new_path_discovered(&mut self, path_id: &str, parent_seed_id: Option<u64>) {
        self.paths_discovered += 1;
        self.cycles_since_new_path = 0;
        self.path_freq.entry(path_id.to_string()).or_insert(0);
        log::debug!(
            "new path {path_id:?} (parent seed {parent_seed_id:?}), {} total",
            self.paths_discovered
        );

        if self.mode == ScheduleMode::Fast {
            self.breakthroughs_in_window += 1;
            if self.breakthroughs_in_window > self.config.breakthrough_b {
                log::info!(
                    "breakthrough: {} new paths within the FAST window, returning to exploration",
                    self.breakthroughs_in_window
                );
                self.enter(ScheduleMode::Exploration);
            }
        }
    }

    /// Drives the state machine at the end of each owner cycle.
    pub fn on_loop_completed(&mut self, found_new_path: bool) {
        if found_new_path {
            self.cycles_since_new_path = 0;
        } else {
            self.cycles_since_new_path += 1;
        }

        match self.mode {
            ScheduleMode::Exploration => {
                if self.cycles_since_new_path >= self.config.plateau_k {
                    log::info!(
                        "coverage plateau after {} cycles, switching to FAST",
                        self.cycles_since_new_path
                    );
                    self.enter(ScheduleMode::Fast);
                }
            }
            ScheduleMode::Fast => {
                self.fast_window_cycles += 1;
                if self.fast_window_cycles >= self.config.fast_window_w {
                    self.fast_window_cycles = 0;
                    self.breakthroughs_in_window = 0;
                }
            }
        }
    }

    /// Current mutation budget for a seed under the active mode.
    pub fn assign_energy(&self, seed_id: u64) -> u32 {
        match self.mode {
            ScheduleMode::Exploration => self.alpha.min(self.bounds.max_energy),
            ScheduleMode::Fast => {
                let path = self
                    .seed_path
                    .get(&seed_id)
                    .map(String::as_str)
                    .unwrap_or(INITIAL_PATH);
                let freq = self.path_freq.get(path).copied().unwrap_or(0).max(1) as f64;
                let depth = self
                    .seed_depth
                    .get(&seed_id)
                    .copied()
                    .unwrap_or(0)
                    .min(self.config.s_cap);
                let energy = self.alpha as f64 / self.rho() * (1u64 << depth) as f64 / freq;
                energy
                    .clamp(self.bounds.min_energy as f64, self.bounds.max_energy as f64)
                    .round() as u32
            }
        }
    }

    fn enter(&mut self, mode: ScheduleMode) {
        self.mode = mode;
        self.cycles_since_new_path = 0;
        self.fast_window_cycles = 0;
        self.breakthroughs_in_window = 0;
    }

    /// Normalization factor: mean of f(i) across known paths, at least 1.
    fn rho(&self) -> f64 {
        if self.path_freq.is_empty() {
            return 1.0;
        }
        let total: u64 = self.path_freq.values().sum();
        (total as f64 / self.path_freq.len() as f64).max(1.0)
    }
}
