use crate::config::EnergyBounds;
use crate::seed::SeedStats;
use rand_core::RngCore;
use serde::Serialize;
use std::collections::BTreeMap;

/// Result of one power-scheduling pass over a batch of seed statistics.
///
/// Ephemeral by design: the owner recomputes it per cycle and never stores
/// it across corpus changes.
#[derive(Debug, Clone, Serialize)]
pub struct PowerScheduleResult {
    /// Mutation budget per seed id.
    pub seed_energies: BTreeMap<u64, u32>,
    /// How many seeds touch each edge index.
    pub edge_frequencies: Vec<u32>,
    /// The bounds this schedule was computed under.
    pub config: EnergyBounds,
    /// Sum of pre-clamp seed weights.
    pub total_weight: f64,
}

impl PowerScheduleResult {
    fn empty(bounds: EnergyBounds) -> Self {
        Self {
            seed_energies: BTreeMap::new(),
            edge_frequencies: Vec::new(),
            config: bounds,
            total_weight: 0.0,
        }
    }
}

/// Counts, per edge index, how many seeds have a non-zero bitmap entry.
///
/// The output length is the longest bitmap observed; seeds without a
/// bitmap are skipped. Pure: identical input always yields identical
/// output.
pub fn compute_edge_frequencies(seeds: &[SeedStats]) -> Vec<u32> {
    let max_len = seeds
        .iter()
        .filter_map(|stats| stats.coverage_bitmap.as_ref())
        .map(Vec::len)
        .max()
        .unwrap_or(0);

    let mut frequencies = vec![0u32; max_len];
    for stats in seeds {
        let Some(bitmap) = &stats.coverage_bitmap else {
            continue;
        };
        for (idx, hit) in bitmap.iter().enumerate() {
            if *hit != 0 {
                frequencies[idx] += 1;
            }
        }
    }
    frequencies
}

// Uniform baseline: every seed weighs 1.0. `fuzz_count` and `exec_time_ms`
// are carried in SeedStats but not consulted here; a weighted refinement
// would replace this single function.
fn seed_weight(_stats: &SeedStats) -> f64 {
    1.0
}

/// Computes the uniform power schedule for a batch of seeds.
///
/// Weights are scaled so the mean energy sits midway between the bounds,
/// then each seed's energy is clamped to `[min_energy, max_energy]` and
/// rounded. An empty batch produces an empty result with zero total
/// weight.
pub fn compute_power_schedule(seeds: &[SeedStats], bounds: &EnergyBounds) -> PowerScheduleResult {
    if seeds.is_empty() {
        return PowerScheduleResult::empty(*bounds);
    }

    let edge_frequencies = compute_edge_frequencies(seeds);
    let weights: Vec<f64> = seeds
        .iter()
        .map(|stats| seed_weight(stats).max(0.0))
        .collect();

    let mut total_weight: f64 = weights.iter().sum();
    if total_weight <= 0.0 {
        total_weight = weights.len() as f64;
    }
    let mean_weight = total_weight / weights.len() as f64;
    let scale = if mean_weight <= 0.0 {
        1.0
    } else {
        bounds.target_mean() / mean_weight
    };

    let mut seed_energies = BTreeMap::new();
    for (stats, weight) in seeds.iter().zip(&weights) {
        let energy = (weight * scale)
            .clamp(bounds.min_energy as f64, bounds.max_energy as f64)
            .round() as u32;
        seed_energies.insert(stats.seed_id, energy);
    }

    PowerScheduleResult {
        seed_energies,
        edge_frequencies,
        config: *bounds,
        total_weight,
    }
}

/// Draws a seed id with probability proportional to its energy.
///
/// Returns `None` when the schedule is empty. A schedule whose energies
/// somehow sum to zero falls back to a uniform draw.
pub fn pick_seed_id(schedule: &PowerScheduleResult, rng: &mut dyn RngCore) -> Option<u64> {
    if schedule.seed_energies.is_empty() {
        return None;
    }

    let total: f64 = schedule.seed_energies.values().map(|e| *e as f64).sum();
    if total <= 0.0 {
        let index = rng.next_u64() as usize % schedule.seed_energies.len();
        return schedule.seed_energies.keys().nth(index).copied();
    }

    let threshold = (rng.next_u64() as f64 / u64::MAX as f64) * total;
    let mut cumulative = 0.0;
    for (seed_id, energy) in &schedule.seed_energies {
        cumulative += *energy as f64;
        if cumulative >= threshold {
            return Some(*seed_id);
        }
    }
    schedule.seed_energies.keys().next_back().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn stats(seed_id: u64, bitmap: Option<Vec<u32>>) -> SeedStats {
        SeedStats {
            seed_id,
            coverage_bitmap: bitmap,
            ..Default::default()
        }
    }

    #[test]
    fn edge_frequencies_count_seeds_per_edge() {
        let seeds = vec![
            stats(0, Some(vec![1, 0, 3])),
            stats(1, Some(vec![0, 2])),
            stats(2, None),
        ];
        assert_eq!(compute_edge_frequencies(&seeds), vec![1, 1, 1]);
    }

    #[test]
    fn edge_frequencies_are_pure() {
        let seeds = vec![stats(0, Some(vec![1, 1])), stats(1, Some(vec![1, 0, 5]))];
        assert_eq!(
            compute_edge_frequencies(&seeds),
            compute_edge_frequencies(&seeds)
        );
        assert_eq!(compute_edge_frequencies(&[]), Vec::<u32>::new());
    }

    #[test]
    fn uniform_schedule_assigns_equal_energy_at_the_midpoint() {
        let seeds = vec![stats(0, None), stats(1, None), stats(2, None)];
        let bounds = EnergyBounds::default();
        let result = compute_power_schedule(&seeds, &bounds);

        let expected = bounds.target_mean().round() as u32;
        assert_eq!(result.seed_energies.len(), 3);
        for energy in result.seed_energies.values() {
            assert_eq!(*energy, expected);
            assert!(*energy >= bounds.min_energy && *energy <= bounds.max_energy);
        }
        let total: u32 = result.seed_energies.values().sum();
        assert_eq!(total, 3 * expected);
        assert_eq!(result.total_weight, 3.0);
    }

    #[test]
    fn energies_respect_bounds_for_any_batch_size() {
        let bounds = EnergyBounds {
            min_energy: 4,
            max_energy: 9,
        };
        for n in 1..20u64 {
            let seeds: Vec<SeedStats> = (0..n).map(|id| stats(id, None)).collect();
            let result = compute_power_schedule(&seeds, &bounds);
            let total: u64 = result.seed_energies.values().map(|e| *e as u64).sum();
            assert!(total >= n * bounds.min_energy as u64);
            for energy in result.seed_energies.values() {
                assert!(*energy >= bounds.min_energy && *energy <= bounds.max_energy);
            }
        }
    }

    #[test]
    fn empty_batch_produces_empty_result_and_null_pick() {
        let bounds = EnergyBounds::default();
        let result = compute_power_schedule(&[], &bounds);
        assert!(result.seed_energies.is_empty());
        assert!(result.edge_frequencies.is_empty());
        assert_eq!(result.total_weight, 0.0);

        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        assert_eq!(pick_seed_id(&result, &mut rng), None);
    }

    #[test]
    fn pick_returns_the_only_seed_and_covers_all_ids_over_many_draws() {
        let bounds = EnergyBounds::default();
        let single = compute_power_schedule(&[stats(7, None)], &bounds);
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        assert_eq!(pick_seed_id(&single, &mut rng), Some(7));

        let seeds: Vec<SeedStats> = (0..4).map(|id| stats(id, None)).collect();
        let schedule = compute_power_schedule(&seeds, &bounds);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(pick_seed_id(&schedule, &mut rng).unwrap());
        }
        assert_eq!(seen.len(), 4, "every seed should be drawn eventually");
    }
}
