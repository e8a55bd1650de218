use cinder_core::config::CoreConfig;
use cinder_core::hybrid::HybridPowerScheduler;
use cinder_core::interest::score_signals;
use cinder_core::scheduler::build_scheduler;
use cinder_core::seed::{Seed, DISCOVERED_SEED_ID_BASE};
use cinder_core::signals::{RunStatus, Signals};

use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::collections::HashSet;
use std::time::Instant;

/// Tiny in-process target: classifies the input into an execution path
/// and occasionally misbehaves, enough to exercise the feedback loop.
fn toy_target(data: &[u8]) -> (String, RunStatus) {
    if data.starts_with(b"BAD") {
        return ("bad-branch".to_string(), RunStatus::Bug);
    }
    if data.starts_with(b"CRAS") {
        return ("crash-branch".to_string(), RunStatus::Crash);
    }
    let path = match data.first() {
        Some(b'{') => "object",
        Some(b'[') => "array",
        Some(c) if c.is_ascii_digit() => "number",
        Some(_) => "scalar",
        None => "empty",
    };
    (path.to_string(), RunStatus::Ok)
}

fn main() -> Result<(), anyhow::Error> {
    let config = CoreConfig::default();
    let mut scheduler = build_scheduler(&config)?;
    let mut hybrid = HybridPowerScheduler::new(config.hybrid, config.power);
    let mut rng = ChaCha8Rng::from_seed([0u8; 32]);

    for (id, payload) in [&b"GOOD"[..], b"{}", b"[1,2]"].iter().enumerate() {
        let seed = Seed::new(id as u64, payload.to_vec(), "valid", "toy");
        hybrid.register_corpus_seed(seed.id);
        scheduler.add(seed, None);
    }

    println!("Starting demo fuzz loop with the default scheduler...");
    let start_time = Instant::now();
    let mut seen_paths: HashSet<String> = HashSet::new();
    let mut next_discovered_id = DISCOVERED_SEED_ID_BASE;
    let mut executions: u64 = 0;
    let mut bugs_seen: u64 = 0;

    let max_iterations = 5_000;

    for i in 0..max_iterations {
        let Some(item) = scheduler.next() else {
            break;
        };
        let energy = hybrid.assign_energy(item.seed.id);

        let mut summary = Signals::default();
        let mut best_score = 0.0f64;
        let mut candidates: Vec<(Vec<u8>, String)> = Vec::new();

        for _ in 0..energy {
            let mut data = item.seed.payload.clone();
            if data.is_empty() {
                data.push(0);
            }
            let index = rng.next_u64() as usize % data.len();
            data[index] = data[index].wrapping_add((rng.next_u64() % 16) as u8 + 1);

            executions += 1;
            let (path, status) = toy_target(&data);
            hybrid.record_executions(&path, 1);

            let mut signals = Signals::default();
            signals.status = status;
            signals.crash = status == RunStatus::Crash;
            signals.new_bug = status == RunStatus::Bug && !seen_paths.contains(&path);
            signals.new_coverage = !seen_paths.contains(&path);
            signals.coverage_key = Some(format!("cov:{path}"));
            if signals.new_coverage {
                candidates.push((data.clone(), path.clone()));
            }
            if status == RunStatus::Bug {
                bugs_seen += 1;
            }
            best_score = best_score.max(score_signals(&signals));
            summary.merge(&signals);
        }

        let mut found_new = false;
        for (payload, path) in candidates {
            if seen_paths.insert(path.clone()) {
                found_new = true;
                hybrid.on_new_path_discovered(&path, Some(item.seed.id));
                let seed = Seed::derived(next_discovered_id, payload, &item.seed);
                next_discovered_id += 1;
                hybrid.add_new_seed(&seed, &path);
                scheduler.add(seed, Some(&summary));
            }
        }

        scheduler.update(&item, best_score, &summary);
        hybrid.on_loop_completed(found_new);

        if i > 0 && i % (max_iterations / 10) == 0 {
            println!(
                "Iter: {}/{}, corpus: {}, paths: {}, bugs: {}",
                i,
                max_iterations,
                scheduler.len(),
                hybrid.paths_discovered(),
                bugs_seen
            );
        }
    }

    let elapsed = start_time.elapsed();
    println!("Demo loop finished in {elapsed:.2?}.");
    println!(
        "Executions: {}, corpus size: {}, unique paths: {}, bugs: {}",
        executions,
        scheduler.len(),
        hybrid.paths_discovered(),
        bugs_seen
    );
    println!(
        "Scheduler stats: {}",
        serde_json::to_string_pretty(&scheduler.stats())?
    );
    Ok(())
}
