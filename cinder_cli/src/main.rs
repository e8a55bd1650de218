use cinder_core::config::CoreConfig;
use cinder_core::corpus::SeedCorpus;
use cinder_core::hybrid::HybridPowerScheduler;
use cinder_core::interest::score_signals;
use cinder_core::power::{compute_power_schedule, pick_seed_id};
use cinder_core::scheduler::{build_scheduler, SchedulerItem};
use cinder_core::seed::{Seed, SeedStats, DISCOVERED_SEED_ID_BASE};
use cinder_core::signals::{BugSignature, RunStatus, Signals};
use cinder_core::worker::{Discovery, LeaseSummary, Worker};

use clap::Parser;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Seed scheduler backend: queue, heap, or ucb-tree.
    #[clap(long)]
    scheduler: Option<String>,
    #[clap(short, long)]
    iterations: Option<u64>,
    #[clap(long)]
    rng_seed: Option<u64>,
    /// JSON corpus file; a small built-in corpus is used when omitted.
    #[clap(long)]
    corpus_file: Option<PathBuf>,
}

/// Branch ids of the toy target, used to build coverage bitmaps.
const TOY_EDGES: usize = 6;

struct ToyOutcome {
    path: String,
    status: RunStatus,
    bitmap: Vec<u32>,
    bug: Option<BugSignature>,
}

/// In-process stand-in for an instrumented target. Classifies the input
/// into one of a handful of execution paths and reports a per-branch hit
/// bitmap the way a real runner would.
fn toy_target(data: &[u8]) -> ToyOutcome {
    let mut bitmap = vec![0u32; TOY_EDGES];
    bitmap[0] = 1;

    if data.starts_with(b"BAD") {
        bitmap[1] = 1;
        return ToyOutcome {
            path: "bad-branch".to_string(),
            status: RunStatus::Bug,
            bitmap,
            bug: Some(BugSignature {
                exception: Some("ValueError".to_string()),
                file: Some("toy.rs".to_string()),
                line: Some(17),
                ..Default::default()
            }),
        };
    }
    if data.starts_with(b"CRAS") {
        bitmap[2] = 1;
        return ToyOutcome {
            path: "crash-branch".to_string(),
            status: RunStatus::Crash,
            bitmap,
            bug: None,
        };
    }

    let (edge, path) = match data.first() {
        Some(b'{') => (3, "object"),
        Some(b'[') => (4, "array"),
        Some(c) if c.is_ascii_digit() => (5, "number"),
        _ => (0, "scalar"),
    };
    bitmap[edge] = 1;
    ToyOutcome {
        path: path.to_string(),
        status: RunStatus::Ok,
        bitmap,
        bug: None,
    }
}

/// Worker that mutates the leased seed and runs the toy target, keeping a
/// local memory of the paths it has already reported as discoveries.
struct ToyWorker {
    reported_paths: HashSet<String>,
}

impl ToyWorker {
    fn new() -> Self {
        Self {
            reported_paths: HashSet::new(),
        }
    }

    fn mutate<R: Rng + ?Sized>(&self, base: &[u8], rng: &mut R) -> Vec<u8> {
        let mut data = base.to_vec();
        if data.is_empty() {
            data.push(0);
        }
        let index = rng.random_range(0..data.len());
        data[index] = data[index].wrapping_add(rng.random_range(1u8..=15u8));
        data
    }
}

impl<R: Rng + ?Sized> Worker<R> for ToyWorker {
    fn run_lease(&mut self, item: &SchedulerItem, energy: u32, rng: &mut R) -> LeaseSummary {
        let mut summary = LeaseSummary::default();
        for _ in 0..energy {
            let data = self.mutate(&item.seed.payload, rng);
            let outcome = toy_target(&data);

            let new_path = !self.reported_paths.contains(&outcome.path);
            // The bare path id doubles as the coverage key, so the owner's
            // per-path accounting and the discoveries it registers share
            // one identifier.
            let signals = Signals {
                new_coverage: new_path,
                new_bug: outcome.bug.is_some() && new_path,
                crash: outcome.status == RunStatus::Crash,
                timeout: outcome.status == RunStatus::Timeout,
                status: outcome.status,
                coverage_key: Some(outcome.path.clone()),
                coverage_bitmap: Some(outcome.bitmap.clone()),
                bug_signature: outcome.bug.clone(),
                ..Default::default()
            };
            summary.isinteresting_score = summary.isinteresting_score.max(score_signals(&signals));
            if new_path {
                self.reported_paths.insert(outcome.path.clone());
                summary.discoveries.push(Discovery {
                    payload: data,
                    path_id: outcome.path.clone(),
                    signals: signals.clone(),
                });
            }
            summary.signals.merge(&signals);
        }
        summary
    }
}

fn built_in_corpus() -> SeedCorpus {
    let mut corpus = SeedCorpus::new("toy-decoder");
    corpus.add_seed("valid", "{}");
    corpus.add_seed("valid", "[1, 2]");
    corpus.add_seed("valid", "GOOD");
    corpus.add_seed("near_valid", "{1:");
    corpus.add_seed("string_stress", "\"aaaaaaaa\"");
    corpus
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            CoreConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}"
                );
                CoreConfig::load_from_file(&default_config_path)?
            } else {
                CoreConfig::default()
            }
        }
    };

    if let Some(kind) = cli.scheduler {
        config.scheduler.kind = kind.parse()?;
    }
    if let Some(iterations) = cli.iterations {
        config
            .fuzzer
            .get_or_insert_with(Default::default)
            .max_iterations = iterations;
    }
    if let Some(rng_seed) = cli.rng_seed {
        config.fuzzer.get_or_insert_with(Default::default).rng_seed = Some(rng_seed);
    }
    config.validate()?;

    let corpus = match &cli.corpus_file {
        Some(path) => SeedCorpus::load_from_file(path)?,
        None => built_in_corpus(),
    };
    println!("Corpus: {}", corpus.summary());

    let mut scheduler = build_scheduler(&config)?;
    let mut hybrid = HybridPowerScheduler::new(config.hybrid, config.power);

    let fuzzer = config.fuzzer.clone().unwrap_or_default();
    let mut rng = match fuzzer.rng_seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_os_rng(),
    };

    // Warm-up power schedule over the initial corpus: validates the energy
    // bounds against real stats and logs where the first budget would go.
    let warmup_stats: Vec<SeedStats> = corpus
        .seeds()
        .map(|seed| SeedStats {
            seed_id: seed.id,
            coverage_bitmap: seed.coverage_hint.clone(),
            ..Default::default()
        })
        .collect();
    let schedule = compute_power_schedule(&warmup_stats, &config.power);
    log::info!(
        "warm-up schedule: total weight {}, first pick {:?}",
        schedule.total_weight,
        pick_seed_id(&schedule, &mut rng)
    );

    for seed in corpus.seeds() {
        hybrid.register_corpus_seed(seed.id);
        scheduler.add(seed.clone(), None);
    }

    let mut worker = ToyWorker::new();
    let mut seen_paths: HashSet<String> = HashSet::new();
    let mut next_discovered_id = DISCOVERED_SEED_ID_BASE;

    let max_iterations = fuzzer.max_iterations;
    println!(
        "Starting fuzz loop for {} iterations with {} initial corpus items...",
        max_iterations,
        scheduler.len()
    );
    let start_time = Instant::now();
    let mut executions: u64 = 0;
    let mut bugs_found: u64 = 0;

    for i in 0..max_iterations {
        let Some(item) = scheduler.next() else {
            break;
        };
        let energy = hybrid.assign_energy(item.seed.id);
        let summary = worker.run_lease(&item, energy, &mut rng);
        executions += energy as u64;

        // f(i) accounting: attribute the whole lease to its representative
        // path, under the same path id `add_new_seed` registers below —
        // FAST-mode lookups miss if the two ever diverge.
        hybrid.record_executions(&summary.signals.coverage_bucket_key(), energy as u64);

        let mut found_new = false;
        for discovery in &summary.discoveries {
            if !seen_paths.insert(discovery.path_id.clone()) {
                continue;
            }
            found_new = true;
            hybrid.on_new_path_discovered(&discovery.path_id, Some(item.seed.id));
            let seed = Seed::derived(next_discovered_id, discovery.payload.clone(), &item.seed);
            next_discovered_id += 1;
            hybrid.add_new_seed(&seed, &discovery.path_id);
            scheduler.add(seed, Some(&discovery.signals));
        }
        if summary.signals.new_bug || summary.signals.crash {
            bugs_found += 1;
        }

        scheduler.update(&item, summary.isinteresting_score, &summary.signals);
        hybrid.on_loop_completed(found_new);

        if i > 0 && i % (max_iterations / 100).max(1) == 0 {
            let elapsed = start_time.elapsed().as_secs_f32();
            let exec_per_sec = if elapsed > 0.0 {
                executions as f32 / elapsed
            } else {
                0.0
            };
            print!(
                "\rIter: {}/{}, corpus: {}, paths: {}, bugs: {}, execs/sec: {:.2}   ",
                i,
                max_iterations,
                scheduler.len(),
                hybrid.paths_discovered(),
                bugs_found,
                exec_per_sec
            );
            use std::io::Write;
            std::io::stdout().flush().unwrap();
        }
    }

    let elapsed_total = start_time.elapsed();
    println!("\nFuzz loop finished in {elapsed_total:.2?}.");
    println!(
        "Executions: {}, corpus size: {}, unique paths: {}, bug leases: {}",
        executions,
        scheduler.len(),
        hybrid.paths_discovered(),
        bugs_found
    );
    println!(
        "Scheduler stats: {}",
        serde_json::to_string_pretty(&scheduler.stats())?
    );
    println!(
        "Scheduler dump: {}",
        serde_json::to_string_pretty(&scheduler.debug_dump(10))?
    );
    Ok(())
}
