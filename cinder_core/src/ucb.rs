use crate::scheduler::{LeaseLedger, LeasePath, SchedulerItem, SchedulerStats, SeedEntry, SeedScheduler};
use crate::seed::Seed;
use crate::signals::{Signals, NO_KEY};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Visit count and running-average reward of one tree node.
#[derive(Debug, Default, Clone)]
struct NodeStats {
    n: u64,
    q: f64,
}

impl NodeStats {
    fn record(&mut self, reward: f64) {
        self.n += 1;
        self.q += (reward - self.q) / self.n as f64;
    }

    fn ucb(&self, parent_n: u64, c: f64) -> f64 {
        if self.n == 0 {
            return f64::INFINITY;
        }
        self.q + c * ((parent_n.max(1) as f64).ln() / self.n as f64).sqrt()
    }
}

#[derive(Debug, Default)]
struct LeafBucket {
    stats: NodeStats,
    seed_ids: Vec<u64>,
}

#[derive(Debug, Default)]
struct CoverageBucket {
    stats: NodeStats,
    leaves: BTreeMap<String, LeafBucket>,
}

impl CoverageBucket {
    fn available(&self) -> usize {
        self.leaves.values().map(|leaf| leaf.seed_ids.len()).sum()
    }
}

/// Bandit scheduler over execution-behavior classes.
///
/// Seeds live in a three-level tree: root, coverage buckets, bug buckets.
/// `next()` descends by UCB1 and picks the least-fuzzed seed of the chosen
/// leaf; `update()` derives a reward from the worker's signals and applies
/// it along the stored path. Seeds stay resident in their leaf while
/// leased, so an abandoned lease loses nothing and never touches the visit
/// counts.
#[derive(Debug)]
pub struct UcbTreeScheduler {
    ucb_c: f64,
    max_seeds_per_leaf: usize,
    root: NodeStats,
    buckets: BTreeMap<String, CoverageBucket>,
    entries: HashMap<u64, SeedEntry>,
    ledger: LeaseLedger,
    added: u64,
}

impl UcbTreeScheduler {
    pub fn new(ucb_c: f64, max_seeds_per_leaf: usize) -> Self {
        Self {
            ucb_c,
            max_seeds_per_leaf: max_seeds_per_leaf.max(1),
            root: NodeStats::default(),
            buckets: BTreeMap::new(),
            entries: HashMap::new(),
            ledger: LeaseLedger::default(),
            added: 0,
        }
    }

    /// Reward derived from lease signals, independent of the
    /// interestingness score: +1 for new coverage, +2 for a new bug, +3
    /// for the crash/timeout class. The contributions sum (max 6).
    fn reward_from_signals(signals: &Signals) -> f64 {
        let mut reward = 0.0;
        if signals.new_coverage {
            reward += 1.0;
        }
        if signals.new_bug {
            reward += 2.0;
        }
        if signals.is_crash_class() {
            reward += 3.0;
        }
        reward
    }

    /// UCB1 pick among the candidate keys. Unvisited children score +inf;
    /// ties keep the first candidate in bucket-key order, which makes
    /// selection deterministic.
    fn best_key<'a, I>(&self, parent_n: u64, candidates: I) -> Option<String>
    where
        I: Iterator<Item = (&'a String, &'a NodeStats)>,
    {
        let mut best: Option<(&String, f64)> = None;
        for (key, stats) in candidates {
            let score = stats.ucb(parent_n, self.ucb_c);
            match &best {
                Some((_, best_score)) if score <= *best_score => {}
                _ => best = Some((key, score)),
            }
        }
        best.map(|(key, _)| key.clone())
    }

    /// Places a seed id under `coverage_key`/`bug_key`, splitting the bug
    /// key with a `#k` discriminator while the target leaf is full.
    fn place(&mut self, coverage_key: String, bug_key: String, seed_id: u64) {
        let bucket = self.buckets.entry(coverage_key).or_default();
        let mut key = bug_key.clone();
        let mut discriminator = 2;
        loop {
            let leaf = bucket.leaves.entry(key.clone()).or_default();
            if leaf.seed_ids.len() < self.max_seeds_per_leaf {
                leaf.seed_ids.push(seed_id);
                return;
            }
            key = format!("{bug_key}#{discriminator}");
            discriminator += 1;
        }
    }

    fn tree_nodes(&self) -> usize {
        1 + self.buckets.len()
            + self
                .buckets
                .values()
                .map(|bucket| bucket.leaves.len())
                .sum::<usize>()
    }

    #[cfg(debug_assertions)]
    fn assert_counts(&self) {
        let bucket_total: u64 = self.buckets.values().map(|b| b.stats.n).sum();
        debug_assert_eq!(
            self.root.n, bucket_total,
            "root visit count must equal the sum over coverage buckets"
        );
        for (key, bucket) in &self.buckets {
            let leaf_total: u64 = bucket.leaves.values().map(|l| l.stats.n).sum();
            debug_assert_eq!(
                bucket.stats.n, leaf_total,
                "coverage bucket {key:?} visit count must equal the sum over its leaves"
            );
        }
    }
}

impl SeedScheduler for UcbTreeScheduler {
    fn add(&mut self, seed: Seed, signals: Option<&Signals>) {
        if self.entries.contains_key(&seed.id) {
            log::debug!("seed {} already tracked, ignoring duplicate add", seed.id);
            return;
        }
        let (coverage_key, bug_key) = match signals {
            Some(signals) => (signals.coverage_bucket_key(), signals.bug_bucket_key()),
            None => (NO_KEY.to_string(), NO_KEY.to_string()),
        };
        self.added += 1;
        let id = seed.id;
        self.entries
            .insert(id, SeedEntry::new(seed, self.added, signals));
        self.place(coverage_key, bug_key, id);
    }

    fn next(&mut self) -> Option<SchedulerItem> {
        let coverage_key = self.best_key(
            self.root.n,
            self.buckets
                .iter()
                .filter(|(_, bucket)| bucket.available() > 0)
                .map(|(key, bucket)| (key, &bucket.stats)),
        )?;
        let bucket = self.buckets.get(&coverage_key)?;
        let bug_key = self.best_key(
            bucket.stats.n,
            bucket
                .leaves
                .iter()
                .filter(|(_, leaf)| !leaf.seed_ids.is_empty())
                .map(|(key, leaf)| (key, &leaf.stats)),
        )?;
        let leaf = bucket.leaves.get(&bug_key)?;

        // Least-fuzzed seed first; FIFO (arrival order) on ties.
        let seed_id = leaf
            .seed_ids
            .iter()
            .copied()
            .min_by_key(|id| {
                self.entries
                    .get(id)
                    .map(|entry| (entry.stats.fuzz_count, entry.added_order))
                    .unwrap_or((u64::MAX, u64::MAX))
            })?;

        let entry = self.entries.get_mut(&seed_id)?;
        entry.stats.fuzz_count += 1;
        let sequence = self.ledger.open(seed_id);
        Some(SchedulerItem {
            item_id: sequence,
            seed: entry.seed.clone(),
            path: LeasePath::Ucb {
                coverage_key,
                bug_key,
            },
            sequence,
        })
    }

    fn update(
        &mut self,
        item: &SchedulerItem,
        isinteresting_score: f64,
        signals: &Signals,
    ) -> bool {
        let LeasePath::Ucb {
            coverage_key,
            bug_key,
        } = &item.path
        else {
            log::warn!("lease {} does not carry a UCB path, discarding", item.sequence);
            return false;
        };
        let Some(seed_id) = self.ledger.close(item.sequence) else {
            log::warn!(
                "stale lease {} for seed {}, discarding update",
                item.sequence,
                item.seed.id
            );
            return false;
        };
        let Some(entry) = self.entries.get_mut(&seed_id) else {
            log::warn!("lease {} references untracked seed {seed_id}", item.sequence);
            return false;
        };
        entry.record(isinteresting_score, signals);

        let reward = Self::reward_from_signals(signals);
        self.root.record(reward);
        let bucket = self.buckets.entry(coverage_key.clone()).or_default();
        bucket.stats.record(reward);
        bucket
            .leaves
            .entry(bug_key.clone())
            .or_default()
            .stats
            .record(reward);

        #[cfg(debug_assertions)]
        self.assert_counts();
        true
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats::new("ucb_tree", self.entries.len(), &self.ledger);
        stats.tree_nodes = Some(self.tree_nodes());
        stats.coverage_buckets = Some(self.buckets.len());
        stats.bug_buckets = Some(
            self.buckets
                .values()
                .map(|bucket| bucket.leaves.len())
                .sum(),
        );
        stats
    }

    fn debug_dump(&self, limit: usize) -> Value {
        let mut leaves: Vec<Value> = Vec::new();
        for (coverage_key, bucket) in &self.buckets {
            for (bug_key, leaf) in &bucket.leaves {
                if leaf.seed_ids.is_empty() {
                    continue;
                }
                leaves.push(json!({
                    "coverage_key": coverage_key,
                    "bug_key": bug_key,
                    "n": leaf.stats.n,
                    "q": (leaf.stats.q * 10_000.0).round() / 10_000.0,
                    "seed_count": leaf.seed_ids.len(),
                    "seed_ids": leaf.seed_ids.iter().take(5).collect::<Vec<_>>(),
                }));
            }
        }
        // Most promising leaves first.
        leaves.sort_by(|a, b| {
            let qa = a["q"].as_f64().unwrap_or(0.0);
            let qb = b["q"].as_f64().unwrap_or(0.0);
            qb.total_cmp(&qa)
                .then_with(|| b["n"].as_u64().cmp(&a["n"].as_u64()))
                .then_with(|| {
                    a["coverage_key"]
                        .as_str()
                        .cmp(&b["coverage_key"].as_str())
                })
                .then_with(|| a["bug_key"].as_str().cmp(&b["bug_key"].as_str()))
        });
        let truncated = leaves.len() > limit;
        leaves.truncate(limit);

        let coverage: Vec<Value> = self
            .buckets
            .iter()
            .map(|(key, bucket)| {
                json!({
                    "coverage_key": key,
                    "n": bucket.stats.n,
                    "q": bucket.stats.q,
                })
            })
            .collect();
        json!({
            "stats": self.stats(),
            "root": { "n": self.root.n, "q": self.root.q },
            "coverage": coverage,
            "leaves": leaves,
            "truncated": truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::RunStatus;

    fn seed(id: u64) -> Seed {
        Seed::new(id, format!("seed-{id}").into_bytes(), "valid", "toy")
    }

    fn signals_with_keys(coverage: &str, bug: &str) -> Signals {
        Signals {
            coverage_key: Some(coverage.to_string()),
            bug_key: Some(bug.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn reward_propagates_along_the_full_path() {
        let mut scheduler = UcbTreeScheduler::new(1.0, 8);
        scheduler.add(seed(1), Some(&signals_with_keys("cov:A", NO_KEY)));

        let item = scheduler.next().expect("one seed available");
        assert_eq!(item.seed.id, 1);
        assert_eq!(
            item.path,
            LeasePath::Ucb {
                coverage_key: "cov:A".to_string(),
                bug_key: NO_KEY.to_string(),
            }
        );

        let outcome = Signals {
            new_coverage: true,
            ..Default::default()
        };
        assert!(scheduler.update(&item, 0.4, &outcome));

        let dump = scheduler.debug_dump(10);
        assert_eq!(dump["root"]["n"], 1);
        assert_eq!(dump["root"]["q"], 1.0);
        assert_eq!(dump["coverage"][0]["n"], 1);
        assert_eq!(dump["coverage"][0]["q"], 1.0);
        assert_eq!(dump["leaves"][0]["n"], 1);
        assert_eq!(dump["leaves"][0]["q"], 1.0);
    }

    #[test]
    fn reward_sums_signal_contributions_up_to_six() {
        let full = Signals {
            new_coverage: true,
            new_bug: true,
            crash: true,
            ..Default::default()
        };
        assert_eq!(UcbTreeScheduler::reward_from_signals(&full), 6.0);

        let timeout_only = Signals {
            status: RunStatus::Timeout,
            ..Default::default()
        };
        assert_eq!(UcbTreeScheduler::reward_from_signals(&timeout_only), 3.0);
        assert_eq!(
            UcbTreeScheduler::reward_from_signals(&Signals::default()),
            0.0
        );
    }

    #[test]
    fn visit_counts_stay_consistent_across_mixed_operations() {
        let mut scheduler = UcbTreeScheduler::new(1.0, 2);
        let keys = ["cov:A", "cov:B", "cov:C"];
        for id in 0..9u64 {
            let signals = signals_with_keys(keys[(id % 3) as usize], NO_KEY);
            scheduler.add(seed(id), Some(&signals));
        }

        let mut stale = None;
        for round in 0..30 {
            let item = scheduler.next().unwrap();
            let outcome = Signals {
                new_coverage: round % 2 == 0,
                crash: round % 5 == 0,
                ..Default::default()
            };
            assert!(scheduler.update(&item, 0.2, &outcome));
            if round == 3 {
                stale = Some(item);
            }
        }
        // Replaying an already-returned lease is discarded and must not
        // disturb the counts (update() re-checks them in debug builds).
        let stale = stale.unwrap();
        assert!(!scheduler.update(&stale, 1.0, &Signals::default()));

        let dump = scheduler.debug_dump(100);
        let root_n = dump["root"]["n"].as_u64().unwrap();
        let coverage_total: u64 = dump["coverage"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["n"].as_u64().unwrap())
            .sum();
        assert_eq!(root_n, 30);
        assert_eq!(root_n, coverage_total);
    }

    #[test]
    fn unvisited_buckets_are_tried_before_revisiting() {
        let mut scheduler = UcbTreeScheduler::new(1.0, 8);
        scheduler.add(seed(1), Some(&signals_with_keys("cov:A", NO_KEY)));
        scheduler.add(seed(2), Some(&signals_with_keys("cov:B", NO_KEY)));

        let first = scheduler.next().unwrap();
        scheduler.update(
            &first,
            0.4,
            &Signals {
                new_coverage: true,
                ..Default::default()
            },
        );
        // The other bucket is still unvisited, so it must be selected next
        // even though the first one just earned a reward.
        let second = scheduler.next().unwrap();
        assert_ne!(first.seed.id, second.seed.id);
    }

    #[test]
    fn leaf_picks_the_least_fuzzed_seed_with_fifo_ties() {
        let mut scheduler = UcbTreeScheduler::new(1.0, 8);
        for id in 1..=3 {
            scheduler.add(seed(id), Some(&signals_with_keys("cov:A", NO_KEY)));
        }
        // All at fuzz_count 0: arrival order decides.
        assert_eq!(scheduler.next().unwrap().seed.id, 1);
        assert_eq!(scheduler.next().unwrap().seed.id, 2);
        assert_eq!(scheduler.next().unwrap().seed.id, 3);
        // Now all at 1: back to the oldest.
        assert_eq!(scheduler.next().unwrap().seed.id, 1);
    }

    #[test]
    fn full_leaves_split_with_a_discriminator() {
        let mut scheduler = UcbTreeScheduler::new(1.0, 2);
        for id in 0..5u64 {
            scheduler.add(seed(id), Some(&signals_with_keys("cov:A", "none")));
        }
        assert_eq!(scheduler.len(), 5);

        let stats = scheduler.stats();
        assert_eq!(stats.coverage_buckets, Some(1));
        // Five seeds at two per leaf need three bug-key variants.
        assert_eq!(stats.bug_buckets, Some(3));

        let dump = scheduler.debug_dump(10);
        let bug_keys: Vec<String> = dump["leaves"]
            .as_array()
            .unwrap()
            .iter()
            .map(|leaf| leaf["bug_key"].as_str().unwrap().to_string())
            .collect();
        assert!(bug_keys.contains(&"none".to_string()));
        assert!(bug_keys.contains(&"none#2".to_string()));
        assert!(bug_keys.contains(&"none#3".to_string()));
    }

    #[test]
    fn seeds_without_signals_land_in_the_none_buckets() {
        let mut scheduler = UcbTreeScheduler::new(1.0, 8);
        scheduler.add(seed(1), None);
        let item = scheduler.next().unwrap();
        assert_eq!(
            item.path,
            LeasePath::Ucb {
                coverage_key: NO_KEY.to_string(),
                bug_key: NO_KEY.to_string(),
            }
        );
    }

    #[test]
    fn empty_tree_yields_no_lease() {
        let mut scheduler = UcbTreeScheduler::new(1.0, 8);
        assert!(scheduler.next().is_none());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn identical_call_sequences_yield_identical_leases() {
        let run = || {
            let mut scheduler = UcbTreeScheduler::new(1.0, 4);
            let keys = ["cov:A", "cov:B"];
            let mut leases = Vec::new();
            for id in 0..6u64 {
                let signals = signals_with_keys(keys[(id % 2) as usize], NO_KEY);
                scheduler.add(seed(id), Some(&signals));
            }
            for round in 0..20 {
                let item = scheduler.next().unwrap();
                leases.push(item.seed.id);
                let outcome = Signals {
                    new_coverage: round % 3 == 0,
                    new_bug: round % 7 == 0,
                    ..Default::default()
                };
                scheduler.update(&item, 0.1, &outcome);
            }
            leases
        };
        assert_eq!(run(), run());
    }
}
