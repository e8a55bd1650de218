use crate::config::{ConfigError, CoreConfig, PriorityMode, SchedulerKind};
use crate::seed::{Seed, SeedStats};
use crate::signals::Signals;
use crate::ucb::UcbTreeScheduler;
use serde::Serialize;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};

/// Cap on tracked outstanding leases. Leases abandoned by workers are
/// pruned oldest-first past this point, so a session that never returns
/// some leases cannot grow the ledger without bound.
const MAX_OUTSTANDING_LEASES: usize = 1024;

/// Decay applied to a heap seed's priority when it is leased, so it will
/// be revisited but at lower urgency until feedback arrives.
const HEAP_DECAY: f64 = 0.9;

/// Priority for the first seed added to an empty heap.
const HEAP_EMPTY_PRIORITY: f64 = 0.5;

/// Opaque backend position carried by a `SchedulerItem`.
///
/// Callers never inspect it; the issuing backend resolves it on `update`.
/// Keeping keys instead of node references avoids any ownership cycle
/// between items and the scheduler's internal structures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeasePath {
    Queue,
    Heap,
    Ucb {
        coverage_key: String,
        bug_key: String,
    },
}

/// Handle for one lease, returned by `next()` and consumed by `update()`.
#[derive(Debug, Clone)]
pub struct SchedulerItem {
    /// Unique per lease.
    pub item_id: u64,
    /// Snapshot of the leased seed.
    pub seed: Seed,
    pub path: LeasePath,
    /// Staleness token; an `update` whose sequence is no longer
    /// outstanding is discarded.
    pub sequence: u64,
}

/// Snapshot returned by `stats()`. Backend-specific fields stay `None`
/// for backends they do not apply to.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub kind: &'static str,
    pub size: usize,
    pub total_leased: u64,
    pub total_updated: u64,
    pub outstanding: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_priority: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_nodes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_buckets: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bug_buckets: Option<usize>,
}

impl SchedulerStats {
    pub(crate) fn new(
        kind: &'static str,
        size: usize,
        ledger: &LeaseLedger,
    ) -> Self {
        Self {
            kind,
            size,
            total_leased: ledger.total_leased,
            total_updated: ledger.total_updated,
            outstanding: ledger.outstanding.len(),
            priority_mode: None,
            mean_priority: None,
            tree_nodes: None,
            coverage_buckets: None,
            bug_buckets: None,
        }
    }
}

/// Per-seed record shared by every backend: the seed itself, its mutable
/// stats, and the interestingness history reported through `update`.
#[derive(Debug, Clone)]
pub(crate) struct SeedEntry {
    pub seed: Seed,
    pub stats: SeedStats,
    /// Monotonic arrival index, used for FIFO tie-breaks.
    pub added_order: u64,
    pub updates: u64,
    pub total_score: f64,
    pub last_score: Option<f64>,
}

impl SeedEntry {
    pub(crate) fn new(seed: Seed, added_order: u64, signals: Option<&Signals>) -> Self {
        let mut stats = SeedStats::new(seed.id);
        if let Some(bitmap) = signals.and_then(|s| s.coverage_bitmap.clone()) {
            stats.coverage_bitmap = Some(bitmap);
        } else if let Some(hint) = &seed.coverage_hint {
            stats.coverage_bitmap = Some(hint.clone());
        }
        Self {
            seed,
            stats,
            added_order,
            updates: 0,
            total_score: 0.0,
            last_score: None,
        }
    }

    pub(crate) fn record(&mut self, score: f64, signals: &Signals) {
        self.updates += 1;
        self.total_score += score;
        self.last_score = Some(score);
        if let Some(bitmap) = &signals.coverage_bitmap {
            self.stats.coverage_bitmap = Some(bitmap.clone());
        }
    }

    pub(crate) fn avg_score(&self) -> f64 {
        if self.updates == 0 {
            0.0
        } else {
            self.total_score / self.updates as f64
        }
    }
}

/// Tracks leases handed out but not yet returned.
#[derive(Debug, Default)]
pub(crate) struct LeaseLedger {
    outstanding: BTreeMap<u64, u64>,
    next_sequence: u64,
    total_leased: u64,
    total_updated: u64,
}

impl LeaseLedger {
    /// Opens a lease for `seed_id` and returns its sequence number.
    pub(crate) fn open(&mut self, seed_id: u64) -> u64 {
        self.next_sequence += 1;
        self.total_leased += 1;
        self.outstanding.insert(self.next_sequence, seed_id);
        if self.outstanding.len() > MAX_OUTSTANDING_LEASES {
            // Oldest lease is the most likely to have been abandoned.
            self.outstanding.pop_first();
        }
        self.next_sequence
    }

    /// Closes a lease. Returns the leased seed id, or `None` when the
    /// sequence is unknown (stale or already returned).
    pub(crate) fn close(&mut self, sequence: u64) -> Option<u64> {
        let seed_id = self.outstanding.remove(&sequence);
        if seed_id.is_some() {
            self.total_updated += 1;
        }
        seed_id
    }
}

/// Common contract for the seed scheduling backends.
///
/// A scheduler owns its seeds and their bookkeeping; all calls happen in
/// the owner's sequential context. `next` leases a seed to a worker and
/// `update` returns the lease with the worker's verdict. Stale leases
/// (unknown or already-returned sequence numbers) are logged and ignored
/// rather than propagated as errors.
pub trait SeedScheduler: Send + Sync {
    /// Registers a seed, optionally with the signals that produced it
    /// (backends use them for placement). Adding a seed whose id is
    /// already tracked is a deterministic no-op.
    fn add(&mut self, seed: Seed, signals: Option<&Signals>);

    /// Leases the next seed. Returns `None` iff the scheduler is empty.
    fn next(&mut self) -> Option<SchedulerItem>;

    /// Applies worker feedback for a lease. Returns `false` when the item
    /// was stale and the update was discarded.
    fn update(&mut self, item: &SchedulerItem, isinteresting_score: f64, signals: &Signals)
        -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> SchedulerStats;

    /// Structured snapshot for debugging, truncated to `limit` entries.
    fn debug_dump(&self, limit: usize) -> Value;
}

/// Builds the backend selected by the configuration.
///
/// Validation is eager: an invalid configuration never produces a
/// scheduler.
pub fn build_scheduler(config: &CoreConfig) -> Result<Box<dyn SeedScheduler>, ConfigError> {
    config.validate()?;
    Ok(match config.scheduler.kind {
        SchedulerKind::Queue => Box::new(QueueScheduler::new()),
        SchedulerKind::Heap => Box::new(HeapScheduler::new(config.scheduler.priority_mode)),
        SchedulerKind::UcbTree => Box::new(UcbTreeScheduler::new(
            config.scheduler.ucb_c,
            config.scheduler.max_seeds_per_leaf,
        )),
    })
}

/// Cyclic FIFO scheduler baseline.
///
/// `next()` rotates the leased seed to the tail, so every seed is visited
/// before any is revisited. `update()` records the score but never
/// reorders.
#[derive(Debug, Default)]
pub struct QueueScheduler {
    ring: VecDeque<u64>,
    entries: HashMap<u64, SeedEntry>,
    ledger: LeaseLedger,
    added: u64,
}

impl QueueScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeedScheduler for QueueScheduler {
    fn add(&mut self, seed: Seed, signals: Option<&Signals>) {
        if self.entries.contains_key(&seed.id) {
            log::debug!("seed {} already tracked, ignoring duplicate add", seed.id);
            return;
        }
        self.added += 1;
        let id = seed.id;
        self.entries
            .insert(id, SeedEntry::new(seed, self.added, signals));
        self.ring.push_back(id);
    }

    fn next(&mut self) -> Option<SchedulerItem> {
        let seed_id = self.ring.pop_front()?;
        self.ring.push_back(seed_id);
        let entry = self.entries.get_mut(&seed_id)?;
        entry.stats.fuzz_count += 1;
        let sequence = self.ledger.open(seed_id);
        Some(SchedulerItem {
            item_id: sequence,
            seed: entry.seed.clone(),
            path: LeasePath::Queue,
            sequence,
        })
    }

    fn update(
        &mut self,
        item: &SchedulerItem,
        isinteresting_score: f64,
        signals: &Signals,
    ) -> bool {
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
        true
    }

    fn len(&self) -> usize {
        self.ring.len()
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats::new("queue", self.ring.len(), &self.ledger)
    }

    fn debug_dump(&self, limit: usize) -> Value {
        let order: Vec<Value> = self
            .ring
            .iter()
            .take(limit)
            .filter_map(|id| self.entries.get(id))
            .map(|entry| {
                json!({
                    "seed_id": entry.seed.id,
                    "bucket": entry.seed.bucket,
                    "fuzz_count": entry.stats.fuzz_count,
                    "last_score": entry.last_score,
                    "avg_score": entry.avg_score(),
                })
            })
            .collect();
        json!({
            "stats": self.stats(),
            "ring_order": order,
            "truncated": self.ring.len() > limit,
        })
    }
}

/// One heap slot. Slots are immutable once pushed; priority changes push
/// a replacement slot with a bumped epoch and the stale slot is skipped
/// when popped.
#[derive(Debug)]
struct HeapSlot {
    priority: f64,
    /// Arrival index of the seed; older seeds win priority ties.
    order: u64,
    epoch: u64,
    seed_id: u64,
}

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapSlot {}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

#[derive(Debug, Clone, Copy)]
struct HeapInfo {
    priority: f64,
    epoch: u64,
}

/// Max-priority scheduler over the seeds' interestingness history.
///
/// `add` inserts at the mean of the current priorities so newcomers are
/// neither favored nor starved. `next()` pops the maximum and immediately
/// re-inserts it decayed; `update()` re-inserts it at the recomputed
/// priority for its mode.
#[derive(Debug)]
pub struct HeapScheduler {
    mode: PriorityMode,
    heap: BinaryHeap<HeapSlot>,
    entries: HashMap<u64, SeedEntry>,
    // Ordered so that the mean-priority sum is evaluated in a fixed order;
    // two identically-driven instances must agree bit-for-bit.
    info: BTreeMap<u64, HeapInfo>,
    ledger: LeaseLedger,
    added: u64,
}

impl HeapScheduler {
    pub fn new(mode: PriorityMode) -> Self {
        Self {
            mode,
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            info: BTreeMap::new(),
            ledger: LeaseLedger::default(),
            added: 0,
        }
    }

    fn mean_priority(&self) -> Option<f64> {
        if self.info.is_empty() {
            return None;
        }
        let total: f64 = self.info.values().map(|info| info.priority).sum();
        Some(total / self.info.len() as f64)
    }

    fn push_slot(&mut self, seed_id: u64, order: u64) {
        let Some(info) = self.info.get(&seed_id) else {
            return;
        };
        self.heap.push(HeapSlot {
            priority: info.priority,
            order,
            epoch: info.epoch,
            seed_id,
        });
    }
}

impl SeedScheduler for HeapScheduler {
    fn add(&mut self, seed: Seed, signals: Option<&Signals>) {
        if self.entries.contains_key(&seed.id) {
            log::debug!("seed {} already tracked, ignoring duplicate add", seed.id);
            return;
        }
        self.added += 1;
        let priority = self.mean_priority().unwrap_or(HEAP_EMPTY_PRIORITY);
        let id = seed.id;
        let order = self.added;
        self.entries.insert(id, SeedEntry::new(seed, order, signals));
        self.info.insert(id, HeapInfo { priority, epoch: 0 });
        self.push_slot(id, order);
    }

    fn next(&mut self) -> Option<SchedulerItem> {
        loop {
            let slot = self.heap.pop()?;
            let Some(info) = self.info.get_mut(&slot.seed_id) else {
                continue;
            };
            if info.epoch != slot.epoch {
                // Superseded by a later update or lease.
                continue;
            }
            let Some(entry) = self.entries.get_mut(&slot.seed_id) else {
                continue;
            };
            entry.stats.fuzz_count += 1;
            info.priority *= HEAP_DECAY;
            info.epoch += 1;
            let order = entry.added_order;
            let seed = entry.seed.clone();
            let sequence = self.ledger.open(slot.seed_id);
            self.push_slot(slot.seed_id, order);
            return Some(SchedulerItem {
                item_id: sequence,
                seed,
                path: LeasePath::Heap,
                sequence,
            });
        }
    }

    fn update(
        &mut self,
        item: &SchedulerItem,
        isinteresting_score: f64,
        signals: &Signals,
    ) -> bool {
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
        let priority = match self.mode {
            PriorityMode::AvgScore => entry.avg_score(),
            PriorityMode::LastScore => isinteresting_score,
        };
        let order = entry.added_order;
        if let Some(info) = self.info.get_mut(&seed_id) {
            info.priority = priority;
            info.epoch += 1;
        }
        self.push_slot(seed_id, order);
        true
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats::new("heap", self.entries.len(), &self.ledger);
        stats.priority_mode = Some(self.mode.as_str());
        stats.mean_priority = self.mean_priority();
        stats
    }

    fn debug_dump(&self, limit: usize) -> Value {
        let mut ordered: Vec<(&SeedEntry, f64)> = self
            .entries
            .values()
            .map(|entry| {
                let priority = self
                    .info
                    .get(&entry.seed.id)
                    .map(|info| info.priority)
                    .unwrap_or(0.0);
                (entry, priority)
            })
            .collect();
        ordered.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| a.0.added_order.cmp(&b.0.added_order))
        });
        let items: Vec<Value> = ordered
            .iter()
            .take(limit)
            .map(|(entry, priority)| {
                json!({
                    "seed_id": entry.seed.id,
                    "bucket": entry.seed.bucket,
                    "priority": priority,
                    "fuzz_count": entry.stats.fuzz_count,
                    "last_score": entry.last_score,
                    "avg_score": entry.avg_score(),
                })
            })
            .collect();
        json!({
            "stats": self.stats(),
            "priority_order": items,
            "truncated": self.entries.len() > limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;

    fn seed(id: u64) -> Seed {
        Seed::new(id, format!("seed-{id}").into_bytes(), "valid", "toy")
    }

    fn no_signals() -> Signals {
        Signals::default()
    }

    #[test]
    fn build_scheduler_honors_kind_and_rejects_invalid_config() {
        for (kind, expected) in [
            (SchedulerKind::Queue, "queue"),
            (SchedulerKind::Heap, "heap"),
            (SchedulerKind::UcbTree, "ucb_tree"),
        ] {
            let config = CoreConfig {
                scheduler: SchedulerConfig {
                    kind,
                    ..Default::default()
                },
                ..Default::default()
            };
            let scheduler = build_scheduler(&config).expect("valid config");
            assert_eq!(scheduler.stats().kind, expected);
        }

        let mut bad = CoreConfig::default();
        bad.power.min_energy = 100;
        bad.power.max_energy = 10;
        assert!(build_scheduler(&bad).is_err());
    }

    #[test]
    fn queue_rotates_round_robin() {
        let mut scheduler = QueueScheduler::new();
        for id in 1..=3 {
            scheduler.add(seed(id), None);
        }
        let leased: Vec<u64> = (0..4).map(|_| scheduler.next().unwrap().seed.id).collect();
        assert_eq!(leased, vec![1, 2, 3, 1]);
    }

    #[test]
    fn queue_never_starves_a_seed() {
        let mut scheduler = QueueScheduler::new();
        for id in 0..7 {
            scheduler.add(seed(id), None);
        }
        let window: Vec<u64> = (0..scheduler.len())
            .map(|_| scheduler.next().unwrap().seed.id)
            .collect();
        for id in 0..7 {
            assert!(window.contains(&id), "seed {id} missing from one full pass");
        }
    }

    #[test]
    fn queue_add_grows_len_and_duplicate_add_is_a_noop() {
        let mut scheduler = QueueScheduler::new();
        assert!(scheduler.is_empty());
        scheduler.add(seed(1), None);
        assert_eq!(scheduler.len(), 1);
        scheduler.add(seed(1), None);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.stats().size, 1);
    }

    #[test]
    fn queue_next_on_empty_returns_none() {
        let mut scheduler = QueueScheduler::new();
        assert!(scheduler.next().is_none());
    }

    #[test]
    fn second_update_with_the_same_item_is_stale() {
        let mut scheduler = QueueScheduler::new();
        scheduler.add(seed(1), None);
        let item = scheduler.next().unwrap();
        assert!(scheduler.update(&item, 0.5, &no_signals()));
        assert!(!scheduler.update(&item, 0.5, &no_signals()));
        let stats = scheduler.stats();
        assert_eq!(stats.total_leased, 1);
        assert_eq!(stats.total_updated, 1);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn abandoned_leases_are_pruned_past_the_cap() {
        let mut scheduler = QueueScheduler::new();
        scheduler.add(seed(1), None);
        let first = scheduler.next().unwrap();
        for _ in 0..MAX_OUTSTANDING_LEASES {
            scheduler.next().unwrap();
        }
        // The very first lease fell off the ledger and is now stale.
        assert!(!scheduler.update(&first, 0.9, &no_signals()));
        assert!(scheduler.stats().outstanding <= MAX_OUTSTANDING_LEASES);
    }

    #[test]
    fn heap_prefers_the_higher_scored_seed() {
        let mut scheduler = HeapScheduler::new(PriorityMode::AvgScore);
        scheduler.add(seed(1), None);
        scheduler.add(seed(2), None);

        let item1 = scheduler.next().unwrap();
        assert_eq!(item1.seed.id, 1, "equal priorities break ties FIFO");
        let item2 = scheduler.next().unwrap();
        assert_eq!(item2.seed.id, 2);

        assert!(scheduler.update(&item1, 0.9, &no_signals()));
        assert!(scheduler.update(&item2, 0.1, &no_signals()));

        assert_eq!(scheduler.next().unwrap().seed.id, 1);
    }

    #[test]
    fn heap_decay_lets_other_seeds_through() {
        let mut scheduler = HeapScheduler::new(PriorityMode::LastScore);
        scheduler.add(seed(1), None);
        scheduler.add(seed(2), None);
        let item = scheduler.next().unwrap();
        scheduler.update(&item, 1.0, &no_signals());

        // Seed 1 leads, but repeated leasing decays it below seed 2.
        let mut leased = Vec::new();
        for _ in 0..10 {
            leased.push(scheduler.next().unwrap().seed.id);
        }
        assert_eq!(leased[0], 1);
        assert!(leased.contains(&2), "decay must let seed 2 through: {leased:?}");
    }

    #[test]
    fn heap_last_score_mode_overwrites_history() {
        let mut scheduler = HeapScheduler::new(PriorityMode::LastScore);
        scheduler.add(seed(1), None);
        scheduler.add(seed(2), None);

        let item1 = scheduler.next().unwrap();
        let item2 = scheduler.next().unwrap();
        scheduler.update(&item1, 1.0, &no_signals());
        scheduler.update(&item2, 0.5, &no_signals());

        // A low latest score buries seed 1 regardless of its strong past;
        // avg-score mode would still rank it above seed 2 here.
        let item1 = scheduler.next().unwrap();
        assert_eq!(item1.seed.id, 1);
        scheduler.update(&item1, 0.05, &no_signals());
        assert_eq!(scheduler.next().unwrap().seed.id, 2);
    }

    #[test]
    fn heap_avg_mode_tracks_the_running_average() {
        let mut scheduler = HeapScheduler::new(PriorityMode::AvgScore);
        scheduler.add(seed(1), None);
        let item = scheduler.next().unwrap();
        scheduler.update(&item, 0.4, &no_signals());
        let item = scheduler.next().unwrap();
        scheduler.update(&item, 0.8, &no_signals());

        let stats = scheduler.stats();
        let mean = stats.mean_priority.expect("heap reports mean priority");
        assert!((mean - 0.6).abs() < 1e-9);
        assert_eq!(stats.priority_mode, Some("avg_score"));
    }

    #[test]
    fn heap_stale_update_does_not_change_priority() {
        let mut scheduler = HeapScheduler::new(PriorityMode::LastScore);
        scheduler.add(seed(1), None);
        scheduler.add(seed(2), None);
        let item1 = scheduler.next().unwrap();
        assert!(scheduler.update(&item1, 0.2, &no_signals()));
        // Replaying the same lease with a huge score must be ignored.
        assert!(!scheduler.update(&item1, 1.0, &no_signals()));
        let dump = scheduler.debug_dump(10);
        let top = &dump["priority_order"][0];
        assert_eq!(top["seed_id"], 2, "stale update must not promote seed 1");
    }

    #[test]
    fn heap_debug_dump_orders_by_priority_and_flags_truncation() {
        let mut scheduler = HeapScheduler::new(PriorityMode::AvgScore);
        for id in 1..=4 {
            scheduler.add(seed(id), None);
        }
        let item = scheduler.next().unwrap();
        scheduler.update(&item, 1.0, &no_signals());

        let dump = scheduler.debug_dump(2);
        assert_eq!(dump["priority_order"].as_array().unwrap().len(), 2);
        assert_eq!(dump["truncated"], true);
        assert_eq!(dump["priority_order"][0]["seed_id"], 1);
    }

    #[test]
    fn identical_call_sequences_yield_identical_leases() {
        let run = || {
            let mut scheduler = HeapScheduler::new(PriorityMode::AvgScore);
            let mut leases = Vec::new();
            for id in 1..=4 {
                scheduler.add(seed(id), None);
            }
            for round in 0..12 {
                let item = scheduler.next().unwrap();
                leases.push(item.seed.id);
                let score = (round % 3) as f64 / 3.0;
                scheduler.update(&item, score, &no_signals());
            }
            leases
        };
        assert_eq!(run(), run());
    }
}
