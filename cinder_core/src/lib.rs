pub mod config;
pub mod corpus;
pub mod hybrid;
pub mod interest;
pub mod power;
pub mod scheduler;
pub mod seed;
pub mod signals;
pub mod ucb;
pub mod worker;

pub use config::{
    ConfigError, CoreConfig, EnergyBounds, FuzzerSettings, HybridConfig, PriorityMode,
    SchedulerConfig, SchedulerKind,
};
pub use corpus::{CorpusError, SeedCorpus};
pub use hybrid::{HybridPowerScheduler, ScheduleMode};
pub use interest::score_signals;
pub use power::{compute_edge_frequencies, compute_power_schedule, pick_seed_id, PowerScheduleResult};
pub use scheduler::{
    build_scheduler, HeapScheduler, LeasePath, QueueScheduler, SchedulerItem, SchedulerStats,
    SeedScheduler,
};
pub use seed::{Seed, SeedStats, DISCOVERED_SEED_ID_BASE};
pub use signals::{BugSignature, RunStatus, Signals, WrappedResult, NO_KEY};
pub use ucb::UcbTreeScheduler;
pub use worker::{Discovery, LeaseSummary, Worker};
