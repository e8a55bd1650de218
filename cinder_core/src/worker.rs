use crate::scheduler::SchedulerItem;
use crate::signals::Signals;
use rand_core::RngCore;

/// A newly interesting input produced during a lease, to be promoted to a
/// seed by the owner.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub payload: Vec<u8>,
    /// Execution path the input was first observed on.
    pub path_id: String,
    /// Signals of the run that produced the input; used for scheduler
    /// placement when the owner registers the derived seed.
    pub signals: Signals,
}

/// Aggregate outcome of one lease.
///
/// The worker performs up to the budgeted number of mutation+execution
/// attempts locally and reports the maximum interestingness score, the
/// union of the signals it observed (with representative bucketing keys),
/// and any inputs worth keeping. The owner calls `update()` once with the
/// summary and `add()` per discovery.
#[derive(Debug, Clone, Default)]
pub struct LeaseSummary {
    pub isinteresting_score: f64,
    pub signals: Signals,
    pub discoveries: Vec<Discovery>,
}

/// A mutation+execution collaborator.
///
/// Workers own all blocking concerns (target invocation, timeouts,
/// coverage extraction); the scheduling core never executes anything
/// itself. Implementations communicate with the owner purely by value.
pub trait Worker<R: RngCore + ?Sized> {
    /// Runs up to `energy` attempts against the leased seed and returns
    /// the aggregated summary.
    fn run_lease(&mut self, item: &SchedulerItem, energy: u32, rng: &mut R) -> LeaseSummary;
}
