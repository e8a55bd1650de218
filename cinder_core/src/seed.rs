use serde::{Deserialize, Serialize};

/// First id handed to seeds synthesized from worker discoveries.
///
/// Corpus loaders assign dense ids starting at zero; derived seeds start
/// here so the two ranges never collide within a session.
pub const DISCOVERED_SEED_ID_BASE: u64 = 1_000_000;

/// An immutable fuzz input.
///
/// Seeds are created by the corpus loader or synthesized from a worker's
/// interesting mutation, and are never mutated after creation. The `id`
/// is stable and unique within a fuzzing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed {
    pub id: u64,
    pub payload: Vec<u8>,
    /// Corpus bucket label this seed belongs to (e.g. `valid`, `near_valid`).
    pub bucket: String,
    /// Target family tag (e.g. `json-decoder`).
    pub family: String,
    /// Lineage: the seed this one was derived from, if any.
    pub parent_id: Option<u64>,
    /// Per-edge hit hint captured when the seed was discovered, if any.
    pub coverage_hint: Option<Vec<u32>>,
}

impl Seed {
    pub fn new(
        id: u64,
        payload: impl Into<Vec<u8>>,
        bucket: impl Into<String>,
        family: impl Into<String>,
    ) -> Self {
        Self {
            id,
            payload: payload.into(),
            bucket: bucket.into(),
            family: family.into(),
            parent_id: None,
            coverage_hint: None,
        }
    }

    /// Synthesizes a seed from a worker discovery. The child inherits the
    /// parent's bucket and family and records the lineage.
    pub fn derived(id: u64, payload: impl Into<Vec<u8>>, parent: &Seed) -> Self {
        Self {
            id,
            payload: payload.into(),
            bucket: parent.bucket.clone(),
            family: parent.family.clone(),
            parent_id: Some(parent.id),
            coverage_hint: None,
        }
    }

    /// Lossy UTF-8 view of the payload, for logs and debug dumps.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Mutable per-seed bookkeeping owned by the seed scheduler.
///
/// `fuzz_count` counts leases, not executions; the power scheduler and
/// the UCB leaf selection both read it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedStats {
    pub seed_id: u64,
    pub exec_time_ms: Option<f64>,
    pub coverage_bitmap: Option<Vec<u32>>,
    pub fuzz_count: u64,
}

impl SeedStats {
    pub fn new(seed_id: u64) -> Self {
        Self {
            seed_id,
            ..Default::default()
        }
    }
}
