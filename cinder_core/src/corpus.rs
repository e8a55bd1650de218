use crate::seed::Seed;
use rand_core::RngCore;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors raised by corpus loading and sampling.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The named bucket does not exist in this corpus.
    #[error("unknown bucket {0:?}")]
    UnknownBucket(String),

    /// The named bucket exists but holds no seeds.
    #[error("bucket {0:?} has no seeds")]
    EmptyBucket(String),

    /// A ratio-based batch requested more seeds than a bucket holds.
    /// Batches sample without replacement, so the request cannot be met.
    #[error("batch requests {requested} seeds from bucket {bucket:?} but only {available} are available")]
    BatchOverflow {
        bucket: String,
        requested: usize,
        available: usize,
    },

    /// An I/O error occurred while reading a corpus file.
    #[error("corpus I/O error: {0}")]
    Io(String),

    /// A corpus file could not be parsed.
    #[error("corpus parse error: {0}")]
    Parse(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Parse(err.to_string())
    }
}

/// On-disk corpus file shape: a family name plus labelled buckets of
/// seed texts.
#[derive(Deserialize, Debug)]
struct CorpusFile {
    family: String,
    #[serde(default)]
    buckets: BTreeMap<String, Vec<CorpusFileSeed>>,
}

#[derive(Deserialize, Debug)]
struct CorpusFileSeed {
    text: String,
}

/// A static, bucketed collection of fuzz seeds for one target family.
///
/// Buckets carry labels like `valid`, `near_valid`, or `string_stress`.
/// Seed ids are dense, assigned in insertion order, and never reused;
/// seeds discovered during fuzzing take ids from
/// [`crate::seed::DISCOVERED_SEED_ID_BASE`] upward so the ranges stay
/// disjoint.
#[derive(Debug, Default)]
pub struct SeedCorpus {
    family: String,
    buckets: BTreeMap<String, Vec<Seed>>,
    next_id: u64,
}

impl SeedCorpus {
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            buckets: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Loads a corpus from a JSON file. Buckets and seeds keep the file's
    /// order, so ids are stable across reloads of the same file.
    pub fn load_from_file(path: &Path) -> Result<Self, CorpusError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CorpusError::Io(format!("failed to read corpus file {path:?}: {e}")))?;
        let parsed: CorpusFile = serde_json::from_str(&content)
            .map_err(|e| CorpusError::Parse(format!("corpus file {path:?}: {e}")))?;

        let mut corpus = SeedCorpus::new(parsed.family);
        for (bucket, entries) in parsed.buckets {
            for entry in entries {
                corpus.add_seed(&bucket, entry.text.into_bytes());
            }
        }
        Ok(corpus)
    }

    /// Adds a seed to `bucket`, assigning the next dense id. Returns the id.
    pub fn add_seed(&mut self, bucket: &str, payload: impl Into<Vec<u8>>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let seed = Seed::new(id, payload, bucket, self.family.clone());
        self.buckets.entry(bucket.to_string()).or_default().push(seed);
        id
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_names(&self) -> Vec<&str> {
        self.buckets.keys().map(String::as_str).collect()
    }

    pub fn bucket(&self, name: &str) -> Result<&[Seed], CorpusError> {
        self.buckets
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| CorpusError::UnknownBucket(name.to_string()))
    }

    /// All seeds, bucket by bucket in bucket-name order.
    pub fn seeds(&self) -> impl Iterator<Item = &Seed> {
        self.buckets.values().flatten()
    }

    /// Samples one seed: uniformly across the whole corpus, or uniformly
    /// within `bucket` when one is named.
    pub fn sample(&self, rng: &mut dyn RngCore, bucket: Option<&str>) -> Result<&Seed, CorpusError> {
        match bucket {
            Some(name) => {
                let seeds = self.bucket(name)?;
                if seeds.is_empty() {
                    return Err(CorpusError::EmptyBucket(name.to_string()));
                }
                Ok(&seeds[rng.next_u64() as usize % seeds.len()])
            }
            None => {
                let total = self.len();
                if total == 0 {
                    return Err(CorpusError::EmptyBucket("*".to_string()));
                }
                let index = rng.next_u64() as usize % total;
                self.seeds()
                    .nth(index)
                    .ok_or_else(|| CorpusError::EmptyBucket("*".to_string()))
            }
        }
    }

    /// Samples one seed with bucket choice weighted by `weights`. Buckets
    /// with no positive weight are skipped; if no weight is positive the
    /// draw falls back to a uniform bucket choice.
    pub fn sample_weighted(
        &self,
        rng: &mut dyn RngCore,
        weights: &BTreeMap<String, f64>,
    ) -> Result<&Seed, CorpusError> {
        if self.is_empty() {
            return Err(CorpusError::EmptyBucket("*".to_string()));
        }
        let candidates: Vec<(&str, f64)> = self
            .buckets
            .iter()
            .filter(|(_, seeds)| !seeds.is_empty())
            .map(|(name, _)| {
                (
                    name.as_str(),
                    weights.get(name).copied().unwrap_or(0.0).max(0.0),
                )
            })
            .collect();
        let total: f64 = candidates.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            let index = rng.next_u64() as usize % candidates.len();
            return self.sample(rng, Some(candidates[index].0));
        }

        let threshold = (rng.next_u64() as f64 / u64::MAX as f64) * total;
        let mut cumulative = 0.0;
        for (name, weight) in &candidates {
            cumulative += weight;
            if cumulative >= threshold {
                return self.sample(rng, Some(name));
            }
        }
        self.sample(rng, Some(candidates[candidates.len() - 1].0))
    }

    /// Draws a batch of `total` seeds split across buckets by `ratios`,
    /// without replacement. Surfaces [`CorpusError::BatchOverflow`] when a
    /// bucket's share exceeds what it holds.
    pub fn sample_batch(
        &self,
        rng: &mut dyn RngCore,
        total: usize,
        ratios: &BTreeMap<String, f64>,
    ) -> Result<Vec<&Seed>, CorpusError> {
        let mut batch = Vec::with_capacity(total);
        for (name, ratio) in ratios {
            let requested = (total as f64 * ratio.max(0.0)).round() as usize;
            if requested == 0 {
                continue;
            }
            let seeds = self.bucket(name)?;
            if requested > seeds.len() {
                return Err(CorpusError::BatchOverflow {
                    bucket: name.clone(),
                    requested,
                    available: seeds.len(),
                });
            }
            // Partial Fisher-Yates over the index space.
            let mut indices: Vec<usize> = (0..seeds.len()).collect();
            for slot in 0..requested {
                let pick = slot + (rng.next_u64() as usize % (indices.len() - slot));
                indices.swap(slot, pick);
                batch.push(&seeds[indices[slot]]);
            }
        }
        Ok(batch)
    }

    pub fn summary(&self) -> serde_json::Value {
        let counts: BTreeMap<&str, usize> = self
            .buckets
            .iter()
            .map(|(name, seeds)| (name.as_str(), seeds.len()))
            .collect();
        json!({
            "family": self.family,
            "total_seeds": self.len(),
            "bucket_counts": counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::io::Write;

    fn corpus() -> SeedCorpus {
        let mut corpus = SeedCorpus::new("json-decoder");
        corpus.add_seed("valid", "{}");
        corpus.add_seed("valid", "[1, 2, 3]");
        corpus.add_seed("near_valid", "{\"a\": }");
        corpus.add_seed("string_stress", "\"\\u0000\"");
        corpus
    }

    #[test]
    fn ids_are_dense_and_buckets_keep_their_seeds() {
        let corpus = corpus();
        assert_eq!(corpus.len(), 4);
        assert_eq!(corpus.bucket("valid").unwrap().len(), 2);
        let ids: Vec<u64> = corpus.seeds().map(|seed| seed.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
        assert_eq!(corpus.bucket("valid").unwrap()[0].family, "json-decoder");
    }

    #[test]
    fn unknown_bucket_is_an_error() {
        let corpus = corpus();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        match corpus.sample(&mut rng, Some("mythical")) {
            Err(CorpusError::UnknownBucket(name)) => assert_eq!(name, "mythical"),
            other => panic!("expected UnknownBucket, got {other:?}"),
        }
    }

    #[test]
    fn sampling_covers_the_corpus() {
        let corpus = corpus();
        let mut rng = ChaCha8Rng::from_seed([7; 32]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(corpus.sample(&mut rng, None).unwrap().id);
        }
        assert_eq!(seen.len(), corpus.len());

        for _ in 0..50 {
            let seed = corpus.sample(&mut rng, Some("valid")).unwrap();
            assert_eq!(seed.bucket, "valid");
        }
    }

    #[test]
    fn weighted_sampling_respects_zero_weights() {
        let corpus = corpus();
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        let mut weights = BTreeMap::new();
        weights.insert("valid".to_string(), 1.0);
        for _ in 0..100 {
            let seed = corpus.sample_weighted(&mut rng, &weights).unwrap();
            assert_eq!(seed.bucket, "valid");
        }
    }

    #[test]
    fn batch_overflow_is_surfaced_to_the_caller() {
        let corpus = corpus();
        let mut rng = ChaCha8Rng::from_seed([1; 32]);
        let mut ratios = BTreeMap::new();
        ratios.insert("near_valid".to_string(), 1.0);
        match corpus.sample_batch(&mut rng, 5, &ratios) {
            Err(CorpusError::BatchOverflow {
                bucket,
                requested,
                available,
            }) => {
                assert_eq!(bucket, "near_valid");
                assert_eq!(requested, 5);
                assert_eq!(available, 1);
            }
            other => panic!("expected BatchOverflow, got {other:?}"),
        }
    }

    #[test]
    fn batches_sample_without_replacement() {
        let corpus = corpus();
        let mut rng = ChaCha8Rng::from_seed([9; 32]);
        let mut ratios = BTreeMap::new();
        ratios.insert("valid".to_string(), 1.0);
        let batch = corpus.sample_batch(&mut rng, 2, &ratios).unwrap();
        assert_eq!(batch.len(), 2);
        assert_ne!(batch[0].id, batch[1].id);
    }

    #[test]
    fn corpus_loads_from_a_json_file() -> Result<(), CorpusError> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "family": "json-decoder",
                "buckets": {{
                    "valid": [{{"text": "{{}}"}}, {{"text": "[]"}}],
                    "near_valid": [{{"text": "[1,"}}]
                }}
            }}"#
        )
        .unwrap();

        let corpus = SeedCorpus::load_from_file(&path)?;
        assert_eq!(corpus.family(), "json-decoder");
        assert_eq!(corpus.len(), 3);
        assert_eq!(corpus.bucket_names(), vec!["near_valid", "valid"]);
        assert_eq!(corpus.summary()["total_seeds"], 3);
        dir.close().unwrap();
        Ok(())
    }

    #[test]
    fn malformed_corpus_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.json");
        std::fs::write(&path, "not json at all").unwrap();
        match SeedCorpus::load_from_file(&path) {
            Err(CorpusError::Parse(_)) => {}
            other => panic!("expected Parse error, got {other:?}"),
        }
        match SeedCorpus::load_from_file(&dir.path().join("missing.json")) {
            Err(CorpusError::Io(_)) => {}
            other => panic!("expected Io error, got {other:?}"),
        }
        dir.close().unwrap();
    }
}
