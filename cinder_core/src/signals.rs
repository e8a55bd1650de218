use serde::{Deserialize, Serialize};

/// Bucket key used when no coverage or bug information is available.
pub const NO_KEY: &str = "none";

/// Final status of a worker execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Ok,
    Bug,
    Crash,
    Timeout,
}

/// Structured identity of an observed bug, as reported by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BugSignature {
    pub exception: Option<String>,
    pub message_digest: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl BugSignature {
    /// Short digest over the populated fields, or `None` when every field
    /// is empty (an all-empty signature carries no bucketing information).
    pub fn short_digest(&self) -> Option<String> {
        if self.exception.is_none()
            && self.message_digest.is_none()
            && self.file.is_none()
            && self.line.is_none()
        {
            return None;
        }
        let canonical = format!(
            "{}|{}|{}|{}",
            self.exception.as_deref().unwrap_or(""),
            self.message_digest.as_deref().unwrap_or(""),
            self.file.as_deref().unwrap_or(""),
            self.line.map(|l| l.to_string()).unwrap_or_default(),
        );
        Some(short_hex(md5::compute(canonical.as_bytes())))
    }
}

/// Flat lease summary signals consumed by `update()`.
///
/// Every field is optional on the wire; missing fields fall back to
/// defaults so that malformed or partial worker reports degrade to a
/// zero-information update instead of an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Signals {
    pub new_coverage: bool,
    pub new_bug: bool,
    pub crash: bool,
    pub timeout: bool,
    pub status: RunStatus,
    pub coverage_key: Option<String>,
    pub coverage_signature: Option<String>,
    pub coverage_bitmap: Option<Vec<u32>>,
    pub bug_signature: Option<BugSignature>,
    pub bug_key: Option<String>,
    pub isinteresting_score: Option<f64>,
}

impl Signals {
    /// Parses signals from a JSON value, accepting both the flat shape and
    /// the wrapped `{closed_result, open_result}` shape. Malformed input
    /// is recovered locally: a warning is logged and defaults returned.
    pub fn from_json(value: serde_json::Value) -> Signals {
        match serde_json::from_value::<WrappedResult>(value) {
            Ok(wrapped) => wrapped.normalize(),
            Err(err) => {
                log::warn!("malformed signals, falling back to defaults: {err}");
                Signals::default()
            }
        }
    }

    /// True when this run belongs to the crash/timeout class, whether the
    /// worker reported it via the flags or via the status tag.
    pub fn is_crash_class(&self) -> bool {
        self.crash || self.timeout || matches!(self.status, RunStatus::Crash | RunStatus::Timeout)
    }

    /// Coverage bucket key. Precedence: explicit `coverage_key`, then
    /// `coverage_signature`, then a digest of `coverage_bitmap`, then the
    /// literal `"none"`.
    pub fn coverage_bucket_key(&self) -> String {
        if let Some(key) = &self.coverage_key {
            return key.clone();
        }
        if let Some(signature) = &self.coverage_signature {
            return signature.clone();
        }
        if let Some(bitmap) = &self.coverage_bitmap {
            let mut raw = Vec::with_capacity(bitmap.len() * 4);
            for edge in bitmap {
                raw.extend_from_slice(&edge.to_le_bytes());
            }
            return format!("cov:{}", short_hex(md5::compute(&raw)));
        }
        NO_KEY.to_string()
    }

    /// Bug bucket key. Precedence: explicit `bug_key`, then a digest of
    /// the bug signature, then the crash/timeout class, then `"none"`.
    pub fn bug_bucket_key(&self) -> String {
        if let Some(key) = &self.bug_key {
            return key.clone();
        }
        if let Some(digest) = self.bug_signature.as_ref().and_then(BugSignature::short_digest) {
            return format!("bug:{digest}");
        }
        if self.is_crash_class() {
            return "bug:crash-or-timeout".to_string();
        }
        NO_KEY.to_string()
    }

    /// Folds another run's signals into this one (union of booleans, first
    /// populated value wins for keys). Used by workers aggregating a lease.
    pub fn merge(&mut self, other: &Signals) {
        self.new_coverage |= other.new_coverage;
        self.new_bug |= other.new_bug;
        self.crash |= other.crash;
        self.timeout |= other.timeout;
        if self.status == RunStatus::Ok {
            self.status = other.status;
        }
        if self.coverage_key.is_none() {
            self.coverage_key = other.coverage_key.clone();
        }
        if self.coverage_signature.is_none() {
            self.coverage_signature = other.coverage_signature.clone();
        }
        if self.coverage_bitmap.is_none() {
            self.coverage_bitmap = other.coverage_bitmap.clone();
        }
        if self.bug_signature.is_none() {
            self.bug_signature = other.bug_signature.clone();
        }
        if self.bug_key.is_none() {
            self.bug_key = other.bug_key.clone();
        }
        match (self.isinteresting_score, other.isinteresting_score) {
            (Some(mine), Some(theirs)) if theirs > mine => {
                self.isinteresting_score = Some(theirs);
            }
            (None, Some(theirs)) => self.isinteresting_score = Some(theirs),
            _ => {}
        }
    }
}

/// Wire shape accepted at the update boundary.
///
/// Workers may report either flat signals or a wrapped pair of subresults
/// (`closed_result` from the instrumented target, `open_result` from an
/// oracle run). Normalization ORs the booleans across both subresults and
/// prefers the closed result's keys for bucketing, so backend code only
/// ever sees the flat shape.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WrappedResult {
    pub closed_result: Option<Signals>,
    pub open_result: Option<Signals>,
    #[serde(flatten)]
    pub flat: Signals,
}

impl WrappedResult {
    pub fn normalize(self) -> Signals {
        let closed = self.closed_result.unwrap_or_default();
        let open = self.open_result.unwrap_or_default();
        let mut out = self.flat;

        out.new_coverage |= closed.new_coverage || open.new_coverage;
        out.new_bug |= closed.new_bug || open.new_bug;
        out.crash |= closed.crash || open.crash;
        out.timeout |= closed.timeout || open.timeout;
        if out.status == RunStatus::Ok {
            out.status = if closed.status != RunStatus::Ok {
                closed.status
            } else {
                open.status
            };
        }
        if out.coverage_key.is_none() {
            out.coverage_key = closed.coverage_key.or(open.coverage_key);
        }
        if out.coverage_signature.is_none() {
            out.coverage_signature = closed.coverage_signature.or(open.coverage_signature);
        }
        if out.coverage_bitmap.is_none() {
            out.coverage_bitmap = closed.coverage_bitmap.or(open.coverage_bitmap);
        }
        if out.bug_signature.is_none() {
            out.bug_signature = closed.bug_signature.or(open.bug_signature);
        }
        if out.bug_key.is_none() {
            out.bug_key = closed.bug_key.or(open.bug_key);
        }
        if out.isinteresting_score.is_none() {
            out.isinteresting_score = closed.isinteresting_score.or(open.isinteresting_score);
        }
        out
    }
}

fn short_hex(digest: md5::Digest) -> String {
    let full = format!("{digest:x}");
    full[..16].to_string()
}
