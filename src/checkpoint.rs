//! Completion and resume markers that GAP workers append to their own output
//! files.

use std::path::Path;
use std::sync::OnceLock;

use fxhash::FxHashSet;
use regex::Regex;

use crate::error::{read_text, Result};

pub const COMPLETE_MARKER: &str = "# Complete:";
pub const LEAF_MARKER: &str = "# Leaf complete:";

fn complete_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^# Complete:\s*(\d+)").expect("static regex"))
}

fn leaf_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"# Leaf complete: ([^\s(]+)").expect("static regex"))
}

fn bucket_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"# Bucket (\d+): (\d+) -> (\d+) reps: \[([^\]]*)\]").expect("static regex")
    })
}

/// State of a worker's output file as seen before (re)launching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeState {
    Fresh,
    /// Number of units (buckets or leaves) already checkpointed.
    Partial(usize),
    /// Count reported on the `# Complete:` line.
    Complete(u64),
}

/// A `# Bucket N: a -> b reps: [ ... ]` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketCheckpoint {
    pub bucket: usize,
    pub size: usize,
    pub num_reps: usize,
    pub reps: Vec<u64>,
}

pub fn completed_count(text: &str) -> Option<u64> {
    complete_re()
        .captures_iter(text)
        .last()
        .and_then(|c| c[1].parse().ok())
}

pub fn has_complete_marker(text: &str) -> bool {
    text.contains(COMPLETE_MARKER)
}

/// Raw labels of every `# Leaf complete: <label> (...)` line.
pub fn completed_leaves(text: &str) -> FxHashSet<String> {
    leaf_re()
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

pub fn bucket_checkpoints(text: &str) -> Vec<BucketCheckpoint> {
    bucket_re()
        .captures_iter(text)
        .filter_map(|c| {
            let reps = c[4]
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<u64>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .ok()?;
            Some(BucketCheckpoint {
                bucket: c[1].parse().ok()?,
                size: c[2].parse().ok()?,
                num_reps: c[3].parse().ok()?,
                reps,
            })
        })
        .collect()
}

/// Checkpoints that still describe `buckets`. A line is kept only when its
/// bucket exists, has the recorded size and contains every replayed rep.
pub fn matching_checkpoints(
    checkpoints: Vec<BucketCheckpoint>,
    buckets: &[Vec<u64>],
) -> (Vec<BucketCheckpoint>, Vec<BucketCheckpoint>) {
    checkpoints.into_iter().partition(|cp| {
        let Some(indices) = cp.bucket.checked_sub(1).and_then(|ix| buckets.get(ix)) else {
            return false;
        };
        let members: FxHashSet<u64> = indices.iter().copied().collect();
        indices.len() == cp.size
            && cp.reps.len() == cp.num_reps
            && cp.reps.iter().all(|r| members.contains(r))
    })
}

/// `text` up to and including the last `# Leaf complete:` line, or `None`
/// when nothing follows it. Records after that line belong to a leaf that
/// was cut off and will be redone.
pub fn truncate_to_last_leaf(text: &str) -> Option<&str> {
    let start = text.rfind(LEAF_MARKER)?;
    let end = text[start..].find('\n').map_or(text.len(), |nl| start + nl + 1);
    if end == text.len() {
        None
    } else {
        Some(&text[..end])
    }
}

/// Label as a GAP record field name. Must agree with `CensusSanitizeLabel`
/// in the generated scripts.
pub fn sanitize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len() + 1);
    out.push('L');
    for c in label.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    out
}

pub fn resume_state(path: impl AsRef<Path>) -> Result<ResumeState> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(ResumeState::Fresh);
    }
    let text = read_text(path)?;
    Ok(resume_state_of(&text))
}

pub fn resume_state_of(text: &str) -> ResumeState {
    if has_complete_marker(text) {
        return ResumeState::Complete(completed_count(text).unwrap_or(0));
    }
    let units = completed_leaves(text).len() + bucket_checkpoints(text).len();
    if units == 0 {
        ResumeState::Fresh
    } else {
        ResumeState::Partial(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_markers() {
        let text = "maxsub_results := [\n  rec(gens := [ ], inv := [ 1 ], source := \"A_7 x S_8\")\n# Leaf complete: A_7x (1 subgroups in 0s)\n# Leaf complete: 15:2(3) (40 subgroups in 12s)\n";
        let leaves = completed_leaves(text);
        assert_eq!(leaves.len(), 2);
        assert!(leaves.contains("A_7x"));
        assert!(leaves.contains("15:2"));
        assert_eq!(resume_state_of(text), ResumeState::Partial(2));
    }

    #[test]
    fn sanitize_matches_gap_side() {
        assert_eq!(sanitize_label("15:2(3)"), "L15_2_3_");
        assert_eq!(sanitize_label("A_7"), "LA_7");
        assert_eq!(sanitize_label(""), "L");
    }

    #[test]
    fn bucket_lines() {
        let text = "# Bucket 1: 4 -> 2 reps: [ 10, 12 ]\nnoise\n# Bucket 2: 1 -> 1 reps: [ 7 ]\n# Bucket 3: 3 -> 0 reps: [  ]\n";
        let cps = bucket_checkpoints(text);
        assert_eq!(cps.len(), 3);
        assert_eq!(cps[0].reps, vec![10, 12]);
        assert_eq!(cps[1].bucket, 2);
        assert!(cps[2].reps.is_empty());
    }

    #[test]
    fn complete_count() {
        let text = "RESULT_REPS_W1 := [ 1 ];\n# Complete: 1 reps from 3 groups in 2 buckets\n";
        assert_eq!(completed_count(text), Some(1));
        assert_eq!(resume_state_of(text), ResumeState::Complete(1));
        assert_eq!(resume_state_of("nothing yet"), ResumeState::Fresh);
    }

    #[test]
    fn stale_checkpoints_are_rejected() {
        let text = "# Bucket 1: 2 -> 1 reps: [ 2 ]\n# Bucket 2: 3 -> 1 reps: [ 999 ]\n# Bucket 3: 1 -> 1 reps: [ 9 ]\n# Bucket 4: 1 -> 1 reps: [ 5 ]\n";
        let buckets = vec![vec![1, 2], vec![3, 4, 5], vec![9, 10]];
        let (kept, stale) = matching_checkpoints(bucket_checkpoints(text), &buckets);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].bucket, 1);
        // rep outside the bucket, wrong size, bucket out of range
        let stale: Vec<usize> = stale.iter().map(|cp| cp.bucket).collect();
        assert_eq!(stale, vec![2, 3, 4]);
    }

    #[test]
    fn partial_leaf_is_cut() {
        let text = "leaf_results := [\nrec( a := 1 ),\n# Leaf complete: A (1 subgroups in 0s)\nrec( b := 2 ),\nrec( b := 3 ),\n";
        let cut = truncate_to_last_leaf(text).unwrap();
        assert!(cut.ends_with("# Leaf complete: A (1 subgroups in 0s)\n"));
        assert!(!cut.contains("b := 2"));
        assert_eq!(completed_leaves(cut).len(), 1);

        let clean = "x\n# Leaf complete: A (1 subgroups in 0s)\n";
        assert_eq!(truncate_to_last_leaf(clean), None);
        assert_eq!(truncate_to_last_leaf("rec( b := 2 ),\n"), None);
    }

    #[test]
    fn missing_file_is_fresh() {
        let path = std::env::temp_dir().join(format!("census_{}.g", uuid::Uuid::new_v4()));
        assert_eq!(resume_state(&path).unwrap(), ResumeState::Fresh);
    }
}
