//! Consistency checks between the pieces of a census run: partitions,
//! counts, proofs and worker outputs.

use std::collections::BTreeMap;
use std::fmt;

use fxhash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::checkpoint::BucketCheckpoint;
use crate::records::{rec_blocks, SubgroupRecord};
use crate::union_find::IsoMap;

const SHOW: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Match,
    Mismatch { diff: i64 },
}

impl Verdict {
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Match => write!(f, "MATCH"),
            Verdict::Mismatch { diff } => write!(f, "MISMATCH (diff {:+})", diff),
        }
    }
}

/// A computed total against a known value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountCheck {
    pub label: String,
    pub expected: u64,
    pub actual: u64,
}

impl CountCheck {
    pub fn new(label: impl Into<String>, expected: u64, actual: u64) -> Self {
        CountCheck {
            label: label.into(),
            expected,
            actual,
        }
    }

    pub fn verdict(&self) -> Verdict {
        if self.expected == self.actual {
            Verdict::Match
        } else {
            Verdict::Mismatch {
                diff: self.actual as i64 - self.expected as i64,
            }
        }
    }

    pub fn print(&self) {
        println!(
            "  {:}: {:} (expected {:}) -> {:}",
            self.label,
            self.actual,
            self.expected,
            self.verdict()
        );
    }
}

/// Who owns each index `1..=total`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionReport {
    pub total: u64,
    pub assigned: usize,
    /// Index and every owner claiming it.
    pub duplicates: Vec<(u64, Vec<String>)>,
    pub missing: Vec<u64>,
    pub out_of_range: Vec<(u64, String)>,
}

impl PartitionReport {
    pub fn is_ok(&self) -> bool {
        self.duplicates.is_empty() && self.missing.is_empty() && self.out_of_range.is_empty()
    }

    pub fn print(&self) {
        println!(
            "  Partition of 1..{:}: {:} assigned, {:} duplicated, {:} missing, {:} out of range",
            self.total,
            self.assigned,
            self.duplicates.len(),
            self.missing.len(),
            self.out_of_range.len()
        );
        for (ix, owners) in self.duplicates.iter().take(SHOW) {
            println!("    index {:} claimed by {:}", ix, owners.join(", "));
        }
        if !self.missing.is_empty() {
            let shown: Vec<String> = self.missing.iter().take(SHOW).map(|i| i.to_string()).collect();
            println!("    missing: {:}", shown.join(", "));
        }
        for (ix, owner) in self.out_of_range.iter().take(SHOW) {
            println!("    index {:} from {:} is out of range", ix, owner);
        }
    }
}

/// Every index in `1..=total` must be owned exactly once.
pub fn check_partition<'a, I>(total: u64, owners: I) -> PartitionReport
where
    I: IntoIterator<Item = (&'a str, &'a [u64])>,
{
    let mut claims: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    let mut out_of_range = Vec::new();
    for (owner, indices) in owners {
        for &ix in indices {
            if ix == 0 || ix > total {
                out_of_range.push((ix, owner.to_string()));
            } else {
                claims.entry(ix).or_default().push(owner.to_string());
            }
        }
    }
    let duplicates = claims
        .iter()
        .filter(|(_, o)| o.len() > 1)
        .map(|(ix, o)| (*ix, o.clone()))
        .collect();
    let missing = (1..=total).filter(|ix| !claims.contains_key(ix)).collect();
    PartitionReport {
        total,
        assigned: claims.len(),
        duplicates,
        missing,
        out_of_range,
    }
}

/// Reads `rec(duplicate := d, representative := r)` entries.
pub fn parse_proofs(text: &str) -> Vec<(u64, u64)> {
    rec_blocks(text)
        .into_iter()
        .filter_map(|block| {
            let r = SubgroupRecord::parse(block).ok()?;
            let dup = r.get("duplicate")?.as_int()?;
            let rep = r.get("representative")?.as_int()?;
            Some((u64::try_from(dup).ok()?, u64::try_from(rep).ok()?))
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofCoverage {
    pub large: usize,
    pub type_reps: usize,
    pub proven_duplicates: usize,
    /// Duplicates proven more than once, with the count.
    pub redundant: Vec<(u64, usize)>,
    /// Large duplicates whose representative is not large.
    pub bad_representatives: Vec<(u64, u64)>,
    /// Proofs about groups outside the large set (IdGroup-compatible).
    pub non_large_duplicates: usize,
    pub expected_type_reps: Option<usize>,
}

impl ProofCoverage {
    pub fn passed(&self) -> bool {
        self.redundant.is_empty()
            && self.bad_representatives.is_empty()
            && self.type_reps + self.proven_duplicates == self.large
            && self.expected_type_reps.map_or(true, |e| e == self.type_reps)
    }

    pub fn print(&self) {
        println!("  Large groups: {:}", self.large);
        println!(
            "  = {:} type reps + {:} duplicates",
            self.type_reps, self.proven_duplicates
        );
        if let Some(e) = self.expected_type_reps {
            println!("  Expected type reps: {:}", e);
        }
        println!("  Proofs about non-large groups: {:}", self.non_large_duplicates);
        for (ix, count) in self.redundant.iter().take(SHOW) {
            println!("    index {:} proven {:} times", ix, count);
        }
        for (dup, rep) in self.bad_representatives.iter().take(SHOW) {
            println!("    {:} -> {:} maps to a non-large representative", dup, rep);
        }
        println!("  RESULT: {:}", if self.passed() { "PASS" } else { "FAIL" });
    }
}

/// Large indices split into type representatives and proven duplicates.
pub fn verify_proof_coverage(
    large: &FxHashSet<u64>,
    proofs: &[(u64, u64)],
    expected_type_reps: Option<usize>,
) -> ProofCoverage {
    let mut counts: FxHashMap<u64, usize> = FxHashMap::default();
    let mut dup_to_rep: FxHashMap<u64, u64> = FxHashMap::default();
    for &(dup, rep) in proofs {
        *counts.entry(dup).or_insert(0) += 1;
        dup_to_rep.insert(dup, rep);
    }
    let mut redundant: Vec<(u64, usize)> = counts
        .iter()
        .filter(|(_, c)| **c > 1)
        .map(|(d, c)| (*d, *c))
        .collect();
    redundant.sort_unstable();
    let proven_duplicates = large.iter().filter(|ix| dup_to_rep.contains_key(*ix)).count();
    let mut bad_representatives: Vec<(u64, u64)> = dup_to_rep
        .iter()
        .filter(|(dup, rep)| large.contains(*dup) && !large.contains(*rep))
        .map(|(d, r)| (*d, *r))
        .collect();
    bad_representatives.sort_unstable();
    ProofCoverage {
        large: large.len(),
        type_reps: large.len() - proven_duplicates,
        proven_duplicates,
        redundant,
        bad_representatives,
        non_large_duplicates: dup_to_rep.keys().filter(|d| !large.contains(*d)).count(),
        expected_type_reps,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsoMapReport {
    pub self_maps: Vec<u64>,
    /// Values that are themselves mapped somewhere else.
    pub non_canonical: Vec<(u64, u64)>,
}

impl IsoMapReport {
    pub fn is_ok(&self) -> bool {
        self.self_maps.is_empty() && self.non_canonical.is_empty()
    }
}

pub fn verify_iso_map(iso: &IsoMap) -> IsoMapReport {
    let mut report = IsoMapReport::default();
    for (&dup, &rep) in iso.map.iter() {
        if dup == rep {
            report.self_maps.push(dup);
        } else if iso.map.contains_key(&rep) {
            report.non_canonical.push((dup, rep));
        }
    }
    report
}

/// Representatives a worker returned that were never assigned to it.
pub fn check_reps_within_assignment(reps: &[u64], assigned: &[u64]) -> Vec<u64> {
    let assigned: FxHashSet<u64> = assigned.iter().copied().collect();
    reps.iter().filter(|r| !assigned.contains(*r)).copied().collect()
}

/// Problems between a worker's per-bucket checkpoint lines and its final
/// representative list.
pub fn check_checkpoint_consistency(checkpoints: &[BucketCheckpoint], reps: &[u64]) -> Vec<String> {
    let mut problems = Vec::new();
    let mut from_checkpoints: FxHashSet<u64> = FxHashSet::default();
    let mut seen_buckets: FxHashSet<usize> = FxHashSet::default();
    for cp in checkpoints {
        if !seen_buckets.insert(cp.bucket) {
            problems.push(format!("bucket {:} checkpointed twice", cp.bucket));
        }
        if cp.num_reps != cp.reps.len() {
            problems.push(format!(
                "bucket {:} reports {:} reps but lists {:}",
                cp.bucket,
                cp.num_reps,
                cp.reps.len()
            ));
        }
        if cp.num_reps > cp.size {
            problems.push(format!(
                "bucket {:} has more reps ({:}) than groups ({:})",
                cp.bucket, cp.num_reps, cp.size
            ));
        }
        from_checkpoints.extend(cp.reps.iter().copied());
    }
    let final_reps: FxHashSet<u64> = reps.iter().copied().collect();
    let mut only_cp: Vec<u64> = from_checkpoints.difference(&final_reps).copied().collect();
    let mut only_final: Vec<u64> = final_reps.difference(&from_checkpoints).copied().collect();
    only_cp.sort_unstable();
    only_final.sort_unstable();
    if !only_cp.is_empty() {
        problems.push(format!("{:} checkpoint reps missing from result: {:?}", only_cp.len(), &only_cp[..only_cp.len().min(SHOW)]));
    }
    if !only_final.is_empty() {
        problems.push(format!("{:} result reps not in any checkpoint: {:?}", only_final.len(), &only_final[..only_final.len().min(SHOW)]));
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_problems_are_reported() {
        let a = [1_u64, 2, 3];
        let b = [3_u64, 5, 9];
        let report = check_partition(6, [("dp", &a[..]), ("regular_1", &b[..])]);
        assert!(!report.is_ok());
        assert_eq!(report.duplicates, vec![(3, vec!["dp".to_string(), "regular_1".to_string()])]);
        assert_eq!(report.missing, vec![4, 6]);
        assert_eq!(report.out_of_range, vec![(9, "regular_1".to_string())]);
        assert_eq!(report.assigned, 4);

        let c = [1_u64, 2];
        let d = [3_u64];
        assert!(check_partition(3, [("x", &c[..]), ("y", &d[..])]).is_ok());
    }

    #[test]
    fn count_verdicts() {
        assert!(CountCheck::new("S14", 75154, 75154).verdict().is_match());
        assert_eq!(
            CountCheck::new("S14", 75154, 75150).verdict(),
            Verdict::Mismatch { diff: -4 }
        );
        assert_eq!(Verdict::Mismatch { diff: 3 }.to_string(), "MISMATCH (diff +3)");
    }

    #[test]
    fn proof_coverage() {
        let text = "PROOFS := [\nrec(duplicate := 4,\n representative := 2),\nrec( duplicate := 5, representative := 2 ),\nrec( duplicate := 7, representative := 1 ) ];";
        let proofs = parse_proofs(text);
        assert_eq!(proofs, vec![(4, 2), (5, 2), (7, 1)]);
        let large: FxHashSet<u64> = [2, 3, 4, 5].into_iter().collect();
        let cov = verify_proof_coverage(&large, &proofs, Some(2));
        assert_eq!(cov.type_reps, 2);
        assert_eq!(cov.proven_duplicates, 2);
        assert_eq!(cov.non_large_duplicates, 1);
        assert!(cov.passed());

        let mut with_bad = proofs.clone();
        with_bad.push((4, 2));
        with_bad.push((3, 1));
        let cov = verify_proof_coverage(&large, &with_bad, None);
        assert_eq!(cov.redundant, vec![(4, 2)]);
        assert_eq!(cov.bad_representatives, vec![(3, 1)]);
        assert!(!cov.passed());
    }

    #[test]
    fn iso_map_checks() {
        let mut iso = IsoMap::from_pairs(vec![(3, 1), (4, 3)]);
        assert!(verify_iso_map(&iso).is_ok());
        iso.map.insert(9, 9);
        iso.map.insert(10, 3);
        let report = verify_iso_map(&iso);
        assert_eq!(report.self_maps, vec![9]);
        assert_eq!(report.non_canonical, vec![(10, 3)]);
    }

    #[test]
    fn worker_output_checks() {
        assert_eq!(check_reps_within_assignment(&[1, 4, 8], &[1, 2, 4]), vec![8]);
        let cps = vec![
            BucketCheckpoint { bucket: 1, size: 3, num_reps: 1, reps: vec![2] },
            BucketCheckpoint { bucket: 2, size: 2, num_reps: 2, reps: vec![5] },
        ];
        let problems = check_checkpoint_consistency(&cps, &[2, 5, 6]);
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("bucket 2 reports 2 reps"));
        assert!(problems[1].contains("not in any checkpoint"));
    }
}
