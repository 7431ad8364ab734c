//! Growing the master proof file: picking the proofs that are new, and
//! appending the ones GAP verified.

use std::fmt::Write as _;
use std::sync::OnceLock;

use fxhash::FxHashSet;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CensusError, Result};
use crate::records::{rec_blocks, SubgroupRecord};
use crate::validate::parse_proofs;

pub const STAGING_VAR: &str = "NEW_PROOFS_STAGING";

/// Proofs not yet in the master file, first one per duplicate, sorted by
/// duplicate index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Staging {
    /// `(duplicate, source name, record text)`
    pub proofs: Vec<(u64, String, String)>,
    pub already_in_master: usize,
    /// Later proofs of a duplicate some earlier candidate already covers.
    pub repeats: usize,
    pub per_source: IndexMap<String, usize>,
}

pub fn duplicates_of(text: &str) -> FxHashSet<u64> {
    parse_proofs(text).into_iter().map(|(dup, _)| dup).collect()
}

/// Scans the candidate files in order. `candidates` pairs a display name
/// with the file's text.
pub fn extract_new_proofs(master: &str, candidates: &[(String, String)]) -> Staging {
    let known = duplicates_of(master);
    let mut seen: FxHashSet<u64> = FxHashSet::default();
    let mut out = Staging::default();
    for (name, text) in candidates {
        let mut taken = 0;
        for block in rec_blocks(text) {
            let Some(dup) = SubgroupRecord::parse(block)
                .ok()
                .and_then(|r| r.get("duplicate").and_then(|v| v.as_int()))
                .and_then(|d| u64::try_from(d).ok())
            else {
                continue;
            };
            if known.contains(&dup) {
                out.already_in_master += 1;
            } else if !seen.insert(dup) {
                out.repeats += 1;
            } else {
                out.proofs.push((dup, name.clone(), block.trim().to_string()));
                taken += 1;
            }
        }
        out.per_source.insert(name.clone(), taken);
    }
    out.proofs.sort_by_key(|(dup, _, _)| *dup);
    out
}

/// `NEW_PROOFS_STAGING := [ ... ];;` with the source of each proof noted
/// above it.
pub fn staging_text(staging: &Staging, stamp: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Staged proofs, extracted {:}", stamp);
    let _ = writeln!(out, "# {:} new proofs", staging.proofs.len());
    for (name, count) in staging.per_source.iter() {
        let _ = writeln!(out, "#   {:}: {:}", name, count);
    }
    let _ = writeln!(out, "{:} := [", STAGING_VAR);
    let mut source = "";
    for (ix, (_, name, block)) in staging.proofs.iter().enumerate() {
        if name != source {
            let _ = writeln!(out, "# from {:}", name);
            source = name;
        }
        out.push_str(block);
        if ix + 1 < staging.proofs.len() {
            out.push(',');
        }
        out.push('\n');
    }
    out.push_str("];;\n");
    out
}

/// Counts from a verification run: the `Passed:`/`Failed:` lines and the
/// duplicate named by every `FAIL proof i (dup=d)` line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub passed: u64,
    pub failed: u64,
    pub total: Option<u64>,
    pub failed_duplicates: Vec<u64>,
}

impl VerifyOutcome {
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.failed_duplicates.is_empty()
    }

    pub fn absorb(&mut self, other: VerifyOutcome) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.total = match (self.total, other.total) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        self.failed_duplicates.extend(other.failed_duplicates);
        self.failed_duplicates.sort_unstable();
        self.failed_duplicates.dedup();
    }

    /// The same line format `parse_verify_output` reads.
    pub fn to_text(&self, fail_lines: &[String]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Total proofs: {:}", self.total.unwrap_or(self.passed + self.failed));
        let _ = writeln!(out, "Passed: {:}", self.passed);
        let _ = writeln!(out, "Failed: {:}", self.failed);
        for line in fail_lines {
            let _ = writeln!(out, "{:}", line);
        }
        out
    }
}

/// Combined result of the GAP verification workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofCheck {
    pub proofs: usize,
    pub workers: usize,
    pub outcome: VerifyOutcome,
    /// Workers whose result file is missing or has no completion marker.
    pub incomplete_workers: Vec<usize>,
}

impl ProofCheck {
    pub fn passed(&self) -> bool {
        self.incomplete_workers.is_empty()
            && self.outcome.all_passed()
            && self.outcome.passed == self.proofs as u64
    }

    pub fn print(&self) {
        println!("{:}", "=".repeat(60));
        println!("PROOF VERIFICATION ({:} workers)", self.workers);
        println!("{:}", "=".repeat(60));
        println!("  Proofs:  {:}", self.proofs);
        println!("  Passed:  {:}", self.outcome.passed);
        println!("  Failed:  {:}", self.outcome.failed);
        if !self.incomplete_workers.is_empty() {
            println!("  Incomplete workers: {:?}", self.incomplete_workers);
        }
        if self.passed() {
            println!("ALL {:} PROOFS VERIFIED", self.proofs);
        } else {
            println!("VERIFICATION FAILED");
        }
    }
}

fn count_re(label: &str) -> Regex {
    Regex::new(&format!(r"(?m)^\s*{:}:\s*(\d+)", label)).expect("static regex")
}

fn fail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"FAIL proof \d+ \(dup=(\d+)\)").expect("static regex"))
}

pub fn parse_verify_output(text: &str) -> VerifyOutcome {
    static RES: OnceLock<[Regex; 3]> = OnceLock::new();
    let [passed, failed, total] =
        RES.get_or_init(|| [count_re("Passed"), count_re("Failed"), count_re("Total proofs")]);
    let grab = |re: &Regex| -> Option<u64> {
        re.captures_iter(text).last().and_then(|c| c[1].parse().ok())
    };
    let mut failed_duplicates: Vec<u64> = fail_re()
        .captures_iter(text)
        .filter_map(|c| c[1].parse().ok())
        .collect();
    failed_duplicates.sort_unstable();
    failed_duplicates.dedup();
    VerifyOutcome {
        passed: grab(passed).unwrap_or(0),
        failed: grab(failed).unwrap_or(0),
        total: grab(total),
        failed_duplicates,
    }
}

/// FAIL lines of a verification output, kept verbatim.
pub fn fail_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter(|l| fail_re().is_match(l))
        .map(|l| l.trim().to_string())
        .collect()
}

/// Master text with the staged proofs that did not fail appended before
/// the closing `];`. Returns the new text and how many were appended.
pub fn append_proofs(master: &str, staged: &str, failed: &[u64], stamp: &str) -> Result<(String, usize)> {
    let failed: FxHashSet<u64> = failed.iter().copied().collect();
    let keep: Vec<&str> = rec_blocks(staged)
        .into_iter()
        .filter(|block| {
            SubgroupRecord::parse(block)
                .ok()
                .and_then(|r| r.get("duplicate").and_then(|v| v.as_int()))
                .and_then(|d| u64::try_from(d).ok())
                .map_or(false, |d| !failed.contains(&d))
        })
        .map(str::trim)
        .collect();
    let body = master.trim_end();
    let body = body.trim_end_matches(';');
    let Some(open_end) = body.strip_suffix(']') else {
        return Err(CensusError::Missing(String::from(
            "master proof file does not end with a closing ];",
        )));
    };
    let head = open_end.trim_end();
    if keep.is_empty() {
        return Ok((master.to_string(), 0));
    }
    let mut out = String::from(head);
    if !head.ends_with('[') {
        out.push(',');
    }
    let _ = writeln!(out, "\n# --- New proofs appended {:} ({:} proofs) ---", stamp, keep.len());
    out.push_str(&keep.join(",\n"));
    out.push_str("\n];;\n");
    Ok((out, keep.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "PROOFS := [\nrec( duplicate := 5, representative := 2 ),\nrec( duplicate := 9, representative := 2 )\n];;\n";

    fn candidates() -> Vec<(String, String)> {
        vec![
            (
                String::from("run_a.g"),
                String::from("P := [ rec( duplicate := 9, representative := 2 ), rec( duplicate := 12, representative := 3, gens := [ [ 2, 1 ] ] ) ];"),
            ),
            (
                String::from("run_b.g"),
                String::from("P := [ rec( duplicate := 12, representative := 4 ), rec( duplicate := 7, representative := 1 ) ];"),
            ),
        ]
    }

    #[test]
    fn extraction_keeps_first_new_proof() {
        let staging = extract_new_proofs(MASTER, &candidates());
        let dups: Vec<u64> = staging.proofs.iter().map(|(d, _, _)| *d).collect();
        assert_eq!(dups, vec![7, 12]);
        assert_eq!(staging.proofs[1].1, "run_a.g");
        assert!(staging.proofs[1].2.contains("representative := 3"));
        assert_eq!(staging.already_in_master, 1);
        assert_eq!(staging.repeats, 1);
        assert_eq!(staging.per_source["run_b.g"], 1);

        let text = staging_text(&staging, "2026-01-02 03:04:05");
        assert!(text.contains("NEW_PROOFS_STAGING := [\n# from run_b.g\n"));
        assert!(text.ends_with("];;\n"));
        assert_eq!(parse_proofs(&text), vec![(7, 1), (12, 3)]);
    }

    #[test]
    fn verify_output() {
        let text = "Total proofs: 3\nPassed: 2\nFailed: 1\nFAIL proof 2 (dup=12): orders differ\n";
        let outcome = parse_verify_output(text);
        assert_eq!(outcome.passed, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.total, Some(3));
        assert_eq!(outcome.failed_duplicates, vec![12]);
        assert!(!outcome.all_passed());
        assert_eq!(fail_lines(text), vec![String::from("FAIL proof 2 (dup=12): orders differ")]);

        let mut sum = VerifyOutcome::default();
        sum.absorb(outcome.clone());
        sum.absorb(parse_verify_output("Passed: 4\nFailed: 0\n"));
        assert_eq!(sum.passed, 6);
        assert_eq!(sum.total, Some(3));
        let again = parse_verify_output(&sum.to_text(&fail_lines(text)));
        assert_eq!(again.failed_duplicates, vec![12]);
        assert_eq!(again.passed, 6);
    }

    #[test]
    fn check_needs_every_worker() {
        let mut check = ProofCheck {
            proofs: 6,
            workers: 2,
            outcome: parse_verify_output("Passed: 6\nFailed: 0\n"),
            incomplete_workers: Vec::new(),
        };
        assert!(check.passed());
        check.incomplete_workers.push(2);
        assert!(!check.passed());
        check.incomplete_workers.clear();
        check.outcome.passed = 5;
        assert!(!check.passed());
    }

    #[test]
    fn append_skips_failed_proofs() {
        let staging = extract_new_proofs(MASTER, &candidates());
        let staged = staging_text(&staging, "t");
        let (merged, added) = append_proofs(MASTER, &staged, &[12], "2026-01-02").unwrap();
        assert_eq!(added, 1);
        assert!(merged.contains("representative := 2 ),\n# --- New proofs appended 2026-01-02 (1 proofs) ---\n"));
        assert!(merged.ends_with("];;\n"));
        assert_eq!(parse_proofs(&merged), vec![(5, 2), (9, 2), (7, 1)]);

        let (empty_master, added) = append_proofs("PROOFS := [\n];\n", &staged, &[], "t").unwrap();
        assert_eq!(added, 2);
        assert!(empty_master.starts_with("PROOFS := [\n# --- New"));

        let (unchanged, added) = append_proofs(MASTER, &staged, &[7, 12], "t").unwrap();
        assert_eq!(added, 0);
        assert_eq!(unchanged, MASTER);
        assert!(append_proofs("PROOFS := 3;", &staged, &[], "t").is_err());
    }
}
