//! JSON artifacts and human-readable reports of a census run.

use std::fmt::Write as _;
use std::path::Path;

use fxhash::FxHashSet;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::bucket::{Bucket, Categorized, Category};
use crate::clock::timestamp;
use crate::error::{read_text, write_text, Result};
use crate::gap::script::INVARIANTS_VAR;
use crate::gap::{DedupMethod, GapEnvironment};
use crate::validate::{PartitionReport, Verdict};

pub const TRACKING_FILENAME: &str = "tracking.json";
pub const FINAL_RESULT_FILENAME: &str = "final_result.json";
pub const BREAKDOWN_FILENAME: &str = "bucket_breakdown.json";

fn save_json<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    write_text(path, &serde_json::to_string_pretty(value)?)
}

fn load_json<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    Ok(serde_json::from_str(&read_text(path)?)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultEntry {
    pub key: String,
    pub indices: Vec<u64>,
    pub representative: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub worker: String,
    pub category: Category,
    pub method: DedupMethod,
    pub environment: GapEnvironment,
    pub buckets: usize,
    pub groups: usize,
    pub indices: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub assigned: usize,
    pub expected: u64,
    pub complete: bool,
    pub missing: Vec<u64>,
    pub overlaps: Vec<u64>,
}

impl From<&PartitionReport> for Coverage {
    fn from(p: &PartitionReport) -> Self {
        Coverage {
            assigned: p.assigned,
            expected: p.total,
            complete: p.is_ok(),
            missing: p.missing.clone(),
            overlaps: p.duplicates.iter().map(|(ix, _)| *ix).collect(),
        }
    }
}

/// What `prepare` decided: who owns which indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracking {
    pub generated: String,
    pub input_file: String,
    /// Variable the input file binds its record list to.
    pub input_var: String,
    pub method: DedupMethod,
    pub total_groups: u64,
    /// Records identified by IdGroup, left out of the buckets.
    pub idgroup_indices: Vec<u64>,
    pub idgroup_types: Option<u64>,
    pub singletons: Vec<u64>,
    pub difficult: Vec<DifficultEntry>,
    pub workers: Vec<WorkerAssignment>,
    pub coverage: Coverage,
}

impl Tracking {
    pub fn new(
        input_file: impl Into<String>,
        method: DedupMethod,
        total_groups: u64,
        cats: &Categorized,
    ) -> Self {
        Tracking {
            generated: timestamp(),
            input_file: input_file.into(),
            input_var: String::from(INVARIANTS_VAR),
            method,
            total_groups,
            idgroup_indices: Vec::new(),
            idgroup_types: None,
            singletons: cats.singletons.clone(),
            difficult: cats
                .difficult
                .iter()
                .map(|b| DifficultEntry {
                    key: b.key.clone(),
                    indices: b.indices.clone(),
                    representative: b.first_index(),
                })
                .collect(),
            workers: Vec::new(),
            coverage: Coverage::default(),
        }
    }

    pub fn add_worker(
        &mut self,
        worker: impl Into<String>,
        category: Category,
        method: DedupMethod,
        environment: GapEnvironment,
        buckets: &[&Bucket],
    ) {
        let indices: Vec<u64> = buckets.iter().flat_map(|b| b.indices.iter().copied()).collect();
        self.workers.push(WorkerAssignment {
            worker: worker.into(),
            category,
            method,
            environment,
            buckets: buckets.len(),
            groups: indices.len(),
            indices,
        });
    }

    /// Every owner of indices: workers, then `singletons`, then each
    /// difficult bucket, then `idgroup`.
    pub fn owners(&self) -> Vec<(String, &[u64])> {
        let mut out: Vec<(String, &[u64])> = self
            .workers
            .iter()
            .map(|w| (w.worker.clone(), w.indices.as_slice()))
            .collect();
        out.push((String::from("singletons"), self.singletons.as_slice()));
        for (i, d) in self.difficult.iter().enumerate() {
            out.push((format!("difficult_{:}", i + 1), d.indices.as_slice()));
        }
        if !self.idgroup_indices.is_empty() {
            out.push((String::from("idgroup"), self.idgroup_indices.as_slice()));
        }
        out
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_json(self, path)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub generated: String,
    pub n: u32,
    pub method: String,
    pub input_groups: u64,
    /// Representatives per source: each worker, `singletons` and `difficult`.
    pub sources: IndexMap<String, usize>,
    pub representatives: usize,
    /// Small isomorphism types counted by IdGroup rather than by a worker.
    pub idgroup_types: Option<u64>,
    pub total: u64,
    pub expected: Option<u64>,
    pub verdict: Option<Verdict>,
    pub missing_workers: Vec<String>,
    pub duplicated: Vec<u64>,
}

impl FinalResult {
    pub fn is_ok(&self) -> bool {
        self.missing_workers.is_empty()
            && self.duplicated.is_empty()
            && self.verdict.as_ref().map_or(true, |v| v.is_match())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_json(self, path)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketOutcome {
    pub key: String,
    pub category: Category,
    pub size: usize,
    pub reps: Vec<u64>,
    pub non_reps: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketBreakdown {
    pub buckets: Vec<BucketOutcome>,
    pub singletons: usize,
    pub total_reps: usize,
    pub total_non_reps: usize,
}

impl BucketBreakdown {
    /// Splits every multi-member bucket into representatives and the rest.
    /// Difficult buckets keep only their first member.
    pub fn new(cats: &Categorized, reps: &FxHashSet<u64>) -> Self {
        let mut out = BucketBreakdown {
            singletons: cats.singletons.len(),
            total_reps: cats.singletons.len(),
            ..Default::default()
        };
        let groups = [
            (Category::DirectProduct, &cats.direct_product),
            (Category::TwoGroup, &cats.two_group),
            (Category::Regular, &cats.regular),
            (Category::Difficult, &cats.difficult),
        ];
        for (category, buckets) in groups {
            for b in buckets.iter() {
                let first = b.first_index();
                let is_rep = |ix: &u64| match category {
                    Category::Difficult => Some(*ix) == first,
                    _ => reps.contains(ix),
                };
                let (r, nr): (Vec<u64>, Vec<u64>) = b.indices.iter().copied().partition(|ix| is_rep(ix));
                out.total_reps += r.len();
                out.total_non_reps += nr.len();
                out.buckets.push(BucketOutcome {
                    key: b.key.clone(),
                    category,
                    size: b.len(),
                    reps: r,
                    non_reps: nr,
                });
            }
        }
        out
    }

    /// Buckets where no member was kept, which means a worker lost it.
    pub fn empty_buckets(&self) -> Vec<&str> {
        self.buckets
            .iter()
            .filter(|b| b.reps.is_empty())
            .map(|b| b.key.as_str())
            .collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_json(self, path)
    }
}

/// One group from a `GROUPS_START ... GROUPS_END` listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryGroup {
    pub number: Option<u64>,
    pub first_found: Option<String>,
    pub order: Option<u64>,
    pub structure: Option<String>,
    pub degree: Option<u64>,
    pub generators_image: Option<String>,
    pub generators_cycle: Option<String>,
}

pub fn parse_summary_groups(text: &str) -> Vec<SummaryGroup> {
    let mut groups = Vec::new();
    let mut current = SummaryGroup::default();
    let mut inside = false;
    for line in text.lines().map(str::trim) {
        match line {
            "GROUPS_START" => inside = true,
            "GROUPS_END" => inside = false,
            "GROUP_END" if inside => groups.push(std::mem::take(&mut current)),
            _ if inside => {
                let Some((field, value)) = line.split_once(':') else {
                    continue;
                };
                let value = value.trim();
                match field {
                    "GROUP" => {
                        current = SummaryGroup {
                            number: value.parse().ok(),
                            ..Default::default()
                        }
                    }
                    "FIRST_FOUND" => current.first_found = Some(value.to_string()),
                    "ORDER" => current.order = value.parse().ok(),
                    "STRUCTURE" => current.structure = Some(value.to_string()),
                    "DEGREE" => current.degree = value.parse().ok(),
                    "GENERATORS_IMAGE" => current.generators_image = Some(value.to_string()),
                    "GENERATORS_CYCLE" => current.generators_cycle = Some(value.to_string()),
                    _ => {}
                }
            }
            _ => {}
        }
    }
    groups
}

/// `S12` -> 12, anything else sorts last.
fn degree_of_label(label: Option<&str>) -> u32 {
    label
        .and_then(|l| l.strip_prefix('S'))
        .and_then(|d| d.parse().ok())
        .unwrap_or(99)
}

/// Table sorted by order then first appearance, followed by counts per
/// first appearance.
pub fn summary_table(groups: &[SummaryGroup], generated: &str) -> String {
    let rule = "=".repeat(80);
    let thin = "-".repeat(80);
    let unknown = || String::from("?");
    let mut sorted: Vec<&SummaryGroup> = groups.iter().collect();
    sorted.sort_by_key(|g| (g.order.unwrap_or(0), degree_of_label(g.first_found.as_deref())));

    let mut out = String::new();
    let _ = writeln!(out, "{:}", rule);
    let _ = writeln!(out, "SUBGROUPS OF SYMMETRIC GROUPS - SUMMARY");
    let _ = writeln!(out, "Generated: {:}", generated);
    let _ = writeln!(out, "Total unique groups: {:}", groups.len());
    let _ = writeln!(out, "{:}\n", rule);
    let _ = writeln!(out, "{:<6} {:<12} {:<10} {:}", "#", "Order", "First In", "Structure");
    let _ = writeln!(out, "{:}", thin);
    for g in sorted {
        let _ = writeln!(
            out,
            "{:<6} {:<12} {:<10} {:}",
            g.number.map(|n| n.to_string()).unwrap_or_else(unknown),
            g.order.map(|n| n.to_string()).unwrap_or_else(unknown),
            g.first_found.clone().unwrap_or_else(unknown),
            g.structure.clone().unwrap_or_else(unknown)
        );
    }
    let _ = writeln!(out, "{:}", thin);
    let _ = writeln!(out, "\nTotal: {:} groups", groups.len());

    let _ = writeln!(out, "\n{:}", rule);
    let _ = writeln!(out, "GROUPS BY FIRST APPEARANCE");
    let _ = writeln!(out, "{:}", rule);
    let mut by_first: IndexMap<String, usize> = IndexMap::new();
    for g in groups {
        let label = g.first_found.clone().unwrap_or_else(|| String::from("Unknown"));
        *by_first.entry(label).or_insert(0) += 1;
    }
    by_first.sort_by(|a, _, b, _| degree_of_label(Some(a.as_str())).cmp(&degree_of_label(Some(b.as_str()))));
    for (label, count) in by_first {
        let _ = writeln!(out, "  {:}: {:} groups", label, count);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRow {
    pub category: String,
    pub groups: u64,
    pub types: u64,
}

/// One independent recomputation and whether it agreed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationPass {
    pub name: String,
    pub detail: String,
    pub total: Option<u64>,
    pub passed: bool,
}

/// Record of how a sequence term was computed and checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub sequence: String,
    pub description: String,
    pub n: u32,
    pub value: u64,
    pub generated: String,
    /// Earlier terms, for the growth table.
    pub known: Vec<(u32, u64)>,
    pub breakdown: Vec<CategoryRow>,
    pub passes: Vec<VerificationPass>,
}

impl VerificationReport {
    /// Every pass passed and every pass that reports a total agrees with
    /// `value`.
    pub fn all_passed(&self) -> bool {
        self.passes
            .iter()
            .all(|p| p.passed && p.total.map_or(true, |t| t == self.value))
    }

    pub fn breakdown_total(&self) -> (u64, u64) {
        self.breakdown
            .iter()
            .fold((0, 0), |(g, t), row| (g + row.groups, t + row.types))
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {:}({:}) = {:}\n", self.sequence, self.n, self.value);
        let _ = writeln!(out, "{:}\n", self.description);
        let _ = writeln!(out, "Generated {:}\n", self.generated);

        if !self.known.is_empty() {
            let _ = writeln!(out, "## Known values\n");
            let _ = writeln!(out, "| n | a(n) | ratio |");
            let _ = writeln!(out, "|---|---:|---:|");
            let mut prev: Option<u64> = None;
            for &(n, a) in self.known.iter() {
                let ratio = match prev {
                    Some(p) if p > 0 => format!("{:.3}", a as f64 / p as f64),
                    _ => String::from("-"),
                };
                let _ = writeln!(out, "| {:} | {:} | {:} |", n, a, ratio);
                prev = Some(a);
            }
            out.push('\n');
        }

        if !self.breakdown.is_empty() {
            let (groups, types) = self.breakdown_total();
            let _ = writeln!(out, "## Result breakdown\n");
            let _ = writeln!(out, "| Category | Groups | Types |");
            let _ = writeln!(out, "|---|---:|---:|");
            for row in self.breakdown.iter() {
                let _ = writeln!(out, "| {:} | {:} | {:} |", row.category, row.groups, row.types);
            }
            let _ = writeln!(out, "| **Total** | **{:}** | **{:}** |\n", groups, types);
        }

        let _ = writeln!(out, "## Verification passes\n");
        let _ = writeln!(out, "| Pass | Detail | Total | Result |");
        let _ = writeln!(out, "|---|---|---:|---|");
        for p in self.passes.iter() {
            let total = p.total.map(|t| t.to_string()).unwrap_or_else(|| String::from("-"));
            let result = if p.passed { "PASS" } else { "FAIL" };
            let _ = writeln!(out, "| {:} | {:} | {:} | {:} |", p.name, p.detail, total, result);
        }
        let verdict = if self.all_passed() {
            "ALL PASSES AGREE"
        } else {
            "PASSES DISAGREE"
        };
        let _ = writeln!(out, "\n**{:}**", verdict);
        out
    }

    /// Writes `<stem>.md` and `<stem>.json` into `dir`.
    pub fn save(&self, dir: impl AsRef<Path>, stem: &str) -> Result<()> {
        let dir = dir.as_ref();
        write_text(dir.join(format!("{:}.md", stem)), &self.to_markdown())?;
        save_json(self, dir.join(format!("{:}.json", stem)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        load_json(path)
    }
}
