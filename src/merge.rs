//! Stitching per-worker outputs back into single files.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use fxhash::{FxHashMap, FxHashSet};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::checkpoint::has_complete_marker;
use crate::error::{read_text, write_text, CensusError, Result};
use crate::records::{
    find_list, rec_blocks, write_record_list, GapValue, ListTarget, SubgroupRecord,
};

#[derive(Debug, Clone)]
pub struct CombineOptions {
    pub target: ListTarget,
    /// Order the output by `originalIndex` (records without one go last).
    pub sort_by_original_index: bool,
    /// Rewrite `index` and `combinedIndex` as 1, 2, 3, ...
    pub renumber: bool,
    pub header: Vec<String>,
}

impl Default for CombineOptions {
    fn default() -> Self {
        CombineOptions {
            target: ListTarget::Return,
            sort_by_original_index: false,
            renumber: true,
            header: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCount {
    pub records: usize,
    pub complete: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CombineSummary {
    pub per_file: IndexMap<String, FileCount>,
    pub missing: Vec<String>,
    pub total: usize,
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Every record block of every input, in input order. Missing inputs are
/// skipped with a warning.
pub fn read_record_files(inputs: &[PathBuf]) -> Result<(Vec<SubgroupRecord>, CombineSummary)> {
    let mut summary = CombineSummary::default();
    let mut records = Vec::new();
    for path in inputs {
        let label = file_label(path);
        if !path.exists() {
            log::warn!("WARNING: Missing file for {:}", label);
            summary.missing.push(label);
            continue;
        }
        let text = read_text(path)?;
        let complete = has_complete_marker(&text);
        if !complete {
            log::warn!("{:} has no completion marker, using the records written so far", label);
        }
        let mut count = 0;
        for block in rec_blocks(&text) {
            records.push(SubgroupRecord::parse(block)?);
            count += 1;
        }
        log::info!("{:}: {:} records", label, count);
        summary.per_file.insert(label, FileCount { records: count, complete });
        summary.total += count;
    }
    Ok((records, summary))
}

pub fn combine_record_files(
    inputs: &[PathBuf],
    output: impl AsRef<Path>,
    options: &CombineOptions,
) -> Result<CombineSummary> {
    let (mut records, summary) = read_record_files(inputs)?;
    if options.sort_by_original_index {
        records.sort_by_key(|r| r.original_index().unwrap_or(u64::MAX));
    }
    if options.renumber {
        for (ix, record) in records.iter_mut().enumerate() {
            let n = GapValue::Int(ix as i64 + 1);
            if record.get("combinedIndex").is_some() {
                record.set("combinedIndex", n.clone());
            }
            record.set("index", n);
        }
    }
    let mut header = options.header.clone();
    header.push(format!("Combined from {:} files", summary.per_file.len()));
    header.push(format!("Total records: {:}", records.len()));
    let trailer = format!("{:} subgroups", records.len());
    let written = write_record_list(
        output.as_ref(),
        &options.target,
        &header,
        records.iter(),
        Some(trailer.as_str()),
    )?;
    debug_assert_eq!(written, summary.total);
    Ok(summary)
}

/// Number of records in a written file, read back from disk.
pub fn recount(path: impl AsRef<Path>) -> Result<usize> {
    let text = read_text(path)?;
    Ok(rec_blocks(&text).len())
}

fn result_var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"RESULT_REPS_\w+\s*:=").expect("static regex"))
}

/// The integer list bound to `RESULT_REPS_*` in a worker result file.
pub fn read_result_reps(text: &str) -> Result<Option<Vec<u64>>> {
    let Some(m) = result_var_re().find(text) else {
        return Ok(None);
    };
    let name = m.as_str().trim_end_matches(":=").trim();
    let Some(list) = find_list(text, name) else {
        return Ok(None);
    };
    let value = GapValue::parse(list)?;
    value
        .as_u64_list()
        .map(Some)
        .ok_or_else(|| CensusError::parse(m.start(), format!("{:} is not a list of indices", name)))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Representatives {
    /// Representatives per worker, in worker order.
    pub per_worker: IndexMap<String, usize>,
    pub missing_workers: Vec<String>,
    pub singletons: usize,
    pub difficult: usize,
    /// Indices reported by more than one source.
    pub duplicated: Vec<u64>,
    pub all: Vec<u64>,
}

/// Gathers the final representative list from worker result files plus the
/// representatives decided without GAP.
pub fn collect_representatives(
    results: &[(String, PathBuf)],
    singletons: &[u64],
    difficult: &[u64],
) -> Result<Representatives> {
    let mut out = Representatives::default();
    let mut seen: FxHashSet<u64> = FxHashSet::default();
    let mut duplicated = BTreeSet::new();
    let mut push = |ix: u64, all: &mut Vec<u64>| {
        if seen.insert(ix) {
            all.push(ix);
        } else {
            duplicated.insert(ix);
        }
    };
    for (worker, path) in results {
        if !path.exists() {
            log::warn!("WARNING: Missing file for {:}", worker);
            out.missing_workers.push(worker.clone());
            continue;
        }
        let text = read_text(path)?;
        match read_result_reps(&text)? {
            Some(reps) => {
                out.per_worker.insert(worker.clone(), reps.len());
                for ix in reps {
                    push(ix, &mut out.all);
                }
            }
            None => {
                log::warn!("WARNING: No RESULT_REPS list in {:}", path.display());
                out.missing_workers.push(worker.clone());
            }
        }
    }
    out.singletons = singletons.len();
    out.difficult = difficult.len();
    for &ix in singletons.iter().chain(difficult.iter()) {
        push(ix, &mut out.all);
    }
    out.all.sort_unstable();
    out.duplicated = duplicated.into_iter().collect();
    Ok(out)
}

/// Writes `return [ gens, ... ];` for the given indices, in order.
pub fn write_representative_gens(
    path: impl AsRef<Path>,
    reps: &[u64],
    by_index: &FxHashMap<u64, SubgroupRecord>,
    header: &[String],
) -> Result<usize> {
    let mut out = String::new();
    for line in header {
        let _ = writeln!(out, "# {:}", line);
    }
    out.push_str("return [\n");
    let mut written = 0;
    for ix in reps {
        let record = by_index
            .get(ix)
            .ok_or_else(|| CensusError::Missing(format!("no record with index {:}", ix)))?;
        let gens = record
            .get("gens")
            .ok_or_else(|| CensusError::Missing(format!("record {:} has no gens", ix)))?;
        if written > 0 {
            out.push_str(",\n");
        }
        let _ = write!(out, "  {:}", gens);
        written += 1;
    }
    out.push_str("\n];\n");
    write_text(path, &out)?;
    Ok(written)
}

fn quoted_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""\[\s*(\d+)\s*,\s*(\d+)\s*\]""#).expect("static regex"))
}

fn map_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\w+\[(\d+)\]\s*:=\s*\[\s*(\d+)\s*,\s*(\d+)\s*\]\s*;").expect("static regex")
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdGroupSummary {
    pub total: usize,
    pub unique: usize,
    /// Indices assigned an id more than once (only for the `MAP[idx]` form).
    pub duplicate_indices: Vec<u64>,
    pub types: BTreeSet<(u64, u64)>,
}

/// Counts IdGroup results written either as `"[o, i]"` strings or as
/// `MAP[idx] := [o, i];` assignments.
pub fn merge_idgroups<'a, I>(texts: I) -> IdGroupSummary
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = IdGroupSummary::default();
    let mut indices: FxHashSet<u64> = FxHashSet::default();
    let mut dup_indices = BTreeSet::new();
    for text in texts {
        for c in map_id_re().captures_iter(text) {
            let (Ok(ix), Ok(o), Ok(i)) = (
                c[1].parse::<u64>(),
                c[2].parse::<u64>(),
                c[3].parse::<u64>(),
            ) else {
                continue;
            };
            if !indices.insert(ix) {
                dup_indices.insert(ix);
            }
            out.types.insert((o, i));
            out.total += 1;
        }
        for c in quoted_id_re().captures_iter(text) {
            let (Ok(o), Ok(i)) = (c[1].parse::<u64>(), c[2].parse::<u64>()) else {
                continue;
            };
            out.types.insert((o, i));
            out.total += 1;
        }
    }
    out.unique = out.types.len();
    out.duplicate_indices = dup_indices.into_iter().collect();
    out
}

/// `idGroup` fields of invariant records, as `(index, [order, id])`.
pub fn idgroups_of_records(records: &[SubgroupRecord]) -> Vec<(u64, (u64, u64))> {
    records
        .iter()
        .filter_map(|r| {
            let ix = r.index()?;
            let pair = r.get("idGroup")?.as_u64_list()?;
            match pair[..] {
                [o, i] => Some((ix, (o, i))),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("census_merge_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn combine_sorts_renumbers_and_recounts() {
        let dir = scratch_dir();
        let a = dir.join("leaf_results_1.g");
        let b = dir.join("leaf_results_2.g");
        std::fs::write(
            &a,
            "maxsub_results := [\n  rec(originalIndex := 9, gens := [ ], source := \"x\"),\n  rec(originalIndex := 2, gens := [ ], source := \"y\")\n];\n# Complete: 2 subgroups from 1 leaves in 0 seconds\n",
        )
        .unwrap();
        // still running, truncated mid-record
        std::fs::write(
            &b,
            "maxsub_results := [\n  rec(originalIndex := 5, combinedIndex := 77, gens := [ ])\n# Leaf complete: z (1 subgroups in 0s)\n,\n  rec(originalIndex := 6, gens := [ [",
        )
        .unwrap();
        let out = dir.join("combined.g");
        let inputs = vec![a, b, dir.join("leaf_results_3.g")];
        let options = CombineOptions {
            sort_by_original_index: true,
            ..Default::default()
        };
        let summary = combine_record_files(&inputs, &out, &options).unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.missing, vec!["leaf_results_3.g".to_string()]);
        assert!(summary.per_file["leaf_results_1.g"].complete);
        assert!(!summary.per_file["leaf_results_2.g"].complete);
        assert_eq!(recount(&out).unwrap(), 3);

        let text = std::fs::read_to_string(&out).unwrap();
        let records: Vec<SubgroupRecord> =
            rec_blocks(&text).into_iter().map(|b| SubgroupRecord::parse(b).unwrap()).collect();
        let orig: Vec<u64> = records.iter().map(|r| r.original_index().unwrap()).collect();
        assert_eq!(orig, vec![2, 5, 9]);
        assert_eq!(records[1].index(), Some(2));
        assert_eq!(records[1].get("combinedIndex").unwrap().as_int(), Some(2));
        assert!(text.contains("# Complete: 3 subgroups"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn result_lists() {
        let text = "# Worker dp results\n\nRESULT_REPS_DP := [ 4, 9,\n 12 ];\n# Complete: 3 reps\n";
        assert_eq!(read_result_reps(text).unwrap(), Some(vec![4, 9, 12]));
        assert_eq!(read_result_reps("nothing").unwrap(), None);
        assert_eq!(read_result_reps("RESULT_REPS_X := [  ];").unwrap(), Some(vec![]));
    }

    #[test]
    fn collects_and_flags_duplicates() {
        let dir = scratch_dir();
        let dp = dir.join("result_dp.g");
        std::fs::write(&dp, "RESULT_REPS_DP := [ 3, 8 ];\n# Complete: 2\n").unwrap();
        let reg = dir.join("result_regular_1.g");
        std::fs::write(&reg, "RESULT_REPS_REGULAR_1 := [ 1, 8 ];\n# Complete: 2\n").unwrap();
        let results = vec![
            ("dp".to_string(), dp),
            ("regular_1".to_string(), reg),
            ("2groups".to_string(), dir.join("result_2groups.g")),
        ];
        let reps = collect_representatives(&results, &[20, 21], &[30]).unwrap();
        assert_eq!(reps.all, vec![1, 3, 8, 20, 21, 30]);
        assert_eq!(reps.duplicated, vec![8]);
        assert_eq!(reps.missing_workers, vec!["2groups".to_string()]);
        assert_eq!(reps.per_worker["dp"], 2);

        let mut by_index = FxHashMap::default();
        for ix in [1_u64, 3] {
            let r = SubgroupRecord::parse(&format!("rec( index := {:}, gens := [ [ 2, 1 ] ] )", ix)).unwrap();
            by_index.insert(ix, r);
        }
        let gens_file = dir.join("final_reps.g");
        assert_eq!(write_representative_gens(&gens_file, &[1, 3], &by_index, &[]).unwrap(), 2);
        let parsed = crate::records::parse_assignments(&std::fs::read_to_string(&gens_file).unwrap()).unwrap();
        assert_eq!(parsed["return"].as_list().unwrap().len(), 2);
        assert!(write_representative_gens(&gens_file, &[8], &by_index, &[]).is_err());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn idgroup_forms() {
        let map = "S16_IDGROUP_MAP := [];\nS16_IDGROUP_MAP[4] := [ 8, 3 ];\nS16_IDGROUP_MAP[7] := [8, 3];\nS16_IDGROUP_MAP[7] := [12, 5];\n";
        let strings = "ids := [ \"[ 8, 3 ]\", \"[24, 12]\" ];";
        let summary = merge_idgroups([map, strings]);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.unique, 3);
        assert_eq!(summary.duplicate_indices, vec![7]);

        let records = vec![
            SubgroupRecord::parse("rec( index := 1, idGroup := [ 6, 1 ] )").unwrap(),
            SubgroupRecord::parse("rec( index := 2 )").unwrap(),
        ];
        assert_eq!(idgroups_of_records(&records), vec![(1, (6, 1))]);
    }
}
