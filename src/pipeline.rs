//! The census phases, one function per `census` subcommand. Each phase reads
//! what the previous one left in the work directory.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use fxhash::{FxHashMap, FxHashSet};
use indexmap::IndexMap;
use regex::Regex;

use crate::bucket::{bucket_records, Bucket, Categorized, Category, CategoryRules};
use crate::checkpoint::{
    bucket_checkpoints, completed_count, completed_leaves, has_complete_marker,
    matching_checkpoints, truncate_to_last_leaf,
};
use crate::clock::timestamp;
use crate::config::{CensusConfig, A000638, A174511};
use crate::distribute::{estimate_leaf_seconds, greedy_pack, imbalance, CostModel, LEAF_CALIBRATION};
use crate::error::{create_dir_all, read_text, write_text, CensusError, Result};
use crate::compare::SigKeyComparison;
use crate::fingerprint::TypeInfo;
use crate::gap::script::{
    dedup_worker_script, leaf_worker_script, precompute_script, verify_proofs_script,
    DedupWorkerParams, LeafWorkerParams, PrecomputeParams, VerifyProofsParams, INVARIANTS_VAR,
};
use crate::gap::{DedupMethod, Echo, GapEnvironment, GapInvocation, Launcher};
use crate::merge::{
    collect_representatives, combine_record_files, idgroups_of_records, merge_idgroups,
    read_result_reps, recount, write_representative_gens, CombineOptions, IdGroupSummary,
};
use crate::proofs::{
    append_proofs, duplicates_of, extract_new_proofs, fail_lines, parse_verify_output,
    staging_text, ProofCheck, Staging,
};
use crate::progress::{print_snapshot, RateTracker, Snapshot, WorkerFiles, WorkerKind};
use crate::records::{rec_blocks, read_bucket_indices, write_bucket_assignments, write_record_list, ListTarget, SubgroupRecord};
use crate::report::{
    parse_summary_groups, summary_table, BucketBreakdown, CategoryRow, Coverage, FinalResult,
    Tracking, VerificationPass, VerificationReport, WorkerAssignment, BREAKDOWN_FILENAME,
    FINAL_RESULT_FILENAME, TRACKING_FILENAME,
};
use crate::selftest::{run_suite, validate_work_dir, SelftestOptions, TestSuite};
use crate::union_find::IsoMap;
use crate::validate::{
    check_checkpoint_consistency, check_partition, check_reps_within_assignment, parse_proofs,
    verify_iso_map, verify_proof_coverage, CountCheck, IsoMapReport, ProofCoverage,
};
use crate::workers::{LaunchSummary, WorkerPool, WorkerSpec, LAUNCH_SUMMARY_FILENAME};

pub const CANDIDATES_VAR: &str = "CENSUS_CANDIDATES";
const LEAF_BATCH_VAR: &str = "leaf_batch";
pub const SIGKEY_COMPARISON_FILENAME: &str = "sigkey_comparison.json";

/// File names inside the work directory.
#[derive(Debug, Clone)]
pub struct Layout {
    dir: PathBuf,
    n: u32,
}

impl Layout {
    pub fn new(conf: &CensusConfig) -> Self {
        Layout {
            dir: conf.work_dir.clone(),
            n: conf.n,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn named(&self, name: String) -> PathBuf {
        self.dir.join(name)
    }

    pub fn precompute_script(&self) -> PathBuf {
        self.named(format!("precompute_s{:}.g", self.n))
    }
    pub fn cache(&self) -> PathBuf {
        self.named(format!("s{:}_subgroups.g", self.n))
    }
    pub fn invariants(&self) -> PathBuf {
        self.named(format!("s{:}_invariants.g", self.n))
    }
    pub fn leaves(&self) -> PathBuf {
        self.dir.join("leaves.g")
    }
    pub fn leaf_batch(&self, id: usize) -> PathBuf {
        self.named(format!("leaf_batch_{:}.g", id))
    }
    pub fn leaf_script(&self, id: usize) -> PathBuf {
        self.named(format!("leaf_worker_{:}.g", id))
    }
    pub fn leaf_result(&self, id: usize) -> PathBuf {
        self.dir.join("results").join(format!("leaf_result_{:}.g", id))
    }
    pub fn leaf_log(&self, id: usize) -> PathBuf {
        self.dir.join("logs").join(format!("leaf_worker_{:}.log", id))
    }
    pub fn candidates(&self) -> PathBuf {
        self.named(format!("s{:}_candidates.g", self.n))
    }
    pub fn bucket_file(&self, worker: &str) -> PathBuf {
        self.dir.join("buckets").join(format!("buckets_{:}.g", worker))
    }
    pub fn worker_script(&self, worker: &str) -> PathBuf {
        self.named(format!("worker_{:}.g", worker))
    }
    pub fn result_file(&self, worker: &str) -> PathBuf {
        self.dir.join("results").join(format!("result_{:}.g", worker))
    }
    pub fn checkpoint_file(&self, worker: &str) -> PathBuf {
        self.dir.join("checkpoints").join(format!("checkpoint_{:}.g", worker))
    }
    pub fn worker_log(&self, worker: &str) -> PathBuf {
        self.dir.join("logs").join(format!("worker_{:}.log", worker))
    }
    pub fn representatives(&self) -> PathBuf {
        self.named(format!("s{:}_representatives.g", self.n))
    }
    pub fn iso_map(&self) -> PathBuf {
        self.named(format!("s{:}_iso_map.g", self.n))
    }
    pub fn idgroup_map(&self) -> PathBuf {
        self.named(format!("s{:}_idgroup_map.g", self.n))
    }
    pub fn proofs(&self) -> PathBuf {
        self.dir.join("proofs.g")
    }
    pub fn type_info(&self) -> PathBuf {
        self.named(format!("s{:}_type_info.g", self.n))
    }
    pub fn staging(&self) -> PathBuf {
        self.dir.join("new_proofs_staging.g")
    }
    pub fn verify_dir(&self) -> PathBuf {
        self.dir.join("verify")
    }
    pub fn verify_script(&self, id: usize) -> PathBuf {
        self.verify_dir().join(format!("verify_worker_{:}.g", id))
    }
    pub fn verify_result(&self, id: usize) -> PathBuf {
        self.verify_dir().join(format!("verify_worker_{:}_results.txt", id))
    }
    pub fn verify_output(&self) -> PathBuf {
        self.verify_dir().join("verify_results.txt")
    }
    pub fn tracking(&self) -> PathBuf {
        self.dir.join(TRACKING_FILENAME)
    }
    pub fn final_result(&self) -> PathBuf {
        self.dir.join(FINAL_RESULT_FILENAME)
    }

    pub fn create_dirs(&self) -> Result<()> {
        for sub in ["buckets", "results", "checkpoints", "logs"] {
            create_dir_all(self.dir.join(sub))?;
        }
        Ok(())
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| CensusError::io(".", e))?;
    Ok(cwd.join(path))
}

/// `path` as the GAP process running in `env` will see it.
fn gap_path(conf: &CensusConfig, env: GapEnvironment, path: &Path) -> Result<String> {
    let inv = GapInvocation::new(&conf.gap, env, &conf.memory);
    Ok(inv.script_path(&absolute(path)?))
}

fn list_var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*([A-Za-z_]\w*)\s*:=\s*\[").expect("static regex"))
}

/// The variable a GAP list file binds, and its records.
pub fn read_record_file(path: &Path) -> Result<(String, Vec<SubgroupRecord>)> {
    let text = read_text(path)?;
    let var = list_var_re()
        .captures(&text)
        .map(|c| c[1].to_string())
        .ok_or_else(|| {
            CensusError::Missing(format!("{:} does not bind a list variable", path.display()))
        })?;
    let records = rec_blocks(&text)
        .into_iter()
        .map(SubgroupRecord::parse)
        .collect::<Result<Vec<_>>>()?;
    Ok((var, records))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrecomputeOptions {
    pub skip_conjugacy: bool,
    pub skip_invariants: bool,
}

/// Enumerates the conjugacy classes of S_n and writes their invariants.
/// Returns whether the class count matches the known value.
pub fn precompute(conf: &CensusConfig, opts: PrecomputeOptions) -> Result<bool> {
    let layout = Layout::new(conf);
    layout.create_dirs()?;
    let env = conf.gap.environment;
    let script = precompute_script(&PrecomputeParams {
        n: conf.n,
        cache_file: gap_path(conf, env, &layout.cache())?,
        invariants_file: gap_path(conf, env, &layout.invariants())?,
        skip_conjugacy: opts.skip_conjugacy,
        skip_invariants: opts.skip_invariants,
    });
    write_text(layout.precompute_script(), &script)?;
    log::info!("Wrote {:}", layout.precompute_script().display());

    let invocation = GapInvocation::new(&conf.gap, env, &conf.memory);
    let command = invocation.command(&layout.precompute_script());
    let outcome = Launcher::new(
        format!("Precompute S{:}", conf.n),
        layout.dir().join("logs").join("precompute.log"),
    )
    .header_line(format!("skip_conjugacy={:} skip_invariants={:}", opts.skip_conjugacy, opts.skip_invariants))
    .timeout(conf.timeout())
    .cleanup(invocation.cleanup_argv(&layout.precompute_script()))
    .run(command)?;
    if !outcome.exited_cleanly() {
        println!(
            "Precompute failed: exit={:?} timed_out={:} last line: {:}",
            outcome.exit_code, outcome.timed_out, outcome.last_line
        );
        return Ok(false);
    }
    if opts.skip_invariants {
        return Ok(true);
    }
    let text = read_text(layout.invariants())?;
    let written = completed_count(&text).unwrap_or(0);
    let reread = rec_blocks(&text).len() as u64;
    let round_trip = CountCheck::new("Invariant records re-read", written, reread);
    round_trip.print();
    let mut ok = round_trip.verdict().is_match();
    if let Some(expected) = conf.expected_conjugacy_classes() {
        let check = CountCheck::new(format!("A000638({:})", conf.n), expected, written);
        check.print();
        ok &= check.verdict().is_match();
    }
    Ok(ok)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LeafOptions {
    pub first: Option<usize>,
    pub last: Option<usize>,
}

/// Splits `leaves.g` over the leaf workers by estimated lattice time and
/// runs them, resuming from the leaves each result file already holds.
pub fn run_leaves(conf: &CensusConfig, opts: LeafOptions) -> Result<LaunchSummary> {
    let layout = Layout::new(conf);
    layout.create_dirs()?;
    let (_, leaves) = read_record_file(&layout.leaves())?;
    for leaf in leaves.iter() {
        if leaf.get("label").and_then(|v| v.as_str()).is_none() {
            return Err(CensusError::Missing(format!("leaf without a label: {:}", leaf)));
        }
    }
    println!("Found {:} leaves", leaves.len());
    let estimate = |r: &SubgroupRecord| {
        let order = r.order().unwrap_or(1);
        estimate_leaf_seconds(order, LEAF_CALIBRATION).round().max(1.0) as u64
    };
    let bins = greedy_pack(leaves, conf.num_workers, estimate);
    let first = opts.first.unwrap_or(1).max(1);
    let last = opts.last.unwrap_or(conf.num_workers).min(conf.num_workers);
    let env = conf.gap.environment;

    let mut specs = Vec::new();
    for (ix, bin) in bins.iter().enumerate() {
        let id = ix + 1;
        println!(
            "  Worker {:}: {:} leaves, est {:}s ({:.1}h)",
            id,
            bin.items.len(),
            bin.load,
            bin.load as f64 / 3600.0
        );
        if bin.items.is_empty() || id < first || id > last {
            continue;
        }
        let header = vec![
            format!("Leaf batch {:} for S{:}", id, conf.n),
            format!("Leaves: {:}", bin.items.len()),
            format!("Estimated time: {:}s", bin.load),
        ];
        write_record_list(
            layout.leaf_batch(id),
            &ListTarget::Variable(String::from(LEAF_BATCH_VAR)),
            &header,
            bin.items.iter(),
            None,
        )?;
        let result = layout.leaf_result(id);
        let completed = resume_leaves(id, &result)?;
        if !completed.is_empty() {
            log::info!("Leaf worker {:}: {:} leaves already done", id, completed.len());
        }
        let script = leaf_worker_script(&LeafWorkerParams {
            worker_id: id,
            n: conf.n,
            batch_file: gap_path(conf, env, &layout.leaf_batch(id))?,
            result_file: gap_path(conf, env, &result)?,
            completed: &completed,
        });
        write_text(layout.leaf_script(id), &script)?;
        specs.push(WorkerSpec {
            name: format!("leaf_{:}", id),
            script: layout.leaf_script(id),
            environment: env,
            memory: conf.memory.clone(),
            result_file: Some(result),
            log_file: layout.leaf_log(id),
            require_marker: true,
        });
    }
    let summary = pool(conf).run_all(&specs)?;
    summary.save(layout.dir().join("launch_summary_leaves.json"))?;
    Ok(summary)
}

/// Labels of the leaves `result` already holds. Records of a leaf that was
/// cut off mid-way are dropped from the file first.
fn resume_leaves(id: usize, result: &Path) -> Result<FxHashSet<String>> {
    if !result.exists() {
        return Ok(FxHashSet::default());
    }
    let text = read_text(result)?;
    if !has_complete_marker(&text) {
        if let Some(kept) = truncate_to_last_leaf(&text) {
            log::warn!(
                "Leaf worker {:}: dropping {:} bytes of an unfinished leaf",
                id,
                text.len() - kept.len()
            );
            write_text(result, kept)?;
        }
    }
    Ok(completed_leaves(&text))
}

fn pool(conf: &CensusConfig) -> WorkerPool<'_, crate::config::GapSettings> {
    let mut pool = WorkerPool::new(&conf.gap, conf.max_parallel);
    pool.timeout = Some(conf.timeout());
    pool.monitor_interval = Duration::from_secs(conf.monitor_interval_secs.max(1));
    pool.echo = Echo::Matching(
        Regex::new(r"Bucket \d+|Leaf complete|Complete|ERROR|Error").expect("static regex"),
    );
    pool
}

/// Concatenates the leaf results into one renumbered candidate file.
/// Returns whether re-reading the output gives the count written.
pub fn combine(conf: &CensusConfig) -> Result<bool> {
    let layout = Layout::new(conf);
    let inputs: Vec<PathBuf> = (1..=conf.num_workers).map(|id| layout.leaf_result(id)).collect();
    let options = CombineOptions {
        target: ListTarget::Variable(String::from(CANDIDATES_VAR)),
        header: vec![format!("Candidate subgroups of S{:} from leaf lattices", conf.n)],
        ..Default::default()
    };
    let summary = combine_record_files(&inputs, layout.candidates(), &options)?;
    for (name, count) in summary.per_file.iter() {
        let state = if count.complete { "complete" } else { "PARTIAL" };
        println!("  {:<24} {:>8} records ({:})", name, count.records, state);
    }
    println!("  Total: {:} records -> {:}", summary.total, layout.candidates().display());
    let check = CountCheck::new("Round trip", summary.total as u64, recount(layout.candidates())? as u64);
    check.print();
    Ok(check.verdict().is_match() && summary.missing.is_empty())
}

/// Buckets split by handling, with the IdGroup-identified records taken out
/// first when counting isomorphism types.
#[derive(Debug, Clone)]
pub struct Split {
    pub cats: Categorized,
    pub idgroup_indices: Vec<u64>,
    pub idgroup_types: Option<u64>,
}

pub fn categorize(conf: &CensusConfig, records: &[SubgroupRecord], method: DedupMethod) -> Split {
    let mut idgroup_indices = Vec::new();
    let mut idgroup_types = None;
    let large: Vec<SubgroupRecord> = if method == DedupMethod::Conjugacy {
        records.to_vec()
    } else {
        let ids = idgroups_of_records(records);
        idgroup_indices = ids.iter().map(|(ix, _)| *ix).collect();
        let unique: FxHashSet<(u64, u64)> = ids.iter().map(|(_, id)| *id).collect();
        idgroup_types = Some(if conf.idgroup_types > 0 {
            conf.idgroup_types
        } else {
            unique.len() as u64
        });
        let skip: FxHashSet<u64> = idgroup_indices.iter().copied().collect();
        records
            .iter()
            .filter(|r| r.index().map_or(true, |ix| !skip.contains(&ix)))
            .cloned()
            .collect()
    };
    let mut cats = Categorized::new(bucket_records(&large, method), &CategoryRules::from_config(conf));
    if method == DedupMethod::Conjugacy {
        // direct products and 2-groups only matter for isomorphism tests
        let dp = std::mem::take(&mut cats.direct_product);
        let two = std::mem::take(&mut cats.two_group);
        cats.regular.extend(dp);
        cats.regular.extend(two);
    }
    Split {
        cats,
        idgroup_indices,
        idgroup_types,
    }
}

#[derive(Debug, Clone)]
pub struct PrepareOptions {
    /// Defaults to the invariants file written by `precompute`.
    pub input: Option<PathBuf>,
    pub method: DedupMethod,
    pub cost: CostModel,
}

fn result_var(worker: &str) -> String {
    format!("RESULT_REPS_{:}", worker.to_ascii_uppercase())
}

fn worker_script(
    conf: &CensusConfig,
    layout: &Layout,
    tracking: &Tracking,
    worker: &WorkerAssignment,
    resume: &[crate::checkpoint::BucketCheckpoint],
) -> Result<String> {
    let env = worker.environment;
    let name = worker.worker.as_str();
    Ok(dedup_worker_script(&DedupWorkerParams {
        worker_name: name,
        n: conf.n,
        method: worker.method,
        data_file: gap_path(conf, env, Path::new(&tracking.input_file))?,
        data_var: &tracking.input_var,
        bucket_file: gap_path(conf, env, &layout.bucket_file(name))?,
        checkpoint_file: gap_path(conf, env, &layout.checkpoint_file(name))?,
        result_file: gap_path(conf, env, &layout.result_file(name))?,
        result_var: result_var(name),
        resume,
    }))
}

/// Deletes checkpoints, bucket files, dedup results and worker scripts so
/// that a new bucketing never resumes from the old one. Leaf results stay.
fn clear_dedup_outputs(layout: &Layout) -> Result<usize> {
    let stale = |dir: &Path, keep: &dyn Fn(&str) -> bool| -> Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CensusError::io(dir, e)),
        };
        Ok(entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .filter(|p| p.file_name().and_then(|n| n.to_str()).map_or(false, |n| !keep(n)))
            .collect())
    };
    let mut doomed = stale(&layout.dir().join("checkpoints"), &|_| false)?;
    doomed.extend(stale(&layout.dir().join("buckets"), &|_| false)?);
    doomed.extend(stale(&layout.dir().join("results"), &|n| {
        !(n.starts_with("result_") && n.ends_with(".g"))
    })?);
    doomed.extend(stale(layout.dir(), &|n| !(n.starts_with("worker_") && n.ends_with(".g")))?);
    for path in doomed.iter() {
        log::info!("Removing stale {:}", path.display());
        std::fs::remove_file(path).map_err(|e| CensusError::io(path, e))?;
    }
    Ok(doomed.len())
}

/// Buckets the input, assigns buckets to workers, and writes every bucket
/// file, worker script and `tracking.json`.
pub fn prepare(conf: &CensusConfig, opts: &PrepareOptions) -> Result<Tracking> {
    let layout = Layout::new(conf);
    layout.create_dirs()?;
    let cleared = clear_dedup_outputs(&layout)?;
    if cleared > 0 {
        println!("Removed {:} files from an earlier run", cleared);
    }
    let input = opts.input.clone().unwrap_or_else(|| layout.invariants());
    let (input_var, records) = read_record_file(&input)?;
    println!("Loaded {:} records from {:}", records.len(), input.display());
    let split = categorize(conf, &records, opts.method);
    let cats = &split.cats;
    cats.print_summary();

    let mut tracking = Tracking::new(
        absolute(&input)?.display().to_string(),
        opts.method,
        records.len() as u64,
        cats,
    );
    tracking.input_var = input_var;
    tracking.idgroup_indices = split.idgroup_indices.clone();
    tracking.idgroup_types = split.idgroup_types;
    if let Some(types) = split.idgroup_types {
        println!(
            "  IdGroup: {:} groups in {:} types, not bucketed",
            split.idgroup_indices.len(),
            types
        );
    }

    let env = conf.gap.environment;
    let mut assignments: Vec<(String, Vec<&Bucket>)> = Vec::new();
    if !cats.direct_product.is_empty() {
        let buckets: Vec<&Bucket> = cats.direct_product.iter().collect();
        tracking.add_worker("dp", Category::DirectProduct, DedupMethod::Isomorphism, env, &buckets);
        assignments.push((String::from("dp"), buckets));
    }
    if !cats.two_group.is_empty() {
        let buckets: Vec<&Bucket> = cats.two_group.iter().collect();
        // ANUPQ is only installed on the WSL side
        tracking.add_worker("2groups", Category::TwoGroup, DedupMethod::PGroup, GapEnvironment::Wsl, &buckets);
        assignments.push((String::from("2groups"), buckets));
    }
    let bins = greedy_pack(cats.regular.iter().collect::<Vec<&Bucket>>(), conf.num_workers, |b| {
        opts.cost.cost(b.len())
    });
    println!("  Regular packing ({:?} cost), imbalance {:.2}:", opts.cost, imbalance(&bins));
    for (ix, bin) in bins.into_iter().enumerate() {
        if bin.items.is_empty() {
            continue;
        }
        let name = format!("regular_{:}", ix + 1);
        println!("    {:<12} {:>5} buckets, load {:}", name, bin.items.len(), bin.load);
        tracking.add_worker(name.as_str(), Category::Regular, opts.method, env, &bin.items);
        assignments.push((name, bin.items));
    }

    let owners = tracking.owners();
    let partition = check_partition(
        tracking.total_groups,
        owners.iter().map(|(name, ix)| (name.as_str(), *ix)),
    );
    partition.print();
    tracking.coverage = Coverage::from(&partition);

    for (name, buckets) in assignments.iter() {
        let header = vec![
            format!("Buckets for worker {:}", name),
            format!("{:} buckets, {:} groups", buckets.len(), buckets.iter().map(|b| b.len()).sum::<usize>()),
        ];
        write_bucket_assignments(
            layout.bucket_file(name),
            &header,
            buckets.iter().map(|b| (b.key.as_str(), b.indices.as_slice())),
        )?;
    }
    for worker in tracking.workers.iter() {
        let script = worker_script(conf, &layout, &tracking, worker, &[])?;
        write_text(layout.worker_script(&worker.worker), &script)?;
    }
    tracking.save(layout.tracking())?;
    println!("Wrote {:} worker scripts and {:}", tracking.workers.len(), layout.tracking().display());
    Ok(tracking)
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub wsl_only: bool,
    pub cygwin_only: bool,
    pub only: Option<String>,
}

pub fn select_workers<'a>(tracking: &'a Tracking, opts: &LaunchOptions) -> Vec<&'a WorkerAssignment> {
    tracking
        .workers
        .iter()
        .filter(|w| !opts.wsl_only || w.environment == GapEnvironment::Wsl)
        .filter(|w| !opts.cygwin_only || w.environment != GapEnvironment::Wsl)
        .filter(|w| opts.only.as_ref().map_or(true, |o| *o == w.worker))
        .collect()
}

/// Runs the dedup workers recorded in `tracking.json`. Scripts are rewritten
/// so that buckets already in a worker's checkpoint are not redone.
pub fn launch(conf: &CensusConfig, opts: &LaunchOptions) -> Result<LaunchSummary> {
    let layout = Layout::new(conf);
    layout.create_dirs()?;
    let tracking = Tracking::from_file(layout.tracking())?;
    let selected = select_workers(&tracking, opts);
    if selected.is_empty() {
        return Err(CensusError::Missing(String::from("no workers match the selection")));
    }
    let mut specs = Vec::new();
    for worker in selected {
        let name = worker.worker.as_str();
        let resume = resume_buckets(&layout, name)?;
        if !resume.is_empty() {
            log::info!("[{:}] {:} buckets checkpointed", name, resume.len());
        }
        let script = worker_script(conf, &layout, &tracking, worker, &resume)?;
        write_text(layout.worker_script(name), &script)?;
        specs.push(WorkerSpec {
            name: name.to_string(),
            script: layout.worker_script(name),
            environment: worker.environment,
            memory: conf.memory.clone(),
            result_file: Some(layout.result_file(name)),
            log_file: layout.worker_log(name),
            require_marker: true,
        });
    }
    let summary = pool(conf).run_all(&specs)?;
    summary.save(layout.dir().join(LAUNCH_SUMMARY_FILENAME))?;
    Ok(summary)
}

/// Checkpointed buckets of `worker` that still match its bucket file.
fn resume_buckets(layout: &Layout, worker: &str) -> Result<Vec<crate::checkpoint::BucketCheckpoint>> {
    let checkpoint = layout.checkpoint_file(worker);
    if !checkpoint.exists() {
        return Ok(Vec::new());
    }
    let buckets = read_bucket_indices(layout.bucket_file(worker))?;
    let (kept, stale) = matching_checkpoints(bucket_checkpoints(&read_text(&checkpoint)?), &buckets);
    for cp in stale.iter() {
        log::warn!(
            "[{:}] ignoring checkpoint for bucket {:}: it does not match {:}",
            worker,
            cp.bucket,
            layout.bucket_file(worker).display()
        );
    }
    Ok(kept)
}

fn expected_total(conf: &CensusConfig, method: DedupMethod) -> Option<u64> {
    match method {
        DedupMethod::Conjugacy => conf.expected_conjugacy_classes(),
        _ => conf.expected_isomorphism_types(),
    }
}

fn representatives_of(tracking: &Tracking, layout: &Layout) -> Result<crate::merge::Representatives> {
    let results: Vec<(String, PathBuf)> = tracking
        .workers
        .iter()
        .map(|w| (w.worker.clone(), layout.result_file(&w.worker)))
        .collect();
    let difficult: Vec<u64> = tracking.difficult.iter().filter_map(|d| d.representative).collect();
    collect_representatives(&results, &tracking.singletons, &difficult)
}

/// Worker results that fall outside the worker's assignment or disagree
/// with its checkpoint.
fn audit_worker(layout: &Layout, worker: &WorkerAssignment) -> Result<Vec<String>> {
    let path = layout.result_file(&worker.worker);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let Some(reps) = read_result_reps(&read_text(&path)?)? else {
        return Ok(Vec::new());
    };
    let mut problems: Vec<String> = check_reps_within_assignment(&reps, &worker.indices)
        .into_iter()
        .map(|ix| format!("representative {:} was not assigned to {:}", ix, worker.worker))
        .collect();
    let checkpoint = layout.checkpoint_file(&worker.worker);
    if checkpoint.exists() {
        let cps = bucket_checkpoints(&read_text(&checkpoint)?);
        problems.extend(check_checkpoint_consistency(&cps, &reps));
    }
    Ok(problems)
}

/// Gathers every representative, checks the total and writes
/// `final_result.json` plus the representative generators.
pub fn merge(conf: &CensusConfig) -> Result<FinalResult> {
    let layout = Layout::new(conf);
    let tracking = Tracking::from_file(layout.tracking())?;
    let reps = representatives_of(&tracking, &layout)?;

    for worker in tracking.workers.iter() {
        for problem in audit_worker(&layout, worker)? {
            log::warn!("{:}", problem);
        }
    }
    let mut sources: IndexMap<String, usize> = reps.per_worker.clone();
    sources.insert(String::from("singletons"), reps.singletons);
    sources.insert(String::from("difficult"), reps.difficult);
    println!("Representatives by source:");
    for (name, count) in sources.iter() {
        println!("  {:<14} {:>8}", name, count);
    }
    if !reps.duplicated.is_empty() {
        println!("  WARNING: {:} indices reported twice", reps.duplicated.len());
    }

    let total = reps.all.len() as u64 + tracking.idgroup_types.unwrap_or(0);
    let expected = expected_total(conf, tracking.method);
    let verdict = expected.map(|e| {
        let check = CountCheck::new(format!("S{:} total", conf.n), e, total);
        check.print();
        check.verdict()
    });
    let result = FinalResult {
        generated: timestamp(),
        n: conf.n,
        method: tracking.method.gap_name().to_string(),
        input_groups: tracking.total_groups,
        sources,
        representatives: reps.all.len(),
        idgroup_types: tracking.idgroup_types,
        total,
        expected,
        verdict,
        missing_workers: reps.missing_workers.clone(),
        duplicated: reps.duplicated.clone(),
    };
    result.save(layout.final_result())?;

    let input = Path::new(&tracking.input_file);
    if input.exists() {
        let (_, records) = read_record_file(input)?;
        let by_index: FxHashMap<u64, SubgroupRecord> = records
            .into_iter()
            .filter_map(|r| r.index().map(|ix| (ix, r)))
            .collect();
        let header = vec![
            format!("Representatives for S{:} ({:})", conf.n, result.method),
            format!("{:} groups", reps.all.len()),
        ];
        write_representative_gens(layout.representatives(), &reps.all, &by_index, &header)?;
    } else {
        log::warn!("WARNING: Missing input {:}, no generators written", input.display());
    }
    println!("Final total: {:} -> {:}", total, layout.final_result().display());
    Ok(result)
}

/// Representatives and duplicates per bucket.
pub fn breakdown(conf: &CensusConfig) -> Result<BucketBreakdown> {
    let layout = Layout::new(conf);
    let tracking = Tracking::from_file(layout.tracking())?;
    let (_, records) = read_record_file(Path::new(&tracking.input_file))?;
    let split = categorize(conf, &records, tracking.method);
    let reps = representatives_of(&tracking, &layout)?;
    let rep_set: FxHashSet<u64> = reps.all.iter().copied().collect();
    let breakdown = BucketBreakdown::new(&split.cats, &rep_set);
    breakdown.save(layout.dir().join(BREAKDOWN_FILENAME))?;
    println!(
        "{:} buckets: {:} representatives, {:} duplicates, {:} singletons",
        breakdown.buckets.len(),
        breakdown.total_reps,
        breakdown.total_non_reps,
        breakdown.singletons
    );
    let empty = breakdown.empty_buckets();
    if !empty.is_empty() {
        println!("WARNING: {:} buckets have no representative:", empty.len());
        for key in empty.iter().take(10) {
            println!("  {:}", key);
        }
    }
    Ok(breakdown)
}

/// Resolves duplicate proofs into a canonical map and writes it for GAP.
pub fn iso_map(conf: &CensusConfig, proofs: Option<&Path>) -> Result<IsoMapReport> {
    let layout = Layout::new(conf);
    let path = proofs.map(Path::to_path_buf).unwrap_or_else(|| layout.proofs());
    let pairs = parse_proofs(&read_text(&path)?);
    let iso = IsoMap::from_pairs(pairs.iter().copied());
    let stats = iso.stats();
    println!("Proofs read: {:}", pairs.len());
    println!("  mapped entries:         {:}", stats.mapped);
    println!("  unique representatives: {:}", stats.unique_representatives);
    println!(
        "  class sizes:            {:}..{:}",
        stats.min_class_size, stats.max_class_size
    );
    let report = verify_iso_map(&iso);
    if !report.is_ok() {
        println!(
            "  INVALID: {:} self maps, {:} non-canonical values",
            report.self_maps.len(),
            report.non_canonical.len()
        );
    }
    let header = vec![
        format!("Duplicate -> representative map for S{:}", conf.n),
        format!("{:} entries from {:}", iso.len(), path.display()),
    ];
    iso.write_gap(layout.iso_map(), &format!("S{:}_ISO_MAP", conf.n), &header)?;
    println!("Wrote {:}", layout.iso_map().display());
    Ok(report)
}

/// Checks that the proofs account for every bucketed group.
pub fn verify_proofs(conf: &CensusConfig, proofs: Option<&Path>) -> Result<ProofCoverage> {
    let layout = Layout::new(conf);
    let tracking = Tracking::from_file(layout.tracking())?;
    let large: FxHashSet<u64> = tracking
        .owners()
        .into_iter()
        .filter(|(name, _)| name != "idgroup")
        .flat_map(|(_, ix)| ix.iter().copied())
        .collect();
    let path = proofs.map(Path::to_path_buf).unwrap_or_else(|| layout.proofs());
    let pairs = parse_proofs(&read_text(&path)?);
    let expected = if layout.final_result().exists() {
        Some(FinalResult::from_file(layout.final_result())?.representatives)
    } else {
        None
    };
    let coverage = verify_proof_coverage(&large, &pairs, expected);
    coverage.print();
    Ok(coverage)
}

/// Input records and the variable they are bound to: the prepared input
/// when there is one, the invariants file otherwise.
fn group_data(layout: &Layout) -> Result<(PathBuf, String)> {
    if layout.tracking().exists() {
        let tracking = Tracking::from_file(layout.tracking())?;
        return Ok((PathBuf::from(tracking.input_file), tracking.input_var));
    }
    Ok((layout.invariants(), String::from(INVARIANTS_VAR)))
}

/// Has GAP re-check every proof's homomorphism, split over `workers`
/// processes. Writes `verify/verify_results.txt` in the format
/// `parse_verify_output` reads.
pub fn check_proofs(conf: &CensusConfig, proofs: Option<&Path>, workers: Option<usize>) -> Result<ProofCheck> {
    let layout = Layout::new(conf);
    create_dir_all(layout.verify_dir())?;
    create_dir_all(layout.dir().join("logs"))?;
    let proof_path = proofs.map(Path::to_path_buf).unwrap_or_else(|| layout.proofs());
    let (data_path, data_var) = group_data(&layout)?;
    let missing: Vec<String> = [&proof_path, &data_path]
        .into_iter()
        .filter(|p| !p.exists())
        .map(|p| p.display().to_string())
        .collect();
    if !missing.is_empty() {
        return Err(CensusError::Missing(format!("required files missing: {:}", missing.join(", "))));
    }
    let proof_text = read_text(&proof_path)?;
    let proof_var = list_var_re()
        .captures(&proof_text)
        .map(|c| c[1].to_string())
        .ok_or_else(|| {
            CensusError::Missing(format!("{:} does not bind a list variable", proof_path.display()))
        })?;
    let count = parse_proofs(&proof_text).len();
    if count == 0 {
        return Err(CensusError::Missing(format!("no proofs in {:}", proof_path.display())));
    }
    let num_workers = workers.unwrap_or(conf.num_workers).clamp(1, count);
    let env = conf.gap.environment;
    println!("Verifying {:} proofs from {:} with {:} workers", count, proof_path.display(), num_workers);

    let mut specs = Vec::with_capacity(num_workers);
    for id in 1..=num_workers {
        let result = layout.verify_result(id);
        if result.exists() {
            std::fs::remove_file(&result).map_err(|e| CensusError::io(&result, e))?;
        }
        let script = verify_proofs_script(&VerifyProofsParams {
            worker_id: id,
            num_workers,
            n: conf.n,
            data_file: gap_path(conf, env, &data_path)?,
            data_var: &data_var,
            proof_file: gap_path(conf, env, &proof_path)?,
            proof_var: &proof_var,
            result_file: gap_path(conf, env, &result)?,
        });
        write_text(layout.verify_script(id), &script)?;
        specs.push(WorkerSpec {
            name: format!("verify_{:}", id),
            script: layout.verify_script(id),
            environment: env,
            memory: conf.memory.clone(),
            result_file: Some(result),
            log_file: layout.dir().join("logs").join(format!("verify_worker_{:}.log", id)),
            require_marker: true,
        });
    }
    pool(conf).run_all(&specs)?;

    let mut check = ProofCheck {
        proofs: count,
        workers: num_workers,
        ..Default::default()
    };
    let mut failures = Vec::new();
    for id in 1..=num_workers {
        let result = layout.verify_result(id);
        let text = if result.exists() { read_text(&result)? } else { String::new() };
        if !has_complete_marker(&text) {
            log::warn!("WARNING: verify worker {:} did not complete", id);
            check.incomplete_workers.push(id);
        }
        check.outcome.absorb(parse_verify_output(&text));
        failures.extend(fail_lines(&text));
    }
    check.outcome.total = Some(count as u64);
    write_text(layout.verify_output(), &check.outcome.to_text(&failures))?;
    check.print();
    Ok(check)
}

/// Collects the proofs in `candidates` whose duplicate the master file does
/// not cover yet and writes them to the staging file.
pub fn stage_proofs(conf: &CensusConfig, master: Option<&Path>, candidates: &[PathBuf]) -> Result<Staging> {
    let layout = Layout::new(conf);
    let master = master.map(Path::to_path_buf).unwrap_or_else(|| layout.proofs());
    let master_text = read_text(&master)?;
    let mut texts = Vec::with_capacity(candidates.len());
    for path in candidates {
        if !path.exists() {
            log::warn!("WARNING: Missing file {:}", path.display());
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        texts.push((name, read_text(path)?));
    }
    let staging = extract_new_proofs(&master_text, &texts);
    println!("Master {:}: {:} proofs", master.display(), duplicates_of(&master_text).len());
    for (name, taken) in staging.per_source.iter() {
        println!("  {:}: {:} new", name, taken);
    }
    println!("  already in master: {:}", staging.already_in_master);
    println!("  repeated across candidates: {:}", staging.repeats);
    write_text(layout.staging(), &staging_text(&staging, &timestamp()))?;
    println!("Wrote {:} new proofs to {:}", staging.proofs.len(), layout.staging().display());
    Ok(staging)
}

/// Appends the staged proofs to the master file, leaving out every
/// duplicate the verification output reports as failed. Returns how many
/// were appended.
pub fn append_staged_proofs(conf: &CensusConfig, master: Option<&Path>, verify_output: Option<&Path>) -> Result<usize> {
    let layout = Layout::new(conf);
    let master = master.map(Path::to_path_buf).unwrap_or_else(|| layout.proofs());
    let staged = read_text(layout.staging())?;
    let failed = match verify_output {
        Some(path) => parse_verify_output(&read_text(path)?).failed_duplicates,
        None if layout.verify_output().exists() => {
            parse_verify_output(&read_text(layout.verify_output())?).failed_duplicates
        }
        None => {
            log::warn!("WARNING: no verification output, appending every staged proof");
            Vec::new()
        }
    };
    if !failed.is_empty() {
        println!("Skipping {:} failed proofs: {:?}", failed.len(), failed);
    }
    let (text, appended) = append_proofs(&read_text(&master)?, &staged, &failed, &timestamp())?;
    if appended > 0 {
        write_text(&master, &text)?;
    }
    println!("Appended {:} proofs to {:}", appended, master.display());
    Ok(appended)
}

/// Writes `s<n>_type_info.g`: the IdGroup types plus, for each large
/// representative, the cheapest invariants that tell it apart from the
/// other large types of its order.
pub fn fingerprints(conf: &CensusConfig, proofs: Option<&Path>) -> Result<TypeInfo> {
    let layout = Layout::new(conf);
    let (input, _) = group_data(&layout)?;
    let (_, records) = read_record_file(&input)?;
    let proof_path = proofs.map(Path::to_path_buf).unwrap_or_else(|| layout.proofs());
    let duplicates = if proof_path.exists() {
        duplicates_of(&read_text(&proof_path)?)
    } else {
        log::warn!("WARNING: Missing file {:}, no duplicates removed", proof_path.display());
        FxHashSet::default()
    };
    let info = TypeInfo::build(&records, &duplicates);
    println!("IdGroup types: {:}", info.idgroup_types.len());
    println!("Large types:   {:}", info.large.len());
    println!("Same-order pairs checked: {:}", info.same_order_pairs);
    if !info.undistinguished.is_empty() {
        println!(
            "WARNING: {:} pairs are not separated by any stored invariant",
            info.undistinguished.len()
        );
    }
    if let Some(expected) = conf.expected_isomorphism_types() {
        CountCheck::new("isomorphism types", expected, info.total() as u64).print();
    }
    let header = vec![
        format!("Isomorphism type fingerprints for S{:}", conf.n),
        format!("From {:} minus {:} proven duplicates", input.display(), duplicates.len()),
    ];
    write_text(layout.type_info(), &info.to_gap(&format!("S{:}_TYPE_INFO", conf.n), &header))?;
    println!("Wrote {:}", layout.type_info().display());
    Ok(info)
}

/// Representatives of a prepared and merged work directory, as records.
fn pass_representatives(dir: &Path, n: u32) -> Result<(String, Vec<SubgroupRecord>)> {
    let mut conf = CensusConfig::default();
    conf.n = n;
    conf.work_dir = dir.to_path_buf();
    let layout = Layout::new(&conf);
    let tracking = Tracking::from_file(layout.tracking())?;
    let reps: FxHashSet<u64> = representatives_of(&tracking, &layout)?.all.into_iter().collect();
    let (_, records) = read_record_file(Path::new(&tracking.input_file))?;
    let kept = records
        .into_iter()
        .filter(|r| r.index().map_or(false, |ix| reps.contains(&ix)))
        .collect();
    Ok((format!("{:} ({:})", dir.display(), tracking.method.gap_name()), kept))
}

/// Counts this work directory's representatives and `other`'s per sigKey
/// and reports where the two passes disagree.
pub fn compare_passes(conf: &CensusConfig, other: &Path) -> Result<SigKeyComparison> {
    let layout = Layout::new(conf);
    let (label_a, a) = pass_representatives(layout.dir(), conf.n)?;
    let (label_b, b) = pass_representatives(other, conf.n)?;
    let cmp = SigKeyComparison::new(&label_a, a.iter(), &label_b, b.iter());
    cmp.print();
    cmp.save(layout.dir().join(SIGKEY_COMPARISON_FILENAME))?;
    Ok(cmp)
}

/// Progress files of the dedup workers in `tracking.json`, or of the leaf
/// workers with `leaves` or when nothing has been prepared yet.
pub fn monitored_workers(conf: &CensusConfig, leaves: bool) -> Result<(Vec<WorkerFiles>, &'static str)> {
    let layout = Layout::new(conf);
    if !leaves && layout.tracking().exists() {
        let tracking = Tracking::from_file(layout.tracking())?;
        let files = tracking
            .workers
            .iter()
            .map(|w| WorkerFiles {
                name: w.worker.clone(),
                kind: WorkerKind::Dedup,
                progress: layout.checkpoint_file(&w.worker),
                result: layout.result_file(&w.worker),
                log: layout.worker_log(&w.worker),
                assigned: w.groups as u64,
            })
            .collect();
        return Ok((files, "groups"));
    }
    let mut files = Vec::new();
    for id in 1..=conf.num_workers {
        let batch = layout.leaf_batch(id);
        if !batch.exists() {
            continue;
        }
        files.push(WorkerFiles {
            name: format!("leaf_{:}", id),
            kind: WorkerKind::Leaf,
            progress: layout.leaf_result(id),
            result: layout.leaf_result(id),
            log: layout.leaf_log(id),
            assigned: recount(&batch)? as u64,
        });
    }
    Ok((files, "leaves"))
}

/// Prints worker progress every `monitor_interval_secs` until every worker
/// has finished, or once.
pub fn monitor(conf: &CensusConfig, once: bool, leaves: bool) -> Result<Snapshot> {
    let (files, unit) = monitored_workers(conf, leaves)?;
    if files.is_empty() {
        return Err(CensusError::Missing(String::from(
            "no workers to monitor: run prepare or leaves first",
        )));
    }
    let interval = Duration::from_secs(conf.monitor_interval_secs.max(1));
    let mut tracker = RateTracker::new(Instant::now());
    loop {
        let snap = Snapshot::take(&files);
        let rates = tracker.observe(snap.total(), snap.expected(), Instant::now());
        print_snapshot(&snap, unit, &rates, &timestamp());
        if once || snap.all_finished() {
            if snap.all_complete() {
                println!("All workers complete.");
            } else if snap.all_finished() {
                println!("All workers exited, some without a completion marker.");
            }
            return Ok(snap);
        }
        thread::sleep(interval);
    }
}

/// Writes the `[order, id]` of every IdGroup-identified input record to
/// `s<n>_idgroup_map.g` and counts its types together with any extra map
/// files. Compared against `tracking.json` when it has a count.
pub fn idgroups(conf: &CensusConfig, extra: &[PathBuf]) -> Result<IdGroupSummary> {
    let layout = Layout::new(conf);
    let tracking = if layout.tracking().exists() {
        Some(Tracking::from_file(layout.tracking())?)
    } else {
        None
    };
    let input = tracking
        .as_ref()
        .map(|t| PathBuf::from(&t.input_file))
        .unwrap_or_else(|| layout.invariants());
    let (_, records) = read_record_file(&input)?;
    let ids = idgroups_of_records(&records);
    let var = format!("S{:}_IDGROUP_MAP", conf.n);
    write_idgroup_map(&layout.idgroup_map(), &var, &ids, &input)?;
    println!("Wrote {:} IdGroup entries to {:}", ids.len(), layout.idgroup_map().display());

    let mut texts = vec![read_text(layout.idgroup_map())?];
    for path in extra.iter() {
        if path.exists() {
            texts.push(read_text(path)?);
        } else {
            log::warn!("WARNING: Missing file {:}", path.display());
        }
    }
    let summary = merge_idgroups(texts.iter().map(String::as_str));
    println!("IdGroup entries: {:}", summary.total);
    println!("Unique [order, id] types: {:}", summary.unique);
    if !summary.duplicate_indices.is_empty() {
        println!(
            "WARNING: {:} indices identified more than once",
            summary.duplicate_indices.len()
        );
    }
    if let Some(types) = tracking.and_then(|t| t.idgroup_types) {
        CountCheck::new("IdGroup types", types, summary.unique as u64).print();
    }
    Ok(summary)
}

fn write_idgroup_map(path: &Path, var: &str, ids: &[(u64, (u64, u64))], input: &Path) -> Result<()> {
    use std::fmt::Write as _;
    let mut out = String::new();
    let _ = writeln!(out, "# IdGroup of every identified record in {:}", input.display());
    let _ = writeln!(out, "# {:} entries", ids.len());
    let _ = writeln!(out, "{:} := [];", var);
    for (ix, (order, id)) in ids.iter() {
        let _ = writeln!(out, "{:}[{:}] := [ {:}, {:} ];", var, ix, order, id);
    }
    write_text(path, &out)
}

/// Writes `subgroups_summary.txt` from a `GROUPS_START` listing. Returns
/// the number of groups.
pub fn summary(conf: &CensusConfig, input: Option<&Path>) -> Result<usize> {
    let layout = Layout::new(conf);
    let path = input
        .map(Path::to_path_buf)
        .unwrap_or_else(|| layout.dir().join("gap_groups.txt"));
    let groups = if path.exists() {
        parse_summary_groups(&read_text(&path)?)
    } else {
        Vec::new()
    };
    if groups.is_empty() {
        println!("No groups found in {:}", path.display());
        return Ok(0);
    }
    let out = layout.dir().join("subgroups_summary.txt");
    write_text(&out, &summary_table(&groups, &timestamp()))?;
    println!("Summary written to: {:}", out.display());
    println!("Total groups: {:}", groups.len());
    Ok(groups.len())
}

fn breakdown_rows(tracking: &Tracking, result: &FinalResult) -> Vec<CategoryRow> {
    let mut rows = Vec::new();
    if let Some(types) = tracking.idgroup_types {
        rows.push(CategoryRow {
            category: String::from("IdGroup-compatible"),
            groups: tracking.idgroup_indices.len() as u64,
            types,
        });
    }
    let mut by_category: IndexMap<&'static str, (u64, u64)> = IndexMap::new();
    for w in tracking.workers.iter() {
        let label = match w.category {
            Category::DirectProduct => "Direct products",
            Category::TwoGroup => "2-groups",
            Category::Difficult => "Difficult",
            Category::Regular => "Regular",
        };
        let entry = by_category.entry(label).or_insert((0, 0));
        entry.0 += w.groups as u64;
        entry.1 += result.sources.get(&w.worker).copied().unwrap_or(0) as u64;
    }
    for (label, (groups, types)) in by_category {
        rows.push(CategoryRow {
            category: label.to_string(),
            groups,
            types,
        });
    }
    rows.push(CategoryRow {
        category: String::from("Singleton buckets"),
        groups: tracking.singletons.len() as u64,
        types: tracking.singletons.len() as u64,
    });
    let difficult_groups: usize = tracking.difficult.iter().map(|d| d.indices.len()).sum();
    if difficult_groups > 0 {
        rows.push(CategoryRow {
            category: String::from("Difficult buckets"),
            groups: difficult_groups as u64,
            types: tracking.difficult.len() as u64,
        });
    }
    rows
}

/// Builds the verification report from the merge result and, when given,
/// a JSON list of independent verification passes.
pub fn report(conf: &CensusConfig, passes: Option<&Path>) -> Result<VerificationReport> {
    let layout = Layout::new(conf);
    let result = FinalResult::from_file(layout.final_result())?;
    let tracking = Tracking::from_file(layout.tracking())?;
    let passes: Vec<VerificationPass> = match passes {
        Some(path) => serde_json::from_str(&read_text(path)?)?,
        None => vec![VerificationPass {
            name: String::from("Census merge"),
            detail: format!(
                "{:} representatives from {:} groups",
                result.representatives, result.input_groups
            ),
            total: Some(result.total),
            passed: result.is_ok(),
        }],
    };
    let (sequence, description, table) = if tracking.method == DedupMethod::Conjugacy {
        ("A000638", "conjugacy classes of subgroups", A000638)
    } else {
        ("A174511", "isomorphism types of subgroups", A174511)
    };
    let report = VerificationReport {
        sequence: sequence.to_string(),
        description: format!("Number of {:} of S_{:}.", description, conf.n),
        n: conf.n,
        value: result.total,
        generated: timestamp(),
        known: table.iter().copied().filter(|(k, _)| *k < conf.n).collect(),
        breakdown: breakdown_rows(&tracking, &result),
        passes,
    };
    report.save(layout.dir(), "verification_report")?;
    println!(
        "{:}({:}) = {:}: {:}",
        sequence,
        conf.n,
        result.total,
        if report.all_passed() { "ALL PASSES AGREE" } else { "PASSES DISAGREE" }
    );
    Ok(report)
}

/// Runs the GAP regression suite, or with `validate` the pre-flight check of
/// a prepared directory. Returns overall success.
pub fn selftest(conf: &CensusConfig, opts: SelftestOptions, validate: Option<&Path>) -> Result<bool> {
    if let Some(dir) = validate {
        let layout = Layout::new(conf);
        let input = layout
            .invariants()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(validate_work_dir(dir, &[input.as_str()])?.overall);
    }
    let tests_dir = conf.work_dir.join("tests");
    create_dir_all(&tests_dir)?;
    let suite = TestSuite::standard(&tests_dir, conf.gap.environment);
    let selected = opts.selected(&suite);
    for test in selected.iter() {
        test.write(|env, path| gap_path(conf, env, path))?;
    }
    println!("Running {:} GAP test scripts from {:}", selected.len(), tests_dir.display());
    let results = run_suite(&conf.gap, &selected, &conf.memory, &tests_dir)?;
    results.print();
    Ok(results.ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proofs::STAGING_VAR;
    use crate::selftest::check_worker_script;

    const INVARIANTS: &str = "# test data
CENSUS_INVARIANTS := [
rec( index := 1, order := 6, gens := [ [ 2, 1, 3, 4 ], [ 2, 3, 1, 4 ] ], sigKey := [ 6, 3, 3, 2, [ 2 ] ], histogram := [ 1 ], isDirectProduct := false, idGroup := [ 6, 1 ] ),
rec( index := 2, order := 6, gens := [ [ 1, 3, 2, 4 ], [ 1, 3, 4, 2 ] ], sigKey := [ 6, 3, 3, 2, [ 2 ] ], histogram := [ 1 ], isDirectProduct := false, idGroup := [ 6, 1 ] ),
rec( index := 3, order := 2, gens := [ [ 2, 1, 3, 4 ] ], sigKey := [ 2, 1, 2, 1, [ 2 ] ], histogram := [ 2 ], isDirectProduct := false, idGroup := [ 2, 1 ] ),
rec( index := 4, order := 4, gens := [ [ 2, 1, 3, 4 ], [ 1, 2, 4, 3 ] ], sigKey := [ 4, 1, 4, 1, [ 2, 2 ] ], histogram := [ 3 ], isDirectProduct := true ),
rec( index := 5, order := 4, gens := [ [ 2, 1, 4, 3 ], [ 3, 4, 1, 2 ] ], sigKey := [ 4, 1, 4, 1, [ 2, 2 ] ], histogram := [ 3 ], isDirectProduct := true ),
rec( index := 6, order := 24, gens := [ [ 2, 1, 3, 4 ], [ 2, 3, 4, 1 ] ], sigKey := [ 24, 12, 5, 3, [ 2 ] ], histogram := [ 4 ], isDirectProduct := false )
];
# Complete: 6 records
";

    fn scratch_conf() -> CensusConfig {
        let dir = std::env::temp_dir().join(format!("census_pipeline_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut conf = CensusConfig::default();
        conf.n = 4;
        conf.work_dir = dir;
        conf.num_workers = 2;
        conf.gap.environment = GapEnvironment::Native;
        let layout = Layout::new(&conf);
        std::fs::write(layout.invariants(), INVARIANTS).unwrap();
        conf
    }

    fn conjugacy() -> PrepareOptions {
        PrepareOptions {
            input: None,
            method: DedupMethod::Conjugacy,
            cost: CostModel::Linear,
        }
    }

    #[test]
    fn prepare_conjugacy_assigns_every_index() {
        let conf = scratch_conf();
        let layout = Layout::new(&conf);
        let tracking = prepare(&conf, &conjugacy()).unwrap();
        assert_eq!(tracking.input_var, INVARIANTS_VAR);
        assert_eq!(tracking.singletons, vec![3, 6]);
        let names: Vec<&str> = tracking.workers.iter().map(|w| w.worker.as_str()).collect();
        assert_eq!(names, vec!["regular_1", "regular_2"]);
        assert_eq!(tracking.workers[0].indices, vec![1, 2]);
        assert_eq!(tracking.workers[1].indices, vec![4, 5]);
        assert!(tracking.coverage.complete);
        for name in names {
            assert!(layout.bucket_file(name).exists());
            let script = read_text(layout.worker_script(name)).unwrap();
            assert!(check_worker_script(&script).is_empty());
            assert!(script.contains(&result_var(name)));
        }
        assert_eq!(Tracking::from_file(layout.tracking()).unwrap(), tracking);
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn prepare_isomorphism_splits_idgroups() {
        let conf = scratch_conf();
        let opts = PrepareOptions {
            method: DedupMethod::Isomorphism,
            ..conjugacy()
        };
        let tracking = prepare(&conf, &opts).unwrap();
        assert_eq!(tracking.idgroup_indices, vec![1, 2, 3]);
        assert_eq!(tracking.idgroup_types, Some(2));
        assert_eq!(tracking.singletons, vec![6]);
        assert_eq!(tracking.workers.len(), 1);
        assert_eq!(tracking.workers[0].worker, "dp");
        assert_eq!(tracking.workers[0].category, Category::DirectProduct);
        assert!(tracking.coverage.complete);
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn isomorphic_embeddings_share_a_bucket() {
        let conf = scratch_conf();
        let text = "X := [
rec( index := 1, order := 2, gens := [ [ 2, 1, 3, 4 ] ], sigKey := [ 2, 1, 2, 1, [ 2 ] ], histogram := [ [ [ 1, 4 ], 1 ], [ [ 2, 2 ], 1 ] ], isDirectProduct := false ),
rec( index := 2, order := 2, gens := [ [ 2, 1, 4, 3 ] ], sigKey := [ 2, 1, 2, 1, [ 2 ] ], histogram := [ [ [ 1, 4 ], 1 ], [ [ 2, 0 ], 1 ] ], isDirectProduct := false )
];
";
        let records: Vec<SubgroupRecord> =
            rec_blocks(text).into_iter().map(|b| SubgroupRecord::parse(b).unwrap()).collect();
        let iso = categorize(&conf, &records, DedupMethod::Isomorphism);
        assert!(iso.cats.singletons.is_empty());
        assert_eq!(iso.cats.regular.len(), 1);
        assert_eq!(iso.cats.regular[0].indices, vec![1, 2]);
        // conjugacy still tells the embeddings apart
        let conj = categorize(&conf, &records, DedupMethod::Conjugacy);
        assert_eq!(conj.cats.singletons.len(), 2);
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn reprepare_discards_old_dedup_state() {
        let conf = scratch_conf();
        let layout = Layout::new(&conf);
        prepare(&conf, &conjugacy()).unwrap();
        std::fs::write(layout.checkpoint_file("regular_1"), "# Bucket 1: 7 -> 1 reps: [ 999 ]\n").unwrap();
        std::fs::write(layout.result_file("regular_1"), "RESULT_REPS_REGULAR_1 := [ 999 ];\n# Complete: 1 reps\n").unwrap();
        std::fs::write(layout.worker_script("old"), "QUIT;\n").unwrap();
        std::fs::write(layout.leaf_result(1), "# Leaf complete: a (1 subgroups in 0s)\n").unwrap();

        prepare(&conf, &conjugacy()).unwrap();
        assert!(!layout.checkpoint_file("regular_1").exists());
        assert!(!layout.result_file("regular_1").exists());
        assert!(!layout.worker_script("old").exists());
        assert!(layout.worker_script("regular_1").exists());
        assert!(layout.bucket_file("regular_1").exists());
        assert!(layout.leaf_result(1).exists());
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn mismatched_checkpoints_are_not_replayed() {
        let conf = scratch_conf();
        let layout = Layout::new(&conf);
        let tracking = prepare(&conf, &conjugacy()).unwrap();
        // regular_1 holds the single bucket [ 1, 2 ]
        std::fs::write(
            layout.checkpoint_file("regular_1"),
            "# Bucket 1: 7 -> 1 reps: [ 999 ]\n# Bucket 1: 2 -> 1 reps: [ 1 ]\n",
        )
        .unwrap();
        let resume = resume_buckets(&layout, "regular_1").unwrap();
        assert_eq!(resume.len(), 1);
        assert_eq!(resume[0].reps, vec![1]);
        let script = worker_script(&conf, &layout, &tracking, &tracking.workers[0], &resume).unwrap();
        assert!(script.contains("DONE_BUCKETS[1] := [ 1 ];;"));
        assert!(!script.contains("999"));
        assert!(resume_buckets(&layout, "regular_2").unwrap().is_empty());
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn unfinished_leaf_is_dropped_before_resume() {
        let conf = scratch_conf();
        let layout = Layout::new(&conf);
        layout.create_dirs().unwrap();
        let result = layout.leaf_result(1);
        std::fs::write(
            &result,
            "maxsub_results := [\n  rec(gens := [ ], inv := [ 1 ], source := \"a\")\n# Leaf complete: a (1 subgroups in 0s)\n,\n  rec(gens := [ [ 2, 1 ] ], inv := [ 2 ], source := \"b\")",
        )
        .unwrap();
        let done = resume_leaves(1, &result).unwrap();
        assert_eq!(done.len(), 1);
        assert!(done.contains("a"));
        let text = read_text(&result).unwrap();
        assert!(!text.contains("source := \"b\""));
        assert!(text.ends_with("(1 subgroups in 0s)\n"));

        // finished files are left as they are
        let finished = "maxsub_results := [\n# Leaf complete: a (0 subgroups in 0s)\n];\n# Complete: 0 subgroups\n";
        std::fs::write(&result, finished).unwrap();
        resume_leaves(1, &result).unwrap();
        assert_eq!(read_text(&result).unwrap(), finished);
        assert!(resume_leaves(2, &layout.leaf_result(2)).unwrap().is_empty());
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn worker_selection() {
        let conf = scratch_conf();
        let mut tracking = prepare(&conf, &conjugacy()).unwrap();
        tracking.workers[1].environment = GapEnvironment::Wsl;
        let wsl = LaunchOptions { wsl_only: true, ..Default::default() };
        assert_eq!(select_workers(&tracking, &wsl).len(), 1);
        let cyg = LaunchOptions { cygwin_only: true, ..Default::default() };
        assert_eq!(select_workers(&tracking, &cyg)[0].worker, "regular_1");
        let only = LaunchOptions { only: Some(String::from("regular_2")), ..Default::default() };
        assert_eq!(select_workers(&tracking, &only)[0].worker, "regular_2");
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn merge_and_breakdown_from_worker_results() {
        let mut conf = scratch_conf();
        conf.expected_total = Some(5);
        let layout = Layout::new(&conf);
        prepare(&conf, &conjugacy()).unwrap();
        std::fs::write(
            layout.result_file("regular_1"),
            "RESULT_REPS_REGULAR_1 := [ 1 ];\n# Complete: 1 reps\n",
        )
        .unwrap();
        std::fs::write(
            layout.result_file("regular_2"),
            "RESULT_REPS_REGULAR_2 := [ 4, 5 ];\n# Complete: 2 reps\n",
        )
        .unwrap();
        let result = merge(&conf).unwrap();
        assert_eq!(result.total, 5);
        assert!(result.is_ok());
        assert_eq!(result.sources["regular_2"], 2);
        assert_eq!(result.sources["singletons"], 2);
        let gens = read_text(layout.representatives()).unwrap();
        assert_eq!(gens.matches("[ [").count(), 5);

        let b = breakdown(&conf).unwrap();
        assert_eq!(b.total_reps, 5);
        assert_eq!(b.total_non_reps, 1);
        assert!(b.empty_buckets().is_empty());

        let report = report(&conf, None).unwrap();
        assert_eq!(report.sequence, "A000638");
        assert!(report.all_passed());
        assert!(layout.dir().join("verification_report.md").exists());
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn merge_flags_missing_worker() {
        let mut conf = scratch_conf();
        conf.expected_total = Some(5);
        let layout = Layout::new(&conf);
        prepare(&conf, &conjugacy()).unwrap();
        std::fs::write(layout.result_file("regular_1"), "RESULT_REPS_REGULAR_1 := [ 2 ];\n").unwrap();
        let result = merge(&conf).unwrap();
        assert_eq!(result.missing_workers, vec![String::from("regular_2")]);
        assert_eq!(result.total, 3);
        assert!(!result.is_ok());
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn iso_map_and_proofs() {
        let conf = scratch_conf();
        let layout = Layout::new(&conf);
        prepare(&conf, &conjugacy()).unwrap();
        std::fs::write(
            layout.proofs(),
            "PROOFS := [ rec( duplicate := 2, representative := 1 ), rec( duplicate := 5, representative := 4 ) ];\n",
        )
        .unwrap();
        let report = iso_map(&conf, None).unwrap();
        assert!(report.is_ok());
        assert!(read_text(layout.iso_map()).unwrap().contains("(\"5\") := 4"));
        let coverage = verify_proofs(&conf, None).unwrap();
        assert_eq!(coverage.large, 6);
        assert_eq!(coverage.proven_duplicates, 2);
        assert!(coverage.passed());
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn staged_proofs_skip_failed_duplicates() {
        let conf = scratch_conf();
        let layout = Layout::new(&conf);
        std::fs::write(
            layout.proofs(),
            "PROOFS := [\nrec( duplicate := 2, representative := 1 )\n];;\n",
        )
        .unwrap();
        let first = layout.dir().join("proofs_a.g");
        let second = layout.dir().join("proofs_b.g");
        std::fs::write(
            &first,
            "P := [ rec( duplicate := 5, representative := 4 ), rec( duplicate := 2, representative := 1 ) ];",
        )
        .unwrap();
        std::fs::write(&second, "Q := [ rec( duplicate := 5, representative := 4 ) ];").unwrap();
        let staging = stage_proofs(&conf, None, &[first, second, layout.dir().join("absent.g")]).unwrap();
        assert_eq!(staging.proofs.len(), 1);
        assert_eq!(staging.already_in_master, 1);
        assert_eq!(staging.repeats, 1);
        assert!(read_text(layout.staging()).unwrap().contains(STAGING_VAR));

        create_dir_all(layout.verify_dir()).unwrap();
        std::fs::write(
            layout.verify_output(),
            "Passed: 0\nFailed: 1\nFAIL proof 1 (dup=5): orders differ\n",
        )
        .unwrap();
        assert_eq!(append_staged_proofs(&conf, None, None).unwrap(), 0);
        assert_eq!(duplicates_of(&read_text(layout.proofs()).unwrap()).len(), 1);

        std::fs::remove_file(layout.verify_output()).unwrap();
        assert_eq!(append_staged_proofs(&conf, None, None).unwrap(), 1);
        let master = read_text(layout.proofs()).unwrap();
        assert!(master.contains("# --- New proofs appended"));
        let dups = duplicates_of(&master);
        assert!(dups.contains(&2) && dups.contains(&5));
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn proof_check_needs_its_inputs() {
        let conf = scratch_conf();
        let err = check_proofs(&conf, None, Some(2)).unwrap_err();
        assert!(matches!(err, CensusError::Missing(ref m) if m.contains("proofs.g")));
        let layout = Layout::new(&conf);
        std::fs::write(layout.proofs(), "PROOFS := [ ];;\n").unwrap();
        let err = check_proofs(&conf, None, Some(2)).unwrap_err();
        assert!(matches!(err, CensusError::Missing(ref m) if m.contains("no proofs")));
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn fingerprints_drop_proven_duplicates() {
        let conf = scratch_conf();
        let layout = Layout::new(&conf);
        let info = fingerprints(&conf, None).unwrap();
        assert_eq!(info.idgroup_types, vec![(2, 1), (6, 1)]);
        assert_eq!(info.large.len(), 3);
        assert_eq!(info.undistinguished, vec![(4, 5)]);

        std::fs::write(
            layout.proofs(),
            "PROOFS := [ rec( duplicate := 5, representative := 4 ) ];;\n",
        )
        .unwrap();
        let info = fingerprints(&conf, None).unwrap();
        let reps: Vec<u64> = info.large.iter().map(|e| e.invariants.index).collect();
        assert_eq!(reps, vec![4, 6]);
        assert_eq!(info.total(), 4);
        assert!(info.undistinguished.is_empty());
        let text = read_text(layout.type_info()).unwrap();
        assert!(text.contains("S4_TYPE_INFO := ["));
        assert!(text.contains("representative := 6, order := 24"));
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn passes_compared_per_sigkey() {
        let conf = scratch_conf();
        let other = scratch_conf();
        for (c, second) in [(&conf, "[ 4, 5 ]"), (&other, "[ 4 ]")] {
            let layout = Layout::new(c);
            prepare(c, &conjugacy()).unwrap();
            std::fs::write(
                layout.result_file("regular_1"),
                "RESULT_REPS_REGULAR_1 := [ 1 ];\n# Complete: 1 reps\n",
            )
            .unwrap();
            std::fs::write(
                layout.result_file("regular_2"),
                format!("RESULT_REPS_REGULAR_2 := {:};\n# Complete: reps\n", second),
            )
            .unwrap();
        }
        let cmp = compare_passes(&conf, &other.work_dir).unwrap();
        assert_eq!(cmp.total_a, 5);
        assert_eq!(cmp.total_b, 4);
        assert_eq!(cmp.discrepancies.len(), 1);
        assert_eq!(cmp.discrepancies[0].key, "[ 4, 1, 4, [ 2, 2 ] ]");
        assert_eq!(cmp.net_difference(), -1);
        assert!(!cmp.agrees());
        assert!(conf.work_dir.join(SIGKEY_COMPARISON_FILENAME).exists());
        std::fs::remove_dir_all(conf.work_dir).unwrap();
        std::fs::remove_dir_all(other.work_dir).unwrap();
    }

    #[test]
    fn idgroups_against_tracking() {
        let conf = scratch_conf();
        let layout = Layout::new(&conf);
        let opts = PrepareOptions {
            method: DedupMethod::Isomorphism,
            ..conjugacy()
        };
        prepare(&conf, &opts).unwrap();
        let extra = layout.dir().join("more_ids.g");
        std::fs::write(&extra, "M[7] := [ 2, 1 ];\nM[7] := [ 2, 1 ];\n").unwrap();
        let summary = idgroups(&conf, &[extra, layout.dir().join("absent.g")]).unwrap();
        let map = read_text(layout.idgroup_map()).unwrap();
        assert!(map.contains("S4_IDGROUP_MAP[1] := [ 6, 1 ];"));
        assert!(map.contains("S4_IDGROUP_MAP[3] := [ 2, 1 ];"));
        assert_eq!(summary.total, 5);
        assert_eq!(summary.unique, 2);
        assert_eq!(summary.duplicate_indices, vec![7]);
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn monitor_reads_tracked_workers() {
        let conf = scratch_conf();
        let layout = Layout::new(&conf);
        prepare(&conf, &conjugacy()).unwrap();
        std::fs::write(layout.checkpoint_file("regular_1"), "# Bucket 1: 2 -> 1 reps: [ 1 ]\n").unwrap();
        std::fs::write(layout.result_file("regular_1"), "RESULT_REPS_REGULAR_1 := [ 1 ];\n# Complete: 1 reps\n").unwrap();
        let snap = monitor(&conf, true, false).unwrap();
        let names: Vec<&str> = snap.workers.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["regular_1", "regular_2"]);
        assert!(snap.workers[0].complete);
        assert_eq!(snap.workers[0].reps, 1);
        assert_eq!(snap.total(), 2);
        assert_eq!(snap.expected(), 4);

        // leaf mode looks at batches instead
        assert!(monitor(&conf, true, true).is_err());
        std::fs::write(
            layout.leaf_batch(2),
            "leaf_batch := [\nrec( label := \"a\", order := 2, genImages := [ [ 2, 1 ] ] ),\nrec( label := \"b\", order := 2, genImages := [ [ 2, 1 ] ] )\n];\n",
        )
        .unwrap();
        let (files, unit) = monitored_workers(&conf, true).unwrap();
        assert_eq!(unit, "leaves");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "leaf_2");
        assert_eq!(files[0].assigned, 2);
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }

    #[test]
    fn combine_leaf_results() {
        let conf = scratch_conf();
        let layout = Layout::new(&conf);
        layout.create_dirs().unwrap();
        std::fs::write(
            layout.leaf_result(1),
            "maxsub_results := [\n  rec(gens := [ [ 2, 1 ] ], inv := [ 2 ], source := \"a\"),\n  rec(gens := [ [ 1, 2 ] ], inv := [ 1 ], source := \"a\")\n# Leaf complete: a (2 subgroups in 0s)\n];\n# Complete: 2 subgroups from 1 leaves\n",
        )
        .unwrap();
        // second worker still running
        std::fs::write(
            layout.leaf_result(2),
            "maxsub_results := [\n  rec(gens := [ [ 2, 1 ] ], inv := [ 2 ], source := \"b\")",
        )
        .unwrap();
        assert!(combine(&conf).unwrap());
        let (var, records) = read_record_file(&layout.candidates()).unwrap();
        assert_eq!(var, CANDIDATES_VAR);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].index(), Some(3));
        std::fs::remove_dir_all(conf.work_dir).unwrap();
    }
}
