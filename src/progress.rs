//! Read-only progress snapshots of running workers, computed from the
//! checkpoint, result and log files they are writing.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{bucket_checkpoints, completed_leaves, has_complete_marker};
use crate::clock::human_duration;
use crate::error::read_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// Progress is counted in groups, from `# Bucket` checkpoint lines.
    Dedup,
    /// Progress is counted in leaves, from `# Leaf complete:` lines.
    Leaf,
}

/// The files one worker writes while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFiles {
    pub name: String,
    pub kind: WorkerKind,
    /// Checkpoint file of a dedup worker, result file of a leaf worker.
    pub progress: PathBuf,
    /// Gets the `# Complete:` line when the worker finishes.
    pub result: PathBuf,
    /// Launcher log, ends with `# Exit code:`.
    pub log: PathBuf,
    /// Groups (dedup) or leaves (leaf) assigned to the worker.
    pub assigned: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProgress {
    pub name: String,
    pub assigned: u64,
    /// Groups or leaves finished so far.
    pub done: u64,
    /// Buckets checkpointed, or subgroup records written by a leaf worker.
    pub units: u64,
    pub reps: u64,
    pub complete: bool,
    pub exit_code: Option<i32>,
    pub last_line: String,
}

impl WorkerProgress {
    fn status(&self) -> String {
        match (self.complete, self.exit_code) {
            (true, Some(0)) | (true, None) => String::from(" DONE"),
            (_, Some(c)) => format!(" EXITED ({:})", c),
            (false, None) if !self.last_line.is_empty() => {
                let mut line = self.last_line.clone();
                line.truncate(60);
                format!("  {:}", line)
            }
            (false, None) => String::new(),
        }
    }
}

fn exit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^# Exit code: (-?\d+)").expect("static regex"))
}

fn read_or_empty(path: &Path) -> String {
    if !path.exists() {
        return String::new();
    }
    read_text(path).unwrap_or_else(|e| {
        log::warn!("could not read {:}: {:}", path.display(), e);
        String::new()
    })
}

pub fn count_rec_lines(text: &str) -> u64 {
    text.lines().filter(|l| l.trim_start().starts_with("rec(")).count() as u64
}

/// Exit code from the launcher's log footer. `None` while running or when
/// the process was killed.
pub fn exit_code(log: &str) -> Option<i32> {
    exit_re()
        .captures_iter(log)
        .last()
        .and_then(|c| c[1].parse().ok())
}

/// Last non-empty, non-comment line of a log.
pub fn last_line(log: &str) -> String {
    log.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .unwrap_or_default()
        .to_string()
}

pub fn read_worker(files: &WorkerFiles) -> WorkerProgress {
    let progress = read_or_empty(&files.progress);
    let log = read_or_empty(&files.log);
    let complete = has_complete_marker(&read_or_empty(&files.result));
    let (done, units, reps) = match files.kind {
        WorkerKind::Dedup => {
            let cps = bucket_checkpoints(&progress);
            let done = cps.iter().map(|cp| cp.size as u64).sum();
            let reps = cps.iter().map(|cp| cp.num_reps as u64).sum();
            (done, cps.len() as u64, reps)
        }
        WorkerKind::Leaf => {
            let leaves = completed_leaves(&progress).len() as u64;
            (leaves, count_rec_lines(&progress), 0)
        }
    };
    WorkerProgress {
        name: files.name.clone(),
        assigned: files.assigned,
        done: if complete { files.assigned.max(done) } else { done },
        units,
        reps,
        complete,
        exit_code: exit_code(&log),
        last_line: last_line(&log),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub workers: Vec<WorkerProgress>,
}

impl Snapshot {
    pub fn take(workers: &[WorkerFiles]) -> Self {
        Snapshot {
            workers: workers.iter().map(read_worker).collect(),
        }
    }

    pub fn total(&self) -> u64 {
        self.workers.iter().map(|w| w.done).sum()
    }

    pub fn expected(&self) -> u64 {
        self.workers.iter().map(|w| w.assigned).sum()
    }

    /// Every worker either wrote its completion marker or exited.
    pub fn all_finished(&self) -> bool {
        !self.workers.is_empty() && self.workers.iter().all(|w| w.complete || w.exit_code.is_some())
    }

    pub fn all_complete(&self) -> bool {
        !self.workers.is_empty() && self.workers.iter().all(|w| w.complete)
    }

    pub fn percent(&self) -> f64 {
        let expected = self.expected();
        if expected == 0 {
            0.0
        } else {
            self.total() as f64 / expected as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateEstimate {
    /// Units per second since the previous observation, when known.
    pub interval: Option<f64>,
    pub average: Option<f64>,
    pub eta: Option<Duration>,
}

/// Turns successive totals into rates and an ETA.
#[derive(Debug, Clone)]
pub struct RateTracker {
    start: Instant,
    first: Option<u64>,
    prev: Option<(u64, Instant)>,
}

impl RateTracker {
    pub fn new(start: Instant) -> Self {
        RateTracker {
            start,
            first: None,
            prev: None,
        }
    }

    /// Rates count only what was done after the first observation, so work
    /// replayed from checkpoints does not inflate them.
    pub fn observe(&mut self, total: u64, expected: u64, now: Instant) -> RateEstimate {
        let base = *self.first.get_or_insert(total);
        let interval = self.prev.and_then(|(prev_total, prev_time)| {
            let secs = now.duration_since(prev_time).as_secs_f64();
            if secs > 0.0 {
                Some(total.saturating_sub(prev_total) as f64 / secs)
            } else {
                None
            }
        });
        let gained = total.saturating_sub(base);
        let elapsed = now.duration_since(self.start).as_secs_f64();
        let average = if gained > 0 && elapsed > 0.0 {
            Some(gained as f64 / elapsed)
        } else {
            None
        };
        let eta = average.filter(|a| *a > 0.0).map(|a| {
            Duration::from_secs_f64(expected.saturating_sub(total) as f64 / a)
        });
        self.prev = Some((total, now));
        RateEstimate {
            interval,
            average,
            eta,
        }
    }
}

pub fn print_snapshot(snap: &Snapshot, unit: &str, rates: &RateEstimate, stamp: &str) {
    let bar = "=".repeat(65);
    let reps: u64 = snap.workers.iter().map(|w| w.reps).sum();
    let complete = snap.workers.iter().filter(|w| w.complete).count();
    println!("Census monitor {:}", stamp);
    println!("{:}", bar);
    println!(
        "Progress: {:>9} / {:} {:}  ({:5.1}%)",
        snap.total(),
        snap.expected(),
        unit,
        snap.percent()
    );
    println!(
        "Workers complete: {:} / {:}   Representatives so far: {:}",
        complete,
        snap.workers.len(),
        reps
    );
    if let (Some(interval), Some(avg)) = (rates.interval, rates.average) {
        println!(
            "Rate: {:.1} {:}/sec (interval)   {:.1} {:}/sec (avg)",
            interval, unit, avg, unit
        );
    }
    match rates.eta {
        Some(eta) => println!("ETA {:}", human_duration(eta)),
        None => println!("ETA calculating..."),
    }
    println!("{:}", bar);
    for w in snap.workers.iter() {
        println!(
            "  {:<12} {:>7} / {:<7} ({:>5} done, {:>6} reps){:}",
            w.name,
            w.done,
            w.assigned,
            w.units,
            w.reps,
            w.status()
        );
    }
    println!("{:}", bar);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("census_progress_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn dedup_files(dir: &Path, name: &str, assigned: u64) -> WorkerFiles {
        WorkerFiles {
            name: name.to_string(),
            kind: WorkerKind::Dedup,
            progress: dir.join(format!("checkpoint_{:}.g", name)),
            result: dir.join(format!("result_{:}.g", name)),
            log: dir.join(format!("worker_{:}.log", name)),
            assigned,
        }
    }

    #[test]
    fn log_footer() {
        let log = "# w\n# Started: x\n\nBucket 3/9: 4 groups\n  Bucket 3 complete\n\n# Finished: y\n# Exit code: 1\n";
        assert_eq!(exit_code(log), Some(1));
        assert_eq!(last_line(log), "Bucket 3 complete");
        assert_eq!(exit_code("# Exit code: none (killed)\n"), None);
        assert_eq!(last_line(""), "");
    }

    #[test]
    fn dedup_workers_from_checkpoints() {
        let dir = scratch_dir();
        let running = dedup_files(&dir, "regular_1", 10);
        std::fs::write(
            &running.progress,
            "# Worker regular_1 checkpoint file\n\n# Bucket 1: 4 -> 2 reps: [ 1, 3 ]\n# Bucket 2: 3 -> 1 reps: [ 7 ]\n",
        )
        .unwrap();
        std::fs::write(&running.log, "# regular_1\n\nBucket 3/3: 3 groups\n").unwrap();
        let done = dedup_files(&dir, "regular_2", 5);
        std::fs::write(&done.result, "RESULT_REPS_REGULAR_2 := [ 2 ];\n# Complete: 1 reps\n").unwrap();
        std::fs::write(&done.log, "=== COMPLETE ===\n# Exit code: 0\n").unwrap();
        let missing = dedup_files(&dir, "dp", 2);

        let snap = Snapshot::take(&[running, done, missing]);
        assert_eq!(snap.workers[0].done, 7);
        assert_eq!(snap.workers[0].units, 2);
        assert_eq!(snap.workers[0].reps, 3);
        assert_eq!(snap.workers[0].last_line, "Bucket 3/3: 3 groups");
        assert!(!snap.workers[0].complete);
        assert!(snap.workers[1].complete);
        assert_eq!(snap.workers[1].done, 5);
        assert_eq!(snap.workers[1].exit_code, Some(0));
        assert_eq!(snap.workers[2], WorkerProgress {
            name: String::from("dp"),
            assigned: 2,
            ..Default::default()
        });
        assert_eq!(snap.total(), 12);
        assert_eq!(snap.expected(), 17);
        assert!(!snap.all_finished());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn leaf_workers_from_results() {
        let dir = scratch_dir();
        let files = WorkerFiles {
            name: String::from("leaf_1"),
            kind: WorkerKind::Leaf,
            progress: dir.join("leaf_result_1.g"),
            result: dir.join("leaf_result_1.g"),
            log: dir.join("leaf_worker_1.log"),
            assigned: 4,
        };
        std::fs::write(
            &files.progress,
            "maxsub_results := [\n  rec(gens := [ ], source := \"a\")\n# Leaf complete: a (1 subgroups in 0s)\n,\n  rec(gens := [ ], source := \"b\")",
        )
        .unwrap();
        std::fs::write(&files.log, "# leaf\n# Exit code: 137\n").unwrap();
        let snap = Snapshot::take(&[files]);
        assert_eq!(snap.workers[0].done, 1);
        assert_eq!(snap.workers[0].units, 2);
        assert_eq!(snap.workers[0].exit_code, Some(137));
        assert!(snap.all_finished());
        assert!(!snap.all_complete());
        assert!((snap.percent() - 25.0).abs() < 1e-9);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn rates_and_eta() {
        let start = Instant::now();
        let mut tracker = RateTracker::new(start);
        // 100 groups were replayed from checkpoints before monitoring began
        let first = tracker.observe(100, 1000, start);
        assert_eq!(first.interval, None);
        assert_eq!(first.average, None);
        let second = tracker.observe(300, 1000, start + Duration::from_secs(10));
        assert_eq!(second.interval, Some(20.0));
        assert_eq!(second.average, Some(20.0));
        assert_eq!(second.eta, Some(Duration::from_secs(35)));
    }
}
