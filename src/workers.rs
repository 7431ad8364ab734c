//! Running a set of GAP workers in parallel with resume and a status
//! monitor.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::{self, ResumeState};
use crate::clock::timestamp;
use crate::config::GapSettings;
use crate::error::{read_text, write_text, CensusError, Result};
use crate::gap::{tail_lines, Echo, GapEnvironment, GapInvocation, Launcher};

pub const LAUNCH_SUMMARY_FILENAME: &str = "launch_summary.json";
const FAILURE_TAIL: usize = 10;

/// One GAP process to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub name: String,
    pub script: PathBuf,
    pub environment: GapEnvironment,
    pub memory: String,
    /// File that carries the `# Complete:` marker when the worker is done.
    pub result_file: Option<PathBuf>,
    pub log_file: PathBuf,
    /// Success needs the marker in `result_file`, not just exit code 0.
    pub require_marker: bool,
}

/// Turns a `WorkerSpec` into the process to start.
pub trait WorkerCommand: Sync {
    fn command(&self, spec: &WorkerSpec) -> Command;

    /// Extra command to run after killing the worker.
    fn cleanup(&self, _spec: &WorkerSpec) -> Vec<String> {
        Vec::new()
    }
}

impl WorkerCommand for GapSettings {
    fn command(&self, spec: &WorkerSpec) -> Command {
        GapInvocation::new(self, spec.environment, &spec.memory).command(&spec.script)
    }

    fn cleanup(&self, spec: &WorkerSpec) -> Vec<String> {
        GapInvocation::new(self, spec.environment, &spec.memory).cleanup_argv(&spec.script)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Pending,
    Running,
    Success,
    /// Already complete from an earlier run.
    Skipped,
    Failed,
    Error,
}

impl WorkerStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, WorkerStatus::Success | WorkerStatus::Skipped)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            WorkerStatus::Success => "[OK]",
            WorkerStatus::Skipped => "[SKIP]",
            WorkerStatus::Failed => "[FAIL]",
            WorkerStatus::Error => "[ERR]",
            WorkerStatus::Pending | WorkerStatus::Running => "[???]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub status: WorkerStatus,
    pub environment: GapEnvironment,
    pub exit_code: Option<i32>,
    pub elapsed_s: f64,
    pub last_line: String,
    pub progress: usize,
    /// Count from the `# Complete:` line of the result file.
    pub count: Option<u64>,
    pub error: Option<String>,
}

impl WorkerReport {
    fn pending(environment: GapEnvironment) -> Self {
        WorkerReport {
            status: WorkerStatus::Pending,
            environment,
            exit_code: None,
            elapsed_s: 0.0,
            last_line: String::new(),
            progress: 0,
            count: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSummary {
    pub run_id: String,
    pub timestamp: String,
    pub total_elapsed_s: f64,
    pub all_success: bool,
    pub workers: IndexMap<String, WorkerReport>,
}

impl LaunchSummary {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_text(path, &serde_json::to_string_pretty(self)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_str(&read_text(path)?)?)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.workers
            .iter()
            .filter(|(_, r)| !r.status.is_success())
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

pub struct WorkerPool<'a, C: WorkerCommand> {
    pub commands: &'a C,
    pub max_parallel: usize,
    pub timeout: Option<Duration>,
    pub monitor_interval: Duration,
    pub echo: Echo,
}

type StatusTable = Mutex<IndexMap<String, WorkerReport>>;

fn update(table: &StatusTable, name: &str, f: impl FnOnce(&mut WorkerReport)) {
    if let Ok(mut t) = table.lock() {
        if let Some(r) = t.get_mut(name) {
            f(r);
        }
    }
}

impl<'a, C: WorkerCommand> WorkerPool<'a, C> {
    pub fn new(commands: &'a C, max_parallel: usize) -> Self {
        WorkerPool {
            commands,
            max_parallel: max_parallel.max(1),
            timeout: None,
            monitor_interval: Duration::from_secs(30),
            echo: Echo::All,
        }
    }

    pub fn run_all(&self, specs: &[WorkerSpec]) -> Result<LaunchSummary> {
        let start = Instant::now();
        let table: StatusTable = Mutex::new(
            specs
                .iter()
                .map(|s| (s.name.clone(), WorkerReport::pending(s.environment)))
                .collect(),
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_parallel)
            .build()?;
        log::info!(
            "Launching {:} workers, at most {:} at a time",
            specs.len(),
            self.max_parallel
        );
        let done = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| monitor(&table, &done, self.monitor_interval));
            pool.install(|| {
                specs.par_iter().for_each(|spec| self.run_one(spec, &table));
            });
            done.store(true, Ordering::SeqCst);
        });

        let workers = table.into_inner().map_err(|_| {
            CensusError::Config(String::from("worker status table poisoned"))
        })?;
        let summary = LaunchSummary {
            run_id: Uuid::new_v4().to_string(),
            timestamp: timestamp(),
            total_elapsed_s: start.elapsed().as_secs_f64(),
            all_success: workers.values().all(|r| r.status.is_success()),
            workers,
        };
        print_summary(&summary, specs);
        Ok(summary)
    }

    fn run_one(&self, spec: &WorkerSpec, table: &StatusTable) {
        let state = match &spec.result_file {
            Some(path) => checkpoint::resume_state(path).unwrap_or(ResumeState::Fresh),
            None => ResumeState::Fresh,
        };
        if let ResumeState::Complete(count) = state {
            if spec.require_marker {
                log::info!("[{:}] already complete ({:}), skipping", spec.name, count);
                update(table, &spec.name, |r| {
                    r.status = WorkerStatus::Skipped;
                    r.count = Some(count);
                });
                return;
            }
        }
        let resuming = matches!(state, ResumeState::Partial(_));
        if let ResumeState::Partial(units) = state {
            log::info!("[{:}] resuming after {:} checkpointed units", spec.name, units);
        }
        update(table, &spec.name, |r| r.status = WorkerStatus::Running);

        let mut launcher = Launcher::new(format!("Worker {:}", spec.name), &spec.log_file)
            .header_line(format!("Script: {:}", spec.script.display()))
            .header_line(format!("Environment: {:}", spec.environment))
            .header_line(format!("Memory: {:}", spec.memory))
            .echo(self.echo.clone())
            .append(resuming)
            .cleanup(self.commands.cleanup(spec));
        if let Some(t) = self.timeout {
            launcher = launcher.timeout(t);
        }
        let command = self.commands.command(spec);
        let outcome = launcher.run_with(command, |line| {
            update(table, &spec.name, |r| {
                if !line.trim().is_empty() {
                    r.last_line = line.trim().to_string();
                }
                if crate::gap::is_progress_line(line) {
                    r.progress += 1;
                }
            });
        });

        match outcome {
            Ok(outcome) => {
                let (marker, count) = match &spec.result_file {
                    Some(path) => match read_text(path) {
                        Ok(text) => (
                            checkpoint::has_complete_marker(&text),
                            checkpoint::completed_count(&text),
                        ),
                        Err(_) => (false, None),
                    },
                    None => (false, None),
                };
                let status = if !outcome.exited_cleanly() {
                    WorkerStatus::Failed
                } else if spec.require_marker && !marker {
                    WorkerStatus::Failed
                } else {
                    WorkerStatus::Success
                };
                let error = if outcome.timed_out {
                    Some(String::from("timed out"))
                } else if status == WorkerStatus::Failed && outcome.exit_code == Some(0) {
                    Some(String::from("exit code 0 but no completion marker"))
                } else {
                    None
                };
                log::info!(
                    "[{:}] finished: exit={:?} elapsed={:.0}s",
                    spec.name,
                    outcome.exit_code,
                    outcome.elapsed.as_secs_f64()
                );
                update(table, &spec.name, |r| {
                    r.status = status;
                    r.exit_code = outcome.exit_code;
                    r.elapsed_s = outcome.elapsed.as_secs_f64();
                    r.progress = outcome.progress_lines;
                    r.last_line = outcome.last_line.clone();
                    r.count = count;
                    r.error = error;
                });
            }
            Err(e) => {
                log::error!("[{:}] ERROR: {:}", spec.name, e);
                update(table, &spec.name, |r| {
                    r.status = WorkerStatus::Error;
                    r.error = Some(e.to_string());
                });
            }
        }
    }
}

fn monitor(table: &StatusTable, done: &AtomicBool, interval: Duration) {
    let tick = Duration::from_millis(100).min(interval);
    let mut last = Instant::now();
    while !done.load(Ordering::SeqCst) {
        thread::sleep(tick);
        if last.elapsed() < interval || done.load(Ordering::SeqCst) {
            continue;
        }
        last = Instant::now();
        let Ok(t) = table.lock() else {
            return;
        };
        let names = |want: &dyn Fn(WorkerStatus) -> bool| {
            t.iter()
                .filter(|(_, r)| want(r.status))
                .map(|(n, _)| n.as_str())
                .collect::<Vec<_>>()
        };
        let running = names(&|s| s == WorkerStatus::Running);
        if running.is_empty() {
            continue;
        }
        let completed = names(&|s| s.is_success());
        let failed = names(&|s| matches!(s, WorkerStatus::Failed | WorkerStatus::Error));
        println!("\n--- Status update ({:}) ---", timestamp());
        println!("  Running ({:}): {:}", running.len(), running.join(", "));
        println!("  Completed ({:}): {:}", completed.len(), completed.join(", "));
        if !failed.is_empty() {
            println!("  FAILED ({:}): {:}", failed.len(), failed.join(", "));
        }
    }
}

fn print_summary(summary: &LaunchSummary, specs: &[WorkerSpec]) {
    println!("\n{:}", "=".repeat(60));
    println!("FINAL SUMMARY");
    println!("{:}", "=".repeat(60));
    println!(
        "Total elapsed: {:.1}s ({:.1}m)",
        summary.total_elapsed_s,
        summary.total_elapsed_s / 60.0
    );
    for spec in specs {
        let Some(r) = summary.workers.get(&spec.name) else {
            continue;
        };
        let exit = r
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| String::from("?"));
        println!(
            "  {:<6} {:>14}: exit={:}, elapsed={:.0}s, buckets={:}",
            r.status.tag(),
            spec.name,
            exit,
            r.elapsed_s,
            r.progress
        );
        if let Some(e) = &r.error {
            println!("         {:}", e);
        }
        if !r.status.is_success() {
            let tail = tail_lines(&spec.log_file, FAILURE_TAIL);
            if !tail.is_empty() {
                println!("       Last lines of {:}:", spec.log_file.display());
                for line in tail {
                    println!("         {:}", line);
                }
            }
        }
    }
    let failed = summary.failed();
    if failed.is_empty() {
        println!("*** ALL WORKERS COMPLETED SUCCESSFULLY ***");
    } else {
        println!("*** {:} WORKER(S) FAILED ***", failed.len());
        println!("Failed: {:}", failed.join(", "));
    }
}
