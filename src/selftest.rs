//! GAP-side regression suites and pre-flight checks of a prepared work
//! directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::clock::timestamp;
use crate::error::{read_text, write_text, CensusError, Result};
use crate::gap::script::{test_script, DedupMethod, TestKind, REQUIRED_FUNCTIONS};
use crate::gap::{Echo, GapEnvironment, Launcher};
use crate::records::match_bracket;
use crate::report::TRACKING_FILENAME;
use crate::workers::{WorkerCommand, WorkerSpec, WorkerStatus};

pub const TEST_RESULTS_FILENAME: &str = "test_results.json";
pub const VALIDATION_RESULTS_FILENAME: &str = "validation_results.json";

/// One GAP test script and the file it writes its counts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestScript {
    pub script: PathBuf,
    pub description: String,
    pub environment: GapEnvironment,
    pub result_file: PathBuf,
    /// Generated source, or `None` for a script kept on disk by hand.
    pub kind: Option<TestKind>,
}

impl TestScript {
    fn new(dir: &Path, script: &str, description: &str, env: GapEnvironment, result: &str) -> Self {
        TestScript {
            script: dir.join(script),
            description: description.to_string(),
            environment: env,
            result_file: dir.join(result),
            kind: None,
        }
    }

    fn generated(kind: TestKind, dir: &Path, env: GapEnvironment) -> Self {
        let (stem, description) = match kind {
            TestKind::Prelude => ("test_prelude", "Prelude Helper Tests"),
            TestKind::Buckets => ("test_bucket_regression", "Bucket Regression Tests"),
            TestKind::Integration => ("test_deduplication_integration", "Deduplication Integration Tests"),
            TestKind::AnuPq => ("test_anupq", "ANUPQ Tests"),
        };
        let mut test = TestScript::new(
            dir,
            &format!("{:}.g", stem),
            description,
            env,
            &format!("{:}_results.txt", stem),
        );
        test.kind = Some(kind);
        test
    }

    fn stem(&self) -> String {
        self.script
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.description.clone())
    }

    /// Writes the generated source, with the result path as GAP sees it.
    /// Clears any result left by an earlier run.
    pub fn write<F>(&self, gap_path: F) -> Result<()>
    where
        F: Fn(GapEnvironment, &Path) -> Result<String>,
    {
        let Some(kind) = self.kind else {
            return Ok(());
        };
        if self.result_file.exists() {
            fs::remove_file(&self.result_file).map_err(|e| CensusError::io(&self.result_file, e))?;
        }
        let result = gap_path(self.environment, &self.result_file)?;
        write_text(&self.script, &test_script(kind, &result))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TestSuite {
    pub main: Vec<TestScript>,
    /// Subset of `main` run by `--quick`.
    pub quick: Vec<TestScript>,
    /// Needs ANUPQ, so always runs under WSL.
    pub anupq: Vec<TestScript>,
}

impl TestSuite {
    /// The generated regression scripts, placed in `dir`.
    pub fn standard(dir: &Path, main_env: GapEnvironment) -> Self {
        let prelude = TestScript::generated(TestKind::Prelude, dir, main_env);
        let buckets = TestScript::generated(TestKind::Buckets, dir, main_env);
        let integration = TestScript::generated(TestKind::Integration, dir, main_env);
        TestSuite {
            quick: vec![prelude.clone(), buckets.clone()],
            main: vec![prelude, buckets, integration],
            anupq: vec![TestScript::generated(TestKind::AnuPq, dir, GapEnvironment::Wsl)],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelftestOptions {
    pub wsl_only: bool,
    pub cygwin_only: bool,
    pub quick: bool,
}

impl SelftestOptions {
    pub fn selected<'a>(&self, suite: &'a TestSuite) -> Vec<&'a TestScript> {
        let mut out = Vec::new();
        if !self.wsl_only {
            let main = if self.quick { &suite.quick } else { &suite.main };
            out.extend(main.iter());
        }
        // quick mode never touches WSL
        if !self.cygwin_only && !self.quick {
            out.extend(suite.anupq.iter());
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub pass_count: Option<u64>,
    pub fail_count: Option<u64>,
    pub error_count: Option<u64>,
}

fn count_re(name: &str) -> Regex {
    Regex::new(&format!(r"{:}\s*:=\s*(\d+)", name)).expect("static regex")
}

/// Reads `passCount := k`, `failCount := k` and `errorCount := k`.
pub fn parse_counts(text: &str) -> TestCounts {
    static RES: OnceLock<[Regex; 3]> = OnceLock::new();
    let [pass, fail, error] =
        RES.get_or_init(|| [count_re("passCount"), count_re("failCount"), count_re("errorCount")]);
    let grab = |re: &Regex| re.captures(text).and_then(|c| c[1].parse().ok());
    TestCounts {
        pass_count: grab(pass),
        fail_count: grab(fail),
        error_count: grab(error),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub script: String,
    pub description: String,
    pub environment: GapEnvironment,
    pub status: WorkerStatus,
    pub exit_code: Option<i32>,
    pub start_time: String,
    pub end_time: String,
    pub output_file: String,
    pub parsed: Option<TestCounts>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub total_tests: u64,
    pub passed: u64,
    pub failed: u64,
    pub errors: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub run_time: String,
    pub tests: Vec<TestRun>,
    pub summary: TestSummary,
}

impl TestResults {
    pub fn ok(&self) -> bool {
        self.summary.failed == 0 && self.summary.errors == 0
    }

    pub fn print(&self) {
        let s = &self.summary;
        println!("\n{:}", "=".repeat(60));
        println!("FINAL SUMMARY");
        println!("{:}", "=".repeat(60));
        println!("Total tests run: {:}", s.total_tests);
        println!("  Passed:  {:}", s.passed);
        println!("  Failed:  {:}", s.failed);
        println!("  Errors:  {:}", s.errors);
        println!("  Skipped: {:}", s.skipped);
        println!("\nPer-script results:");
        for t in self.tests.iter() {
            let icon = t.status.tag();
            match t.parsed {
                Some(c) => println!(
                    "  {:} {:}: {:} pass, {:} fail",
                    icon,
                    t.description,
                    c.pass_count.map(|v| v.to_string()).unwrap_or_else(|| String::from("?")),
                    c.fail_count.map(|v| v.to_string()).unwrap_or_else(|| String::from("?")),
                ),
                None => println!("  {:} {:}", icon, t.description),
            }
        }
    }
}

/// Runs the selected scripts one after another, logging each to
/// `<out_dir>/<stem>_output.txt`, and writes `test_results.json`.
pub fn run_suite<C: WorkerCommand>(
    commands: &C,
    scripts: &[&TestScript],
    memory: &str,
    out_dir: &Path,
) -> Result<TestResults> {
    let mut results = TestResults {
        run_time: timestamp(),
        tests: Vec::new(),
        summary: TestSummary::default(),
    };
    for test in scripts {
        println!("\n{:}", "=".repeat(60));
        println!("Running: {:} ({:})", test.description, test.environment);
        println!("Script: {:}", test.script.display());
        println!("{:}", "=".repeat(60));
        let output_file = out_dir.join(format!("{:}_output.txt", test.stem()));
        let spec = WorkerSpec {
            name: test.stem(),
            script: test.script.clone(),
            environment: test.environment,
            memory: memory.to_string(),
            result_file: Some(test.result_file.clone()),
            log_file: output_file.clone(),
            require_marker: false,
        };
        let start_time = timestamp();
        let outcome = Launcher::new(test.description.clone(), &output_file)
            .header_line(format!("Script: {:}", test.script.display()))
            .echo(Echo::All)
            .run(commands.command(&spec));
        let mut run = TestRun {
            script: test.script.display().to_string(),
            description: test.description.clone(),
            environment: test.environment,
            status: WorkerStatus::Error,
            exit_code: None,
            start_time,
            end_time: String::new(),
            output_file: output_file.display().to_string(),
            parsed: None,
            error: None,
        };
        match outcome {
            Ok(outcome) => {
                run.exit_code = outcome.exit_code;
                run.status = if outcome.exited_cleanly() {
                    WorkerStatus::Success
                } else {
                    WorkerStatus::Failed
                };
                if test.result_file.exists() {
                    let counts = parse_counts(&read_text(&test.result_file)?);
                    results.summary.passed += counts.pass_count.unwrap_or(0);
                    results.summary.failed += counts.fail_count.unwrap_or(0);
                    results.summary.errors += counts.error_count.unwrap_or(0);
                    run.parsed = Some(counts);
                }
            }
            Err(CensusError::Spawn { .. }) if test.environment == GapEnvironment::Wsl => {
                println!("WARNING: WSL not available, skipping this test");
                run.status = WorkerStatus::Skipped;
                run.error = Some(String::from("WSL not available"));
                results.summary.skipped += 1;
            }
            Err(e) => {
                println!("ERROR: {:}", e);
                run.error = Some(e.to_string());
            }
        }
        run.end_time = timestamp();
        results.tests.push(run);
    }
    let s = &mut results.summary;
    s.total_tests = s.passed + s.failed + s.errors;
    write_text(
        out_dir.join(TEST_RESULTS_FILENAME),
        &serde_json::to_string_pretty(&results)?,
    )?;
    Ok(results)
}

/// Offset of the first bracket outside strings and comments that does not
/// close, or of a stray closer.
pub fn unbalanced_at(script: &str) -> Option<usize> {
    let bytes = script.as_bytes();
    let mut ix = 0;
    let mut in_string = false;
    let mut in_comment = false;
    while ix < bytes.len() {
        let b = bytes[ix];
        if in_comment {
            in_comment = b != b'\n';
        } else if in_string {
            if b == b'\\' {
                ix += 1;
            } else if b == b'"' {
                in_string = false;
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'#' => in_comment = true,
                // character literal such as '\n' or 'a'
                b'\'' => ix += if bytes.get(ix + 1) == Some(&b'\\') { 3 } else { 2 },
                b'[' | b'(' => match match_bracket(script, ix) {
                    Some(close) => ix = close,
                    None => return Some(ix),
                },
                b']' | b')' => return Some(ix),
                _ => {}
            }
        }
        ix += 1;
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResults {
    pub timestamp: String,
    pub implementation_dir: String,
    pub checks: Vec<ValidationCheck>,
    pub passed: usize,
    pub failed: usize,
    pub overall: bool,
}

impl ValidationResults {
    fn push(&mut self, name: impl Into<String>, passed: bool, message: impl Into<String>) {
        let message = message.into();
        println!("  {:}: {:}", if passed { "OK" } else { "FAIL" }, message);
        if passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.checks.push(ValidationCheck {
            name: name.into(),
            passed,
            message,
        });
    }
}

/// Problems with one generated worker script.
pub fn check_worker_script(text: &str) -> Vec<String> {
    let mut issues = Vec::new();
    if let Some(at) = unbalanced_at(text) {
        issues.push(format!("unbalanced bracket at byte {:}", at));
    }
    for f in REQUIRED_FUNCTIONS {
        if !text.contains(&format!("{:} := function", f)) {
            issues.push(format!("missing {:}", f));
        }
    }
    let pgroup = format!("# Method: {:}", DedupMethod::PGroup.gap_name());
    if text.contains(&pgroup) && !text.contains("LoadPackage(\"anupq\")") {
        issues.push(String::from("missing ANUPQ package load"));
    }
    issues
}

/// Pre-flight checks of a prepared work directory before a long launch:
/// layout, inputs, and every `worker_*.g` script.
pub fn validate_work_dir(dir: &Path, required_files: &[&str]) -> Result<ValidationResults> {
    let mut results = ValidationResults {
        timestamp: timestamp(),
        implementation_dir: dir.display().to_string(),
        checks: Vec::new(),
        passed: 0,
        failed: 0,
        overall: false,
    };
    println!("{:}", "=".repeat(60));
    println!("WORK DIRECTORY VALIDATION");
    println!("{:}", "=".repeat(60));
    println!("Directory: {:}", dir.display());

    println!("\n--- Checking directory structure ---");
    for sub in ["buckets", "results", "logs", "checkpoints"] {
        let ok = dir.join(sub).is_dir();
        let msg = format!("{:}{:}/", if ok { "Found: " } else { "Missing: " }, sub);
        results.push(format!("dir_{:}", sub), ok, msg);
    }

    println!("\n--- Checking required files ---");
    for name in std::iter::once(TRACKING_FILENAME).chain(required_files.iter().copied()) {
        let ok = dir.join(name).is_file();
        let msg = format!("{:}{:}", if ok { "Found: " } else { "Missing: " }, name);
        results.push(format!("file_{:}", name), ok, msg);
    }

    println!("\n--- Checking worker scripts ---");
    let mut scripts: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| CensusError::io(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with("worker_") && n.ends_with(".g"))
        })
        .collect();
    scripts.sort();
    if scripts.is_empty() {
        results.push("worker_scripts", false, "no worker_*.g scripts");
    }
    for path in scripts {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let issues = check_worker_script(&read_text(&path)?);
        let msg = if issues.is_empty() {
            format!("{:}: syntax OK", name)
        } else {
            format!("{:}: {:}", name, issues.join(", "))
        };
        results.push(format!("syntax_{:}", name), issues.is_empty(), msg);
    }

    results.overall = results.failed == 0;
    println!("\nPassed: {:}  Failed: {:}", results.passed, results.failed);
    if results.overall {
        println!(">>> VALIDATION PASSED - safe to launch <<<");
    } else {
        println!(">>> VALIDATION FAILED - fix issues before launching <<<");
    }
    write_text(
        dir.join(VALIDATION_RESULTS_FILENAME),
        &serde_json::to_string_pretty(&results)?,
    )?;
    Ok(results)
}
