use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::clock::timestamp;
use crate::config::GapSettings;
use crate::error::{CensusError, Result};

use super::paths::{to_cygwin_path, to_wsl_path};

/// How long to keep draining output after killing a timed out child.
const KILL_GRACE: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapEnvironment {
    /// GAP's bundled Cygwin runtime on Windows.
    Cygwin,
    /// A GAP install inside WSL, needed for ANUPQ.
    Wsl,
    /// `gap` on the PATH of this machine.
    Native,
}

impl std::fmt::Display for GapEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GapEnvironment::Cygwin => "cygwin",
            GapEnvironment::Wsl => "wsl",
            GapEnvironment::Native => "native",
        };
        f.write_str(s)
    }
}

/// Builds the command line that runs one GAP script.
#[derive(Debug, Clone)]
pub struct GapInvocation<'a> {
    pub settings: &'a GapSettings,
    pub environment: GapEnvironment,
    pub memory: &'a str,
}

impl<'a> GapInvocation<'a> {
    pub fn new(settings: &'a GapSettings, environment: GapEnvironment, memory: &'a str) -> Self {
        GapInvocation {
            settings,
            environment,
            memory,
        }
    }

    /// The script path as GAP will see it.
    pub fn script_path(&self, script: &Path) -> String {
        let s = script.to_string_lossy();
        match self.environment {
            GapEnvironment::Cygwin => to_cygwin_path(&s),
            GapEnvironment::Wsl => to_wsl_path(&s),
            GapEnvironment::Native => s.into_owned(),
        }
    }

    pub fn command(&self, script: &Path) -> Command {
        let gap_script = self.script_path(script);
        match self.environment {
            GapEnvironment::Cygwin => {
                let mut cmd = Command::new(&self.settings.cygwin_bash);
                // exec so that killing the wrapper kills GAP itself
                cmd.arg("--login").arg("-c").arg(format!(
                    "exec {:}/gap -q -o {:} \"{:}\"",
                    self.settings.cygwin_gap_root.trim_end_matches('/'),
                    self.memory,
                    gap_script
                ));
                cmd
            }
            GapEnvironment::Wsl => {
                let mut cmd = Command::new("wsl");
                cmd.arg(&self.settings.wsl_gap)
                    .args(["-q", "-o", self.memory])
                    .arg(gap_script);
                cmd
            }
            GapEnvironment::Native => {
                let mut cmd = Command::new(&self.settings.native_gap);
                cmd.args(["-q", "-o", self.memory]).arg(gap_script);
                cmd
            }
        }
    }

    /// Command line to run after killing a timed out worker. Killing `wsl`
    /// leaves the Linux side running, so GAP is matched by its script path.
    pub fn cleanup_argv(&self, script: &Path) -> Vec<String> {
        match self.environment {
            GapEnvironment::Wsl => vec![
                String::from("wsl"),
                String::from("pkill"),
                String::from("-KILL"),
                String::from("-f"),
                self.script_path(script),
            ],
            GapEnvironment::Cygwin | GapEnvironment::Native => Vec::new(),
        }
    }
}

/// Which child output lines are forwarded to the logger.
#[derive(Debug, Clone)]
pub enum Echo {
    Silent,
    All,
    Matching(Regex),
}

impl Echo {
    fn wants(&self, line: &str) -> bool {
        match self {
            Echo::Silent => false,
            Echo::All => true,
            Echo::Matching(re) => re.is_match(line),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// `None` when the child was killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
    pub last_line: String,
    pub progress_lines: usize,
}

impl RunOutcome {
    pub fn exited_cleanly(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// `Bucket 12 complete: ...` style lines printed by the dedup workers.
pub fn is_progress_line(line: &str) -> bool {
    line.contains("Bucket ") && line.contains("complete:")
}

/// Runs one child process, teeing its merged stdout and stderr into a log
/// file line by line.
#[derive(Debug, Clone)]
pub struct Launcher {
    pub label: String,
    pub log_path: PathBuf,
    pub echo: Echo,
    pub timeout: Option<Duration>,
    /// Append to an existing log instead of truncating it, for resumed runs.
    pub append: bool,
    pub header: Vec<String>,
    /// Run after the child is killed; empty for none.
    pub cleanup: Vec<String>,
}

/// What the output loop saw before the child closed its pipes.
struct Pumped {
    last_line: String,
    progress_lines: usize,
    timed_out: bool,
}

impl Launcher {
    pub fn new(label: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        Launcher {
            label: label.into(),
            log_path: log_path.into(),
            echo: Echo::Silent,
            timeout: None,
            append: false,
            header: Vec::new(),
            cleanup: Vec::new(),
        }
    }

    pub fn echo(mut self, echo: Echo) -> Self {
        self.echo = echo;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn header_line(mut self, line: impl Into<String>) -> Self {
        self.header.push(line.into());
        self
    }

    pub fn cleanup(mut self, argv: Vec<String>) -> Self {
        self.cleanup = argv;
        self
    }

    pub fn run(&self, command: Command) -> Result<RunOutcome> {
        self.run_with(command, |_| {})
    }

    /// Like `run`, calling `on_line` for every output line as it arrives.
    pub fn run_with<F>(&self, command: Command, on_line: F) -> Result<RunOutcome>
    where
        F: FnMut(&str),
    {
        let mut log_file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(&self.log_path)
            .map_err(|e| CensusError::io(&self.log_path, e))?;
        self.run_into(command, &mut log_file, on_line)
    }

    /// Runs `command` with `log` as the tee target. A failed write to `log`
    /// kills and reaps the child before the error is returned.
    pub(crate) fn run_into<W, F>(&self, mut command: Command, log: &mut W, mut on_line: F) -> Result<RunOutcome>
    where
        W: Write,
        F: FnMut(&str),
    {
        let log_err = |e| CensusError::io(&self.log_path, e);
        writeln!(log, "# {:}", self.label).map_err(log_err)?;
        writeln!(log, "# Started: {:}", timestamp()).map_err(log_err)?;
        for line in self.header.iter() {
            writeln!(log, "# {:}", line).map_err(log_err)?;
        }
        writeln!(log).map_err(log_err)?;
        log.flush().map_err(log_err)?;

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // own process group, so a timeout can take wrapper and GAP down together
            command.process_group(0);
        }
        let start = Instant::now();
        let mut child = command.spawn().map_err(|e| CensusError::Spawn {
            program: command.get_program().to_string_lossy().into_owned(),
            source: e,
        })?;
        log::trace!("[{:}] spawned pid {:}", self.label, child.id());

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            spawn_reader(out, tx.clone());
        }
        if let Some(err) = child.stderr.take() {
            spawn_reader(err, tx.clone());
        }
        drop(tx);

        let pumped = match self.pump(&mut child, &rx, log, start, &mut on_line) {
            Ok(p) => p,
            Err(e) => {
                log::error!("[{:}] log write failed, stopping the worker: {:}", self.label, e);
                self.terminate(&mut child);
                if let Err(wait_err) = child.wait() {
                    log::warn!("[{:}] wait failed: {:}", self.label, wait_err);
                }
                return Err(e);
            }
        };

        let status = child
            .wait()
            .map_err(|e| CensusError::io(&self.log_path, e))?;
        let elapsed = start.elapsed();
        writeln!(log, "\n# Finished: {:}", timestamp()).map_err(log_err)?;
        writeln!(log, "# Elapsed: {:.1}s", elapsed.as_secs_f64()).map_err(log_err)?;
        let footer = match status.code() {
            Some(code) => writeln!(log, "# Exit code: {:}", code),
            None => writeln!(log, "# Exit code: none (killed)"),
        };
        footer.map_err(log_err)?;
        if pumped.timed_out {
            writeln!(log, "# Timed out").map_err(log_err)?;
        }
        log.flush().map_err(log_err)?;

        Ok(RunOutcome {
            exit_code: status.code(),
            timed_out: pumped.timed_out,
            elapsed,
            last_line: pumped.last_line,
            progress_lines: pumped.progress_lines,
        })
    }

    fn pump<W, F>(
        &self,
        child: &mut Child,
        rx: &mpsc::Receiver<String>,
        log: &mut W,
        start: Instant,
        on_line: &mut F,
    ) -> Result<Pumped>
    where
        W: Write,
        F: FnMut(&str),
    {
        let log_err = |e| CensusError::io(&self.log_path, e);
        let mut out = Pumped {
            last_line: String::new(),
            progress_lines: 0,
            timed_out: false,
        };
        let mut killed_at: Option<Instant> = None;
        loop {
            match rx.recv_timeout(POLL) {
                Ok(line) => {
                    writeln!(log, "{:}", line).map_err(log_err)?;
                    log.flush().map_err(log_err)?;
                    if self.echo.wants(&line) {
                        log::info!("[{:}] {:}", self.label, line);
                    }
                    if is_progress_line(&line) {
                        out.progress_lines += 1;
                    }
                    on_line(&line);
                    if !line.trim().is_empty() {
                        out.last_line = line.trim().to_string();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if let Some(at) = killed_at {
                // a grandchild may still hold the pipes open
                if at.elapsed() > KILL_GRACE {
                    break;
                }
            } else if let Some(limit) = self.timeout {
                if start.elapsed() > limit {
                    log::warn!(
                        "[{:}] timed out after {:.0}s, killing",
                        self.label,
                        start.elapsed().as_secs_f64()
                    );
                    self.terminate(child);
                    out.timed_out = true;
                    killed_at = Some(Instant::now());
                }
            }
        }
        Ok(out)
    }

    /// Kills the child's whole process group where there is one, then the
    /// child itself, then runs the cleanup command.
    fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            let group = format!("-{:}", child.id());
            match Command::new("kill").args(["-KILL", "--", group.as_str()]).status() {
                Ok(status) if status.success() => {}
                Ok(status) => log::debug!("[{:}] group kill exited with {:}", self.label, status),
                Err(e) => log::debug!("[{:}] group kill failed: {:}", self.label, e),
            }
        }
        if let Err(e) = child.kill() {
            log::debug!("[{:}] kill failed: {:}", self.label, e);
        }
        if let Some((program, args)) = self.cleanup.split_first() {
            match Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
            {
                Ok(status) => log::info!("[{:}] cleanup {:} exited with {:}", self.label, program, status),
                Err(e) => log::warn!("[{:}] cleanup {:} failed: {:}", self.label, program, e),
            }
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: R, tx: mpsc::Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(&['\n', '\r'][..]).to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}

/// The last `n` lines of a log, for failure reports.
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    match crate::error::read_text(path) {
        Ok(text) => {
            let lines: Vec<&str> = text.trim_end().lines().collect();
            let from = lines.len().saturating_sub(n);
            lines[from..].iter().map(|s| s.to_string()).collect()
        }
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("census_launch_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn cygwin_command_line() {
        let settings = GapSettings::default();
        let inv = GapInvocation::new(&settings, GapEnvironment::Cygwin, "20g");
        let cmd = inv.command(Path::new(r"C:\work\leaf_worker_1.g"));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program().to_string_lossy(), settings.cygwin_bash);
        assert_eq!(
            args,
            vec![
                "--login".to_string(),
                "-c".to_string(),
                "exec /opt/gap-4.15.1/gap -q -o 20g \"/cygdrive/c/work/leaf_worker_1.g\"".to_string()
            ]
        );
    }

    #[test]
    fn wsl_command_line() {
        let settings = GapSettings::default();
        let inv = GapInvocation::new(&settings, GapEnvironment::Wsl, "8g");
        let cmd = inv.command(Path::new(r"C:\work\worker_2groups.g"));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program().to_string_lossy(), "wsl");
        assert_eq!(args, vec!["gap", "-q", "-o", "8g", "/mnt/c/work/worker_2groups.g"]);
        assert_eq!(
            inv.cleanup_argv(Path::new(r"C:\work\worker_2groups.g")),
            vec!["wsl", "pkill", "-KILL", "-f", "/mnt/c/work/worker_2groups.g"]
        );
        let native = GapInvocation::new(&settings, GapEnvironment::Native, "8g");
        assert!(native.cleanup_argv(Path::new("w.g")).is_empty());
    }

    #[test]
    fn progress_lines() {
        assert!(is_progress_line("  Bucket 12 complete: 4 -> 1"));
        assert!(!is_progress_line("Bucket 12 started"));
    }

    #[cfg(unix)]
    #[test]
    fn tees_output_and_writes_footer() {
        let dir = scratch_dir();
        let log_path = dir.join("w.log");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("echo hello; echo 'Bucket 1 complete: 3 -> 1'; echo oops 1>&2; exit 3");
        let mut seen = Vec::new();
        let outcome = Launcher::new("test worker", &log_path)
            .header_line("Environment: native")
            .run_with(cmd, |l| seen.push(l.to_string()))
            .unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.timed_out);
        assert_eq!(outcome.progress_lines, 1);
        assert!(!outcome.exited_cleanly());
        assert_eq!(seen.len(), 3);
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.starts_with("# test worker\n# Started: "));
        assert!(log.contains("# Environment: native\n"));
        assert!(log.contains("hello\n"));
        assert!(log.contains("oops\n"));
        assert!(log.contains("# Exit code: 3\n"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn kills_on_timeout() {
        let dir = scratch_dir();
        let log_path = dir.join("slow.log");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo started; exec sleep 30");
        let outcome = Launcher::new("slow", &log_path)
            .timeout(Duration::from_millis(300))
            .run(cmd)
            .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.last_line, "started");
        assert!(outcome.elapsed < Duration::from_secs(20));
        std::fs::remove_dir_all(dir).unwrap();
    }

    /// Accepts writes until `trigger` has been written, then fails.
    struct FailAfter {
        seen: Vec<u8>,
        trigger: &'static str,
    }

    impl Write for FailAfter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if String::from_utf8_lossy(&self.seen).contains(self.trigger) {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
            }
            self.seen.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[cfg(unix)]
    #[test]
    fn log_write_failure_stops_the_child() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo hello; echo more; exec sleep 30");
        let mut sink = FailAfter {
            seen: Vec::new(),
            trigger: "hello",
        };
        let begin = Instant::now();
        let res = Launcher::new("failing log", "/nonexistent/failing.log").run_into(cmd, &mut sink, |_| {});
        assert!(matches!(res, Err(CensusError::Io { .. })), "{:?}", res);
        assert!(begin.elapsed() < Duration::from_secs(20));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timeout_kills_grandchildren() {
        let dir = scratch_dir();
        let pid_file = dir.join("grandchild.pid");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!(
            "sleep 30 & echo $! > '{:}'; echo started; wait",
            pid_file.display()
        ));
        let outcome = Launcher::new("nested", dir.join("nested.log"))
            .timeout(Duration::from_millis(500))
            .run(cmd)
            .unwrap();
        assert!(outcome.timed_out);
        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let stat = Path::new("/proc").join(&pid).join("stat");
        let deadline = Instant::now() + Duration::from_secs(5);
        let gone = loop {
            // a zombie waiting for its reaper counts as dead
            let alive = std::fs::read_to_string(&stat)
                .map(|s| !s.contains(") Z "))
                .unwrap_or(false);
            if !alive {
                break true;
            }
            if Instant::now() > deadline {
                break false;
            }
            thread::sleep(Duration::from_millis(50));
        };
        assert!(gone, "grandchild {:} survived the timeout", pid);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_executable_is_an_error() {
        let dir = scratch_dir();
        let cmd = Command::new("/definitely/not/a/gap/binary");
        let res = Launcher::new("missing", dir.join("m.log")).run(cmd);
        assert!(matches!(res, Err(CensusError::Spawn { .. })));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn tail_of_log() {
        let dir = scratch_dir();
        let p = dir.join("t.log");
        std::fs::write(&p, "a\nb\nc\nd\n").unwrap();
        assert_eq!(tail_lines(&p, 2), vec!["c", "d"]);
        assert!(tail_lines(&dir.join("none"), 2).is_empty());
        std::fs::remove_dir_all(dir).unwrap();
    }
}
