//! Driver: converts a `DriverInput` into a wire command, drives the read
//! loop against a deadline, classifies crashes and timeouts, and produces a
//! `DriverOutput`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tempfile::TempDir;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::block::ContentBlock;
use crate::command;
use crate::error::{DriverError, DriverResult};
use crate::monitor::{CrashMonitor, NullCrashMonitor};
use crate::process::ServerProcess;
use crate::types::{DriverInput, DriverOutput, DriverPostTestOutput};

/// Far enough out to be effectively unbounded without overflowing
/// downstream deadline arithmetic.
const NO_TIMEOUT_DEADLINE: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// Fixed deadline for each post-test directive response.
const POST_TEST_QUERY_DEADLINE: Duration = Duration::from_secs(20);

/// Symbolication of a sanitizer report can take a long time.
const SANITIZER_REPORT_GRACE: Duration = Duration::from_secs(600);

static CRASHED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#CRASHED - (\S+)").unwrap());
static UNRESPONSIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#PROCESS UNRESPONSIVE - (\S+)").unwrap());
static PID_UNRESPONSIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#PID UNRESPONSIVE - (\S+)").unwrap());
static PID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"pid (\d+)").unwrap());
static CHILD_PROCESS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([^:]+): ([0-9]+)$").unwrap());
static TEST_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^TEST: (.+)$").unwrap());
static ABANDONED_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ABANDONED DOCUMENT: (.+)$").unwrap());

/// Static configuration for a driver. Every recognized runner option is an
/// explicit field with a default; there is no dynamic option lookup.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Path to the runner binary.
    pub runner_path: PathBuf,

    /// Root directory containing the tests.
    pub tests_root: PathBuf,

    /// Worker identifier, used for temp-dir isolation and logging.
    pub worker_number: usize,

    /// Disable the per-test deadline (debugging aid).
    pub no_timeout: bool,

    /// Whether the runner accepts a per-test `--timeout` segment.
    pub per_test_timeout_supported: bool,

    /// Extra time past the nominal timeout, letting the runner self-report
    /// before the harness treats it as hung.
    pub timeout_grace: Duration,

    /// How long `stop()` waits for a clean exit before escalating.
    pub stop_timeout: Duration,

    /// Sample unresponsive child processes reported on stdout.
    pub sample_on_timeout: bool,

    /// Issue `#LIST CHILD PROCESSES` after a batch.
    pub gather_child_processes: bool,

    /// Issue `#CHECK FOR WORLD LEAKS` after a batch.
    pub check_world_leaks: bool,

    pub gc_between_tests: bool,
    pub threaded: bool,

    /// Wrapper argv prepended to the runner command line (e.g. valgrind).
    pub wrapper: Vec<String>,

    /// Extra arguments always passed to the runner.
    pub additional_args: Vec<String>,

    /// Crash-log lookup and sampling collaborator.
    pub monitor: Arc<dyn CrashMonitor>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            runner_path: PathBuf::from("target/debug/webtest-runner"),
            tests_root: PathBuf::from("webtests"),
            worker_number: 0,
            no_timeout: false,
            per_test_timeout_supported: true,
            timeout_grace: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(3),
            sample_on_timeout: true,
            gather_child_processes: false,
            check_world_leaks: false,
            gc_between_tests: false,
            threaded: false,
            wrapper: Vec::new(),
            additional_args: Vec::new(),
            monitor: Arc::new(NullCrashMonitor),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    PrimaryBlock,
    ImageBlock,
    Done(Outcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Crashed,
    TimedOut,
}

/// Per-test protocol state. Built fresh at the top of every `run_test`, so
/// nothing here can leak between tests.
#[derive(Debug)]
struct TestSession {
    phase: Phase,
    deadline: Instant,

    /// Accumulated stderr for the test.
    error: Vec<u8>,
    err_seen_eof: bool,

    /// Timeout reported in-band by the runner, as opposed to deadline expiry.
    timed_out_in_band: bool,

    crashed_process_name: Option<String>,
    crashed_pid: Option<u32>,

    /// Becomes the crash log once sanitizer output starts; stderr is routed
    /// here instead of `error` from that point on.
    crash_report: Option<Vec<u8>>,

    measurements: HashMap<String, f64>,
}

impl TestSession {
    fn new(deadline: Instant) -> Self {
        Self {
            phase: Phase::Starting,
            deadline,
            error: Vec::new(),
            err_seen_eof: false,
            timed_out_in_band: false,
            crashed_process_name: None,
            crashed_pid: None,
            crash_report: None,
            measurements: HashMap::new(),
        }
    }

    fn advance(&mut self, next: Phase) {
        debug!(from = ?self.phase, to = ?next, "test phase transition");
        self.phase = next;
    }

    fn finish(&mut self, crashed: bool, timed_out: bool) -> Outcome {
        let outcome = if crashed {
            Outcome::Crashed
        } else if timed_out {
            Outcome::TimedOut
        } else {
            Outcome::Completed
        };
        self.advance(Phase::Done(outcome));
        outcome
    }
}

/// Runs tests through one live runner process.
///
/// The process is spawned lazily on the first `run_test` and reused across
/// tests until it crashes, times out, or `stop()` is called. Per-test state
/// lives in a session value scoped to each `run_test` call.
pub struct Driver {
    config: DriverConfig,
    server: Option<ServerProcess>,
    tempdir: Option<TempDir>,
}

impl Driver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            server: None,
            tempdir: None,
        }
    }

    /// Pid of the live runner, if one is running.
    pub fn pid(&self) -> Option<u32> {
        self.server.as_ref().and_then(ServerProcess::pid)
    }

    /// Spawn the runner if none is live. The pixel-test mode and argument
    /// set are fixed for the lifetime of the process; `DriverProxy` tears
    /// the driver down when they change.
    pub async fn start(&mut self, per_test_args: &[String]) -> DriverResult<()> {
        if self.server.is_none() {
            self.spawn_runner(per_test_args).await?;
        }
        Ok(())
    }

    /// Run a single test and return its results.
    ///
    /// A test that crashes or times out leaves the driver without a live
    /// process; the next `run_test` spawns a fresh one. Protocol trouble is
    /// reported through the returned `DriverOutput`; only contract
    /// violations and spawn failures surface as errors.
    pub async fn run_test(
        &mut self,
        input: &DriverInput,
        stop_when_done: bool,
    ) -> DriverResult<DriverOutput> {
        self.start(&input.extra_args).await?;
        let test_begin = Instant::now();
        let command = command::command_from_input(&self.config, input)?;

        let deadline = if self.config.no_timeout {
            test_begin + NO_TIMEOUT_DEADLINE
        } else {
            test_begin + Duration::from_millis(input.timeout_ms) + self.config.timeout_grace
        };
        let mut session = TestSession::new(deadline);

        debug!(
            worker = self.config.worker_number,
            test = %input.test_name,
            "running test"
        );

        if let Err(err) = self.write_command(command.as_bytes()).await {
            // A dead runner surfaces as a crash through the read loop.
            warn!("failed to write test command to runner: {err}");
        }

        // First block is either text or audio; the image block follows only
        // for pixel tests. Exactly one of the two reads waits for the
        // stderr EOF sentinel.
        session.advance(Phase::PrimaryBlock);
        let primary = self
            .read_block(&mut session, &input.test_name, !input.should_run_pixel_test)
            .await;
        let (mut text, audio) = split_primary_block(primary, &mut session);

        let (image, image_hash) = if input.should_run_pixel_test {
            session.advance(Phase::ImageBlock);
            let block = self.read_block(&mut session, &input.test_name, true).await;
            split_image_block(block)
        } else {
            (None, None)
        };

        let crashed = self.note_crashed_process(&mut session);
        let deadline_expired = self.server.as_ref().map_or(false, ServerProcess::timed_out);
        let pid = self.pid();
        let timeout = deadline_expired || session.timed_out_in_band;

        let outcome = session.finish(crashed, timeout);

        if stop_when_done || crashed || deadline_expired {
            // Stop even mid-crash to pick up remaining output; a hung
            // process gets no extra grace.
            let stop_timeout = if stop_when_done {
                self.config.stop_timeout
            } else {
                Duration::ZERO
            };
            let (trailing_out, trailing_err) = self.stop_with_timeout(stop_timeout).await;
            if !trailing_out.is_empty() {
                text.get_or_insert_with(String::new)
                    .push_str(&String::from_utf8_lossy(&trailing_out));
            }
            session.error.extend_from_slice(&trailing_err);
        }

        if crashed && session.crashed_pid.is_none() {
            // The pid may only have been printed after the crash sentinel.
            session.crashed_pid = find_pid(&String::from_utf8_lossy(&session.error));
        }

        let error_text = String::from_utf8_lossy(&session.error).into_owned();
        let crash_log = if let Some(report) = &session.crash_report {
            Some(String::from_utf8_lossy(report).into_owned())
        } else if crashed {
            let name = session
                .crashed_process_name
                .clone()
                .unwrap_or_else(|| runner_name(&self.config));
            let log = self
                .config
                .monitor
                .find_crash_log(&name, session.crashed_pid)
                .unwrap_or_else(|| {
                    placeholder_crash_log(
                        &name,
                        session.crashed_pid,
                        text.as_deref().unwrap_or(""),
                        &error_text,
                    )
                });
            Some(log)
        } else {
            None
        };

        debug!(?outcome, test = %input.test_name, "test finished");

        Ok(DriverOutput {
            text,
            image,
            image_hash,
            audio,
            crash: crashed,
            crashed_process_name: session.crashed_process_name.clone(),
            crashed_pid: session.crashed_pid,
            crash_log,
            test_time: test_begin.elapsed(),
            measurements: std::mem::take(&mut session.measurements),
            timeout,
            error: error_text,
            pid,
        })
    }

    /// Issue the post-test diagnostic directives over the live runner's
    /// channel. Returns `None` when no runner is live or neither query is
    /// enabled. Never runs concurrently with `run_test` on the same driver.
    pub async fn do_post_tests_work(&mut self) -> DriverResult<Option<DriverPostTestOutput>> {
        if self.server.is_none() {
            return Ok(None);
        }
        if !self.config.gather_child_processes && !self.config.check_world_leaks {
            return Ok(None);
        }

        let mut output = DriverPostTestOutput::default();

        if self.config.gather_child_processes {
            debug!("gathering child processes");
            self.write_command(b"#LIST CHILD PROCESSES\n").await?;
            let mut session = TestSession::new(Instant::now() + POST_TEST_QUERY_DEADLINE);
            let block = self.read_block(&mut session, "", true).await;
            output.child_processes =
                parse_child_processes(&String::from_utf8_lossy(block.decoded_content()));
        }

        if self.config.check_world_leaks {
            debug!("checking for world leaks");
            self.write_command(b"#CHECK FOR WORLD LEAKS\n").await?;
            let mut session = TestSession::new(Instant::now() + POST_TEST_QUERY_DEADLINE);
            let block = self.read_block(&mut session, "", true).await;
            let text = String::from_utf8_lossy(block.decoded_content()).into_owned();
            debug!(result = %text, "world leak check finished");
            output.world_leaks = parse_world_leaks(&self.config, &text);
        }

        Ok(Some(output))
    }

    /// Stop the runner and delete its scratch directory. Idempotent.
    pub async fn stop(&mut self) {
        let _ = self.stop_with_timeout(self.config.stop_timeout).await;
    }

    async fn spawn_runner(&mut self, per_test_args: &[String]) -> DriverResult<()> {
        let _ = self.stop_with_timeout(self.config.stop_timeout).await;

        let tempdir = tempfile::Builder::new()
            .prefix(&format!("webtest-worker-{}-", self.config.worker_number))
            .tempdir()?;
        let environment = runner_environment(tempdir.path());
        let argv = command::runner_command_line(&self.config, per_test_args);

        info!(
            worker = self.config.worker_number,
            runner = %self.config.runner_path.display(),
            "starting runner"
        );
        let server = ServerProcess::spawn(runner_name(&self.config), &argv, &environment)?;
        debug!(pid = ?server.pid(), "runner started");

        self.server = Some(server);
        self.tempdir = Some(tempdir);
        Ok(())
    }

    async fn stop_with_timeout(&mut self, timeout: Duration) -> (Vec<u8>, Vec<u8>) {
        let trailing = match self.server.take() {
            Some(server) => server.stop(timeout).await,
            None => (Vec::new(), Vec::new()),
        };
        // Dropping the tempdir deletes the per-worker scratch space.
        self.tempdir = None;
        trailing
    }

    async fn write_command(&mut self, bytes: &[u8]) -> DriverResult<()> {
        match self.server.as_mut() {
            Some(server) => server.write(bytes).await,
            None => Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "runner not started",
            ))),
        }
    }

    /// Read one content block. Each stream tracks its own `#EOF` sentinel;
    /// the loop ends when the expected sentinels arrived, the deadline
    /// expired, or a crash was detected.
    async fn read_block(
        &mut self,
        session: &mut TestSession,
        test_name: &str,
        wait_for_stderr_eof: bool,
    ) -> ContentBlock {
        let mut block = ContentBlock::new();
        let mut out_seen_eof = false;

        loop {
            if out_seen_eof && (session.err_seen_eof || !wait_for_stderr_eof) {
                break;
            }
            let Some(server) = self.server.as_mut() else {
                break;
            };

            let (raw_out, raw_err) = if session.err_seen_eof {
                (server.read_stdout_line(session.deadline).await, None)
            } else if out_seen_eof {
                (None, server.read_stderr_line(session.deadline).await)
            } else {
                server.read_either_line(session.deadline).await
            };

            // Deadline expiry and stream end both read as "nothing from
            // either stream".
            if raw_out.is_none() && raw_err.is_none() {
                break;
            }

            let out_line = raw_out.map(|line| {
                let (line, eof) = strip_eof(line);
                if eof {
                    out_seen_eof = true;
                }
                line
            });
            let err_line = raw_err.map(|line| {
                let (line, eof) = strip_eof(line);
                if eof {
                    session.err_seen_eof = true;
                }
                line
            });

            if let Some(line) = out_line.filter(|line| !line.is_empty()) {
                self.check_for_driver_timeout(session, &line);
                if line.last() != Some(&b'\n') {
                    error!(
                        test = test_name,
                        "last character read from runner stdout line was not a newline"
                    );
                }
                if let Some(size) = block.process_line(&line) {
                    // The runner dumps the payload immediately after the
                    // Content-Length header, bypassing line framing.
                    if let Some(server) = self.server.as_mut() {
                        block.content = server.read_stdout_exact(session.deadline, size).await;
                    }
                }
            }

            if let Some(line) = err_line.filter(|line| !line.is_empty()) {
                if self.apply_stderr_line(session, &line).await {
                    break;
                }
            }
        }

        // A sanitizer report is a crash even when no crash sentinel named
        // the process.
        if session.crash_report.is_some() && session.crashed_process_name.is_none() {
            if let Some(server) = &self.server {
                session.crashed_process_name = Some(server.process_name().to_string());
                session.crashed_pid = server.pid();
            }
        }

        block.decode();
        block
    }

    /// In-band timeout markers arriving on stdout.
    fn check_for_driver_timeout(&self, session: &mut TestSession, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        if let Some(caps) = PID_UNRESPONSIVE_RE.captures(&text) {
            let child_name = caps[1].to_string();
            let child_pid = find_pid(&text);
            let message = format!(
                "Wait on notifyDone timed out, process {} pid = {}",
                child_name,
                child_pid.map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
            );
            debug!("{message}");
            session.error.extend_from_slice(message.as_bytes());
            if self.config.sample_on_timeout {
                self.config.monitor.sample_process(&child_name, child_pid);
            }
        }
        if text == "FAIL: Timed out waiting for notifyDone to be called\n" {
            session.timed_out_in_band = true;
        }
    }

    /// Classify one stderr line and fold it into the session. Returns true
    /// when the read loop must end. Sentinel-reported crashes win over
    /// stream-end detection within one read cycle.
    async fn apply_stderr_line(&mut self, session: &mut TestSession, line: &[u8]) -> bool {
        let text = String::from_utf8_lossy(line).into_owned();

        if text.trim_end_matches(['\r', '\n']) == "#CRASHED" {
            if let Some(server) = &self.server {
                session.crashed_process_name = Some(server.process_name().to_string());
                session.crashed_pid = server.pid();
            }
            return true;
        }

        if let Some(caps) = CRASHED_RE.captures(&text) {
            session.crashed_process_name = Some(caps[1].to_string());
            session.crashed_pid = find_pid(&text);
            debug!(
                process = &caps[1],
                pid = ?session.crashed_pid,
                "runner reported a subprocess crash"
            );
            return true;
        }

        if let Some(caps) = UNRESPONSIVE_RE.captures(&text) {
            let child_name = caps[1].to_string();
            let child_pid = find_pid(&text);
            debug!(
                process = %child_name,
                pid = ?child_pid,
                "child process unresponsive, requesting a sample"
            );
            session.timed_out_in_band = true;
            if child_pid.is_some() {
                self.config.monitor.sample_process(&child_name, child_pid);
            }
            session.error.extend_from_slice(line);
            if let Some(server) = self.server.as_mut() {
                // The runner may already be gone; a lost ack is harmless.
                if let Err(err) = server.write(b"#SAMPLE FINISHED\n").await {
                    debug!("sample ack not delivered: {err}");
                }
            }
            return false;
        }

        if self.note_crashed_process(session) {
            return true;
        }

        if text.contains("ERROR: AddressSanitizer") {
            // The report opens with a nondescript banner line; drop it from
            // the accumulated stderr and give symbolication time to finish.
            truncate_to_previous_line(&mut session.error);
            session.crash_report = Some(line.to_vec());
            session.deadline += SANITIZER_REPORT_GRACE;
            return false;
        }

        match &mut session.crash_report {
            Some(report) => report.extend_from_slice(line),
            None => session.error.extend_from_slice(line),
        }
        false
    }

    /// Record a crash learned from the process handle (stream end). Sentinel
    /// classification runs first, so a name reported in-band is never
    /// overwritten.
    fn note_crashed_process(&self, session: &mut TestSession) -> bool {
        if session.crashed_process_name.is_some() {
            return true;
        }
        let Some(server) = self.server.as_ref() else {
            return false;
        };
        if server.has_crashed() {
            session.crashed_process_name = Some(server.process_name().to_string());
            session.crashed_pid = server.pid();
            return true;
        }
        false
    }
}

fn runner_name(config: &DriverConfig) -> String {
    config.runner_path.file_stem().map_or_else(
        || "runner".to_string(),
        |stem| stem.to_string_lossy().into_owned(),
    )
}

/// Environment for a freshly spawned runner: everything mutable lives under
/// the per-worker temp directory so a stop can wipe it.
fn runner_environment(tempdir: &Path) -> Vec<(String, String)> {
    let home = tempdir.join("home");
    let cache = tempdir.join("cache");
    let _ = std::fs::create_dir_all(&home);
    let _ = std::fs::create_dir_all(&cache);
    vec![
        ("TMPDIR".to_string(), tempdir.display().to_string()),
        ("HOME".to_string(), home.display().to_string()),
        ("XDG_CACHE_HOME".to_string(), cache.display().to_string()),
        (
            "ASAN_OPTIONS".to_string(),
            "allocator_may_return_null=1".to_string(),
        ),
    ]
}

/// Strip a trailing `#EOF` marker, reporting whether one was present.
fn strip_eof(mut line: Vec<u8>) -> (Vec<u8>, bool) {
    if line.ends_with(b"#EOF\n") {
        line.truncate(line.len() - 5);
        (line, true)
    } else if line.ends_with(b"#EOF") {
        line.truncate(line.len() - 4);
        (line, true)
    } else {
        (line, false)
    }
}

/// Drop the last (possibly partial) line from the buffer.
fn truncate_to_previous_line(buf: &mut Vec<u8>) {
    if buf.is_empty() {
        return;
    }
    let end = buf.len() - 1;
    match buf[..end].iter().rposition(|&b| b == b'\n') {
        Some(idx) if idx > 0 => buf.truncate(idx),
        _ => buf.clear(),
    }
}

fn find_pid(text: &str) -> Option<u32> {
    PID_RE
        .captures(text)
        .and_then(|caps| caps[1].parse().ok())
}

/// Fallback crash log when the OS lookup came up empty; carries as much
/// context as we have.
fn placeholder_crash_log(name: &str, pid: Option<u32>, stdout: &str, stderr: &str) -> String {
    let pid_str = pid.map_or_else(|| "unknown pid".to_string(), |pid| pid.to_string());
    let mut log = format!("No crash log found for {name}:{pid_str}.\n");
    if !stderr.is_empty() {
        log.push_str(&format!("\nstdout:\n{stdout}\nstderr:\n{stderr}\n"));
    }
    log
}

fn split_primary_block(
    block: ContentBlock,
    session: &mut TestSession,
) -> (Option<String>, Option<Vec<u8>>) {
    if let Some(malloc) = block.malloc {
        session.measurements.insert("Malloc".to_string(), malloc);
    }
    if let Some(js_heap) = block.js_heap {
        session.measurements.insert("JSHeap".to_string(), js_heap);
    }
    if block.content_type.as_deref() == Some("audio/wav") {
        (None, Some(block.decoded_content().to_vec()))
    } else {
        (
            Some(String::from_utf8_lossy(block.decoded_content()).into_owned()),
            None,
        )
    }
}

fn split_image_block(block: ContentBlock) -> (Option<Vec<u8>>, Option<String>) {
    if !block.content.is_empty() && block.content_type.as_deref() == Some("image/png") {
        (
            Some(block.decoded_content().to_vec()),
            block.content_hash.clone(),
        )
    } else {
        (None, block.content_hash)
    }
}

fn parse_child_processes(output: &str) -> HashMap<String, Vec<u32>> {
    let mut children: HashMap<String, Vec<u32>> = HashMap::new();
    for line in output.lines() {
        if let Some(caps) = CHILD_PROCESS_RE.captures(line) {
            if let Ok(pid) = caps[2].parse() {
                children.entry(caps[1].to_string()).or_default().push(pid);
            }
        }
    }
    children
}

/// Leaked documents are attributed to the most recently seen `TEST:` line.
fn parse_world_leaks(config: &DriverConfig, output: &str) -> HashMap<String, Vec<String>> {
    let mut leaks: HashMap<String, Vec<String>> = HashMap::new();
    let mut last_test: Option<String> = None;
    for line in output.lines() {
        if let Some(caps) = TEST_LINE_RE.captures(line) {
            match command::uri_to_test(config, &caps[1]) {
                Ok(test) => last_test = Some(test),
                Err(err) => {
                    warn!("ignoring leak report for unrecognized url: {err}");
                    last_test = None;
                }
            }
        } else if let Some(caps) = ABANDONED_LINE_RE.captures(line) {
            if let Some(test) = &last_test {
                leaks.entry(test.clone()).or_default().push(caps[1].to_string());
            }
        }
    }
    leaks
}
