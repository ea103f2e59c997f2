//! WebTest harness entry point
//!
//! Drives the out-of-process runner over a list of test names and writes a
//! JSON summary. Test discovery and expectation matching live upstream; this
//! binary only executes what it is given.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use webtest_driver::{DriverConfig, DriverInput, DriverProxy};

#[derive(Parser, Debug)]
#[command(name = "webtest-harness")]
#[command(about = "Runs web tests through the out-of-process runner")]
struct Args {
    /// Test names (relative to the tests root) or URLs
    tests: Vec<String>,

    /// File with one test name per line
    #[arg(long)]
    tests_file: Option<PathBuf>,

    /// Path to the runner binary
    #[arg(long, default_value = "target/debug/webtest-runner")]
    runner: PathBuf,

    /// Root directory containing the tests
    #[arg(long, default_value = "webtests")]
    tests_root: PathBuf,

    /// Per-test timeout in milliseconds
    #[arg(long, default_value = "30000")]
    timeout_ms: u64,

    /// Run pixel tests
    #[arg(long)]
    pixel_tests: bool,

    /// Disable the per-test deadline (for debugging the runner)
    #[arg(long)]
    no_timeout: bool,

    /// Check for world leaks after the run
    #[arg(long)]
    world_leaks: bool,

    /// Gather child process ids after the run
    #[arg(long)]
    leaks: bool,

    /// Worker number, used for temp-dir isolation
    #[arg(long, default_value = "0")]
    worker: usize,

    /// Extra argument passed to the runner (repeatable)
    #[arg(long = "runner-arg")]
    runner_args: Vec<String>,

    /// Output directory for results
    #[arg(short, long, default_value = "test-results")]
    output: PathBuf,
}

#[derive(Debug, Serialize)]
struct TestResult {
    name: String,
    ok: bool,
    crash: bool,
    timeout: bool,
    duration_ms: u64,
    crashed_process_name: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SuiteResult {
    total: usize,
    ok: usize,
    crashes: usize,
    timeouts: usize,
    duration_ms: u64,
    results: Vec<TestResult>,
    world_leaks: std::collections::HashMap<String, Vec<String>>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
    match rt.block_on(run(args)) {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("Error: {err:#}");
            std::process::exit(2);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<bool> {
    let tests = collect_tests(&args)?;
    if tests.is_empty() {
        bail!("no tests given; pass test names or --tests-file");
    }

    let config = DriverConfig {
        runner_path: args.runner,
        tests_root: args.tests_root,
        worker_number: args.worker,
        no_timeout: args.no_timeout,
        check_world_leaks: args.world_leaks,
        gather_child_processes: args.leaks,
        additional_args: args.runner_args,
        ..DriverConfig::default()
    };

    let mut proxy = DriverProxy::new(config);
    let start = Instant::now();
    let mut results = Vec::new();

    info!("Running {} test(s)...", tests.len());

    for (index, name) in tests.iter().enumerate() {
        let mut input = DriverInput::new(name.clone(), args.timeout_ms);
        if args.pixel_tests {
            input = input.with_pixel_test(None);
        }

        let stop_when_done = index + 1 == tests.len();
        let output = proxy.run_test(&input, stop_when_done).await?;

        let ok = !output.crash && !output.timeout;
        let duration_ms = output.test_time.as_millis() as u64;
        if ok {
            info!("✓ {} ({} ms)", name, duration_ms);
        } else if output.crash {
            error!(
                "✗ {} - {} crashed",
                name,
                output.crashed_process_name.as_deref().unwrap_or("runner")
            );
        } else {
            error!("✗ {} - timed out", name);
        }

        results.push(TestResult {
            name: name.clone(),
            ok,
            crash: output.crash,
            timeout: output.timeout,
            duration_ms,
            crashed_process_name: output.crashed_process_name.clone(),
            error: output.has_stderr().then(|| output.error.clone()),
        });
    }

    let diagnostics = proxy.do_post_tests_work().await?;
    proxy.stop().await;

    let crashes = results.iter().filter(|r| r.crash).count();
    let timeouts = results.iter().filter(|r| r.timeout).count();
    let ok = results.iter().filter(|r| r.ok).count();

    let suite = SuiteResult {
        total: results.len(),
        ok,
        crashes,
        timeouts,
        duration_ms: start.elapsed().as_millis() as u64,
        results,
        world_leaks: diagnostics.map(|d| d.world_leaks).unwrap_or_default(),
    };

    for (test, documents) in &suite.world_leaks {
        error!("world leak in {}: {} abandoned document(s)", test, documents.len());
    }

    info!(
        "Results: {} ok, {} crashed, {} timed out ({} ms)",
        suite.ok, suite.crashes, suite.timeouts, suite.duration_ms
    );

    write_results(&args.output, &suite)?;
    Ok(suite.crashes == 0 && suite.timeouts == 0 && suite.world_leaks.is_empty())
}

fn collect_tests(args: &Args) -> anyhow::Result<Vec<String>> {
    let mut tests = args.tests.clone();
    if let Some(path) = &args.tests_file {
        let listing = std::fs::read_to_string(path)
            .with_context(|| format!("reading tests file {}", path.display()))?;
        tests.extend(
            listing
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    Ok(tests)
}

fn write_results(output_dir: &PathBuf, suite: &SuiteResult) -> anyhow::Result<()> {
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join("test-results.json");
    let json = serde_json::to_string_pretty(suite)?;
    std::fs::write(&path, json)?;
    info!("Results written to: {}", path.display());
    Ok(())
}
