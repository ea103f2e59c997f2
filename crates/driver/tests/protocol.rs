//! End-to-end exercises of the driver protocol against the mock runner.
//!
//! The mock runner binary speaks the real wire protocol; `--mode=<name>`
//! selects the scenario for each test command.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use webtest_driver::{
    CrashMonitor, Driver, DriverConfig, DriverInput, DriverProxy,
};

fn config(mode: &str) -> DriverConfig {
    DriverConfig {
        runner_path: PathBuf::from(env!("CARGO_BIN_EXE_mock-runner")),
        tests_root: PathBuf::from("/webtests"),
        timeout_grace: Duration::from_millis(500),
        stop_timeout: Duration::from_secs(2),
        additional_args: vec![format!("--mode={mode}")],
        ..DriverConfig::default()
    }
}

fn input(name: &str) -> DriverInput {
    DriverInput::new(name, 4000)
}

#[derive(Debug, Default)]
struct RecordingMonitor {
    samples: Mutex<Vec<(String, Option<u32>)>>,
}

impl CrashMonitor for RecordingMonitor {
    fn sample_process(&self, process_name: &str, pid: Option<u32>) {
        self.samples
            .lock()
            .unwrap()
            .push((process_name.to_string(), pid));
    }
}

#[derive(Debug)]
struct CannedLogMonitor;

impl CrashMonitor for CannedLogMonitor {
    fn find_crash_log(&self, process_name: &str, _pid: Option<u32>) -> Option<String> {
        Some(format!("canned log for {process_name}"))
    }
}

#[tokio::test]
async fn plain_text_test_round_trip() {
    let mut driver = Driver::new(config("text"));
    let output = driver.run_test(&input("fast/a.html"), false).await.unwrap();

    assert_eq!(output.text.as_deref(), Some("hello\n"));
    assert!(!output.crash);
    assert!(!output.timeout);
    assert!(output.image.is_none());
    assert!(output.audio.is_none());
    assert_eq!(output.error, "");
    assert!(output.pid.is_some());
    driver.stop().await;
}

#[tokio::test]
async fn driver_reuses_process_between_tests() {
    let mut driver = Driver::new(config("text"));
    let first = driver.run_test(&input("fast/a.html"), false).await.unwrap();
    let second = driver.run_test(&input("fast/b.html"), false).await.unwrap();

    assert_eq!(first.pid, second.pid);
    assert_eq!(second.text.as_deref(), Some("hello\n"));
    driver.stop().await;
}

#[tokio::test]
async fn pixel_test_recovers_image_and_hash() {
    let mut driver = Driver::new(config("pixel"));
    let request = input("fast/a.html").with_pixel_test(Some("f00d".to_string()));
    let output = driver.run_test(&request, true).await.unwrap();

    assert_eq!(output.text.as_deref(), Some("hello\n"));
    assert_eq!(
        output.image.as_deref(),
        Some(b"\x89PNG\n#EOF\nraw\x00bytes\n".as_slice())
    );
    assert_eq!(output.image_hash.as_deref(), Some("f00d"));
    assert!(!output.crash);
    assert!(!output.timeout);
}

#[tokio::test]
async fn pixel_test_tolerates_missing_image() {
    let mut driver = Driver::new(config("text"));
    let request = input("fast/a.html").with_pixel_test(None);
    let output = driver.run_test(&request, true).await.unwrap();

    assert_eq!(output.text.as_deref(), Some("hello\n"));
    assert!(output.image.is_none());
    assert!(output.image_hash.is_none());
    assert!(!output.crash);
}

#[tokio::test]
async fn audio_test_returns_audio_not_text() {
    let mut driver = Driver::new(config("audio"));
    let output = driver.run_test(&input("fast/a.html"), true).await.unwrap();

    assert!(output.text.is_none());
    assert_eq!(output.audio.as_deref(), Some(b"RIFF".as_slice()));
}

#[tokio::test]
async fn measurement_headers_populate_measurements() {
    let mut driver = Driver::new(config("measurements"));
    let output = driver.run_test(&input("fast/a.html"), true).await.unwrap();

    assert_eq!(output.measurements.get("Malloc"), Some(&2048.0));
    assert_eq!(output.measurements.get("JSHeap"), Some(&4096.5));
    assert_eq!(output.text.as_deref(), Some("hello\n"));
}

#[tokio::test]
async fn crash_with_pid_on_following_line() {
    let mut driver = Driver::new(config("crash"));
    let output = driver.run_test(&input("fast/a.html"), false).await.unwrap();

    assert!(output.crash);
    assert!(!output.timeout);
    assert_eq!(output.crashed_process_name.as_deref(), Some("WebProcess"));
    assert_eq!(output.crashed_pid, Some(4242));
    let log = output.crash_log.expect("crash must always carry a log");
    assert!(log.starts_with("No crash log found for WebProcess:4242."));
}

#[tokio::test]
async fn crash_with_inline_pid() {
    let mut driver = Driver::new(config("crash-inline"));
    let output = driver.run_test(&input("fast/a.html"), false).await.unwrap();

    assert!(output.crash);
    assert_eq!(output.crashed_process_name.as_deref(), Some("WebProcess"));
    assert_eq!(output.crashed_pid, Some(4242));
    assert!(output.crash_log.is_some());
}

#[tokio::test]
async fn bare_crash_sentinel_names_the_runner() {
    let mut driver = Driver::new(config("crash-bare"));
    let output = driver.run_test(&input("fast/a.html"), false).await.unwrap();

    assert!(output.crash);
    assert_eq!(output.crashed_process_name.as_deref(), Some("mock-runner"));
    assert_eq!(output.crashed_pid, output.pid);
    assert!(output.crash_log.is_some());
}

#[tokio::test]
async fn os_crash_log_wins_over_placeholder() {
    let mut cfg = config("crash");
    cfg.monitor = Arc::new(CannedLogMonitor);
    let mut driver = Driver::new(cfg);
    let output = driver.run_test(&input("fast/a.html"), false).await.unwrap();

    assert!(output.crash);
    assert_eq!(output.crash_log.as_deref(), Some("canned log for WebProcess"));
}

#[tokio::test]
async fn silent_runner_times_out() {
    let mut driver = Driver::new(config("silent"));
    let output = driver
        .run_test(&DriverInput::new("fast/a.html", 200), false)
        .await
        .unwrap();

    assert!(output.timeout);
    assert!(!output.crash);
}

#[tokio::test]
async fn in_band_timeout_keeps_the_runner_alive() {
    let mut driver = Driver::new(config("inband-timeout"));
    let output = driver.run_test(&input("fast/a.html"), false).await.unwrap();

    assert!(output.timeout);
    assert!(!output.crash);
    // Tool-detected timeouts do not cost us the process.
    assert!(driver.pid().is_some());
    driver.stop().await;
}

#[tokio::test]
async fn hang_sentinel_samples_child_and_continues() {
    let monitor = Arc::new(RecordingMonitor::default());
    let mut cfg = config("hang");
    cfg.monitor = monitor.clone();
    let mut driver = Driver::new(cfg);
    let output = driver.run_test(&input("fast/a.html"), false).await.unwrap();

    // The hang is non-fatal: the run is marked timed out but still delivers
    // the text that followed the sentinel.
    assert!(output.timeout);
    assert!(!output.crash);
    assert_eq!(output.text.as_deref(), Some("hello\n"));
    assert!(output.error.contains("#PROCESS UNRESPONSIVE - WebProcess"));
    assert_eq!(
        monitor.samples.lock().unwrap().as_slice(),
        &[("WebProcess".to_string(), Some(777))]
    );
}

#[tokio::test]
async fn sanitizer_violation_reroutes_stderr() {
    let mut driver = Driver::new(config("asan"));
    let output = driver.run_test(&input("fast/a.html"), false).await.unwrap();

    assert!(output.crash);
    // Pre-banner noise stays in error, truncated to the last line boundary.
    assert_eq!(output.error, "noise");
    let log = output.crash_log.expect("sanitizer report is the crash log");
    assert!(log.contains("ERROR: AddressSanitizer: heap-use-after-free"));
    assert!(log.contains("READ of size 8"));
    assert!(!output.error.contains("AddressSanitizer"));
}

#[tokio::test]
async fn trailing_output_is_captured_on_stop() {
    let mut driver = Driver::new(config("trailing"));
    let output = driver.run_test(&input("fast/a.html"), true).await.unwrap();

    assert_eq!(output.text.as_deref(), Some("hello\nlate stdout\n"));
    assert!(output.error.contains("late stderr"));
}

#[tokio::test]
async fn post_test_queries_parse_children_and_leaks() {
    let mut cfg = config("text");
    cfg.gather_child_processes = true;
    cfg.check_world_leaks = true;
    let mut driver = Driver::new(cfg);
    driver.run_test(&input("fast/a.html"), false).await.unwrap();

    let diagnostics = driver
        .do_post_tests_work()
        .await
        .unwrap()
        .expect("queries were enabled");

    assert_eq!(diagnostics.child_processes["WebProcess"], vec![100, 101]);
    assert_eq!(diagnostics.child_processes["NetworkProcess"], vec![200]);
    assert_eq!(
        diagnostics.world_leaks["fast/a.html"],
        vec!["file:///leaked/doc1", "file:///leaked/doc2"]
    );
    driver.stop().await;
}

#[tokio::test]
async fn post_test_queries_disabled_yield_nothing() {
    let mut driver = Driver::new(config("text"));
    driver.run_test(&input("fast/a.html"), false).await.unwrap();
    assert!(driver.do_post_tests_work().await.unwrap().is_none());
    driver.stop().await;
}

#[tokio::test]
async fn proxy_replaces_driver_when_pixel_mode_flips() {
    let mut proxy = DriverProxy::new(config("text"));

    let first = proxy.run_test(&input("fast/a.html"), false).await.unwrap();
    let second = proxy
        .run_test(&input("fast/b.html").with_pixel_test(None), false)
        .await
        .unwrap();
    let third = proxy.run_test(&input("fast/c.html"), false).await.unwrap();

    // Each mode flip fully tears down the previous runner process.
    assert_ne!(first.pid, second.pid);
    assert_ne!(second.pid, third.pid);
    assert_eq!(third.text.as_deref(), Some("hello\n"));
    proxy.stop().await;
}

#[tokio::test]
async fn proxy_reuses_driver_for_matching_mode() {
    let mut proxy = DriverProxy::new(config("text"));
    let first = proxy.run_test(&input("fast/a.html"), false).await.unwrap();
    let second = proxy.run_test(&input("fast/b.html"), false).await.unwrap();
    assert_eq!(first.pid, second.pid);
    proxy.stop().await;
}

#[tokio::test]
async fn extra_args_change_forces_restart() {
    let mut proxy = DriverProxy::new(config("text"));
    let first = proxy.run_test(&input("fast/a.html"), false).await.unwrap();

    let mut with_args = input("fast/b.html");
    with_args.extra_args = vec!["--enable-feature".to_string()];
    let second = proxy.run_test(&with_args, false).await.unwrap();

    assert_ne!(first.pid, second.pid);
    proxy.stop().await;
}
