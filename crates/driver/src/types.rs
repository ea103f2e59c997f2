//! Inputs and outputs of a single test execution

use std::collections::HashMap;
use std::time::Duration;

/// Everything the driver needs to run one test. Immutable once built; one
/// instance per test execution.
#[derive(Debug, Clone)]
pub struct DriverInput {
    /// Test name relative to the tests root, or a full URL.
    pub test_name: String,

    /// Per-test timeout in milliseconds.
    pub timeout_ms: u64,

    /// Expected pixel hash. Only legal when `should_run_pixel_test` is set.
    pub image_hash: Option<String>,

    /// Ask the runner to produce a pixel dump for this test.
    pub should_run_pixel_test: bool,

    /// Ask the runner to copy the JS console log onto stderr.
    pub should_dump_jsconsolelog_in_stderr: bool,

    /// Extra runner arguments for this test. A change in this set forces a
    /// driver restart (see `DriverProxy`).
    pub extra_args: Vec<String>,
}

impl DriverInput {
    pub fn new(test_name: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            test_name: test_name.into(),
            timeout_ms,
            image_hash: None,
            should_run_pixel_test: false,
            should_dump_jsconsolelog_in_stderr: false,
            extra_args: Vec::new(),
        }
    }

    pub fn with_pixel_test(mut self, image_hash: Option<String>) -> Self {
        self.should_run_pixel_test = true;
        self.image_hash = image_hash;
        self
    }
}

/// Everything the runner produced for one test. Produced exactly once per
/// `run_test` call and never mutated afterward.
#[derive(Debug, Clone, Default)]
pub struct DriverOutput {
    /// Decoded text output. `None` when the test produced audio instead.
    pub text: Option<String>,

    /// Decoded pixel dump, when the runner emitted one.
    pub image: Option<Vec<u8>>,

    /// Hash of the actual image, as reported by the runner.
    pub image_hash: Option<String>,

    /// Decoded audio payload for audio tests.
    pub audio: Option<Vec<u8>>,

    pub crash: bool,
    pub crashed_process_name: Option<String>,
    pub crashed_pid: Option<u32>,

    /// Always present when `crash` is set; a synthesized placeholder when no
    /// OS crash log could be found.
    pub crash_log: Option<String>,

    pub test_time: Duration,

    /// In-band measurements (`Malloc`, `JSHeap`) reported by the runner.
    pub measurements: HashMap<String, f64>,

    pub timeout: bool,

    /// Accumulated stderr output.
    pub error: String,

    /// Pid of the runner process that executed this test.
    pub pid: Option<u32>,
}

impl DriverOutput {
    pub fn has_stderr(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Diagnostics gathered after a batch of tests, via the `#LIST CHILD
/// PROCESSES` and `#CHECK FOR WORLD LEAKS` directives.
#[derive(Debug, Clone, Default)]
pub struct DriverPostTestOutput {
    /// Process name -> pids of live child processes.
    pub child_processes: HashMap<String, Vec<u32>>,

    /// Test name -> leaked document URLs.
    pub world_leaks: HashMap<String, Vec<String>>,
}
