//! Scriptable stand-in for the web test runner, used by the integration
//! suite. Speaks the same stdin/stdout/stderr protocol as the real runner;
//! the `--mode=<name>` argument selects the behavior for each test command.

use std::io::{self, BufRead, Write};

fn main() {
    let mode = std::env::args()
        .find_map(|arg| arg.strip_prefix("--mode=").map(str::to_string))
        .unwrap_or_else(|| "text".to_string());

    let stdin = io::stdin();
    let mut last_path = String::new();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.is_empty() || line == "#SAMPLE FINISHED" {
            continue;
        }
        if line == "#LIST CHILD PROCESSES" {
            emit_child_processes();
            continue;
        }
        if line == "#CHECK FOR WORLD LEAKS" {
            emit_world_leaks(&last_path);
            continue;
        }

        let command = TestCommand::parse(&line);
        last_path = command.path.clone();
        run_one_test(&mode, &command);
    }

    if mode == "trailing" {
        // Late output after stdin closes; a correct driver appends this to
        // the test's text/error rather than discarding it.
        out(b"late stdout\n");
        err(b"late stderr\n");
    }
}

/// One stdin command: apostrophe-separated path, options, optional hash.
struct TestCommand {
    path: String,
    pixel_test: bool,
    expected_hash: Option<String>,
}

impl TestCommand {
    fn parse(line: &str) -> Self {
        let segments: Vec<&str> = line.split('\'').collect();
        let path = segments.first().copied().unwrap_or("").to_string();
        let pixel_test = segments.iter().any(|s| *s == "--pixel-test");
        let expected_hash = segments
            .iter()
            .skip_while(|s| **s != "--pixel-test")
            .skip(1)
            .find(|s| !s.starts_with("--"))
            .map(|s| s.to_string());
        Self {
            path,
            pixel_test,
            expected_hash,
        }
    }
}

fn out(bytes: &[u8]) {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let _ = handle.write_all(bytes);
    let _ = handle.flush();
}

fn err(bytes: &[u8]) {
    let stderr = io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_all(bytes);
    let _ = handle.flush();
}

/// Empty second block for pixel tests in modes that have no image to dump.
fn finish_streams(command: &TestCommand) {
    if command.pixel_test {
        out(b"#EOF\n");
    }
    err(b"#EOF\n");
}

fn run_one_test(mode: &str, command: &TestCommand) {
    match mode {
        "pixel" => {
            out(b"Content-Type: text/plain\nhello\n#EOF\n");
            let hash = command
                .expected_hash
                .clone()
                .unwrap_or_else(|| "deadbeef".to_string());
            // Payload with embedded newlines and a fake #EOF to prove the
            // exact-length read is binary-safe.
            let payload: &[u8] = b"\x89PNG\n#EOF\nraw\x00bytes\n";
            out(format!("ActualHash: {hash}\n").as_bytes());
            out(b"Content-Type: image/png\n");
            out(format!("Content-Length: {}\n", payload.len()).as_bytes());
            out(payload);
            out(b"#EOF\n");
            err(b"#EOF\n");
        }
        "audio" => {
            out(b"Content-Type: audio/wav\nContent-Transfer-Encoding: base64\nUklGRg==\n#EOF\n");
            finish_streams(command);
        }
        "measurements" => {
            out(b"Content-Type: text/plain\nDumpMalloc: 2048\nDumpJSHeap: 4096.5\nhello\n#EOF\n");
            finish_streams(command);
        }
        "crash" => {
            out(b"partial output\n");
            err(b"#CRASHED - WebProcess\n");
            err(b"pid 4242\n");
            err(b"#EOF\n");
            std::process::exit(1);
        }
        "crash-inline" => {
            err(b"#CRASHED - WebProcess pid 4242\n");
            std::process::exit(1);
        }
        "crash-bare" => {
            err(b"#CRASHED\n");
            std::process::exit(1);
        }
        "hang" => {
            err(b"#PROCESS UNRESPONSIVE - WebProcess pid 777\n");
            out(b"Content-Type: text/plain\nhello\n#EOF\n");
            finish_streams(command);
        }
        "inband-timeout" => {
            out(b"FAIL: Timed out waiting for notifyDone to be called\n#EOF\n");
            finish_streams(command);
        }
        "asan" => {
            out(b"Content-Type: text/plain\nhello\n#EOF\n");
            err(b"noise\n");
            err(b"=================================================================\n");
            err(b"==1234==ERROR: AddressSanitizer: heap-use-after-free on address 0x0001\n");
            err(b"READ of size 8 at 0x0001 thread T0\n");
            err(b"#EOF\n");
        }
        "silent" => {
            std::thread::sleep(std::time::Duration::from_secs(3600));
        }
        // "text" and "trailing" run a plain text test.
        _ => {
            out(b"Content-Type: text/plain\nhello\n#EOF\n");
            finish_streams(command);
        }
    }
}

fn emit_child_processes() {
    out(b"WebProcess: 100\nWebProcess: 101\nNetworkProcess: 200\n#EOF\n");
    err(b"#EOF\n");
}

fn emit_world_leaks(last_path: &str) {
    out(format!(
        "TEST: file://{last_path}\n\
         ABANDONED DOCUMENT: file:///leaked/doc1\n\
         ABANDONED DOCUMENT: file:///leaked/doc2\n\
         #EOF\n"
    )
    .as_bytes());
    err(b"#EOF\n");
}
