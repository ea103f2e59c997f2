//! Test command encoding and test-name <-> URI mapping
//!
//! The runner parses its stdin commands positionally: segments are joined
//! with a single apostrophe, and the whole command is terminated by one
//! newline. This framing is bit-exact and must not be reordered.

use std::path::PathBuf;

use crate::driver::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::types::DriverInput;

const HTTP_DIR: &str = "http/tests/";
const HTTP_LOCAL_DIR: &str = "http/tests/local/";

/// Tests under `http/tests/` are served over HTTP rather than loaded from
/// disk, except for the `local/` subtree.
pub fn is_http_test(test_name: &str) -> bool {
    test_name.starts_with(HTTP_DIR) && !test_name.starts_with(HTTP_LOCAL_DIR)
}

fn is_secure_path(path: &str) -> bool {
    path.starts_with("ssl") || path.contains(".https.")
}

fn http_base_url(secure: bool) -> &'static str {
    if secure {
        "https://127.0.0.1:8443/"
    } else {
        "http://127.0.0.1:8000/"
    }
}

fn absolute_tests_root(config: &DriverConfig) -> PathBuf {
    if config.tests_root.is_absolute() {
        config.tests_root.clone()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(&config.tests_root)
    }
}

/// Absolute on-disk path of a test.
pub fn abspath_for_test(config: &DriverConfig, test_name: &str) -> PathBuf {
    absolute_tests_root(config).join(test_name)
}

/// Convert a test name to the URI the runner should load.
pub fn test_to_uri(config: &DriverConfig, test_name: &str) -> String {
    if !is_http_test(test_name) {
        return format!("file://{}", abspath_for_test(config, test_name).display());
    }
    let rest = &test_name[HTTP_DIR.len()..];
    format!("{}{}", http_base_url(is_secure_path(rest)), rest)
}

/// Map a URI from runner output back to the test name it was loaded for.
pub fn uri_to_test(config: &DriverConfig, uri: &str) -> DriverResult<String> {
    if let Some(path) = uri.strip_prefix("file://") {
        let mut root = absolute_tests_root(config).display().to_string();
        if !root.ends_with('/') {
            root.push('/');
        }
        return path
            .strip_prefix(&root)
            .map(str::to_string)
            .ok_or_else(|| DriverError::UnknownUrl(uri.to_string()));
    }
    if let Some(rest) = uri.strip_prefix(http_base_url(false)) {
        return Ok(format!("{HTTP_DIR}{rest}"));
    }
    if let Some(rest) = uri.strip_prefix(http_base_url(true)) {
        return Ok(format!("{HTTP_DIR}{rest}"));
    }
    Err(DriverError::UnknownUrl(uri.to_string()))
}

/// Serialize a `DriverInput` into the newline-terminated command line the
/// runner expects. Supplying an image hash without requesting a pixel test
/// is a caller contract violation and fails fast.
pub(crate) fn command_from_input(
    config: &DriverConfig,
    input: &DriverInput,
) -> DriverResult<String> {
    if input.image_hash.is_some() && !input.should_run_pixel_test {
        return Err(DriverError::ImageHashWithoutPixelTest(
            input.test_name.clone(),
        ));
    }

    let mut command = if input.test_name.starts_with("http://")
        || input.test_name.starts_with("https://")
        || input.test_name == "about:blank"
    {
        input.test_name.clone()
    } else if is_http_test(&input.test_name) {
        let mut uri = test_to_uri(config, &input.test_name);
        uri.push_str("'--absolutePath'");
        uri.push_str(&abspath_for_test(config, &input.test_name).to_string_lossy());
        uri
    } else {
        abspath_for_test(config, &input.test_name)
            .to_string_lossy()
            .into_owned()
    };

    if config.per_test_timeout_supported {
        command.push_str(&format!("'--timeout'{}", input.timeout_ms));
    }
    if input.should_run_pixel_test {
        command.push_str("'--pixel-test");
    }
    if input.should_dump_jsconsolelog_in_stderr {
        command.push_str("'--dump-jsconsolelog-in-stderr");
    }
    if let Some(hash) = &input.image_hash {
        command.push('\'');
        command.push_str(hash);
    }
    command.push('\n');
    Ok(command)
}

/// Argv for spawning the runner process. Per-test options travel in the
/// stdin command, not here; the trailing `-` asks the runner to read
/// commands from stdin.
pub(crate) fn runner_command_line(config: &DriverConfig, per_test_args: &[String]) -> Vec<String> {
    let mut cmd = config.wrapper.clone();
    cmd.push(config.runner_path.to_string_lossy().into_owned());
    if config.gc_between_tests {
        cmd.push("--gc-between-tests".to_string());
    }
    if config.threaded {
        cmd.push("--threaded".to_string());
    }
    if config.check_world_leaks {
        cmd.push("--world-leaks".to_string());
    }
    if config.no_timeout {
        cmd.push("--no-timeout".to_string());
    }
    cmd.extend(config.additional_args.iter().cloned());
    cmd.extend(per_test_args.iter().cloned());
    cmd.push("-".to_string());
    cmd
}
