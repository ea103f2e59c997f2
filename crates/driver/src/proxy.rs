//! Driver lifecycle management
//!
//! A runner process is spawned for one `(pixel-test mode, per-test args)`
//! combination and cannot be reconfigured in place. The proxy hides that:
//! callers see a single `run_test`, and the proxy tears down and replaces
//! the driver whenever the required combination changes.

use tracing::debug;

use crate::driver::{Driver, DriverConfig};
use crate::error::DriverResult;
use crate::types::{DriverInput, DriverOutput, DriverPostTestOutput};

#[derive(Debug, Clone, PartialEq, Eq)]
struct DriverKey {
    pixel_tests: bool,
    per_test_args: Vec<String>,
}

/// Owns at most one live [`Driver`] at a time.
pub struct DriverProxy {
    config: DriverConfig,
    driver: Option<Driver>,
    key: Option<DriverKey>,
}

impl DriverProxy {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            driver: None,
            key: None,
        }
    }

    /// Pid of the live runner, if any.
    pub fn pid(&self) -> Option<u32> {
        self.driver.as_ref().and_then(Driver::pid)
    }

    /// Run one test. When the pixel-test mode or per-test argument set
    /// differs from the live driver's, the old driver is fully stopped
    /// before a replacement is constructed; there is never more than one
    /// live runner process per proxy.
    pub async fn run_test(
        &mut self,
        input: &DriverInput,
        stop_when_done: bool,
    ) -> DriverResult<DriverOutput> {
        let key = DriverKey {
            pixel_tests: input.should_run_pixel_test,
            per_test_args: input.extra_args.clone(),
        };
        if self.key.as_ref() != Some(&key) {
            if let Some(mut old) = self.driver.take() {
                debug!(
                    pixel_tests = key.pixel_tests,
                    "driver mode changed, replacing driver"
                );
                old.stop().await;
            }
            self.key = Some(key);
        }
        let driver = self
            .driver
            .get_or_insert_with(|| Driver::new(self.config.clone()));
        driver.run_test(input, stop_when_done).await
    }

    /// Post-test diagnostics from the live driver, if any.
    pub async fn do_post_tests_work(&mut self) -> DriverResult<Option<DriverPostTestOutput>> {
        match self.driver.as_mut() {
            Some(driver) => driver.do_post_tests_work().await,
            None => Ok(None),
        }
    }

    /// Stop and discard the live driver.
    pub async fn stop(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.stop().await;
        }
        self.key = None;
    }
}
