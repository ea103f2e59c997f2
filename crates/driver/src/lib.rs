//! WebTest Driver
//!
//! This crate speaks the I/O protocol between a test harness and the
//! out-of-process web test runner:
//! - Spawns the runner binary with an isolated environment
//! - Sends one encoded test-execution command per test over stdin
//! - Recovers framed output blocks (text, image, audio, diagnostics) from
//!   stdout/stderr under an absolute wall-clock deadline
//! - Classifies crashes, timeouts and hung child processes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  DriverProxy                                                │
//! │    └── run_test(DriverInput)                                │
//! │          restarts the Driver when the pixel-test mode or    │
//! │          per-test argument set changes                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Driver                                                     │
//! │    ├── start() -> ServerProcess (lazy, reused across tests) │
//! │    ├── encoded command -> runner stdin                      │
//! │    ├── read loop: ContentBlock framing + sentinel           │
//! │    │   classification (#EOF, #CRASHED, #PROCESS             │
//! │    │   UNRESPONSIVE, ERROR: AddressSanitizer)               │
//! │    └── DriverOutput (text/image/audio, crash, timeout, ...) │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ServerProcess                                              │
//! │    deadline-bounded line reads from stdout/stderr, exact    │
//! │    binary reads after Content-Length, stop() reaps the      │
//! │    process and returns trailing buffered output             │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod block;
pub mod command;
pub mod driver;
pub mod error;
pub mod monitor;
pub mod process;
pub mod proxy;
pub mod types;

pub use block::ContentBlock;
pub use driver::{Driver, DriverConfig};
pub use error::{DriverError, DriverResult};
pub use monitor::{CrashMonitor, NullCrashMonitor};
pub use process::ServerProcess;
pub use proxy::DriverProxy;
pub use types::{DriverInput, DriverOutput, DriverPostTestOutput};
