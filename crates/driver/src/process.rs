//! Runner process handle with deadline-bounded stream reads
//!
//! Two background tasks pump the child's stdout and stderr into channels as
//! raw newline-delimited chunks (binary-safe). The driver observes them as
//! blocking reads bounded by an absolute deadline; repeated reads within one
//! test naturally shrink the remaining budget. The handle is consumed by
//! `stop()`, which reaps the process and returns trailing buffered output.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{DriverError, DriverResult};

/// Outcome of one attempt to pull more bytes off a stream.
enum Pull {
    Data,
    Eof,
    DeadlinePassed,
}

struct StreamReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    eof: bool,
}

impl StreamReader {
    fn new<R>(source: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut reader = BufReader::new(source);
            loop {
                let mut chunk = Vec::new();
                match reader.read_until(b'\n', &mut chunk).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(chunk).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!("stream read error: {err}");
                        break;
                    }
                }
            }
        });
        Self {
            rx,
            pending: Vec::new(),
            eof: false,
        }
    }

    /// Take one newline-terminated line off the pending buffer, or the
    /// unterminated remainder once the stream has ended.
    fn buffered_line(&mut self) -> Option<Vec<u8>> {
        if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            return Some(std::mem::replace(&mut self.pending, rest));
        }
        if self.eof && !self.pending.is_empty() {
            return Some(std::mem::take(&mut self.pending));
        }
        None
    }

    async fn pull(&mut self, deadline: Instant) -> Pull {
        if self.eof {
            return Pull::Eof;
        }
        match tokio::time::timeout_at(deadline, self.rx.recv()).await {
            Ok(Some(chunk)) => {
                self.pending.extend_from_slice(&chunk);
                Pull::Data
            }
            Ok(None) => {
                self.eof = true;
                Pull::Eof
            }
            Err(_) => Pull::DeadlinePassed,
        }
    }

    fn at_eof(&self) -> bool {
        self.eof && self.pending.is_empty()
    }
}

/// Exclusive handle to one live runner process.
pub struct ServerProcess {
    name: String,
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: StreamReader,
    stderr: StreamReader,
    timed_out: bool,
    crashed: bool,
}

impl ServerProcess {
    /// Spawn the runner. `argv[0]` is the program; the given environment
    /// entries are merged over the inherited environment.
    pub fn spawn(
        name: impl Into<String>,
        argv: &[String],
        env: &[(String, String)],
    ) -> DriverResult<Self> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty runner command line",
            ))
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| DriverError::Spawn {
            path: PathBuf::from(program),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "runner stdout not captured",
            ))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "runner stderr not captured",
            ))
        })?;

        let pid = child.id();
        Ok(Self {
            name: name.into(),
            child,
            pid,
            stdin,
            stdout: StreamReader::new(stdout),
            stderr: StreamReader::new(stderr),
            timed_out: false,
            crashed: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn process_name(&self) -> &str {
        &self.name
    }

    /// True once any read hit the deadline.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// True when the process died while output was still expected. Learned
    /// from unexpected stream end, not by polling the exit status, so lines
    /// the process wrote before dying are never dropped.
    pub fn has_crashed(&self) -> bool {
        self.crashed
    }

    /// Write to the runner's stdin and flush.
    pub async fn write(&mut self, data: &[u8]) -> DriverResult<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "runner stdin closed",
            ))
        })?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Next stdout line, or `None` on deadline expiry or stream end.
    pub async fn read_stdout_line(&mut self, deadline: Instant) -> Option<Vec<u8>> {
        Self::read_line_from(
            &mut self.stdout,
            deadline,
            &mut self.timed_out,
            &mut self.crashed,
        )
        .await
    }

    /// Next stderr line, or `None` on deadline expiry or stream end.
    pub async fn read_stderr_line(&mut self, deadline: Instant) -> Option<Vec<u8>> {
        Self::read_line_from(
            &mut self.stderr,
            deadline,
            &mut self.timed_out,
            &mut self.crashed,
        )
        .await
    }

    async fn read_line_from(
        stream: &mut StreamReader,
        deadline: Instant,
        timed_out: &mut bool,
        crashed: &mut bool,
    ) -> Option<Vec<u8>> {
        loop {
            if let Some(line) = stream.buffered_line() {
                return Some(line);
            }
            if stream.at_eof() {
                *crashed = true;
                return None;
            }
            if let Pull::DeadlinePassed = stream.pull(deadline).await {
                *timed_out = true;
                return None;
            }
        }
    }

    /// Next line from whichever stream produces one first. `(None, None)`
    /// signals deadline expiry or both streams ended.
    pub async fn read_either_line(
        &mut self,
        deadline: Instant,
    ) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
        loop {
            if let Some(line) = self.stdout.buffered_line() {
                return (Some(line), None);
            }
            if let Some(line) = self.stderr.buffered_line() {
                return (None, Some(line));
            }
            if self.stdout.at_eof() && self.stderr.at_eof() {
                self.crashed = true;
                return (None, None);
            }

            let pulled = tokio::select! {
                pulled = self.stdout.pull(deadline), if !self.stdout.eof => pulled,
                pulled = self.stderr.pull(deadline), if !self.stderr.eof => pulled,
            };
            if let Pull::DeadlinePassed = pulled {
                self.timed_out = true;
                return (None, None);
            }
        }
    }

    /// Read exactly `size` raw bytes from stdout, bypassing line framing so
    /// binary payloads may contain embedded newlines. Returns a short buffer
    /// on deadline expiry or stream end.
    pub async fn read_stdout_exact(&mut self, deadline: Instant, size: usize) -> Vec<u8> {
        loop {
            if self.stdout.pending.len() >= size {
                let rest = self.stdout.pending.split_off(size);
                return std::mem::replace(&mut self.stdout.pending, rest);
            }
            if self.stdout.eof {
                self.crashed = true;
                return std::mem::take(&mut self.stdout.pending);
            }
            if let Pull::DeadlinePassed = self.stdout.pull(deadline).await {
                self.timed_out = true;
                return std::mem::take(&mut self.stdout.pending);
            }
        }
    }

    /// Reap the process and return any trailing buffered (stdout, stderr).
    ///
    /// Closing stdin asks a healthy runner to exit on its own within
    /// `timeout`; after that it is sent SIGTERM, then killed.
    pub async fn stop(mut self, timeout: Duration) -> (Vec<u8>, Vec<u8>) {
        debug!(name = %self.name, pid = ?self.pid, "stopping runner process");
        drop(self.stdin.take());

        let mut exited = !timeout.is_zero()
            && tokio::time::timeout(timeout, self.child.wait()).await.is_ok();

        #[cfg(unix)]
        if !exited {
            if let Some(pid) = self.pid {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                exited = tokio::time::timeout(Duration::from_millis(500), self.child.wait())
                    .await
                    .is_ok();
            }
        }

        if !exited {
            warn!(name = %self.name, pid = ?self.pid, "runner did not exit cleanly, killing");
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }

        (
            Self::drain(self.stdout).await,
            Self::drain(self.stderr).await,
        )
    }

    /// Collect whatever the reader task still holds. The pipes are closed by
    /// now, so this terminates quickly; the deadline is a backstop.
    async fn drain(mut stream: StreamReader) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(1);
        while !stream.eof {
            if let Pull::DeadlinePassed = stream.pull(deadline).await {
                break;
            }
        }
        std::mem::take(&mut stream.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ServerProcess {
        ServerProcess::spawn(
            "sh",
            &["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            &[],
        )
        .unwrap()
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn reads_lines_until_eof() {
        let mut process = sh("printf 'one\\ntwo\\n'");
        assert_eq!(
            process.read_stdout_line(soon()).await.as_deref(),
            Some(b"one\n".as_slice())
        );
        assert_eq!(
            process.read_stdout_line(soon()).await.as_deref(),
            Some(b"two\n".as_slice())
        );
        assert_eq!(process.read_stdout_line(soon()).await, None);
        assert!(process.has_crashed());
    }

    #[tokio::test]
    async fn deadline_expiry_sets_timed_out() {
        let mut process = sh("sleep 30");
        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(process.read_stdout_line(deadline).await, None);
        assert!(process.timed_out());
        assert!(!process.crashed);
        process.stop(Duration::ZERO).await;
    }

    #[tokio::test]
    async fn exact_read_spans_newlines() {
        let mut process = sh("printf 'header\\nAB\\nCD\\nrest\\n'");
        assert_eq!(
            process.read_stdout_line(soon()).await.as_deref(),
            Some(b"header\n".as_slice())
        );
        let payload = process.read_stdout_exact(soon(), 6).await;
        assert_eq!(payload, b"AB\nCD\n");
        assert_eq!(
            process.read_stdout_line(soon()).await.as_deref(),
            Some(b"rest\n".as_slice())
        );
    }

    #[tokio::test]
    async fn either_read_sees_both_streams() {
        let mut process = sh("echo out; echo err >&2; sleep 30");
        let mut saw_out = false;
        let mut saw_err = false;
        for _ in 0..2 {
            let (out, err) = process.read_either_line(soon()).await;
            saw_out |= out.as_deref() == Some(b"out\n".as_slice());
            saw_err |= err.as_deref() == Some(b"err\n".as_slice());
        }
        assert!(saw_out && saw_err);
        process.stop(Duration::ZERO).await;
    }

    #[tokio::test]
    async fn stop_returns_trailing_output() {
        // The shell exits once stdin is closed by stop(), printing late output
        // that must be captured rather than discarded.
        let mut process = sh("echo early; read _line; echo late");
        assert_eq!(
            process.read_stdout_line(soon()).await.as_deref(),
            Some(b"early\n".as_slice())
        );
        let (out, _err) = process.stop(Duration::from_secs(2)).await;
        assert_eq!(out, b"late\n");
    }
}
