//! Command execution
//!
//! [`ProcessRunner`] is the only place step commands are spawned. Every child:
//!
//! - runs from an argument vector (no shell interpolation)
//! - leads its own process group (see [`crate::process_guard`])
//! - is registered with the global [`ChildRegistry`] while alive
//! - has stdout/stderr drained concurrently into bounded buffers
//!
//! On timeout the whole group gets SIGTERM, then SIGKILL after the grace
//! period.

use crate::config::ResourceLimits;
use crate::process_guard::{ChildRegistry, CommandProcessGroup, terminate_group};
use crate::redact;
use anyhow::{Context, Result, anyhow, bail};
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured result of one command invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// None when killed by a signal
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
    /// Bytes dropped from the front of stdout/stderr
    pub truncated: usize,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr, for excerpts and advisor matching
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }

    /// Short human reason for a non-successful run
    pub fn failure_reason(&self, timeout: Duration) -> String {
        if self.timed_out {
            return format!("timed out after {}s", timeout.as_secs());
        }
        let tail = self
            .stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .or_else(|| self.stdout.lines().rev().find(|l| !l.trim().is_empty()))
            .unwrap_or("");
        let tail = redact::redact(tail.trim());
        match self.exit_code {
            Some(code) if tail.is_empty() => format!("exit code {code}"),
            Some(code) => format!("exit code {code}: {tail}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Seam between the engine and the host.
pub trait CommandRunner: Send + Sync {
    /// Run `argv` to completion or until `timeout`. An `Err` means the command
    /// could not be started or observed at all.
    fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    output_limit_bytes: usize,
    kill_grace: Duration,
    limits: ResourceLimits,
}

impl ProcessRunner {
    pub fn new(output_limit_bytes: usize, kill_grace: Duration) -> Self {
        Self {
            output_limit_bytes: output_limit_bytes.max(1024),
            kill_grace,
            limits: ResourceLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(64 * 1024, Duration::from_secs(5))
    }
}

impl CommandRunner for ProcessRunner {
    #[instrument(skip_all, fields(program = argv.first().map(String::as_str), timeout_secs = timeout.as_secs()))]
    fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput> {
        let Some((program, args)) = argv.split_first() else {
            bail!("empty argument vector");
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .with_resource_limits(self.limits);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", redact::command_summary(argv)))?;
        let pid = child.id();
        register(pid);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let limit = self.output_limit_bytes;
        let (tx, rx) = mpsc::channel();
        let tx_err = tx.clone();
        thread::spawn(move || {
            let _ = tx.send((true, read_tail_limited(stdout, limit)));
        });
        thread::spawn(move || {
            let _ = tx_err.send((false, read_tail_limited(stderr, limit)));
        });

        let mut timed_out = false;
        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(pid, timeout_secs = timeout.as_secs(), "command timed out, terminating process group");
                timed_out = true;
                terminate_group(pid, self.kill_grace);
                child.wait().context("wait for command after kill")?
            }
            Err(e) => {
                terminate_group(pid, self.kill_grace);
                unregister(pid);
                return Err(e).context("wait for command");
            }
        };

        // Leftover group members may still hold our pipes open.
        let mut collected = Vec::with_capacity(2);
        let drain_wait = self.kill_grace.max(Duration::from_millis(200));
        let mut deadline = Instant::now() + drain_wait;
        let mut killed_leftovers = false;
        while collected.len() < 2 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(item) => collected.push(item),
                Err(mpsc::RecvTimeoutError::Timeout) if !killed_leftovers => {
                    debug!(pid, "output still open after exit, terminating leftover group members");
                    terminate_group(pid, self.kill_grace);
                    killed_leftovers = true;
                    deadline = Instant::now() + drain_wait;
                }
                Err(_) => break,
            }
        }
        unregister(pid);

        let mut output = CommandOutput {
            exit_code: status.code(),
            timed_out,
            duration: started.elapsed(),
            ..CommandOutput::default()
        };
        for (is_stdout, result) in collected {
            let (bytes, dropped) = result?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            output.truncated += dropped;
            if is_stdout {
                output.stdout = text;
            } else {
                output.stderr = text;
            }
        }

        debug!(
            exit_code = ?output.exit_code,
            timed_out,
            elapsed_ms = output.duration.as_millis() as u64,
            "command finished"
        );
        Ok(output)
    }
}

fn register(pid: u32) {
    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid);
    }
}

fn unregister(pid: u32) {
    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }
}

/// Drain `reader` keeping only the last `limit` bytes.
fn read_tail_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > limit * 2 {
            let excess = buf.len() - limit;
            buf.drain(..excess);
            dropped += excess;
        }
    }
    if buf.len() > limit {
        let excess = buf.len() - limit;
        buf.drain(..excess);
        dropped += excess;
    }
    Ok((buf, dropped))
}
