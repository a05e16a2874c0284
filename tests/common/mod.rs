//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use homestead::engine::{CancelToken, Engine};
use homestead::plan::{Plan, Step, Verification};
use homestead::preflight::StaticPreflight;
use homestead::runner::{CommandOutput, CommandRunner, ProcessRunner};
use homestead::store::StateStore;
use homestead::EngineConfig;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub config: EngineConfig,
    pub store: StateStore,
    pub runner: Arc<RecordingRunner>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig::for_dir(dir.path());
        tweak(&mut config);
        let store = StateStore::open(&config.state_db).expect("open store");
        Self {
            dir,
            config,
            store,
            runner: Arc::new(RecordingRunner::default()),
        }
    }

    /// Engine over this harness' store, recording runner and an empty preflight.
    pub fn engine(&self) -> Engine {
        Engine::new(self.store.clone(), self.config.clone())
            .with_runner(self.runner.clone())
            .with_preflight(StaticPreflight::pass())
    }

    /// A second engine with its own connection to the same database.
    pub fn second_engine(&self) -> Engine {
        let store = StateStore::open(&self.config.state_db).expect("open store");
        Engine::new(store, self.config.clone())
            .with_runner(self.runner.clone())
            .with_preflight(StaticPreflight::pass())
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Lines appended to the marker file `name`.
    pub fn marks(&self, name: &str) -> Vec<String> {
        std::fs::read_to_string(self.path(name))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Runs real processes and remembers every argv it was handed.
#[derive(Default)]
pub struct RecordingRunner {
    inner: ProcessRunner,
    calls: Mutex<Vec<Vec<String>>>,
    cancel_on: Mutex<Option<(String, CancelToken)>>,
}

impl RecordingRunner {
    /// Request cancellation right after a command containing `needle` runs.
    pub fn cancel_after(&self, needle: &str, token: CancelToken) {
        *self.cancel_on.lock().expect("lock") = Some((needle.to_string(), token));
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|argv| argv.iter().any(|a| a.contains(needle)))
            .count()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, argv: &[String], timeout: Duration) -> anyhow::Result<CommandOutput> {
        self.calls.lock().expect("lock").push(argv.to_vec());
        let out = self.inner.run(argv, timeout);
        if let Some((needle, token)) = &*self.cancel_on.lock().expect("lock") {
            if argv.iter().any(|a| a.contains(needle.as_str())) {
                token.cancel();
            }
        }
        out
    }
}

pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// `sh -c <script>`
pub fn sh(script: &str) -> Vec<String> {
    argv(&["sh", "-c", script])
}

/// Shell snippet appending `tag` to `file`.
pub fn mark(file: &Path, tag: &str) -> Vec<String> {
    sh(&format!("echo {tag} >> '{}'", file.display()))
}

pub fn step(index: u32, name: &str, command: Vec<String>) -> Step {
    Step {
        index,
        name: name.to_string(),
        description: String::new(),
        command,
        verification: Verification::Command {
            argv: argv(&["true"]),
            expect_output: None,
            timeout_secs: 5,
        },
        rollback_command: None,
        rollback_verification: None,
        requires_elevated_privileges: false,
        retryable: true,
        max_retries: 1,
        timeout: Duration::from_secs(10),
        risky: false,
        backup_paths: Vec::new(),
        error_hint: None,
    }
}

pub fn plan(id: &str, steps: Vec<Step>) -> Plan {
    Plan {
        id: id.to_string(),
        title: format!("{id} plan"),
        steps,
        created_at: chrono::Utc::now(),
    }
}
