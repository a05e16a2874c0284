//! Process lifecycle management for step commands
//!
//! Every step command runs in its own process group so that a timeout, a
//! second interrupt, or the engine process dying takes the whole tree down
//! with it (a `docker compose up` that forks helpers, a package manager that
//! spawns hooks).
//!
//! - Children are spawned with PGID = child PID and `PR_SET_PDEATHSIG`
//! - Live child PIDs are tracked in a global registry
//! - Termination is SIGTERM to the group, a grace period, then SIGKILL
//! - Address-space and CPU ceilings are set before exec

use crate::config::ResourceLimits;
use nix::libc;
use nix::sys::resource::{Resource, getrlimit, setrlimit};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Registry tracking all spawned child processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    /// Set once `terminate_all` has run, so a second signal does not redo it
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!(pid, "registered child process");
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!(pid, "unregistered child process");
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate every tracked process group. Runs at most once.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            debug!("child cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            return;
        }

        info!(count = self.pids.len(), "terminating child process groups");
        let pids: Vec<u32> = self.pids.drain().collect();
        terminate_groups(&pids, grace_period);
    }
}

/// Terminate a single process group led by `pgid`.
///
/// Returns `true` if SIGKILL was needed.
pub fn terminate_group(pgid: u32, grace_period: Duration) -> bool {
    terminate_groups(&[pgid], grace_period)
}

fn terminate_groups(pgids: &[u32], grace_period: Duration) -> bool {
    for &pgid in pgids {
        if let Err(e) = send_signal_to_group(pgid, Signal::SIGTERM) {
            debug!(pgid, error = %e, "group SIGTERM failed, signalling leader");
            let _ = send_signal(pgid, Signal::SIGTERM);
        }
    }

    let start = Instant::now();
    while start.elapsed() < grace_period {
        if pgids.iter().all(|&pid| !is_process_alive(pid)) {
            debug!("process groups exited within grace period");
            return false;
        }
        std::thread::sleep(Duration::from_millis(25));
    }

    let mut killed = false;
    for &pgid in pgids {
        if is_process_alive(pgid) {
            warn!(pgid, "process group ignored SIGTERM, sending SIGKILL");
            killed = true;
            if let Err(e) = send_signal_to_group(pgid, Signal::SIGKILL) {
                error!(pgid, error = %e, "failed to SIGKILL process group");
                let _ = send_signal(pgid, Signal::SIGKILL);
            }
        }
    }
    killed
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Negative PID signals every process in the group
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Check if a process is still alive (zombies count as dead)
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/<pid>/stat is the state letter
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        if let Some(rest) = stat.rsplit_once(')').map(|(_, r)| r) {
            if let Some(state) = rest.split_whitespace().next() {
                return !matches!(state, "Z" | "X");
            }
        }
    }

    true
}

/// RAII guard that terminates all registered children on drop
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
    grace_period: Duration,
}

impl ProcessGuard {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            registry: ChildRegistry::global(),
            grace_period,
        }
    }

    pub fn child_count(&self) -> usize {
        self.registry.lock().map(|r| r.count()).unwrap_or(0)
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        debug!("ProcessGuard dropped, initiating cleanup");
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(self.grace_period);
        }
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handling.
///
/// The first signal calls `on_first` (cooperative cancellation). A second
/// signal terminates every registered child group and exits with
/// `128 + signal`.
pub fn init_signal_handlers<F>(grace_period: Duration, on_first: F) -> std::io::Result<()>
where
    F: Fn(i32) + Send + 'static,
{
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::Builder::new()
        .name("signal-handler".into())
        .spawn(move || {
            let mut received = 0u32;
            for sig in signals.forever() {
                received += 1;
                let name = match sig {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    SIGHUP => "SIGHUP",
                    _ => "UNKNOWN",
                };

                if received == 1 {
                    warn!(
                        signal = name,
                        "cancellation requested; stopping at the next step boundary (signal again to abort)"
                    );
                    on_first(sig);
                    continue;
                }

                error!(signal = name, "second signal received, killing child processes");
                if let Ok(mut registry) = ChildRegistry::global().lock() {
                    registry.terminate_all(grace_period);
                }
                std::process::exit(128 + sig);
            }
        })?;

    Ok(())
}

/// Extension trait for `std::process::Command` to set up process groups
pub trait CommandProcessGroup {
    /// Run the command as leader of a new process group that dies with us.
    fn in_new_process_group(&mut self) -> &mut Self;

    /// Lower the child's RLIMIT_AS and RLIMIT_CPU soft limits. Never raises a
    /// limit above the inherited hard limit; failures leave the limit as is.
    fn with_resource_limits(&mut self, limits: ResourceLimits) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls run between fork and exec.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }

    fn with_resource_limits(&mut self, limits: ResourceLimits) -> &mut Self {
        use std::os::unix::process::CommandExt;
        let wanted = [
            (Resource::RLIMIT_AS, limits.address_space_bytes),
            (Resource::RLIMIT_CPU, limits.cpu_secs),
        ];
        // SAFETY: getrlimit and setrlimit are plain syscalls.
        unsafe {
            self.pre_exec(move || {
                for (resource, value) in wanted {
                    let Some(value) = value else { continue };
                    if let Ok((_, hard)) = getrlimit(resource) {
                        let soft = (value as libc::rlim_t).min(hard);
                        let _ = setrlimit(resource, soft, hard);
                    }
                }
                Ok(())
            });
        }
        self
    }
}
