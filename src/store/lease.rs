//! Advisory per-session lease.
//!
//! At most one executor acts on a session. The lease row records a random
//! holder token, the holder's pid and a heartbeat. A lease is stale when its
//! pid is gone or its heartbeat is older than the TTL; a stale lease is taken
//! over, a live one yields `SessionLocked`.

use super::{StateStore, format_ts, now, parse_ts};
use crate::error::{EngineError, Result};
use crate::process_guard::is_process_alive;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub session_id: String,
    pub holder: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_stale(&self, ttl: Duration, at: DateTime<Utc>) -> bool {
        let age = (at - self.heartbeat_at).to_std().unwrap_or_default();
        age > ttl || !is_process_alive(self.pid)
    }
}

/// Held lease; released on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    store: StateStore,
    session_id: String,
    holder: String,
    released: bool,
    pulse: Option<Pulse>,
}

/// Background heartbeat for a held lease.
#[derive(Debug)]
struct Pulse {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Pulse {
    fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("lease heartbeat thread panicked");
        }
    }
}

impl LeaseGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Refresh the heartbeat. Fails with `SessionLocked` if the lease was lost.
    pub fn heartbeat(&self) -> Result<()> {
        self.store.heartbeat_lease(&self.session_id, &self.holder)
    }

    /// Refresh the heartbeat every `interval` from a background thread until
    /// the guard is released. The thread stops on its own if the lease is lost.
    pub fn keep_alive(&mut self, interval: Duration) {
        if self.pulse.is_some() {
            return;
        }
        let (stop, ticks) = mpsc::channel::<()>();
        let store = self.store.clone();
        let session_id = self.session_id.clone();
        let holder = self.holder.clone();
        let handle = std::thread::spawn(move || {
            loop {
                match ticks.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = store.heartbeat_lease(&session_id, &holder) {
                            warn!(%session_id, error = %e, "lease heartbeat failed");
                            return;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        });
        debug!(session_id = %self.session_id, ?interval, "lease heartbeat started");
        self.pulse = Some(Pulse { stop, handle });
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        if let Some(pulse) = self.pulse.take() {
            pulse.stop();
        }
        self.store.release_lease(&self.session_id, &self.holder)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(pulse) = self.pulse.take() {
            pulse.stop();
        }
        if self.released {
            return;
        }
        if let Err(e) = self.store.release_lease(&self.session_id, &self.holder) {
            warn!(session_id = %self.session_id, error = %e, "failed to release session lease");
        }
    }
}

impl StateStore {
    /// Take the lease for `session_id`, replacing a stale holder.
    pub fn acquire_lease(&self, session_id: &str, ttl: Duration) -> Result<LeaseGuard> {
        let holder = Uuid::new_v4().to_string();
        let pid = std::process::id();
        self.write(|tx| {
            let existing = tx
                .query_row(
                    "SELECT session_id, holder, pid, acquired_at, heartbeat_at \
                     FROM session_leases WHERE session_id = ?1",
                    [session_id],
                    |row| {
                        Ok(Lease {
                            session_id: row.get(0)?,
                            holder: row.get(1)?,
                            pid: row.get(2)?,
                            acquired_at: parse_ts(row, 3, "acquired_at")?,
                            heartbeat_at: parse_ts(row, 4, "heartbeat_at")?,
                        })
                    },
                )
                .optional()?;

            let at = now();
            if let Some(lease) = existing {
                if !lease.is_stale(ttl, at) {
                    debug!(session_id, holder_pid = lease.pid, "session lease is held");
                    return Err(EngineError::SessionLocked {
                        session_id: session_id.to_string(),
                    });
                }
                info!(
                    session_id,
                    stale_pid = lease.pid,
                    "taking over stale session lease"
                );
            }

            tx.execute(
                "INSERT OR REPLACE INTO session_leases (session_id, holder, pid, acquired_at, heartbeat_at) \
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![session_id, holder, pid, format_ts(&at)],
            )?;
            Ok(())
        })?;

        debug!(session_id, %holder, "session lease acquired");
        Ok(LeaseGuard {
            store: self.clone(),
            session_id: session_id.to_string(),
            holder,
            released: false,
            pulse: None,
        })
    }

    pub fn heartbeat_lease(&self, session_id: &str, holder: &str) -> Result<()> {
        self.write(|tx| {
            let changed = tx.execute(
                "UPDATE session_leases SET heartbeat_at = ?3 WHERE session_id = ?1 AND holder = ?2",
                params![session_id, holder, format_ts(&now())],
            )?;
            if changed == 0 {
                return Err(EngineError::SessionLocked {
                    session_id: session_id.to_string(),
                });
            }
            Ok(())
        })
    }

    /// Drop the lease if `holder` still owns it.
    pub fn release_lease(&self, session_id: &str, holder: &str) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "DELETE FROM session_leases WHERE session_id = ?1 AND holder = ?2",
                params![session_id, holder],
            )?;
            Ok(())
        })?;
        debug!(session_id, "session lease released");
        Ok(())
    }

    pub fn get_lease(&self, session_id: &str) -> Result<Option<Lease>> {
        self.read(|tx| {
            Ok(tx
                .query_row(
                    "SELECT session_id, holder, pid, acquired_at, heartbeat_at \
                     FROM session_leases WHERE session_id = ?1",
                    [session_id],
                    |row| {
                        Ok(Lease {
                            session_id: row.get(0)?,
                            holder: row.get(1)?,
                            pid: row.get(2)?,
                            acquired_at: parse_ts(row, 3, "acquired_at")?,
                            heartbeat_at: parse_ts(row, 4, "heartbeat_at")?,
                        })
                    },
                )
                .optional()?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_second_acquire_is_locked() {
        let store = StateStore::open_in_memory().expect("open");
        let guard = store.acquire_lease("s-1", Duration::from_secs(60)).expect("first");
        let err = store.acquire_lease("s-1", Duration::from_secs(60)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionLocked);

        guard.release().expect("release");
        store.acquire_lease("s-1", Duration::from_secs(60)).expect("after release");
    }

    #[test]
    fn test_drop_releases() {
        let store = StateStore::open_in_memory().expect("open");
        {
            let _guard = store.acquire_lease("s-1", Duration::from_secs(60)).expect("first");
            assert!(store.get_lease("s-1").expect("get").is_some());
        }
        assert!(store.get_lease("s-1").expect("get").is_none());
    }

    #[test]
    fn test_dead_holder_is_stale() {
        let store = StateStore::open_in_memory().expect("open");
        store
            .write(|tx| {
                tx.execute(
                    "INSERT INTO session_leases VALUES ('s-1', 'ghost', 999999, ?1, ?1)",
                    [format_ts(&now())],
                )?;
                Ok(())
            })
            .expect("seed");
        let guard = store.acquire_lease("s-1", Duration::from_secs(60)).expect("take over");
        assert_ne!(guard.holder(), "ghost");
    }

    #[test]
    fn test_expired_heartbeat_is_stale() {
        let lease = Lease {
            session_id: "s".into(),
            holder: "h".into(),
            pid: std::process::id(),
            acquired_at: now(),
            heartbeat_at: now() - chrono::Duration::seconds(120),
        };
        assert!(lease.is_stale(Duration::from_secs(60), now()));
        assert!(!lease.is_stale(Duration::from_secs(600), now()));
    }

    #[test]
    fn test_heartbeat_after_takeover_fails() {
        let store = StateStore::open_in_memory().expect("open");
        let guard = store.acquire_lease("s-1", Duration::from_secs(60)).expect("first");
        guard.heartbeat().expect("heartbeat");
        store.release_lease("s-1", guard.holder()).expect("forced release");
        assert_eq!(guard.heartbeat().unwrap_err().kind(), ErrorKind::SessionLocked);
    }

    #[test]
    fn test_keep_alive_outlives_ttl() {
        let store = StateStore::open_in_memory().expect("open");
        let ttl = Duration::from_millis(300);
        let mut guard = store.acquire_lease("s-1", ttl).expect("first");
        guard.keep_alive(ttl / 3);

        std::thread::sleep(Duration::from_millis(900));
        let err = store.acquire_lease("s-1", ttl).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionLocked);

        guard.release().expect("release");
        assert!(store.get_lease("s-1").expect("get").is_none());
    }

    #[test]
    fn test_lease_without_keep_alive_goes_stale() {
        let store = StateStore::open_in_memory().expect("open");
        let ttl = Duration::from_millis(100);
        let _guard = store.acquire_lease("s-1", ttl).expect("first");
        std::thread::sleep(Duration::from_millis(250));
        store.acquire_lease("s-1", ttl).expect("stale lease is taken over");
    }
}
