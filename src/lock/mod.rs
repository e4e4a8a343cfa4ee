//! In-process reader/writer lock registry keyed by normalized path strings.
//!
//! Used by the merge engine and tracker sync to serialize access to shared
//! resources (notably the beads database). Locks are host-local; a
//! filesystem sentinel marks the beads-sync lock for sibling orchestrator
//! processes but carries no authority of its own.

use crate::{AzedarachError, Result};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Key of the host-wide exclusive lock wrapped around every tracker sync.
pub const BEADS_SYNC_KEY: &str = "beads-sync";

/// The beads-sync lock waits longer than ordinary locks: a full sync can
/// legitimately take tens of seconds.
pub const BEADS_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Exclusive,
    Shared,
}

/// A granted lock. Dropping it does NOT release; callers hand it back to
/// [`FileLockManager::release`].
#[derive(Debug, Clone)]
pub struct Lock {
    pub id: String,
    pub path: String,
    pub lock_type: LockType,
    pub acquired_at: DateTime<Utc>,
    pub session_id: Option<String>,
}

/// Observable state of one lock key.
#[derive(Debug, Clone)]
pub struct LockState {
    pub exclusive_holder: Option<String>,
    pub shared_holders: Vec<String>,
    pub waiting_count: usize,
}

struct Waiter {
    id: u64,
    lock_type: LockType,
    session_id: Option<String>,
    tx: oneshot::Sender<Lock>,
}

#[derive(Default)]
struct PathLockState {
    exclusive_holder: Option<Lock>,
    shared_holders: Vec<Lock>,
    queue: VecDeque<Waiter>,
}

impl PathLockState {
    fn is_empty(&self) -> bool {
        self.exclusive_holder.is_none() && self.shared_holders.is_empty() && self.queue.is_empty()
    }

    fn grantable(&self, lock_type: LockType) -> bool {
        match lock_type {
            LockType::Exclusive => {
                self.exclusive_holder.is_none() && self.shared_holders.is_empty()
            }
            LockType::Shared => self.exclusive_holder.is_none(),
        }
    }

    fn hold(&mut self, lock: Lock) {
        match lock.lock_type {
            LockType::Exclusive => self.exclusive_holder = Some(lock),
            LockType::Shared => self.shared_holders.push(lock),
        }
    }
}

/// Keyed reader/writer locks with a strictly FIFO wait queue.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct FileLockManager {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<HashMap<String, PathLockState>>,
    next_waiter_id: AtomicU64,
}

impl FileLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a lock on `path`, waiting up to `timeout` (default 30 s).
    ///
    /// A compatible request is granted immediately; otherwise the caller is
    /// queued FIFO. Timing out or dropping the returned future removes the
    /// waiter from the queue, releasing the lock if the grant raced the
    /// cancellation.
    pub async fn acquire(
        &self,
        path: &str,
        lock_type: LockType,
        timeout: Option<Duration>,
        session_id: Option<String>,
    ) -> Result<Lock> {
        let key = normalize_key(path);
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);

        let (waiter_id, rx) = {
            let mut map = self.map();
            let entry = map.entry(key.clone()).or_default();
            if entry.queue.is_empty() && entry.grantable(lock_type) {
                let lock = new_lock(&key, lock_type, session_id);
                entry.hold(lock.clone());
                return Ok(lock);
            }
            let waiter_id = self.inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            entry.queue.push_back(Waiter {
                id: waiter_id,
                lock_type,
                session_id,
                tx,
            });
            (waiter_id, rx)
        };

        let mut guard = WaitGuard {
            manager: self.clone(),
            key: key.clone(),
            waiter_id,
            rx: Some(rx),
            done: false,
        };

        let outcome =
            tokio::time::timeout(timeout, guard.rx.as_mut().expect("rx present")).await;
        match outcome {
            Ok(Ok(lock)) => {
                guard.done = true;
                Ok(lock)
            }
            Ok(Err(_closed)) => {
                guard.done = true;
                Err(AzedarachError::Lock(format!(
                    "waiter for '{key}' was dropped by the lock manager"
                )))
            }
            Err(_elapsed) => {
                drop(guard);
                Err(AzedarachError::LockTimeout(key))
            }
        }
    }

    /// Release a lock. Idempotent: releasing a lock that is no longer held
    /// is a no-op.
    pub fn release(&self, lock: &Lock) {
        let mut map = self.map();
        let Some(entry) = map.get_mut(&lock.path) else {
            return;
        };

        let removed = match lock.lock_type {
            LockType::Exclusive => {
                if entry
                    .exclusive_holder
                    .as_ref()
                    .is_some_and(|held| held.id == lock.id)
                {
                    entry.exclusive_holder = None;
                    true
                } else {
                    false
                }
            }
            LockType::Shared => {
                let before = entry.shared_holders.len();
                entry.shared_holders.retain(|held| held.id != lock.id);
                entry.shared_holders.len() != before
            }
        };

        if !removed {
            return;
        }

        grant_waiters(&lock.path, entry);
        if entry.is_empty() {
            map.remove(&lock.path);
            if lock.path == BEADS_SYNC_KEY {
                let _ = std::fs::remove_file(beads_sync_sentinel());
            }
        }
    }

    /// Snapshot of one key's state, or `None` when nothing holds or waits.
    pub fn lock_state(&self, path: &str) -> Option<LockState> {
        let key = normalize_key(path);
        let map = self.map();
        map.get(&key).map(|entry| LockState {
            exclusive_holder: entry.exclusive_holder.as_ref().map(|lock| lock.id.clone()),
            shared_holders: entry
                .shared_holders
                .iter()
                .map(|lock| lock.id.clone())
                .collect(),
            waiting_count: entry.queue.len(),
        })
    }

    /// Acquire the host-wide beads-sync lock (exclusive, 60 s timeout) and
    /// mark the filesystem sentinel for sibling processes.
    pub async fn acquire_beads_sync(&self) -> Result<Lock> {
        let lock = self
            .acquire(
                BEADS_SYNC_KEY,
                LockType::Exclusive,
                Some(BEADS_SYNC_TIMEOUT),
                None,
            )
            .await?;
        if let Err(e) = std::fs::write(beads_sync_sentinel(), format!("{}\n", std::process::id())) {
            tracing::debug!("could not write beads-sync sentinel: {}", e);
        }
        Ok(lock)
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, PathLockState>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cancel_waiter(&self, key: &str, waiter_id: u64, rx: Option<oneshot::Receiver<Lock>>) {
        let granted = {
            let mut map = self.map();
            match map.get_mut(key) {
                Some(entry) => {
                    if let Some(pos) = entry.queue.iter().position(|w| w.id == waiter_id) {
                        entry.queue.remove(pos);
                        // Removing a queued exclusive waiter can unblock
                        // shared waiters behind it.
                        grant_waiters(key, entry);
                        if entry.is_empty() {
                            map.remove(key);
                        }
                        None
                    } else {
                        rx.and_then(|mut rx| rx.try_recv().ok())
                    }
                }
                None => rx.and_then(|mut rx| rx.try_recv().ok()),
            }
        };
        // Grant raced the cancellation: hand the lock straight back.
        if let Some(lock) = granted {
            self.release(&lock);
        }
    }
}

/// Removes the waiter (or releases a racing grant) when an acquire future
/// is cancelled or times out.
struct WaitGuard {
    manager: FileLockManager,
    key: String,
    waiter_id: u64,
    rx: Option<oneshot::Receiver<Lock>>,
    done: bool,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.manager
            .cancel_waiter(&self.key, self.waiter_id, self.rx.take());
    }
}

/// Grant from the queue front as long as the front waiter is compatible
/// with the current holders. Strictly FIFO: a shared waiter behind an
/// exclusive waiter is never granted early.
fn grant_waiters(key: &str, entry: &mut PathLockState) {
    loop {
        let Some(front) = entry.queue.front() else {
            break;
        };
        if !entry.grantable(front.lock_type) {
            break;
        }
        let waiter = entry.queue.pop_front().expect("front checked");
        let lock = new_lock(key, waiter.lock_type, waiter.session_id);
        match waiter.tx.send(lock.clone()) {
            Ok(()) => entry.hold(lock),
            // Receiver dropped (cancelled acquire): skip and keep granting.
            Err(_) => continue,
        }
    }
}

fn new_lock(key: &str, lock_type: LockType, session_id: Option<String>) -> Lock {
    Lock {
        id: format!("lock-{:08x}", rand::random::<u32>()),
        path: key.to_string(),
        lock_type,
        acquired_at: Utc::now(),
        session_id,
    }
}

/// Sentinel advertising the beads-sync lock to other orchestrator processes
/// on this host.
pub fn beads_sync_sentinel() -> PathBuf {
    std::env::temp_dir().join("azedarach-beads-sync.lock")
}

/// Lexically normalize a lock key so `/a/b/../c` and `/a/c` collide.
/// Non-path keys (no separators) pass through unchanged.
fn normalize_key(path: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut prefix = String::new();
    for comp in Path::new(path).components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    parts.push("..".to_string());
                }
            }
            Component::RootDir => prefix = "/".to_string(),
            Component::Prefix(p) => prefix = p.as_os_str().to_string_lossy().to_string(),
            Component::Normal(s) => parts.push(s.to_string_lossy().to_string()),
        }
    }
    format!("{}{}", prefix, parts.join("/"))
}
