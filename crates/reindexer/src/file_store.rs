use crate::clock::{from_unix_ms, to_unix_ms};
use crate::store::{LockHandle, ReindexingStore};
use crate::{Reindexing, ReindexerError, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(1);
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(600);

static NEXT_LOCK_OWNER: AtomicU64 = AtomicU64::new(1);

/// Contents of the lock file: a lease kept alive by its holder's renewals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner: String,
    pub acquired_at_unix_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewed_at_unix_ms: Option<u64>,
    #[serde(default)]
    pub renewals: u32,
}

impl LockInfo {
    /// Last sign of life from the holder.
    #[must_use]
    pub fn last_seen_unix_ms(&self) -> u64 {
        self.renewed_at_unix_ms
            .map_or(self.acquired_at_unix_ms, |renewed| {
                renewed.max(self.acquired_at_unix_ms)
            })
    }
}

/// Store keeping the snapshot as a JSON file, locked through an exclusively created sibling
/// `.lock` file, so separate processes sharing a filesystem exclude each other.
///
/// The lock is a lease: a holder renews it every quarter of `stale_after`, and a lock file not
/// renewed for `stale_after` is taken to be left behind by a crashed holder.
#[derive(Debug, Clone)]
pub struct FileReindexingStore {
    cluster: String,
    path: PathBuf,
    lock_path: PathBuf,
    stale_after: Duration,
    /// Serializes renewals against unlocking, so a late renewal never recreates a released lock.
    lease: Arc<Mutex<()>>,
}

impl FileReindexingStore {
    pub fn new(cluster: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            cluster: cluster.into(),
            path,
            lock_path: PathBuf::from(lock_path),
            stale_after: DEFAULT_LOCK_STALE_AFTER,
            lease: Arc::new(Mutex::new(())),
        }
    }

    /// Lock files not renewed for this long are assumed to be left behind by a crashed holder.
    #[must_use]
    pub const fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn lock_info(&self) -> Result<Option<LockInfo>> {
        match fs::read(&self.lock_path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes the lock file regardless of holder. Returns whether there was one.
    pub fn force_unlock(&self) -> Result<bool> {
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {
                warn!("Forcibly removed reindexing lock {}", self.lock_path.display());
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Sibling of the lock file private to this process and call.
    fn scratch_path(&self, suffix: &str) -> PathBuf {
        let mut path = self.lock_path.clone().into_os_string();
        path.push(format!(
            ".{}-{}.{suffix}",
            std::process::id(),
            NEXT_LOCK_OWNER.fetch_add(1, Ordering::Relaxed)
        ));
        PathBuf::from(path)
    }

    fn try_create_lock(&self, contents: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)?;
        file.write_all(contents)?;
        file.sync_all()
    }

    fn holder_mismatch(&self, handle: &LockHandle, info: Option<&LockInfo>) -> ReindexerError {
        match info {
            Some(info) => ReindexerError::Other(format!(
                "reindexing lock {} is held by {}, not {}",
                self.lock_path.display(),
                info.owner,
                handle.owner()
            )),
            None => ReindexerError::Other(format!(
                "reindexing lock {} vanished while held by {}",
                self.lock_path.display(),
                handle.owner()
            )),
        }
    }

    /// Removes the lock file if its lease ran out. An unreadable lock file is aged by its
    /// modification time.
    ///
    /// The file is first renamed aside, so concurrent breakers cannot both act on it, and only
    /// deleted if it still holds the bytes judged stale; a lock taken in between is put back.
    fn break_if_stale(&self) -> Result<bool> {
        let observed = match fs::read(&self.lock_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err.into()),
        };
        let last_seen = match serde_json::from_slice::<LockInfo>(&observed) {
            Ok(info) => from_unix_ms(info.last_seen_unix_ms()),
            Err(_) => match fs::metadata(&self.lock_path).and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
                Err(err) => return Err(err.into()),
            },
        };

        let age = SystemTime::now()
            .duration_since(last_seen)
            .unwrap_or_default();
        if age <= self.stale_after {
            return Ok(false);
        }

        let aside = self.scratch_path("stale");
        match fs::rename(&self.lock_path, &aside) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err.into()),
        }
        let moved = fs::read(&aside);
        let _ = fs::remove_file(&aside);
        let moved = moved?;

        if moved != observed {
            debug!(
                "Reindexing lock {} changed hands while being broken, restoring it",
                self.lock_path.display()
            );
            match self.try_create_lock(&moved) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::AlreadyExists => warn!(
                    "Could not restore reindexing lock {}, it was taken again",
                    self.lock_path.display()
                ),
                Err(err) => return Err(err.into()),
            }
            return Ok(false);
        }

        warn!(
            "Broke reindexing lock {} for cluster '{}', not renewed for {age:?}",
            self.lock_path.display(),
            self.cluster
        );
        Ok(true)
    }
}

impl ReindexingStore for FileReindexingStore {
    fn read(&self) -> Result<Reindexing> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Reindexing::empty()),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, reindexing: &Reindexing) -> Result<()> {
        self.ensure_parent()?;
        let bytes = serde_json::to_vec_pretty(reindexing)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn lock(&self, timeout: Duration) -> Result<LockHandle> {
        self.ensure_parent()?;
        let deadline = Instant::now() + timeout;
        let owner = format!(
            "{}-pid{}-{}",
            self.cluster,
            std::process::id(),
            NEXT_LOCK_OWNER.fetch_add(1, Ordering::Relaxed)
        );

        loop {
            let info = LockInfo {
                owner: owner.clone(),
                acquired_at_unix_ms: to_unix_ms(SystemTime::now()),
                renewed_at_unix_ms: None,
                renewals: 0,
            };
            match self.try_create_lock(&serde_json::to_vec(&info)?) {
                Ok(()) => return Ok(LockHandle::new(owner)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if self.break_if_stale()? {
                        continue;
                    }
                }
                Err(err) => return Err(err.into()),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ReindexerError::LockContention {
                    cluster: self.cluster.clone(),
                    timeout,
                });
            }
            std::thread::sleep(remaining.min(LOCK_POLL_INTERVAL));
        }
    }

    fn unlock(&self, handle: LockHandle) -> Result<()> {
        let _lease = self.lease.lock().unwrap_or_else(PoisonError::into_inner);
        match self.lock_info()? {
            Some(info) if info.owner == handle.owner() => {
                fs::remove_file(&self.lock_path)?;
                Ok(())
            }
            info => Err(self.holder_mismatch(&handle, info.as_ref())),
        }
    }

    fn renew(&self, handle: &LockHandle) -> Result<()> {
        let _lease = self.lease.lock().unwrap_or_else(PoisonError::into_inner);
        let mut info = match self.lock_info()? {
            Some(info) if info.owner == handle.owner() => info,
            info => return Err(self.holder_mismatch(handle, info.as_ref())),
        };
        info.renewed_at_unix_ms = Some(to_unix_ms(SystemTime::now()));
        info.renewals += 1;

        let tmp = self.scratch_path("renew");
        fs::write(&tmp, serde_json::to_vec(&info)?)?;
        if let Err(err) = fs::rename(&tmp, &self.lock_path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    fn renewal_interval(&self) -> Option<Duration> {
        Some((self.stale_after / 4).max(MIN_RENEWAL_INTERVAL))
    }
}
