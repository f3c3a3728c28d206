use crate::error::{RemoteError, Result};
use crate::fingerprint::Fingerprint;
use crate::storage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const APPROVED_KEY: &str = "TrustedClients";
pub const BLOCKED_KEY: &str = "BlockedClients";
pub const SEEN_KEY: &str = "SeenClients";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TrustEntry {
    pub fingerprint: Fingerprint,
    pub display_name: String,
    pub last_seen: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustStatus {
    Approved,
    Blocked,
    /// Seen but never decided.
    Unknown,
}

/// Durable key-value storage for trust lists.
pub trait TrustStore: Send {
    fn load(&self, key: &str) -> Result<Option<Vec<TrustEntry>>>;
    fn save(&self, key: &str, entries: &[TrustEntry]) -> Result<()>;
}

/// One JSON file per key in a private directory.
#[derive(Debug, Clone)]
pub struct JsonFileTrustStore {
    dir: PathBuf,
}

impl JsonFileTrustStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        storage::ensure_private_dir(&dir).map_err(|e| RemoteError::TrustStore(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl TrustStore for JsonFileTrustStore {
    fn load(&self, key: &str) -> Result<Option<Vec<TrustEntry>>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }

        let data = std::fs::read(&path).map_err(|e| RemoteError::TrustStore(e.to_string()))?;
        match serde_json::from_slice(&data) {
            Ok(entries) => Ok(Some(entries)),
            Err(e) => {
                warn!("Failed to parse trust list {}: {}", key, e);
                storage::quarantine_corrupt(&path);
                Ok(Some(Vec::new()))
            }
        }
    }

    fn save(&self, key: &str, entries: &[TrustEntry]) -> Result<()> {
        let data = serde_json::to_vec_pretty(entries)?;
        storage::write_private_file(&self.path(key), &data)
            .map_err(|e| RemoteError::TrustStore(e.to_string()))
    }
}

/// In-process store. Clones share contents, so a test can reopen a registry over the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryTrustStore {
    lists: Arc<Mutex<HashMap<String, Vec<TrustEntry>>>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustStore for MemoryTrustStore {
    fn load(&self, key: &str) -> Result<Option<Vec<TrustEntry>>> {
        Ok(self.lists.lock().get(key).cloned())
    }

    fn save(&self, key: &str, entries: &[TrustEntry]) -> Result<()> {
        self.lists.lock().insert(key.to_string(), entries.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct TrustSets {
    seen: BTreeMap<Fingerprint, TrustEntry>,
    approved: BTreeSet<Fingerprint>,
    blocked: BTreeSet<Fingerprint>,
}

impl TrustSets {
    fn entry_mut(&mut self, fingerprint: Fingerprint) -> &mut TrustEntry {
        self.seen.entry(fingerprint).or_insert_with(|| TrustEntry {
            fingerprint,
            display_name: String::new(),
            last_seen: storage::unix_timestamp(),
        })
    }

    fn entries(&self, set: &BTreeSet<Fingerprint>) -> Vec<TrustEntry> {
        set.iter().filter_map(|fp| self.seen.get(fp).cloned()).collect()
    }
}

/// Known peers partitioned into approved, blocked and all-seen.
///
/// Every mutation is persisted before it becomes visible, so a storage failure leaves the
/// registry unchanged.
pub struct TrustRegistry {
    store: Box<dyn TrustStore>,
    sets: TrustSets,
}

impl TrustRegistry {
    pub fn open(store: Box<dyn TrustStore>) -> Result<Self> {
        let approved = store.load(APPROVED_KEY)?.unwrap_or_default();
        let blocked = store.load(BLOCKED_KEY)?.unwrap_or_default();
        let seen = store.load(SEEN_KEY)?;

        let mut sets = TrustSets::default();
        for entry in seen.unwrap_or_default() {
            sets.seen.insert(entry.fingerprint, entry);
        }
        for entry in approved.iter().chain(blocked.iter()) {
            sets.seen
                .entry(entry.fingerprint)
                .or_insert_with(|| entry.clone());
        }
        sets.approved = approved.iter().map(|e| e.fingerprint).collect();
        sets.blocked = blocked.iter().map(|e| e.fingerprint).collect();

        let overlap = sets.approved.intersection(&sets.blocked).count();
        if overlap > 0 {
            warn!(
                "{} fingerprint(s) are both approved and blocked in storage; treating as blocked",
                overlap
            );
        }

        info!(
            "Trust registry loaded: {} approved, {} blocked, {} seen",
            sets.approved.len(),
            sets.blocked.len(),
            sets.seen.len()
        );
        Ok(Self { store, sets })
    }

    fn commit(&mut self, next: TrustSets) -> Result<()> {
        self.store
            .save(APPROVED_KEY, &next.entries(&next.approved))?;
        self.store.save(BLOCKED_KEY, &next.entries(&next.blocked))?;
        let seen: Vec<TrustEntry> = next.seen.values().cloned().collect();
        self.store.save(SEEN_KEY, &seen)?;
        self.sets = next;
        Ok(())
    }

    pub fn record_seen(&mut self, fingerprint: Fingerprint, display_name: &str) -> Result<()> {
        let mut next = self.sets.clone();
        let entry = next.entry_mut(fingerprint);
        entry.display_name = display_name.to_string();
        entry.last_seen = storage::unix_timestamp();
        debug!("Seen {} as '{}'", fingerprint.short(), display_name);
        self.commit(next)
    }

    /// Approve a fingerprint. Overrides any previous block.
    pub fn approve(&mut self, fingerprint: Fingerprint) -> Result<()> {
        let mut next = self.sets.clone();
        next.entry_mut(fingerprint);
        next.blocked.remove(&fingerprint);
        next.approved.insert(fingerprint);
        self.commit(next)?;
        info!("Approved {}", fingerprint.short());
        Ok(())
    }

    pub fn block(&mut self, fingerprint: Fingerprint) -> Result<()> {
        let mut next = self.sets.clone();
        next.entry_mut(fingerprint);
        next.approved.remove(&fingerprint);
        next.blocked.insert(fingerprint);
        self.commit(next)?;
        info!("Blocked {}", fingerprint.short());
        Ok(())
    }

    /// Drop every record of a fingerprint. Returns whether it was known.
    pub fn forget(&mut self, fingerprint: Fingerprint) -> Result<bool> {
        if !self.sets.seen.contains_key(&fingerprint) {
            return Ok(false);
        }
        let mut next = self.sets.clone();
        next.seen.remove(&fingerprint);
        next.approved.remove(&fingerprint);
        next.blocked.remove(&fingerprint);
        self.commit(next)?;
        info!("Forgot {}", fingerprint.short());
        Ok(true)
    }

    pub fn is_approved(&self, fingerprint: &Fingerprint) -> bool {
        self.sets.approved.contains(fingerprint) && !self.is_blocked(fingerprint)
    }

    pub fn is_blocked(&self, fingerprint: &Fingerprint) -> bool {
        self.sets.blocked.contains(fingerprint)
    }

    pub fn status(&self, fingerprint: &Fingerprint) -> Option<TrustStatus> {
        if !self.sets.seen.contains_key(fingerprint) {
            None
        } else if self.is_blocked(fingerprint) {
            Some(TrustStatus::Blocked)
        } else if self.is_approved(fingerprint) {
            Some(TrustStatus::Approved)
        } else {
            Some(TrustStatus::Unknown)
        }
    }

    pub fn entry(&self, fingerprint: &Fingerprint) -> Option<TrustEntry> {
        self.sets.seen.get(fingerprint).cloned()
    }

    pub fn approved(&self) -> Vec<TrustEntry> {
        self.sets.entries(&self.sets.approved)
    }

    pub fn blocked(&self) -> Vec<TrustEntry> {
        self.sets.entries(&self.sets.blocked)
    }

    pub fn all_seen(&self) -> Vec<TrustEntry> {
        self.sets.seen.values().cloned().collect()
    }
}
