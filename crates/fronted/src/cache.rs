//! Durable persistence of proven masquerades.
//!
//! A single write-back worker consumes commit offers, deduplicates them by
//! identity, and flushes coalesced snapshots to an external store. Offers
//! are lossy by contract: when the channel is full the offer is dropped,
//! which is safe because the masquerade is still in the vetted queue and
//! will be offered again on its next successful use.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::masquerade::Masquerade;

/// One persisted pool entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMasquerade {
    pub domain: String,
    pub ip_address: String,
    pub last_vetted: SystemTime,
}

/// External persistence contract for the pool.
///
/// Implementations only need durable storage of `(domain, ip)` pairs with
/// their timestamps; all policy (age filtering, the size cap, write
/// batching) lives on the caller's side of this trait.
pub trait MasqueradeStore: Send + Sync {
    fn load(&self) -> io::Result<Vec<CachedMasquerade>>;
    fn save(&self, entries: &[CachedMasquerade]) -> io::Result<()>;
}

/// JSON-file store. A missing file reads as empty.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Serialize, Deserialize)]
struct DiskRecord {
    domain: String,
    ip_address: String,
    last_vetted: u64,
}

impl MasqueradeStore for FileStore {
    fn load(&self) -> io::Result<Vec<CachedMasquerade>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let records: Vec<DiskRecord> = serde_json::from_slice(&bytes).map_err(io::Error::other)?;
        Ok(records
            .into_iter()
            .map(|record| CachedMasquerade {
                domain: record.domain,
                ip_address: record.ip_address,
                last_vetted: UNIX_EPOCH + Duration::from_secs(record.last_vetted),
            })
            .collect())
    }

    fn save(&self, entries: &[CachedMasquerade]) -> io::Result<()> {
        let records: Vec<DiskRecord> = entries
            .iter()
            .map(|entry| DiskRecord {
                domain: entry.domain.clone(),
                ip_address: entry.ip_address.clone(),
                last_vetted: entry
                    .last_vetted
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            })
            .collect();
        let bytes = serde_json::to_vec(&records).map_err(io::Error::other)?;
        std::fs::write(&self.path, bytes)
    }
}

/// Write-back policy knobs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WritebackPolicy {
    pub max_size: usize,
    pub save_interval: Duration,
}

/// Load a store's entries, skipping anything older than `max_age`.
///
/// Store failures degrade to an empty start: persistence is an
/// optimisation, never a prerequisite.
pub(crate) fn live_entries(store: &dyn MasqueradeStore, max_age: Duration) -> Vec<CachedMasquerade> {
    let entries = match store.load() {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, "masquerade store unreadable, starting empty");
            return Vec::new();
        }
    };
    let now = SystemTime::now();
    let total = entries.len();
    let live: Vec<CachedMasquerade> = entries
        .into_iter()
        .filter(|entry| {
            now.duration_since(entry.last_vetted)
                .map(|age| age <= max_age)
                .unwrap_or(true)
        })
        .collect();
    debug!(
        live = live.len(),
        expired = total - live.len(),
        "masquerade cache loaded"
    );
    live
}

/// Handle on the write-back worker; [`close`](Self::close) performs the
/// final flush. Closing twice is a no-op.
pub(crate) struct CacheHandle {
    shutdown: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CacheHandle {
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "cache write-back worker aborted");
            }
        }
    }
}

pub(crate) fn spawn_writeback(
    store: Box<dyn MasqueradeStore>,
    policy: WritebackPolicy,
    initial: Vec<CachedMasquerade>,
    offers: mpsc::Receiver<Arc<Masquerade>>,
) -> CacheHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_writeback(store, policy, initial, offers, shutdown_rx));
    CacheHandle {
        shutdown,
        task: parking_lot::Mutex::new(Some(task)),
    }
}

async fn run_writeback(
    store: Box<dyn MasqueradeStore>,
    policy: WritebackPolicy,
    initial: Vec<CachedMasquerade>,
    mut offers: mpsc::Receiver<Arc<Masquerade>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut entries: HashMap<(String, String), SystemTime> = initial
        .into_iter()
        .map(|entry| ((entry.domain, entry.ip_address), entry.last_vetted))
        .collect();
    let mut dirty = false;

    let mut ticker = tokio::time::interval(policy.save_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            offer = offers.recv() => match offer {
                Some(masquerade) => {
                    record(&mut entries, &masquerade);
                    dirty = true;
                }
                None => break,
            },
            _ = ticker.tick() => {
                if dirty {
                    flush(store.as_ref(), &entries, policy.max_size);
                    dirty = false;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    // Offers that lost the race against the shutdown signal still count.
    while let Ok(masquerade) = offers.try_recv() {
        record(&mut entries, &masquerade);
        dirty = true;
    }
    if dirty {
        flush(store.as_ref(), &entries, policy.max_size);
    }
}

fn record(entries: &mut HashMap<(String, String), SystemTime>, masquerade: &Masquerade) {
    let stamp = masquerade.last_vetted().unwrap_or_else(SystemTime::now);
    entries.insert(
        (
            masquerade.domain().to_string(),
            masquerade.ip_address().to_string(),
        ),
        stamp,
    );
}

fn flush(
    store: &dyn MasqueradeStore,
    entries: &HashMap<(String, String), SystemTime>,
    max_size: usize,
) {
    let snapshot = snapshot(entries, max_size);
    trace!(count = snapshot.len(), "persisting masquerades");
    #[cfg(feature = "metrics")]
    metrics::counter!("fronted_cache_flush_total").increment(1);
    if let Err(err) = store.save(&snapshot) {
        warn!(error = %err, "failed to persist masquerades");
    }
}

/// Snapshot newest-first and cap the size; the oldest entries fall off.
fn snapshot(
    entries: &HashMap<(String, String), SystemTime>,
    max_size: usize,
) -> Vec<CachedMasquerade> {
    let mut snapshot: Vec<CachedMasquerade> = entries
        .iter()
        .map(|((domain, ip_address), last_vetted)| CachedMasquerade {
            domain: domain.clone(),
            ip_address: ip_address.clone(),
            last_vetted: *last_vetted,
        })
        .collect();
    snapshot.sort_by(|a, b| b.last_vetted.cmp(&a.last_vetted));
    snapshot.truncate(max_size);
    snapshot
}
