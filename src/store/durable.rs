use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

use super::{InMemoryStore, Predicate, PutOutcome, ReservationStore, StoreError};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that arrive while a flush is pending share one fsync:
/// block for the first append, drain whatever else is queued, write the batch,
/// flush once, answer everyone.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray buffered bytes are not
    // attributed to the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

/// In-memory state made durable by a write-ahead log.
///
/// Each mutation is acknowledged only after its WAL entry is fsynced. Slot
/// claims are decided in memory first (that is the atomic step) and rolled
/// back if the log write fails. Record inserts are logged before they become
/// visible, so a listed reservation is always a durable one.
///
/// Every mutation holds a read guard on `log_gate` from its in-memory change
/// until its WAL ack. Compaction takes the write guard, so the snapshot it
/// writes never misses an entry the old log already holds.
pub struct DurableStore {
    state: InMemoryStore,
    wal_tx: mpsc::Sender<WalCommand>,
    log_gate: RwLock<()>,
}

impl DurableStore {
    /// Replay `wal_path` and start the writer task. Must run inside a tokio runtime.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let state = InMemoryStore::new();
        for event in &events {
            state.apply_event(event);
        }
        info!(
            "replayed {} WAL events from {}: {} reservations, {} held slots",
            events.len(),
            wal_path.display(),
            state.record_count(),
            state.slot_count()
        );

        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));
        Ok(Self {
            state,
            wal_tx,
            log_gate: RwLock::new(()),
        })
    }

    pub fn record_count(&self) -> usize {
        self.state.record_count()
    }

    async fn wal_append(&self, event: Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Rewrite the WAL with just the events needed to rebuild current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _quiesced = self.log_gate.write().await;
        let events = self.state.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Compact once `threshold` appends have accumulated. Returns whether it did.
    pub async fn maybe_compact(&self, threshold: u64) -> Result<bool, StoreError> {
        let appends = self.appends_since_compact().await;
        if appends < threshold {
            return Ok(false);
        }
        self.compact().await?;
        info!("compacted WAL after {appends} appends ({} reservations)", self.record_count());
        Ok(true)
    }
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(store: Arc<DurableStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if let Err(e) = store.maybe_compact(threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

#[async_trait]
impl ReservationStore for DurableStore {
    async fn insert_if_absent(&self, reservation: &Reservation) -> Result<PutOutcome, StoreError> {
        let _gate = self.log_gate.read().await;
        if self.state.get_record(&reservation.id).is_some() {
            return Ok(PutOutcome::AlreadyExists);
        }
        self.wal_append(Event::ReservationStored {
            reservation: reservation.clone(),
        })
        .await?;
        Ok(self.state.insert_record(reservation))
    }

    async fn claim_slot(&self, slot_key: &str, id: Ulid) -> Result<PutOutcome, StoreError> {
        let _gate = self.log_gate.read().await;
        if self.state.claim(slot_key, id) == PutOutcome::AlreadyExists {
            return Ok(PutOutcome::AlreadyExists);
        }
        let event = Event::SlotClaimed {
            slot_key: slot_key.to_string(),
            id,
        };
        if let Err(e) = self.wal_append(event).await {
            self.state.release(slot_key, id);
            warn!("rolled back claim on {slot_key} after WAL failure: {e}");
            return Err(e);
        }
        Ok(PutOutcome::Inserted)
    }

    async fn release_slot(&self, slot_key: &str, holder: Ulid) -> Result<bool, StoreError> {
        let _gate = self.log_gate.read().await;
        if !self.state.release(slot_key, holder) {
            return Ok(false);
        }
        let event = Event::SlotReleased {
            slot_key: slot_key.to_string(),
            id: holder,
        };
        if let Err(e) = self.wal_append(event).await {
            // Restore so a retry finds the entry and logs the release.
            self.state.claim(slot_key, holder);
            return Err(e);
        }
        Ok(true)
    }

    async fn slot_holder(&self, slot_key: &str) -> Result<Option<Ulid>, StoreError> {
        Ok(self.state.holder(slot_key))
    }

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.state.get_record(&id))
    }

    async fn delete(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        let _gate = self.log_gate.read().await;
        let Some(prior) = self.state.remove_record(&id) else {
            return Ok(None);
        };
        if let Err(e) = self.wal_append(Event::ReservationRemoved { id }).await {
            self.state.insert_record(&prior);
            return Err(e);
        }
        Ok(Some(prior))
    }

    async fn scan(&self, predicate: Predicate<'_>) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.state.matching(predicate))
    }

    async fn slot_entries(&self) -> Result<Vec<(String, Ulid)>, StoreError> {
        Ok(self.state.slot_entries_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_durable");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn reservation(time_slot: &str) -> Reservation {
        Reservation::new(
            Ulid::new(),
            &ReservationRequest::new("court-1", "2024-05-01", time_slot, "userA"),
            0,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let path = test_wal_path("reopen.wal");
        let kept = reservation("10:00");
        let gone = reservation("11:00");
        {
            let store = DurableStore::open(&path).unwrap();
            for r in [&kept, &gone] {
                store.claim_slot(&r.slot().key(), r.id).await.unwrap();
                store.insert_if_absent(r).await.unwrap();
            }
            store.delete(gone.id).await.unwrap();
            assert!(store.release_slot(&gone.slot().key(), gone.id).await.unwrap());
        }

        let store = DurableStore::open(&path).unwrap();
        assert_eq!(store.get(kept.id).await.unwrap(), Some(kept.clone()));
        assert_eq!(store.get(gone.id).await.unwrap(), None);
        assert_eq!(store.slot_holder(&kept.slot().key()).await.unwrap(), Some(kept.id));
        assert_eq!(store.slot_holder(&gone.slot().key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_release_does_not_free_reclaimed_slot() {
        let path = test_wal_path("stale_release.wal");
        let first = Ulid::new();
        let second = Ulid::new();
        {
            let store = DurableStore::open(&path).unwrap();
            store.claim_slot("slot:x", first).await.unwrap();
            store.release_slot("slot:x", first).await.unwrap();
            store.claim_slot("slot:x", second).await.unwrap();
            // Late duplicate of the first release must be a no-op.
            assert!(!store.release_slot("slot:x", first).await.unwrap());
        }
        let store = DurableStore::open(&path).unwrap();
        assert_eq!(store.slot_holder("slot:x").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn claim_is_exclusive_under_contention() {
        let path = test_wal_path("contention.wal");
        let store = std::sync::Arc::new(DurableStore::open(&path).unwrap());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_slot("slot:hot", Ulid::new()).await.unwrap()
            }));
        }
        let mut won = 0;
        for h in handles {
            if h.await.unwrap() == PutOutcome::Inserted {
                won += 1;
            }
        }
        assert_eq!(won, 1);
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("compact.wal");
        let kept = reservation("10:00");
        {
            let store = DurableStore::open(&path).unwrap();
            for _ in 0..10 {
                let churn = reservation("12:00");
                store.claim_slot(&churn.slot().key(), churn.id).await.unwrap();
                store.insert_if_absent(&churn).await.unwrap();
                store.delete(churn.id).await.unwrap();
                store.release_slot(&churn.slot().key(), churn.id).await.unwrap();
            }
            store.claim_slot(&kept.slot().key(), kept.id).await.unwrap();
            store.insert_if_absent(&kept).await.unwrap();
            assert_eq!(store.appends_since_compact().await, 42);

            let before = std::fs::metadata(&path).unwrap().len();
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
            let after = std::fs::metadata(&path).unwrap().len();
            assert!(after < before);
        }
        let store = DurableStore::open(&path).unwrap();
        assert_eq!(store.record_count(), 1);
        assert_eq!(store.get(kept.id).await.unwrap(), Some(kept.clone()));
        assert_eq!(store.slot_holder(&kept.slot().key()).await.unwrap(), Some(kept.id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn compaction_during_writes_keeps_acknowledged_records() {
        let path = test_wal_path("compact_race.wal");
        let store = Arc::new(DurableStore::open(&path).unwrap());
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let compactor = {
            let store = store.clone();
            let done = done.clone();
            tokio::spawn(async move {
                let mut runs = 0;
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    store.compact().await.unwrap();
                    runs += 1;
                    tokio::task::yield_now().await;
                }
                runs
            })
        };

        let mut writers = Vec::new();
        for w in 0..8 {
            let store = store.clone();
            writers.push(tokio::spawn(async move {
                let mut acked = Vec::new();
                for i in 0..100 {
                    let r = Reservation::new(
                        Ulid::new(),
                        &ReservationRequest::new(&format!("court-{w}"), "2024-05-01", &format!("{i}"), "userA"),
                        0,
                    )
                    .unwrap();
                    store.claim_slot(&r.slot().key(), r.id).await.unwrap();
                    store.insert_if_absent(&r).await.unwrap();
                    acked.push(r);
                }
                acked
            }));
        }
        let mut acked = Vec::new();
        for h in writers {
            acked.extend(h.await.unwrap());
        }
        done.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(compactor.await.unwrap() > 0);
        drop(store);

        let reopened = DurableStore::open(&path).unwrap();
        assert_eq!(reopened.record_count(), acked.len());
        for r in &acked {
            assert_eq!(reopened.get(r.id).await.unwrap().as_ref(), Some(r));
            assert_eq!(reopened.slot_holder(&r.slot().key()).await.unwrap(), Some(r.id));
        }
    }

    /// A store whose WAL writer is gone, so every append fails.
    fn store_with_dead_log() -> DurableStore {
        let (wal_tx, wal_rx) = mpsc::channel(1);
        drop(wal_rx);
        DurableStore {
            state: InMemoryStore::new(),
            wal_tx,
            log_gate: RwLock::new(()),
        }
    }

    #[tokio::test]
    async fn failed_append_rolls_back_every_mutation() {
        let store = store_with_dead_log();
        let held = reservation("10:00");
        store.state.claim(&held.slot().key(), held.id);
        store.state.insert_record(&held);

        let fresh = reservation("11:00");
        assert!(matches!(
            store.claim_slot(&fresh.slot().key(), fresh.id).await,
            Err(StoreError::Wal(_))
        ));
        assert_eq!(store.slot_holder(&fresh.slot().key()).await.unwrap(), None);

        assert!(store.insert_if_absent(&fresh).await.is_err());
        assert_eq!(store.get(fresh.id).await.unwrap(), None);

        assert!(store.release_slot(&held.slot().key(), held.id).await.is_err());
        assert_eq!(store.slot_holder(&held.slot().key()).await.unwrap(), Some(held.id));

        assert!(store.delete(held.id).await.is_err());
        assert_eq!(store.get(held.id).await.unwrap(), Some(held.clone()));
    }

    #[tokio::test]
    async fn delete_without_release_leaves_orphan_after_reopen() {
        let path = test_wal_path("orphan.wal");
        let r = reservation("10:00");
        {
            let store = DurableStore::open(&path).unwrap();
            store.claim_slot(&r.slot().key(), r.id).await.unwrap();
            store.insert_if_absent(&r).await.unwrap();
            store.delete(r.id).await.unwrap();
        }

        let store = Arc::new(DurableStore::open(&path).unwrap());
        assert_eq!(store.slot_entries().await.unwrap(), vec![(r.slot().key(), r.id)]);

        let reconciler = crate::reconciler::Reconciler::new(store.clone());
        assert_eq!(reconciler.sweep_orphans(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(reconciler.run_once().await, 0);
        assert_eq!(store.slot_holder(&r.slot().key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn maybe_compact_waits_for_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = DurableStore::open(&path).unwrap();
        let r = reservation("09:00");
        store.claim_slot(&r.slot().key(), r.id).await.unwrap();
        store.insert_if_absent(&r).await.unwrap();

        assert!(!store.maybe_compact(3).await.unwrap());
        assert_eq!(store.appends_since_compact().await, 2);
        assert!(store.maybe_compact(2).await.unwrap());
        assert_eq!(store.appends_since_compact().await, 0);
        assert_eq!(store.get(r.id).await.unwrap(), Some(r));
    }
}
