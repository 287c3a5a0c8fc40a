use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::booking::now_ms;
use crate::limits::{ORPHAN_MIN_AGE_MS, ORPHAN_SWEEP_INTERVAL_MS};
use crate::observability::RECONCILE_PENDING;
use crate::store::{ReservationStore, StoreError};

/// What to do with a slot-index entry that the booking path could not settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    /// The reservation is gone; its index entry must be removed.
    Release,
    /// The claim was won but the record write failed. Keep the entry if the
    /// record turns out to exist, remove it otherwise.
    Verify,
}

/// Queue of slot-index entries awaiting cleanup, keyed by (slot key, holder).
///
/// Nothing is ever dropped from the queue except by a successful repair, so a
/// slot that the store refuses to free stays visible in `pending()` and in
/// the `slotbook_reconcile_pending` gauge until someone fixes it.
pub struct Reconciler {
    store: Arc<dyn ReservationStore>,
    pending: DashMap<(String, Ulid), Repair>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ReservationStore>) -> Self {
        Self {
            store,
            pending: DashMap::new(),
        }
    }

    pub fn schedule(&self, slot_key: String, holder: Ulid, repair: Repair) {
        warn!("slot {slot_key} held by {holder} queued for reconciliation ({repair:?})");
        self.pending.insert((slot_key, holder), repair);
        self.publish_gauge();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, slot_key: &str, holder: Ulid) -> bool {
        self.pending.contains_key(&(slot_key.to_string(), holder))
    }

    /// Queue a `Verify` for every slot-index entry whose holder has no record.
    ///
    /// Such entries survive a crash between a record delete and its slot
    /// release, or a restart that lost the in-process queue. Holders minted
    /// less than `min_age` ago are skipped: their record write may still be
    /// in flight. Returns how many entries were queued.
    pub async fn sweep_orphans(&self, min_age: Duration) -> Result<usize, StoreError> {
        let cutoff = (now_ms().max(0) as u64).saturating_sub(min_age.as_millis() as u64);
        let mut queued = 0;
        for (slot_key, holder) in self.store.slot_entries().await? {
            if holder.timestamp_ms() > cutoff || self.is_pending(&slot_key, holder) {
                continue;
            }
            if self.store.get(holder).await?.is_none() {
                self.schedule(slot_key, holder, Repair::Verify);
                queued += 1;
            }
        }
        if queued > 0 {
            warn!("orphan sweep found {queued} slot entries without a reservation");
        }
        Ok(queued)
    }

    /// Attempt every queued repair once. Returns how many remain.
    pub async fn run_once(&self) -> usize {
        let work: Vec<((String, Ulid), Repair)> = self
            .pending
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        for ((slot_key, holder), repair) in work {
            match self.repair(&slot_key, holder, repair).await {
                Ok(()) => {
                    self.pending.remove(&(slot_key.clone(), holder));
                    info!("reconciled slot {slot_key} (holder {holder}, {repair:?})");
                }
                Err(e) => debug!("reconcile retry later for {slot_key}: {e}"),
            }
        }
        self.publish_gauge();
        self.pending.len()
    }

    async fn repair(&self, slot_key: &str, holder: Ulid, repair: Repair) -> Result<(), StoreError> {
        if repair == Repair::Verify && self.store.get(holder).await?.is_some() {
            return Ok(());
        }
        self.store.release_slot(slot_key, holder).await?;
        Ok(())
    }

    fn publish_gauge(&self) {
        metrics::gauge!(RECONCILE_PENDING).set(self.pending.len() as f64);
    }
}

/// Background task that periodically drains the reconciliation queue and
/// sweeps the slot index for orphaned claims.
pub async fn run_reconciler(reconciler: Arc<Reconciler>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    let sweep_every = Duration::from_millis(ORPHAN_SWEEP_INTERVAL_MS);
    let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + sweep_every, sweep_every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = sweep.tick() => {
                if let Err(e) = reconciler.sweep_orphans(Duration::from_millis(ORPHAN_MIN_AGE_MS)).await {
                    warn!("orphan sweep failed: {e}");
                }
            }
        }
        if reconciler.pending() == 0 {
            continue;
        }
        let left = reconciler.run_once().await;
        if left > 0 {
            warn!("{left} slot repairs still pending");
        }
    }
}
