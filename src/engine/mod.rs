mod availability;
mod error;
mod mutations;
pub mod pricing;
mod queries;

pub use availability::{merge_ranges, AvailabilityChecker, OccupiedRange, RentalTerms};
pub use error::{EngineError, RangeRejection};
pub use mutations::{BookingRequest, ItemFields, ValidatedBooking};
pub use pricing::PriceQuote;
pub use queries::RangeCheck;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{
    mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedItemState = Arc<RwLock<ItemState>>;

pub const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_secs(2);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush + fsync for the whole batch, then answer each sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("wal flush of {} events failed: {e}", batch.len());
        }
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    tracing::debug!("wal writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-written bytes never prefix the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed outside a batch")));
        }
    }
}

/// Send one event to the writer task and wait until it is durable.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::Transient("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::Transient("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::Transient(format!("WAL write failed: {e}")))
}

// ── In-memory tables ─────────────────────────────────────

/// Everything the engine knows, rebuilt from the WAL at startup.
#[derive(Default)]
pub(super) struct Tables {
    pub(super) items: DashMap<Ulid, SharedItemState>,
    pub(super) users: DashMap<UserId, UserProfile>,
    /// Reverse lookup: booking id → item id.
    pub(super) booking_to_item: DashMap<Ulid, Ulid>,
}

impl Tables {
    pub(super) fn item_state(&self, id: &Ulid) -> Option<SharedItemState> {
        self.items.get(id).map(|e| e.value().clone())
    }

    fn all_item_states(&self) -> Vec<SharedItemState> {
        self.items.iter().map(|e| e.value().clone()).collect()
    }

    /// Items whose state `event` changes, sorted by id (the lock order).
    async fn affected_items(&self, event: &Event) -> Vec<Ulid> {
        let mut ids = match event {
            Event::UserUpserted { .. } | Event::ItemListed { .. } => Vec::new(),
            Event::ItemUpdated { item } => vec![item.id],
            Event::ItemDelisted { id } => vec![*id],
            Event::BookingCreated { booking } => vec![booking.item_id],
            Event::BookingStatusChanged { item_id, .. } => vec![*item_id],
            Event::UserRemoved { id } => {
                let mut hit = Vec::new();
                for rs in self.all_item_states() {
                    let guard = rs.read().await;
                    if guard.item.owner_id == *id || guard.bookings.iter().any(|b| b.renter_id == *id) {
                        hit.push(guard.item.id);
                    }
                }
                hit
            }
        };
        ids.sort();
        ids.dedup();
        ids
    }
}

fn guard_for(guards: &mut [ItemGuard], id: Ulid) -> Option<&mut ItemState> {
    guards.iter_mut().find(|g| g.item.id == id).map(|g| &mut **g)
}

fn drop_item(tables: &Tables, rs: &mut ItemState) {
    for booking in rs.bookings.drain(..) {
        tables.booking_to_item.remove(&booking.id);
    }
    tables.items.remove(&rs.item.id);
}

/// Apply an event to the tables. The caller holds write guards for every item
/// `Tables::affected_items` names for this event.
fn apply_event(tables: &Tables, guards: &mut [ItemGuard], event: &Event) {
    match event {
        Event::UserUpserted { profile } => {
            tables.users.insert(profile.id.clone(), profile.clone());
        }
        Event::UserRemoved { id } => {
            tables.users.remove(id);
            for rs in guards.iter_mut() {
                if rs.item.owner_id == *id {
                    drop_item(tables, rs);
                    continue;
                }
                rs.bookings.retain(|b| {
                    if b.renter_id == *id {
                        tables.booking_to_item.remove(&b.id);
                        false
                    } else {
                        true
                    }
                });
            }
        }
        Event::ItemListed { item } => {
            tables
                .items
                .insert(item.id, Arc::new(RwLock::new(ItemState::new(item.clone()))));
        }
        Event::ItemUpdated { item } => {
            if let Some(rs) = guard_for(guards, item.id) {
                rs.item = item.clone();
            }
        }
        Event::ItemDelisted { id } => {
            if let Some(rs) = guard_for(guards, *id) {
                drop_item(tables, rs);
            }
        }
        Event::BookingCreated { booking } => {
            if let Some(rs) = guard_for(guards, booking.item_id) {
                tables.booking_to_item.insert(booking.id, booking.item_id);
                rs.insert_booking(booking.clone());
            }
        }
        Event::BookingStatusChanged { id, item_id, status } => {
            if let Some(b) = guard_for(guards, *item_id).and_then(|rs| rs.booking_mut(*id)) {
                b.status = *status;
            }
        }
    }
}

// ── Commit scope ─────────────────────────────────────────

pub(super) type ItemGuard = OwnedRwLockWriteGuard<ItemState>;

/// Commits share the gate; compaction and catalog-wide changes take it exclusively.
pub(super) enum GateGuard {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Locks held from validation until the commit task has applied its event.
pub(super) struct CommitScope {
    _gate: GateGuard,
    items: Vec<ItemGuard>,
}

impl CommitScope {
    pub(super) fn new(gate: GateGuard, items: Vec<ItemGuard>) -> Self {
        Self { _gate: gate, items }
    }
}

pub struct Engine {
    pub(super) tables: Arc<Tables>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) persist_timeout: Duration,
}

impl Engine {
    /// Open the WAL at `wal_path`, replay it, and start the group-commit writer.
    pub async fn new(wal_path: PathBuf, persist_timeout: Duration) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let tables = Arc::new(Tables::default());
        // Sole owner of every lock here, so these acquisitions never wait.
        for event in &events {
            let ids = tables.affected_items(event).await;
            let mut guards = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(rs) = tables.item_state(&id) {
                    guards.push(rs.write_owned().await);
                }
            }
            apply_event(&tables, &mut guards, event);
        }
        tracing::info!(
            "replayed {} events: {} users, {} items, {} bookings",
            events.len(),
            tables.users.len(),
            tables.items.len(),
            tables.booking_to_item.len()
        );

        Ok(Self {
            tables,
            wal_tx,
            commit_gate: Arc::new(RwLock::new(())),
            persist_timeout,
        })
    }

    pub fn persist_timeout(&self) -> Duration {
        self.persist_timeout
    }

    /// Await `fut` for at most the persistence timeout.
    pub(super) async fn bounded<F: Future>(
        &self,
        what: &'static str,
        fut: F,
    ) -> Result<F::Output, EngineError> {
        tokio::time::timeout(self.persist_timeout, fut)
            .await
            .map_err(|_| EngineError::Transient(format!("timed out waiting for {what}")))
    }

    pub(super) async fn shared_gate(&self) -> Result<GateGuard, EngineError> {
        let gate = self.commit_gate.clone();
        self.bounded("commit gate", gate.read_owned())
            .await
            .map(GateGuard::Shared)
    }

    pub(super) async fn exclusive_gate(&self) -> Result<GateGuard, EngineError> {
        let gate = self.commit_gate.clone();
        self.bounded("commit gate", gate.write_owned())
            .await
            .map(GateGuard::Exclusive)
    }

    /// Write-lock one item, bounded by the persistence timeout.
    pub(super) async fn lock_item(&self, id: Ulid) -> Result<ItemGuard, EngineError> {
        let rs = self
            .tables
            .item_state(&id)
            .ok_or_else(|| EngineError::not_found("item", id))?;
        self.bounded("item lock", rs.write_owned()).await
    }

    /// Write-lock every item `event` touches, in id order.
    pub(super) async fn lock_affected(&self, event: &Event) -> Result<Vec<ItemGuard>, EngineError> {
        let ids = self.tables.affected_items(event).await;
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock_item(id).await?);
        }
        Ok(guards)
    }

    /// Make `event` durable, then apply it, in a task the caller cannot cancel.
    ///
    /// The task owns `scope`, so the locks stay held until the apply is done even
    /// if the caller gives up. A caller that times out gets `Transient`; the event
    /// may still land.
    pub(super) async fn commit(&self, scope: CommitScope, event: Event) -> Result<(), EngineError> {
        let wal_tx = self.wal_tx.clone();
        let tables = self.tables.clone();
        let task = tokio::spawn(async move {
            let mut scope = scope;
            wal_append(&wal_tx, &event).await?;
            apply_event(&tables, &mut scope.items, &event);
            Ok::<(), EngineError>(())
        });

        match tokio::time::timeout(self.persist_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(EngineError::Transient(format!("commit task failed: {join_err}"))),
            Err(_) => Err(EngineError::Transient("commit did not complete in time".into())),
        }
    }
}
