mod retry;

pub use retry::RetryPolicy;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{
    OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot,
};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::config::StoreConfig;
use crate::error::EngineError;
use crate::limits::MAX_TRANSACTION_RETRIES;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::{Frame, Wal};

pub type SharedClassRow = Arc<RwLock<ClassRow>>;
pub type SharedTrainerCalendar = Arc<RwLock<TrainerCalendar>>;
pub type SharedPersonalSession = Arc<RwLock<PersonalSessionRow>>;
pub type SharedLedgerSlot = Arc<RwLock<LedgerSlot>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        frame: Frame,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Frame, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { frame, response } => {
                let mut batch = vec![(frame, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { frame, response }) => batch.push((frame, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // nothing else queued
                    }
                }

                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(frame, _)| wal.append_buffered(frame))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        // Every sender in this batch is told it failed, so none of its frames
        // may survive into the file.
        warn!(error = %e, frames = batch.len(), "WAL batch failed, rolling back");
        if let Err(rollback) = wal.discard_unsynced() {
            error!(error = %rollback, "WAL rollback failed, refusing further appends");
        }
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { frame, response } => {
            let mut batch = vec![(frame, response)];
            flush_and_respond(wal, &mut batch);
        }
    }
}

// ── Store ────────────────────────────────────────────────

/// The transactional boundary every component writes through.
///
/// Rows live in memory behind per-row `RwLock`s; holding a row's write lock is the
/// equivalent of `SELECT ... FOR UPDATE` on it. A [`Transaction`] stages events and
/// commits them to the WAL as a single frame; only after the frame is durable does
/// the caller apply the events to the rows it holds locked.
pub struct Store {
    pub(crate) members: DashMap<Ulid, String>,
    pub(crate) trainers: DashMap<Ulid, SharedTrainerCalendar>,
    pub(crate) classes: DashMap<Ulid, SharedClassRow>,
    pub(crate) personal: DashMap<Ulid, SharedPersonalSession>,
    /// Keyed by owning billable event (registration or personal session id).
    pub(crate) ledger: DashMap<Ulid, SharedLedgerSlot>,
    /// Reverse lookup: registration id → class session id
    pub(crate) registration_index: DashMap<Ulid, Ulid>,
    /// Reverse lookup: ledger entry id → owning event id
    pub(crate) entry_index: DashMap<Ulid, Ulid>,
    /// Member/trainer ids with a registration in flight. See [`Store::claim_seed`].
    seed_claims: DashMap<Ulid, ()>,
    /// Transactions hold this shared for their whole lifetime; compaction takes it
    /// exclusively so its snapshot and the WAL swap see no commit in between.
    commit_gate: Arc<RwLock<()>>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    config: StoreConfig,
}

impl Store {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called from within a tokio runtime.
    pub fn open(wal_path: PathBuf, config: StoreConfig) -> io::Result<Self> {
        let frames = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            members: DashMap::new(),
            trainers: DashMap::new(),
            classes: DashMap::new(),
            personal: DashMap::new(),
            ledger: DashMap::new(),
            registration_index: DashMap::new(),
            entry_index: DashMap::new(),
            seed_claims: DashMap::new(),
            commit_gate: Arc::new(RwLock::new(())),
            wal_tx,
            notify: Arc::new(NotifyHub::new()),
            config,
        };

        let mut replayed = 0usize;
        for frame in &frames {
            for event in frame {
                store.replay_event(event);
                replayed += 1;
            }
        }
        info!(
            frames = frames.len(),
            events = replayed,
            path = %wal_path.display(),
            "store opened"
        );
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Start a transaction. Take it before any row lock.
    pub async fn begin(&self) -> Result<Transaction<'_>, EngineError> {
        let gate = tokio::time::timeout(
            self.config.lock_timeout,
            self.commit_gate.clone().read_owned(),
        )
        .await
        .map_err(|_| self.lock_timed_out("commit gate"))?;
        Ok(Transaction {
            store: self,
            staged: Vec::new(),
            _gate: gate,
        })
    }

    /// Run `body` as a transaction, retrying from scratch on retryable failures
    /// with the configured backoff. Exhausting retries surfaces the last error.
    pub async fn run_transaction<T, F, Fut>(&self, op: &'static str, mut body: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let policy = &self.config.retry;
        let max_retries = policy.max_retries.min(MAX_TRANSACTION_RETRIES);
        let mut attempt = 0usize;
        loop {
            match body().await {
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "transaction failed, retrying");
                    metrics::counter!(observability::TRANSACTION_RETRIES_TOTAL, "op" => op).increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    error!(op, attempt, error = %e, "transaction failed after max retries");
                    metrics::counter!(observability::TRANSACTION_EXHAUSTED_TOTAL, "op" => op).increment(1);
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    // ── Row locks ────────────────────────────────────────────

    fn lock_timed_out(&self, what: &'static str) -> EngineError {
        metrics::counter!(observability::LOCK_TIMEOUTS_TOTAL, "row" => what).increment(1);
        EngineError::TransientStore(format!(
            "timed out after {}ms waiting for {what} lock",
            self.config.lock_timeout.as_millis()
        ))
    }

    async fn write_row<T>(
        &self,
        row: Arc<RwLock<T>>,
        what: &'static str,
    ) -> Result<OwnedRwLockWriteGuard<T>, EngineError> {
        tokio::time::timeout(self.config.lock_timeout, row.write_owned())
            .await
            .map_err(|_| self.lock_timed_out(what))
    }

    async fn read_row<T>(
        &self,
        row: Arc<RwLock<T>>,
        what: &'static str,
    ) -> Result<OwnedRwLockReadGuard<T>, EngineError> {
        tokio::time::timeout(self.config.lock_timeout, row.read_owned())
            .await
            .map_err(|_| self.lock_timed_out(what))
    }

    pub fn get_class(&self, id: &Ulid) -> Option<SharedClassRow> {
        self.classes.get(id).map(|e| e.value().clone())
    }

    pub fn get_trainer(&self, id: &Ulid) -> Option<SharedTrainerCalendar> {
        self.trainers.get(id).map(|e| e.value().clone())
    }

    pub fn get_personal(&self, id: &Ulid) -> Option<SharedPersonalSession> {
        self.personal.get(id).map(|e| e.value().clone())
    }

    pub fn get_ledger_slot(&self, event_id: &Ulid) -> Option<SharedLedgerSlot> {
        self.ledger.get(event_id).map(|e| e.value().clone())
    }

    pub fn member_exists(&self, id: &Ulid) -> bool {
        self.members.contains_key(id)
    }

    /// Claim a member or trainer id for the duration of its registration
    /// transaction. Returns `None` while another registration of the same id is
    /// in flight; the claim is released when the guard drops.
    pub fn claim_seed(&self, id: Ulid) -> Option<SeedClaim<'_>> {
        match self.seed_claims.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(SeedClaim { store: self, id })
            }
        }
    }

    pub fn session_for_registration(&self, registration_id: &Ulid) -> Option<Ulid> {
        self.registration_index.get(registration_id).map(|e| *e.value())
    }

    pub fn event_for_entry(&self, entry_id: &Ulid) -> Option<Ulid> {
        self.entry_index.get(entry_id).map(|e| *e.value())
    }

    pub async fn lock_class(&self, id: Ulid) -> Result<OwnedRwLockWriteGuard<ClassRow>, EngineError> {
        let row = self.get_class(&id).ok_or(EngineError::NotFound(id))?;
        self.write_row(row, "class").await
    }

    pub async fn read_class(&self, id: Ulid) -> Result<OwnedRwLockReadGuard<ClassRow>, EngineError> {
        let row = self.get_class(&id).ok_or(EngineError::NotFound(id))?;
        self.read_row(row, "class").await
    }

    pub async fn lock_trainer(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<TrainerCalendar>, EngineError> {
        let row = self.get_trainer(&id).ok_or(EngineError::NotFound(id))?;
        self.write_row(row, "trainer").await
    }

    pub async fn read_trainer(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<TrainerCalendar>, EngineError> {
        let row = self.get_trainer(&id).ok_or(EngineError::NotFound(id))?;
        self.read_row(row, "trainer").await
    }

    pub async fn lock_personal(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<PersonalSessionRow>, EngineError> {
        let row = self.get_personal(&id).ok_or(EngineError::NotFound(id))?;
        self.write_row(row, "personal_session").await
    }

    pub async fn read_personal(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<PersonalSessionRow>, EngineError> {
        let row = self.get_personal(&id).ok_or(EngineError::NotFound(id))?;
        self.read_row(row, "personal_session").await
    }

    /// Lock the ledger slot for `event_id`, creating an empty one if none exists.
    pub async fn lock_or_create_ledger_slot(
        &self,
        event_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<LedgerSlot>, EngineError> {
        let slot = self
            .ledger
            .entry(event_id)
            .or_insert_with(|| Arc::new(RwLock::new(LedgerSlot::new(event_id))))
            .value()
            .clone();
        self.write_row(slot, "ledger").await
    }

    pub async fn lock_ledger_slot(
        &self,
        event_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<LedgerSlot>, EngineError> {
        let slot = self
            .get_ledger_slot(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        self.write_row(slot, "ledger").await
    }

    pub async fn read_ledger_slot(
        &self,
        event_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<LedgerSlot>, EngineError> {
        let slot = self
            .get_ledger_slot(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        self.read_row(slot, "ledger").await
    }

    // ── Commit plumbing ──────────────────────────────────────

    /// Write a frame to the WAL via the background group-commit writer.
    async fn wal_append(&self, frame: Frame) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { frame, response: tx })
            .await
            .map_err(|_| EngineError::TransientStore("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::TransientStore("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::TransientStore(format!("WAL write failed: {e}")))
    }

    /// Effects of a committed event that live outside any lockable row: new rows
    /// and reverse indexes.
    fn index(&self, event: &Event) {
        match event {
            Event::MemberRegistered { id, name } => {
                self.members.insert(*id, name.clone());
            }
            Event::TrainerRegistered { id, name } => {
                self.trainers
                    .entry(*id)
                    .or_insert_with(|| Arc::new(RwLock::new(TrainerCalendar::new(*id, name.clone()))));
            }
            Event::ClassScheduled { id, .. } | Event::ClassRestored { id, .. } => {
                if let Some(row) = ClassRow::from_event(event) {
                    for reg in &row.registrations {
                        self.registration_index.insert(reg.id, *id);
                    }
                    self.classes.insert(*id, Arc::new(RwLock::new(row)));
                }
            }
            Event::RegistrationConfirmed { id, session_id, .. } => {
                self.registration_index.insert(*id, *session_id);
            }
            Event::PersonalSessionBooked { id, .. } => {
                if let Some(row) = PersonalSessionRow::from_event(event) {
                    self.personal.insert(*id, Arc::new(RwLock::new(row)));
                }
            }
            Event::ChargePosted { id, event_id, .. } => {
                self.entry_index.insert(*id, *event_id);
                self.ledger
                    .entry(*event_id)
                    .or_insert_with(|| Arc::new(RwLock::new(LedgerSlot::new(*event_id))));
            }
            _ => {}
        }
    }

    /// Apply an event during WAL replay. We're the sole owner of every row here,
    /// so `try_write` always succeeds; it is never `blocking_write`, which would
    /// panic inside the async runtime.
    fn replay_event(&self, event: &Event) {
        self.index(event);
        match event {
            Event::ClassScheduled { trainer_id, .. } | Event::ClassRestored { trainer_id, .. } => {
                if let Some(cal) = self.get_trainer(trainer_id)
                    && let Ok(mut guard) = cal.try_write()
                {
                    guard.apply(event);
                }
            }
            Event::ClassUpdated { id, trainer_id, .. } => {
                if let Some(row) = self.get_class(id)
                    && let Ok(mut guard) = row.try_write()
                {
                    guard.apply(event);
                }
                if let Some(cal) = self.get_trainer(trainer_id)
                    && let Ok(mut guard) = cal.try_write()
                {
                    guard.apply(event);
                }
            }
            Event::RegistrationConfirmed { session_id, .. }
            | Event::RegistrationCancelled { session_id, .. }
            | Event::AttendanceMarked { session_id, .. } => {
                if let Some(row) = self.get_class(session_id)
                    && let Ok(mut guard) = row.try_write()
                {
                    guard.apply(event);
                }
            }
            Event::PersonalSessionBooked { trainer_id, .. } => {
                if let Some(cal) = self.get_trainer(trainer_id)
                    && let Ok(mut guard) = cal.try_write()
                {
                    guard.apply(event);
                }
            }
            Event::PersonalSessionUpdated { id, trainer_id, .. } => {
                if let Some(row) = self.get_personal(id)
                    && let Ok(mut guard) = row.try_write()
                {
                    guard.apply(event);
                }
                if let Some(cal) = self.get_trainer(trainer_id)
                    && let Ok(mut guard) = cal.try_write()
                {
                    guard.apply(event);
                }
            }
            Event::ChargePosted { event_id, .. }
            | Event::PaymentRecorded { event_id, .. }
            | Event::ChargeVoided { event_id, .. }
            | Event::ChargeOverdue { event_id, .. } => {
                if let Some(slot) = self.get_ledger_slot(event_id)
                    && let Ok(mut guard) = slot.try_write()
                {
                    guard.apply(event);
                }
            }
            Event::MemberRegistered { .. } | Event::TrainerRegistered { .. } => {}
        }
    }

    /// Single-event transaction on a locked class row: commit, apply, notify.
    pub async fn persist_and_apply_class(
        &self,
        mut tx: Transaction<'_>,
        row: &mut ClassRow,
        event: Event,
    ) -> Result<(), EngineError> {
        tx.stage(event);
        let frame = tx.commit().await?;
        for event in &frame {
            row.apply(event);
            self.notify.send(row.id, event);
        }
        Ok(())
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL as the minimal set of events that recreates the current state.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let _exclusive = tokio::time::timeout(
            self.config.lock_timeout,
            self.commit_gate.clone().write_owned(),
        )
        .await
        .map_err(|_| self.lock_timed_out("commit gate"))?;

        let mut snapshot = Vec::new();
        for entry in self.members.iter() {
            snapshot.push(Event::MemberRegistered {
                id: *entry.key(),
                name: entry.value().clone(),
            });
        }

        let trainers: Vec<SharedTrainerCalendar> =
            self.trainers.iter().map(|e| e.value().clone()).collect();
        for cal in trainers {
            let guard = self.read_row(cal, "trainer").await?;
            snapshot.push(Event::TrainerRegistered {
                id: guard.id,
                name: guard.name.clone(),
            });
        }

        let classes: Vec<SharedClassRow> = self.classes.iter().map(|e| e.value().clone()).collect();
        for row in classes {
            snapshot.push(self.read_row(row, "class").await?.snapshot());
        }

        let personal: Vec<SharedPersonalSession> =
            self.personal.iter().map(|e| e.value().clone()).collect();
        for row in personal {
            let guard = self.read_row(row, "personal_session").await?;
            snapshot.push(Event::PersonalSessionBooked {
                id: guard.id,
                member_id: guard.member_id,
                trainer_id: guard.trainer_id,
                window: guard.window,
                notes: guard.notes.clone(),
            });
            if guard.status != PersonalSessionStatus::Scheduled {
                snapshot.push(Event::PersonalSessionUpdated {
                    id: guard.id,
                    trainer_id: guard.trainer_id,
                    status: guard.status,
                    notes: None,
                });
            }
        }

        let slots: Vec<SharedLedgerSlot> = self.ledger.iter().map(|e| e.value().clone()).collect();
        for slot in slots {
            let guard = self.read_row(slot, "ledger").await?;
            for entry in &guard.entries {
                snapshot.push(Event::ChargePosted {
                    id: entry.id,
                    event_id: entry.event_id,
                    member_id: entry.member_id,
                    amount: entry.amount,
                    description: entry.description.clone(),
                    posted_at: entry.posted_at,
                    due_at: entry.due_at,
                });
                let follow_up = match entry.status {
                    PaymentStatus::Pending => None,
                    PaymentStatus::Paid => Some(Event::PaymentRecorded {
                        id: entry.id,
                        event_id: entry.event_id,
                        paid_at: entry.paid_at.unwrap_or(entry.posted_at),
                    }),
                    PaymentStatus::Overdue => Some(Event::ChargeOverdue {
                        id: entry.id,
                        event_id: entry.event_id,
                    }),
                    PaymentStatus::Void => Some(Event::ChargeVoided {
                        id: entry.id,
                        event_id: entry.event_id,
                    }),
                };
                snapshot.extend(follow_up);
            }
        }

        let events = snapshot.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| EngineError::TransientStore("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::TransientStore("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::TransientStore(format!("WAL compaction failed: {e}")))?;
        info!(events, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
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
}

/// Held while a member or trainer row is being created.
pub struct SeedClaim<'s> {
    store: &'s Store,
    id: Ulid,
}

impl Drop for SeedClaim<'_> {
    fn drop(&mut self) {
        self.store.seed_claims.remove(&self.id);
    }
}

/// A unit of work against the store. Events staged here become visible together
/// on [`Transaction::commit`]; dropping the transaction uncommitted discards them.
pub struct Transaction<'s> {
    store: &'s Store,
    staged: Frame,
    _gate: OwnedRwLockReadGuard<()>,
}

impl Transaction<'_> {
    pub fn stage(&mut self, event: Event) {
        self.staged.push(event);
    }

    pub fn staged(&self) -> &[Event] {
        &self.staged
    }

    /// Make the staged events durable as one WAL frame and publish new rows and
    /// indexes. On `Ok` the caller must apply the returned events to the rows it
    /// holds locked; on `Err` nothing was committed.
    pub async fn commit(self) -> Result<Frame, EngineError> {
        if self.staged.is_empty() {
            return Ok(Vec::new());
        }
        self.store.wal_append(self.staged.clone()).await?;
        for event in &self.staged {
            self.store.index(event);
        }
        Ok(self.staged)
    }
}
