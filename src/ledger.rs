use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::EngineError;
use crate::model::*;
use crate::observability;
use crate::store::Store;
use crate::validate::now_ms;

const PERSONAL_SESSION_DESCRIPTION: &str = "Personal training session";

/// What `void` did. Leaving a paid charge alone is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoidOutcome {
    Voided(Ulid),
    /// The live entry was not Pending and was left as is.
    NoOp { entry_id: Ulid, status: PaymentStatus },
    /// Nothing to void: no charge was ever posted, or it was already void.
    NoEntry,
}

/// Who pays for a billable event and how the charge reads on their statement.
struct Payer {
    member_id: Ulid,
    description: String,
}

/// One monetary obligation per billable event, keyed by the event's id
/// (registration or personal session). Every call is its own transaction,
/// independent of the reservation that triggered it.
pub struct BillingLedger {
    store: Arc<Store>,
}

impl BillingLedger {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Post a Pending charge for `event_id`. Calling it again for the same event
    /// returns the existing entry instead of creating a second one.
    pub async fn charge(&self, event_id: Ulid, amount: Decimal) -> Result<Ulid, EngineError> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation("charge amount must be positive"));
        }
        if self.store.session_for_registration(&event_id).is_none()
            && self.store.get_personal(&event_id).is_none()
        {
            return Err(EngineError::NotFound(event_id));
        }

        let (entry_id, posted) = self
            .store
            .run_transaction("charge", || async {
                let mut tx = self.store.begin().await?;
                let mut slot = self.store.lock_or_create_ledger_slot(event_id).await?;

                if let Some(live) = slot.live() {
                    if live.amount != amount {
                        warn!(
                            %event_id,
                            entry_id = %live.id,
                            existing = %live.amount,
                            requested = %amount,
                            "charge retried with a different amount, keeping existing entry"
                        );
                    }
                    return Ok((live.id, false));
                }
                if !slot.entries.is_empty() {
                    return Err(EngineError::InvalidTransition {
                        from: PaymentStatus::Void.as_str(),
                        to: PaymentStatus::Pending.as_str(),
                    });
                }

                // Ledger slot before the owning row: the global lock order.
                let payer = self.resolve_payer(event_id).await?;
                let posted_at = now_ms();
                let id = Ulid::new();
                tx.stage(Event::ChargePosted {
                    id,
                    event_id,
                    member_id: payer.member_id,
                    amount,
                    description: payer.description,
                    posted_at,
                    due_at: posted_at + self.store.config().billing_due_after_ms,
                });
                for event in tx.commit().await? {
                    slot.apply(&event);
                }
                Ok((id, true))
            })
            .await?;

        if posted {
            metrics::counter!(observability::LEDGER_ENTRIES_TOTAL, "status" => PaymentStatus::Pending.as_str())
                .increment(1);
            info!(%event_id, %entry_id, %amount, "charge posted");
        } else {
            debug!(%event_id, %entry_id, "charge already posted");
        }
        Ok(entry_id)
    }

    /// Read-lock the owning row and make sure it can still be billed.
    async fn resolve_payer(&self, event_id: Ulid) -> Result<Payer, EngineError> {
        if let Some(session_id) = self.store.session_for_registration(&event_id) {
            let row = self.store.read_class(session_id).await?;
            let reg = row
                .registration(event_id)
                .ok_or(EngineError::NotFound(event_id))?;
            if !reg.status.is_active() {
                return Err(EngineError::InvalidTransition {
                    from: reg.status.as_str(),
                    to: "charged",
                });
            }
            return Ok(Payer {
                member_id: reg.member_id,
                description: row.name.clone(),
            });
        }

        let row = self.store.read_personal(event_id).await?;
        if row.status == PersonalSessionStatus::Cancelled {
            return Err(EngineError::InvalidTransition {
                from: row.status.as_str(),
                to: "charged",
            });
        }
        Ok(Payer {
            member_id: row.member_id,
            description: PERSONAL_SESSION_DESCRIPTION.into(),
        })
    }

    /// Pending or Overdue → Paid. Paying a Paid entry again is a no-op.
    pub async fn mark_paid(&self, entry_id: Ulid, paid_at: Ms) -> Result<(), EngineError> {
        let event_id = self
            .store
            .event_for_entry(&entry_id)
            .ok_or(EngineError::NotFound(entry_id))?;

        let changed = self
            .store
            .run_transaction("mark_paid", || async {
                let mut tx = self.store.begin().await?;
                let mut slot = self.store.lock_ledger_slot(event_id).await?;
                let entry = slot.entry(entry_id).ok_or(EngineError::NotFound(entry_id))?;
                match entry.status {
                    PaymentStatus::Paid => return Ok(false),
                    PaymentStatus::Void => {
                        return Err(EngineError::InvalidTransition {
                            from: PaymentStatus::Void.as_str(),
                            to: PaymentStatus::Paid.as_str(),
                        });
                    }
                    PaymentStatus::Pending | PaymentStatus::Overdue => {}
                }
                tx.stage(Event::PaymentRecorded {
                    id: entry_id,
                    event_id,
                    paid_at,
                });
                for event in tx.commit().await? {
                    slot.apply(&event);
                }
                Ok(true)
            })
            .await?;

        if changed {
            metrics::counter!(observability::LEDGER_ENTRIES_TOTAL, "status" => PaymentStatus::Paid.as_str())
                .increment(1);
            info!(%entry_id, %event_id, "payment recorded");
        } else {
            debug!(%entry_id, "entry already paid");
        }
        Ok(())
    }

    /// Void the Pending charge for `event_id`, if there is one.
    pub async fn void(&self, event_id: Ulid) -> Result<VoidOutcome, EngineError> {
        if self.store.get_ledger_slot(&event_id).is_none() {
            return Ok(VoidOutcome::NoEntry);
        }

        let outcome = self
            .store
            .run_transaction("void", || async {
                let mut tx = self.store.begin().await?;
                let mut slot = self.store.lock_ledger_slot(event_id).await?;
                let Some(live) = slot.live() else {
                    return Ok(VoidOutcome::NoEntry);
                };
                if live.status != PaymentStatus::Pending {
                    return Ok(VoidOutcome::NoOp {
                        entry_id: live.id,
                        status: live.status,
                    });
                }
                let entry_id = live.id;
                tx.stage(Event::ChargeVoided {
                    id: entry_id,
                    event_id,
                });
                for event in tx.commit().await? {
                    slot.apply(&event);
                }
                Ok(VoidOutcome::Voided(entry_id))
            })
            .await?;

        match &outcome {
            VoidOutcome::Voided(entry_id) => {
                metrics::counter!(observability::LEDGER_ENTRIES_TOTAL, "status" => PaymentStatus::Void.as_str())
                    .increment(1);
                info!(%event_id, %entry_id, "charge voided");
            }
            VoidOutcome::NoOp { entry_id, status } => {
                info!(%event_id, %entry_id, status = status.as_str(), "charge left untouched");
            }
            VoidOutcome::NoEntry => debug!(%event_id, "no charge to void"),
        }
        Ok(outcome)
    }

    /// Flip every Pending entry due at or before `now` to Overdue. Returns the
    /// ids of the entries it changed. A slot that stays locked or fails to commit
    /// is logged and left for the next sweep; the rest still go through.
    pub async fn mark_overdue(&self, now: Ms) -> Result<Vec<Ulid>, EngineError> {
        let event_ids: Vec<Ulid> = self.store.ledger.iter().map(|e| *e.key()).collect();
        let mut candidates = Vec::new();
        for event_id in event_ids {
            let guard = match self.store.read_ledger_slot(event_id).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(%event_id, error = %e, "skipping ledger slot in overdue scan");
                    continue;
                }
            };
            if guard
                .entries
                .iter()
                .any(|e| e.status == PaymentStatus::Pending && e.due_at <= now)
            {
                candidates.push(event_id);
            }
        }

        let mut changed = Vec::new();
        let mut skipped = 0usize;
        for event_id in candidates {
            let result = self
                .store
                .run_transaction("mark_overdue", || async {
                    let mut tx = self.store.begin().await?;
                    let mut slot = self.store.lock_ledger_slot(event_id).await?;
                    // Re-check under the lock: a payment may have landed since the scan.
                    let due: Vec<Ulid> = slot
                        .entries
                        .iter()
                        .filter(|e| e.status == PaymentStatus::Pending && e.due_at <= now)
                        .map(|e| e.id)
                        .collect();
                    for &id in &due {
                        tx.stage(Event::ChargeOverdue { id, event_id });
                    }
                    for event in tx.commit().await? {
                        slot.apply(&event);
                    }
                    Ok(due)
                })
                .await;
            match result {
                Ok(ids) => changed.extend(ids),
                Err(e) => {
                    skipped += 1;
                    warn!(%event_id, error = %e, "failed to mark charge overdue, will retry next sweep");
                }
            }
        }

        if !changed.is_empty() {
            metrics::counter!(observability::LEDGER_ENTRIES_TOTAL, "status" => PaymentStatus::Overdue.as_str())
                .increment(changed.len() as u64);
            info!(count = changed.len(), skipped, "charges marked overdue");
        }
        Ok(changed)
    }

    // ── Queries ──────────────────────────────────────────────

    pub async fn entry(&self, entry_id: Ulid) -> Result<LedgerEntry, EngineError> {
        let event_id = self
            .store
            .event_for_entry(&entry_id)
            .ok_or(EngineError::NotFound(entry_id))?;
        let slot = self.store.read_ledger_slot(event_id).await?;
        slot.entry(entry_id)
            .cloned()
            .ok_or(EngineError::NotFound(entry_id))
    }

    /// Every entry ever posted for the event, voided ones included, oldest first.
    pub async fn entries_for_event(&self, event_id: Ulid) -> Result<Vec<LedgerEntry>, EngineError> {
        match self.store.get_ledger_slot(&event_id) {
            Some(_) => Ok(self.store.read_ledger_slot(event_id).await?.entries.clone()),
            None => Ok(Vec::new()),
        }
    }

    /// The member's billing history, newest first.
    pub async fn history_for_member(&self, member_id: Ulid) -> Vec<LedgerEntry> {
        let slots: Vec<_> = self.store.ledger.iter().map(|e| e.value().clone()).collect();
        let mut history = Vec::new();
        for slot in slots {
            let guard = slot.read().await;
            history.extend(guard.entries.iter().filter(|e| e.member_id == member_id).cloned());
        }
        history.sort_by(|a, b| b.posted_at.cmp(&a.posted_at).then(b.id.cmp(&a.id)));
        history
    }

    pub async fn member_summary(&self, member_id: Ulid) -> BillingSummary {
        let history = self.history_for_member(member_id).await;
        let mut summary = BillingSummary {
            member_id,
            pending: Decimal::ZERO,
            overdue: Decimal::ZERO,
            paid: Decimal::ZERO,
            voided: Decimal::ZERO,
            entries: history.len(),
        };
        for entry in &history {
            let bucket = match entry.status {
                PaymentStatus::Pending => &mut summary.pending,
                PaymentStatus::Overdue => &mut summary.overdue,
                PaymentStatus::Paid => &mut summary.paid,
                PaymentStatus::Void => &mut summary.voided,
            };
            *bucket += entry.amount;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use rust_decimal_macros::dec;

    const H: Ms = 3_600_000;

    fn test_store(name: &str, config: StoreConfig) -> Arc<Store> {
        let dir = std::env::temp_dir().join("classbook_test_ledger");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        Arc::new(Store::open(path, config).unwrap())
    }

    /// A member with one Confirmed registration, committed straight through the store.
    async fn seed_registration(store: &Store) -> (Ulid, Ulid, Ulid) {
        let member_id = Ulid::new();
        let trainer_id = Ulid::new();
        let class_id = Ulid::new();
        let reg_id = Ulid::new();
        let start = now_ms() + 24 * H;

        let mut tx = store.begin().await.unwrap();
        tx.stage(Event::MemberRegistered {
            id: member_id,
            name: "Ada".into(),
        });
        tx.stage(Event::TrainerRegistered {
            id: trainer_id,
            name: "Kim".into(),
        });
        tx.stage(Event::ClassScheduled {
            id: class_id,
            name: "Yoga".into(),
            trainer_id,
            room_id: None,
            window: Span::new(start, start + H),
            capacity: 5,
            fee: dec!(50.00),
        });
        tx.commit().await.unwrap();

        let tx = store.begin().await.unwrap();
        let mut row = store.lock_class(class_id).await.unwrap();
        store
            .persist_and_apply_class(
                tx,
                &mut row,
                Event::RegistrationConfirmed {
                    id: reg_id,
                    member_id,
                    session_id: class_id,
                    created_at: now_ms(),
                },
            )
            .await
            .unwrap();
        (member_id, class_id, reg_id)
    }

    #[tokio::test]
    async fn charge_twice_yields_one_entry() {
        let store = test_store("charge_twice.wal", StoreConfig::default());
        let ledger = BillingLedger::new(store.clone());
        let (member_id, _, reg) = seed_registration(&store).await;

        let first = ledger.charge(reg, dec!(50.00)).await.unwrap();
        let second = ledger.charge(reg, dec!(50.00)).await.unwrap();
        assert_eq!(first, second);

        let entries = ledger.entries_for_event(reg).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, PaymentStatus::Pending);
        assert_eq!(entries[0].amount, dec!(50.00));
        assert_eq!(entries[0].member_id, member_id);
        assert_eq!(entries[0].description, "Yoga");
        assert_eq!(
            entries[0].due_at - entries[0].posted_at,
            StoreConfig::default().billing_due_after_ms
        );
    }

    #[tokio::test]
    async fn concurrent_charges_post_once() {
        let store = test_store("charge_concurrent.wal", StoreConfig::default());
        let ledger = Arc::new(BillingLedger::new(store.clone()));
        let (_, _, reg) = seed_registration(&store).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.charge(reg, dec!(50.00)).await }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(ledger.entries_for_event(reg).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn void_after_paid_is_noop() {
        let store = test_store("void_after_paid.wal", StoreConfig::default());
        let ledger = BillingLedger::new(store.clone());
        let (_, _, reg) = seed_registration(&store).await;

        let entry_id = ledger.charge(reg, dec!(50.00)).await.unwrap();
        let today = now_ms();
        ledger.mark_paid(entry_id, today).await.unwrap();

        let outcome = ledger.void(reg).await.unwrap();
        assert_eq!(
            outcome,
            VoidOutcome::NoOp {
                entry_id,
                status: PaymentStatus::Paid
            }
        );
        let entry = ledger.entry(entry_id).await.unwrap();
        assert_eq!(entry.status, PaymentStatus::Paid);
        assert_eq!(entry.paid_at, Some(today));
    }

    #[tokio::test]
    async fn void_pending_then_pay_is_invalid() {
        let store = test_store("void_then_pay.wal", StoreConfig::default());
        let ledger = BillingLedger::new(store.clone());
        let (_, _, reg) = seed_registration(&store).await;

        let entry_id = ledger.charge(reg, dec!(50.00)).await.unwrap();
        assert_eq!(ledger.void(reg).await.unwrap(), VoidOutcome::Voided(entry_id));
        assert_eq!(ledger.void(reg).await.unwrap(), VoidOutcome::NoEntry);

        let result = ledger.mark_paid(entry_id, now_ms()).await;
        assert!(matches!(result, Err(EngineError::InvalidTransition { from: "void", .. })));

        // The event already had its one charge; it is not re-billed.
        let again = ledger.charge(reg, dec!(50.00)).await;
        assert!(matches!(again, Err(EngineError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn mark_paid_twice_is_idempotent() {
        let store = test_store("paid_twice.wal", StoreConfig::default());
        let ledger = BillingLedger::new(store.clone());
        let (_, _, reg) = seed_registration(&store).await;

        let entry_id = ledger.charge(reg, dec!(50.00)).await.unwrap();
        ledger.mark_paid(entry_id, 1).await.unwrap();
        ledger.mark_paid(entry_id, 2).await.unwrap();
        assert_eq!(ledger.entry(entry_id).await.unwrap().paid_at, Some(1));
    }

    #[tokio::test]
    async fn charge_rejects_bad_input() {
        let store = test_store("charge_bad_input.wal", StoreConfig::default());
        let ledger = BillingLedger::new(store.clone());
        let (_, _, reg) = seed_registration(&store).await;

        assert!(matches!(ledger.charge(reg, dec!(0)).await, Err(EngineError::Validation(_))));
        let unknown = Ulid::new();
        assert!(matches!(
            ledger.charge(unknown, dec!(10)).await,
            Err(EngineError::NotFound(id)) if id == unknown
        ));
        assert!(store.get_ledger_slot(&unknown).is_none());
        assert!(matches!(
            ledger.mark_paid(Ulid::new(), now_ms()).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_registration_is_not_billed() {
        let store = test_store("charge_cancelled.wal", StoreConfig::default());
        let ledger = BillingLedger::new(store.clone());
        let (_, class_id, reg) = seed_registration(&store).await;

        let tx = store.begin().await.unwrap();
        let mut row = store.lock_class(class_id).await.unwrap();
        store
            .persist_and_apply_class(
                tx,
                &mut row,
                Event::RegistrationCancelled {
                    id: reg,
                    session_id: class_id,
                },
            )
            .await
            .unwrap();
        drop(row);

        let result = ledger.charge(reg, dec!(50.00)).await;
        assert!(matches!(result, Err(EngineError::InvalidTransition { from: "cancelled", .. })));
        assert!(ledger.entries_for_event(reg).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overdue_sweep_and_summary() {
        let config = StoreConfig {
            billing_due_after_ms: H,
            ..StoreConfig::default()
        };
        let store = test_store("overdue.wal", config);
        let ledger = BillingLedger::new(store.clone());
        let (member_id, _, reg) = seed_registration(&store).await;

        let entry_id = ledger.charge(reg, dec!(50.00)).await.unwrap();
        let due_at = ledger.entry(entry_id).await.unwrap().due_at;

        assert!(ledger.mark_overdue(due_at - 1).await.unwrap().is_empty());
        assert_eq!(ledger.mark_overdue(due_at).await.unwrap(), vec![entry_id]);
        // Already overdue: nothing left to flip.
        assert!(ledger.mark_overdue(due_at + H).await.unwrap().is_empty());

        let summary = ledger.member_summary(member_id).await;
        assert_eq!(summary.overdue, dec!(50.00));
        assert_eq!(summary.outstanding(), dec!(50.00));
        assert_eq!(summary.entries, 1);

        // Overdue can still be paid, and a paid entry is not voided.
        ledger.mark_paid(entry_id, due_at + H).await.unwrap();
        let summary = ledger.member_summary(member_id).await;
        assert_eq!(summary.paid, dec!(50.00));
        assert_eq!(summary.outstanding(), Decimal::ZERO);
        assert!(matches!(ledger.void(reg).await.unwrap(), VoidOutcome::NoOp { .. }));
    }

    #[tokio::test]
    async fn overdue_sweep_skips_a_locked_slot() {
        let config = StoreConfig {
            lock_timeout: std::time::Duration::from_millis(50),
            retry: crate::store::RetryPolicy::none(),
            billing_due_after_ms: H,
        };
        let store = test_store("overdue_locked.wal", config);
        let ledger = BillingLedger::new(store.clone());
        let (_, _, busy_reg) = seed_registration(&store).await;
        let (_, _, free_reg) = seed_registration(&store).await;
        let busy = ledger.charge(busy_reg, dec!(50.00)).await.unwrap();
        let free = ledger.charge(free_reg, dec!(50.00)).await.unwrap();
        let now = ledger.entry(free).await.unwrap().due_at + 1;

        let held = store.lock_ledger_slot(busy_reg).await.unwrap();
        assert_eq!(ledger.mark_overdue(now).await.unwrap(), vec![free]);
        drop(held);

        assert_eq!(ledger.mark_overdue(now).await.unwrap(), vec![busy]);
        assert_eq!(ledger.entry(busy).await.unwrap().status, PaymentStatus::Overdue);
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let store = test_store("history.wal", StoreConfig::default());
        let ledger = BillingLedger::new(store.clone());
        let (member_id, class_id, first_reg) = seed_registration(&store).await;

        let second_reg = Ulid::new();
        let tx = store.begin().await.unwrap();
        let mut row = store.lock_class(class_id).await.unwrap();
        // Same member, second seat: bypasses the engine's duplicate check on purpose.
        store
            .persist_and_apply_class(
                tx,
                &mut row,
                Event::RegistrationConfirmed {
                    id: second_reg,
                    member_id,
                    session_id: class_id,
                    created_at: now_ms(),
                },
            )
            .await
            .unwrap();
        drop(row);

        let older = ledger.charge(first_reg, dec!(50.00)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = ledger.charge(second_reg, dec!(50.00)).await.unwrap();

        let history: Vec<Ulid> = ledger
            .history_for_member(member_id)
            .await
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(history, vec![newer, older]);
        assert!(ledger.history_for_member(Ulid::new()).await.is_empty());
    }
}
