use std::sync::Arc;

use tracing::info;
use ulid::Ulid;

use crate::error::EngineError;
use crate::model::*;
use crate::store::Store;
use crate::validate::*;

/// Read side of the schedule: class sessions, trainers and members, plus the
/// scheduling operations that create them. Never touches `occupied`; seat
/// counts only change through the reservation engine.
pub struct ScheduleCatalog {
    store: Arc<Store>,
}

impl ScheduleCatalog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    // ── Seed rows ────────────────────────────────────────────

    pub async fn register_member(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        validate_name(&name)?;
        self.store
            .run_transaction("register_member", || async {
                let mut tx = self.store.begin().await?;
                let claim = self.store.claim_seed(id);
                if claim.is_none() || self.store.member_exists(&id) {
                    return Err(EngineError::Conflict {
                        with: id,
                        reason: "member already registered",
                    });
                }
                tx.stage(Event::MemberRegistered {
                    id,
                    name: name.clone(),
                });
                tx.commit().await?;
                Ok(())
            })
            .await?;
        info!(member_id = %id, "member registered");
        Ok(())
    }

    pub async fn register_trainer(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        validate_name(&name)?;
        self.store
            .run_transaction("register_trainer", || async {
                let mut tx = self.store.begin().await?;
                let claim = self.store.claim_seed(id);
                if claim.is_none() || self.store.get_trainer(&id).is_some() {
                    return Err(EngineError::Conflict {
                        with: id,
                        reason: "trainer already registered",
                    });
                }
                tx.stage(Event::TrainerRegistered {
                    id,
                    name: name.clone(),
                });
                tx.commit().await?;
                Ok(())
            })
            .await?;
        info!(trainer_id = %id, "trainer registered");
        Ok(())
    }

    // ── Scheduling ───────────────────────────────────────────

    /// Create a class session and commit the trainer to its window.
    pub async fn schedule_class(&self, class: NewClass) -> Result<Ulid, EngineError> {
        validate_name(&class.name)?;
        validate_window(&class.window)?;
        validate_capacity(class.capacity)?;
        validate_fee(class.fee)?;
        let id = Ulid::new();

        self.store
            .run_transaction("schedule_class", || async {
                let mut tx = self.store.begin().await?;
                let mut calendar = self.store.lock_trainer(class.trainer_id).await?;
                if let Some(clash) = calendar.first_clash(&class.window, None) {
                    return Err(EngineError::Conflict {
                        with: clash.id,
                        reason: "trainer already booked in this window",
                    });
                }
                tx.stage(Event::ClassScheduled {
                    id,
                    name: class.name.clone(),
                    trainer_id: class.trainer_id,
                    room_id: class.room_id,
                    window: class.window,
                    capacity: class.capacity,
                    fee: class.fee,
                });
                for event in tx.commit().await? {
                    calendar.apply(&event);
                }
                Ok(())
            })
            .await?;

        info!(session_id = %id, trainer_id = %class.trainer_id, capacity = class.capacity, "class scheduled");
        Ok(id)
    }

    /// Apply a partial update to a class. Capacity may never drop below the
    /// seats already taken; a moved window is re-checked against the trainer.
    pub async fn update_class(&self, id: Ulid, update: ClassUpdate) -> Result<ClassInfo, EngineError> {
        if let Some(name) = &update.name {
            validate_name(name)?;
        }
        if let Some(window) = &update.window {
            validate_window(window)?;
        }
        if let Some(capacity) = update.capacity {
            validate_capacity(capacity)?;
        }
        if let Some(fee) = update.fee {
            validate_fee(fee)?;
        }

        self.store
            .run_transaction("update_class", || async {
                let mut tx = self.store.begin().await?;
                let mut row = self.store.lock_class(id).await?;

                let capacity = update.capacity.unwrap_or(row.capacity);
                if capacity < row.occupied {
                    return Err(EngineError::Validation("capacity below seats already taken"));
                }
                let window = update.window.unwrap_or(row.window);
                let event = Event::ClassUpdated {
                    id,
                    trainer_id: row.trainer_id,
                    name: update.name.clone().unwrap_or_else(|| row.name.clone()),
                    room_id: update.room_id.unwrap_or(row.room_id),
                    window,
                    capacity,
                    fee: update.fee.unwrap_or(row.fee),
                };

                // Class row before trainer calendar: the global lock order.
                let mut calendar = self.store.lock_trainer(row.trainer_id).await?;
                if window != row.window
                    && let Some(clash) = calendar.first_clash(&window, Some(id))
                {
                    return Err(EngineError::Conflict {
                        with: clash.id,
                        reason: "trainer already booked in this window",
                    });
                }

                tx.stage(event);
                for event in tx.commit().await? {
                    row.apply(&event);
                    calendar.apply(&event);
                    self.store.notify.send(id, &event);
                }
                Ok(row.info())
            })
            .await
    }

    // ── Read side ────────────────────────────────────────────

    pub async fn get_session(&self, id: Ulid) -> Result<ClassInfo, EngineError> {
        Ok(self.store.read_class(id).await?.info())
    }

    /// `(capacity, occupied)` for a class session.
    pub async fn capacity_of(&self, id: Ulid) -> Result<(u32, u32), EngineError> {
        let row = self.store.read_class(id).await?;
        Ok((row.capacity, row.occupied))
    }

    /// Every window the trainer is committed to, class or personal, sorted by start.
    pub async fn trainer_commitments(&self, trainer_id: Ulid) -> Result<Vec<Commitment>, EngineError> {
        Ok(self.store.read_trainer(trainer_id).await?.commitments.clone())
    }

    pub async fn trainer_windows_overlap(
        &self,
        trainer_id: Ulid,
        window: Span,
    ) -> Result<bool, EngineError> {
        let calendar = self.store.read_trainer(trainer_id).await?;
        Ok(calendar.overlapping(&window).next().is_some())
    }

    /// Class sessions starting after `now`, soonest first.
    pub async fn upcoming_classes(&self, now: Ms) -> Vec<ClassInfo> {
        let rows: Vec<_> = self.store.classes.iter().map(|e| e.value().clone()).collect();
        let mut upcoming = Vec::new();
        for row in rows {
            let guard = row.read().await;
            if guard.window.start > now {
                upcoming.push(guard.info());
            }
        }
        upcoming.sort_by_key(|c| (c.window.start, c.id));
        upcoming
    }

    /// The trainer's class sessions, soonest first.
    pub async fn trainer_schedule(&self, trainer_id: Ulid) -> Result<Vec<ClassInfo>, EngineError> {
        let class_ids: Vec<Ulid> = self
            .trainer_commitments(trainer_id)
            .await?
            .into_iter()
            .filter(|c| c.kind == CommitmentKind::Class)
            .map(|c| c.id)
            .collect();
        let mut schedule = Vec::with_capacity(class_ids.len());
        for id in class_ids {
            schedule.push(self.get_session(id).await?);
        }
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use rust_decimal::Decimal;

    const H: Ms = 3_600_000;

    fn test_store(name: &str) -> Arc<Store> {
        let dir = std::env::temp_dir().join("classbook_test_catalog");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        Arc::new(Store::open(path, StoreConfig::default()).unwrap())
    }

    fn class(trainer_id: Ulid, start: Ms, capacity: u32) -> NewClass {
        NewClass {
            name: "HIIT".into(),
            trainer_id,
            room_id: None,
            window: Span::new(start, start + H),
            capacity,
            fee: Decimal::new(2500, 2),
        }
    }

    #[tokio::test]
    async fn schedule_and_read_back() {
        let catalog = ScheduleCatalog::new(test_store("schedule_read.wal"));
        let trainer = Ulid::new();
        catalog.register_trainer(trainer, "Kim".into()).await.unwrap();

        let start = now_ms() + 24 * H;
        let id = catalog.schedule_class(class(trainer, start, 12)).await.unwrap();

        assert_eq!(catalog.capacity_of(id).await.unwrap(), (12, 0));
        let info = catalog.get_session(id).await.unwrap();
        assert_eq!(info.trainer_id, trainer);
        assert_eq!(info.window, Span::new(start, start + H));
        assert!(catalog.trainer_windows_overlap(trainer, Span::new(start + 10, start + 20)).await.unwrap());
        assert!(!catalog.trainer_windows_overlap(trainer, Span::new(start + H, start + 2 * H)).await.unwrap());
    }

    #[tokio::test]
    async fn trainer_double_booking_rejected() {
        let catalog = ScheduleCatalog::new(test_store("double_booking.wal"));
        let trainer = Ulid::new();
        catalog.register_trainer(trainer, "Kim".into()).await.unwrap();

        let start = now_ms() + 24 * H;
        let first = catalog.schedule_class(class(trainer, start, 10)).await.unwrap();
        let result = catalog.schedule_class(class(trainer, start + H / 2, 10)).await;
        assert!(matches!(result, Err(EngineError::Conflict { with, .. }) if with == first));

        // Back-to-back is fine: windows are half-open.
        catalog.schedule_class(class(trainer, start + H, 10)).await.unwrap();
        assert_eq!(catalog.trainer_commitments(trainer).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_trainer_is_not_found() {
        let catalog = ScheduleCatalog::new(test_store("unknown_trainer.wal"));
        let trainer = Ulid::new();
        let result = catalog.schedule_class(class(trainer, now_ms() + H, 10)).await;
        assert!(matches!(result, Err(EngineError::NotFound(id)) if id == trainer));
    }

    #[tokio::test]
    async fn invalid_class_rejected_before_any_lock() {
        let catalog = ScheduleCatalog::new(test_store("invalid_class.wal"));
        let trainer = Ulid::new();
        catalog.register_trainer(trainer, "Kim".into()).await.unwrap();
        let result = catalog.schedule_class(class(trainer, now_ms() + H, 0)).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn duplicate_seed_rows_conflict() {
        let catalog = ScheduleCatalog::new(test_store("dup_seed.wal"));
        let id = Ulid::new();
        catalog.register_member(id, "Ada".into()).await.unwrap();
        assert!(matches!(
            catalog.register_member(id, "Ada".into()).await,
            Err(EngineError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_duplicate_registrations_commit_once() {
        let store = test_store("dup_seed_concurrent.wal");
        let catalog = Arc::new(ScheduleCatalog::new(store.clone()));
        let member = Ulid::new();
        let trainer = Ulid::new();

        let mut handles = Vec::new();
        for i in 0..8 {
            let catalog = catalog.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    catalog.register_member(member, "Ada".into()).await
                } else {
                    catalog.register_trainer(trainer, "Kim".into()).await
                }
            }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => ok += 1,
                Err(EngineError::Conflict { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 2);
        assert!(store.member_exists(&member));
        assert!(store.get_trainer(&trainer).is_some());

        // Once the first registration is done the id is free to check again.
        assert!(matches!(
            catalog.register_member(member, "Ada".into()).await,
            Err(EngineError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn update_class_moves_window_and_checks_trainer() {
        let catalog = ScheduleCatalog::new(test_store("update_class.wal"));
        let trainer = Ulid::new();
        catalog.register_trainer(trainer, "Kim".into()).await.unwrap();
        let start = now_ms() + 24 * H;
        let a = catalog.schedule_class(class(trainer, start, 10)).await.unwrap();
        let b = catalog.schedule_class(class(trainer, start + 2 * H, 10)).await.unwrap();

        // Moving A onto B clashes.
        let clash = catalog
            .update_class(
                a,
                ClassUpdate {
                    window: Some(Span::new(start + 2 * H, start + 3 * H)),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(clash, Err(EngineError::Conflict { with, .. }) if with == b));

        // Shifting A within its own slot ignores its own commitment.
        let moved = catalog
            .update_class(
                a,
                ClassUpdate {
                    window: Some(Span::new(start + H / 2, start + H + H / 2)),
                    capacity: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.capacity, 5);
        let commitments = catalog.trainer_commitments(trainer).await.unwrap();
        assert_eq!(commitments[0].window, Span::new(start + H / 2, start + H + H / 2));
    }

    #[tokio::test]
    async fn upcoming_classes_sorted_and_future_only() {
        let catalog = ScheduleCatalog::new(test_store("upcoming.wal"));
        let trainer = Ulid::new();
        catalog.register_trainer(trainer, "Kim".into()).await.unwrap();
        let start = now_ms() + 24 * H;
        let later = catalog.schedule_class(class(trainer, start + 3 * H, 10)).await.unwrap();
        let sooner = catalog.schedule_class(class(trainer, start, 10)).await.unwrap();

        let ids: Vec<Ulid> = catalog.upcoming_classes(start - 1).await.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![sooner, later]);
        let ids: Vec<Ulid> = catalog.upcoming_classes(start).await.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![later]);

        let schedule = catalog.trainer_schedule(trainer).await.unwrap();
        assert_eq!(schedule.len(), 2);
        assert_eq!(schedule[0].id, sooner);
    }
}
