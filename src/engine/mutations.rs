use std::time::Instant;

use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::error::EngineError;
use crate::model::*;
use crate::observability;
use crate::validate::*;

use super::{Cancellation, PersonalBooking, PersonalSessionChange, Reservation, ReservationEngine};

impl ReservationEngine {
    /// Take a seat in a class session, then bill it.
    ///
    /// The capacity check, the increment and the registration row commit as one
    /// frame while the session row is write-locked, so two callers can never both
    /// see the last free seat. Billing runs afterwards in its own transaction.
    pub async fn reserve(&self, member_id: Ulid, session_id: Ulid) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self.try_reserve(member_id, session_id).await;
        metrics::histogram!(observability::RESERVE_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        let (registration_id, fee) = match result {
            Ok(reserved) => reserved,
            Err(e) => {
                metrics::counter!(observability::RESERVATIONS_TOTAL, "outcome" => e.kind()).increment(1);
                return Err(e);
            }
        };
        metrics::counter!(observability::RESERVATIONS_TOTAL, "outcome" => "confirmed").increment(1);
        info!(%member_id, %session_id, %registration_id, "registration confirmed");

        // The session row is unlocked by now; the charge re-reads it.
        let billing = self.bill(registration_id, fee).await;
        Ok(Reservation {
            registration_id,
            billing,
        })
    }

    async fn try_reserve(
        &self,
        member_id: Ulid,
        session_id: Ulid,
    ) -> Result<(Ulid, Decimal), EngineError> {
        if !self.store.member_exists(&member_id) {
            return Err(EngineError::NotFound(member_id));
        }
        self.store
            .run_transaction("reserve", || async {
                let tx = self.store.begin().await?;
                let mut row = self.store.lock_class(session_id).await?;
                ensure_future(&row.window, now_ms())?;
                if let Some(existing) = row.seat_held_by(member_id) {
                    return Err(EngineError::Conflict {
                        with: existing.id,
                        reason: "member already holds a seat in this session",
                    });
                }
                if row.occupied >= row.capacity {
                    return Err(EngineError::CapacityExceeded(row.capacity));
                }

                let id = Ulid::new();
                let event = Event::RegistrationConfirmed {
                    id,
                    member_id,
                    session_id,
                    created_at: now_ms(),
                };
                self.store.persist_and_apply_class(tx, &mut row, event).await?;
                Ok((id, row.fee))
            })
            .await
    }

    /// Release the member's seat and void the charge if it is still Pending.
    /// A seat kept by a no-show (attendance marked Cancelled) is released too.
    /// A second call finds no seat and fails with `NotFound` without touching
    /// occupancy.
    pub async fn cancel(&self, member_id: Ulid, session_id: Ulid) -> Result<Cancellation, EngineError> {
        let result = self
            .store
            .run_transaction("cancel", || async {
                let tx = self.store.begin().await?;
                let mut row = self.store.lock_class(session_id).await?;
                let reg = row
                    .seat_held_by(member_id)
                    .ok_or(EngineError::NotFound(member_id))?;
                if reg.status == RegistrationStatus::Attended {
                    return Err(EngineError::InvalidTransition {
                        from: reg.status.as_str(),
                        to: RegistrationStatus::Cancelled.as_str(),
                    });
                }
                let id = reg.id;
                let event = Event::RegistrationCancelled { id, session_id };
                self.store.persist_and_apply_class(tx, &mut row, event).await?;
                Ok(id)
            })
            .await;

        let registration_id = match result {
            Ok(id) => id,
            Err(e) => {
                metrics::counter!(observability::CANCELLATIONS_TOTAL, "outcome" => e.kind()).increment(1);
                return Err(e);
            }
        };
        metrics::counter!(observability::CANCELLATIONS_TOTAL, "outcome" => "cancelled").increment(1);
        info!(%member_id, %session_id, %registration_id, "registration cancelled");

        let billing = self.release_charge(registration_id).await;
        Ok(Cancellation {
            registration_id,
            billing,
        })
    }

    /// Confirmed → Attended or Cancelled, for reporting. Occupancy reflects the
    /// booking, not attendance, so the seat count is left alone.
    pub async fn mark_attendance(
        &self,
        registration_id: Ulid,
        status: RegistrationStatus,
    ) -> Result<(), EngineError> {
        if !matches!(status, RegistrationStatus::Attended | RegistrationStatus::Cancelled) {
            return Err(EngineError::Validation("attendance must be attended or cancelled"));
        }
        let session_id = self
            .store
            .session_for_registration(&registration_id)
            .ok_or(EngineError::NotFound(registration_id))?;

        self.store
            .run_transaction("mark_attendance", || async {
                let tx = self.store.begin().await?;
                let mut row = self.store.lock_class(session_id).await?;
                let reg = row
                    .registration(registration_id)
                    .ok_or(EngineError::NotFound(registration_id))?;
                if reg.status != RegistrationStatus::Confirmed {
                    return Err(EngineError::InvalidTransition {
                        from: reg.status.as_str(),
                        to: status.as_str(),
                    });
                }
                let event = Event::AttendanceMarked {
                    id: registration_id,
                    session_id,
                    status,
                };
                self.store.persist_and_apply_class(tx, &mut row, event).await
            })
            .await?;

        info!(%registration_id, status = status.as_str(), "attendance marked");
        Ok(())
    }

    // ── Personal sessions ────────────────────────────────────

    /// Book a one-on-one session, committing the trainer to the window, then bill it.
    pub async fn book_personal_session(
        &self,
        request: NewPersonalSession,
    ) -> Result<PersonalBooking, EngineError> {
        let result = self.try_book_personal(&request).await;
        metrics::counter!(
            observability::PERSONAL_BOOKINGS_TOTAL,
            "outcome" => result.as_ref().map_or_else(EngineError::kind, |_| "booked")
        )
        .increment(1);
        let session_id = result?;
        info!(%session_id, member_id = %request.member_id, trainer_id = %request.trainer_id, "personal session booked");

        let billing = self.bill(session_id, request.fee).await;
        Ok(PersonalBooking {
            session_id,
            billing,
        })
    }

    async fn try_book_personal(&self, request: &NewPersonalSession) -> Result<Ulid, EngineError> {
        validate_window(&request.window)?;
        validate_fee(request.fee)?;
        validate_notes(request.notes.as_deref())?;
        ensure_future(&request.window, now_ms())?;
        if !self.store.member_exists(&request.member_id) {
            return Err(EngineError::NotFound(request.member_id));
        }
        let id = Ulid::new();

        self.store
            .run_transaction("book_personal_session", || async {
                let mut tx = self.store.begin().await?;
                let mut calendar = self.store.lock_trainer(request.trainer_id).await?;
                if let Some(clash) = calendar.first_clash(&request.window, None) {
                    return Err(EngineError::Conflict {
                        with: clash.id,
                        reason: "trainer already booked in this window",
                    });
                }
                tx.stage(Event::PersonalSessionBooked {
                    id,
                    member_id: request.member_id,
                    trainer_id: request.trainer_id,
                    window: request.window,
                    notes: request.notes.clone(),
                });
                for event in tx.commit().await? {
                    calendar.apply(&event);
                }
                Ok(id)
            })
            .await
    }

    /// Scheduled → Completed or Cancelled, optionally replacing the notes.
    /// Cancelling frees the trainer's window and voids a Pending charge.
    pub async fn update_personal_session(
        &self,
        id: Ulid,
        update: PersonalSessionUpdate,
    ) -> Result<PersonalSessionChange, EngineError> {
        validate_notes(update.notes.as_deref())?;

        let session = self
            .store
            .run_transaction("update_personal_session", || async {
                let mut tx = self.store.begin().await?;
                let mut row = self.store.lock_personal(id).await?;
                if row.status != PersonalSessionStatus::Scheduled {
                    return Err(EngineError::InvalidTransition {
                        from: row.status.as_str(),
                        to: update.status.as_str(),
                    });
                }
                // Personal row before trainer calendar: the global lock order.
                let mut calendar = self.store.lock_trainer(row.trainer_id).await?;
                tx.stage(Event::PersonalSessionUpdated {
                    id,
                    trainer_id: row.trainer_id,
                    status: update.status,
                    notes: update.notes.clone(),
                });
                for event in tx.commit().await? {
                    row.apply(&event);
                    calendar.apply(&event);
                }
                Ok(row.clone())
            })
            .await?;

        info!(session_id = %id, status = session.status.as_str(), "personal session updated");
        let billing = match session.status {
            PersonalSessionStatus::Cancelled => Some(self.release_charge(id).await),
            _ => None,
        };
        Ok(PersonalSessionChange { session, billing })
    }
}
