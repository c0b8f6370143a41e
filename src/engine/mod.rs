mod mutations;
mod queries;

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::warn;
use ulid::Ulid;

use crate::error::EngineError;
use crate::ledger::{BillingLedger, VoidOutcome};
use crate::model::*;
use crate::observability;
use crate::store::Store;

/// What happened to the charge that follows a committed booking. The booking
/// itself stands either way.
#[derive(Debug)]
pub enum ChargeOutcome {
    Posted(Ulid),
    /// Free session: nothing to bill.
    Waived,
    /// The seat is held but billing failed; reconcile with `BillingLedger::charge`.
    Failed(EngineError),
}

impl ChargeOutcome {
    pub fn entry_id(&self) -> Option<Ulid> {
        match self {
            ChargeOutcome::Posted(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ChargeOutcome::Failed(_))
    }
}

#[derive(Debug)]
pub struct Reservation {
    pub registration_id: Ulid,
    pub billing: ChargeOutcome,
}

#[derive(Debug)]
pub struct Cancellation {
    pub registration_id: Ulid,
    /// The seat is released regardless of how voiding went.
    pub billing: Result<VoidOutcome, EngineError>,
}

#[derive(Debug)]
pub struct PersonalBooking {
    pub session_id: Ulid,
    pub billing: ChargeOutcome,
}

#[derive(Debug)]
pub struct PersonalSessionChange {
    pub session: PersonalSessionRow,
    /// Set when the change cancelled the session.
    pub billing: Option<Result<VoidOutcome, EngineError>>,
}

/// Registration state machine and capacity invariant for class sessions, plus
/// personal-session booking. Holds no shared state of its own: every seat count
/// and registration lives in the store.
pub struct ReservationEngine {
    store: Arc<Store>,
    ledger: Arc<BillingLedger>,
}

impl ReservationEngine {
    pub fn new(store: Arc<Store>, ledger: Arc<BillingLedger>) -> Self {
        Self { store, ledger }
    }

    /// Committed events for a class session. Callers turned away with
    /// `CapacityExceeded` wait here for a `RegistrationCancelled`.
    pub fn subscribe(&self, session_id: Ulid) -> Result<broadcast::Receiver<Event>, EngineError> {
        if self.store.get_class(&session_id).is_none() {
            return Err(EngineError::NotFound(session_id));
        }
        Ok(self.store.notify.subscribe(session_id))
    }

    /// Bill a committed booking. Failures are reported, never propagated.
    async fn bill(&self, event_id: Ulid, fee: Decimal) -> ChargeOutcome {
        if fee.is_zero() {
            return ChargeOutcome::Waived;
        }
        match self.ledger.charge(event_id, fee).await {
            Ok(entry_id) => ChargeOutcome::Posted(entry_id),
            Err(e) => {
                warn!(%event_id, error = %e, "booking committed but charge failed");
                metrics::counter!(observability::BILLING_PARTIAL_FAILURES_TOTAL, "step" => "charge")
                    .increment(1);
                ChargeOutcome::Failed(e)
            }
        }
    }

    async fn release_charge(&self, event_id: Ulid) -> Result<VoidOutcome, EngineError> {
        let result = self.ledger.void(event_id).await;
        if let Err(e) = &result {
            warn!(%event_id, error = %e, "booking cancelled but void failed");
            metrics::counter!(observability::BILLING_PARTIAL_FAILURES_TOTAL, "step" => "void")
                .increment(1);
        }
        result
    }
}
