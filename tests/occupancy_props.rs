use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use rust_decimal::Decimal;
use ulid::Ulid;

use classbook::config::StoreConfig;
use classbook::model::*;
use classbook::validate::now_ms;
use classbook::{BillingLedger, EngineError, ReservationEngine, ScheduleCatalog, Store};

#[derive(Debug, Clone)]
enum Op {
    Reserve(usize),
    Cancel(usize),
    Attend(usize),
}

fn op(members: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..members).prop_map(Op::Reserve),
        2 => (0..members).prop_map(Op::Cancel),
        1 => (0..members).prop_map(Op::Attend),
    ]
}

/// Replays `ops` against the engine and a trivial model of who holds a seat.
async fn run(capacity: u32, ops: Vec<Op>) -> Result<(), TestCaseError> {
    let dir = std::env::temp_dir().join("classbook_prop_occupancy");
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(Store::open(dir.join(format!("{}.wal", Ulid::new())), StoreConfig::default()).unwrap());
    let catalog = ScheduleCatalog::new(store.clone());
    let ledger = Arc::new(BillingLedger::new(store.clone()));
    let engine = ReservationEngine::new(store, ledger);

    let trainer = Ulid::new();
    catalog.register_trainer(trainer, "Kim".into()).await.unwrap();
    let start = now_ms() + 3_600_000;
    let session = catalog
        .schedule_class(NewClass {
            name: "Boxing".into(),
            trainer_id: trainer,
            room_id: None,
            window: Span::new(start, start + 3_600_000),
            capacity,
            fee: Decimal::ZERO,
        })
        .await
        .unwrap();
    let mut members = Vec::new();
    for i in 0..6 {
        let id = Ulid::new();
        catalog.register_member(id, format!("m{i}")).await.unwrap();
        members.push(id);
    }

    // Confirmed seats the member can still cancel, and seats settled by attendance.
    let mut booked: BTreeSet<usize> = BTreeSet::new();
    let mut attended: BTreeSet<usize> = BTreeSet::new();
    let mut regs = vec![None; members.len()];

    for op in ops {
        match op {
            Op::Reserve(i) => {
                let result = engine.reserve(members[i], session).await;
                let seats = (booked.len() + attended.len()) as u32;
                if booked.contains(&i) || attended.contains(&i) {
                    prop_assert!(matches!(result, Err(EngineError::Conflict { .. })), "expected Conflict, got {:?}", result);
                } else if seats >= capacity {
                    prop_assert!(matches!(result, Err(EngineError::CapacityExceeded(_))));
                } else {
                    let reservation = result.map_err(|e| TestCaseError::fail(e.to_string()))?;
                    regs[i] = Some(reservation.registration_id);
                    booked.insert(i);
                }
            }
            Op::Cancel(i) => {
                let result = engine.cancel(members[i], session).await;
                if booked.remove(&i) {
                    prop_assert!(result.is_ok());
                } else {
                    prop_assert!(result.is_err());
                }
            }
            Op::Attend(i) => {
                let Some(reg) = regs[i] else { continue };
                let result = engine.mark_attendance(reg, RegistrationStatus::Attended).await;
                if booked.remove(&i) {
                    prop_assert!(result.is_ok());
                    attended.insert(i);
                } else {
                    prop_assert!(matches!(result, Err(EngineError::InvalidTransition { .. })), "expected InvalidTransition, got {:?}", result);
                }
            }
        }

        let (cap, occupied) = catalog.capacity_of(session).await.unwrap();
        prop_assert!(occupied <= cap);
        prop_assert_eq!(occupied, (booked.len() + attended.len()) as u32);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn occupancy_never_leaves_bounds(
        capacity in 1u32..5,
        ops in prop::collection::vec(op(6), 1..40),
    ) {
        tokio_test::block_on(run(capacity, ops))?;
    }
}
