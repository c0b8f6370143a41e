pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod store;
pub mod sweeper;
pub mod validate;
pub mod wal;

pub use catalog::ScheduleCatalog;
pub use engine::ReservationEngine;
pub use error::EngineError;
pub use ledger::BillingLedger;
pub use store::Store;
