use std::time::{SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;

use crate::error::EngineError;
use crate::limits::*;
use crate::model::*;

pub fn now_ms() -> Ms {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

pub fn validate_window(window: &Span) -> Result<(), EngineError> {
    if window.start >= window.end {
        return Err(EngineError::Validation("window must end after it starts"));
    }
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if window.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    Ok(())
}

/// Bookings are only taken for sessions that have not started yet.
pub fn ensure_future(window: &Span, now: Ms) -> Result<(), EngineError> {
    if window.start <= now {
        return Err(EngineError::Validation("session already started"));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub fn validate_notes(notes: Option<&str>) -> Result<(), EngineError> {
    if notes.is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

pub fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::Validation("capacity must be positive"));
    }
    if capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

pub fn validate_fee(fee: Decimal) -> Result<(), EngineError> {
    if fee.is_sign_negative() {
        return Err(EngineError::Validation("fee must not be negative"));
    }
    Ok(())
}
