use ulid::Ulid;

use crate::error::EngineError;
use crate::model::*;

use super::ReservationEngine;

impl ReservationEngine {
    pub async fn registration(&self, id: Ulid) -> Result<Registration, EngineError> {
        let session_id = self
            .store
            .session_for_registration(&id)
            .ok_or(EngineError::NotFound(id))?;
        let row = self.store.read_class(session_id).await?;
        row.registration(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// The member's non-cancelled class registrations, soonest first.
    pub async fn member_schedule(&self, member_id: Ulid) -> Result<Vec<ScheduleItem>, EngineError> {
        if !self.store.member_exists(&member_id) {
            return Err(EngineError::NotFound(member_id));
        }
        let rows: Vec<_> = self.store.classes.iter().map(|e| e.value().clone()).collect();
        let mut schedule = Vec::new();
        for row in rows {
            let guard = row.read().await;
            if let Some(reg) = guard.active_registration_for(member_id) {
                schedule.push(ScheduleItem {
                    registration_id: reg.id,
                    session_id: guard.id,
                    class_name: guard.name.clone(),
                    window: guard.window,
                    room_id: guard.room_id,
                    status: reg.status,
                });
            }
        }
        schedule.sort_by_key(|s| (s.window.start, s.session_id));
        Ok(schedule)
    }

    /// Registrations currently holding a seat or already attended.
    pub async fn roster(&self, session_id: Ulid) -> Result<Vec<Registration>, EngineError> {
        let row = self.store.read_class(session_id).await?;
        Ok(row
            .registrations
            .iter()
            .filter(|r| r.status.is_active())
            .cloned()
            .collect())
    }

    pub async fn personal_session(&self, id: Ulid) -> Result<PersonalSessionRow, EngineError> {
        Ok(self.store.read_personal(id).await?.clone())
    }
}
