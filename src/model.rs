use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Status enums ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationStatus {
    /// In-flight marker; only ever lives in a staged, uncommitted transaction.
    Pending,
    Confirmed,
    Cancelled,
    Attended,
}

impl RegistrationStatus {
    /// Holds the (member, session) slot: at most one such registration per pair.
    pub fn is_active(self) -> bool {
        !matches!(self, RegistrationStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegistrationStatus::Pending => "pending",
            RegistrationStatus::Confirmed => "confirmed",
            RegistrationStatus::Cancelled => "cancelled",
            RegistrationStatus::Attended => "attended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersonalSessionStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl PersonalSessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PersonalSessionStatus::Scheduled => "scheduled",
            PersonalSessionStatus::Completed => "completed",
            PersonalSessionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Overdue,
    Void,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Overdue => "overdue",
            PaymentStatus::Void => "void",
        }
    }
}

// ── Rows ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: Ulid,
    pub member_id: Ulid,
    pub session_id: Ulid,
    pub status: RegistrationStatus,
    pub created_at: Ms,
    /// Counted in `occupied`. Set on confirmation and cleared only by
    /// `RegistrationCancelled`; attendance never touches it.
    pub holds_seat: bool,
}

/// A class session row together with its registrations. Locking this row is
/// the "select for update" on the session: occupancy and registration rows
/// only change while the write lock is held.
#[derive(Debug, Clone)]
pub struct ClassRow {
    pub id: Ulid,
    pub name: String,
    pub trainer_id: Ulid,
    pub room_id: Option<Ulid>,
    pub window: Span,
    pub capacity: u32,
    /// Invariant: `occupied <= capacity`.
    pub occupied: u32,
    pub fee: Decimal,
    pub registrations: Vec<Registration>,
}

impl ClassRow {
    /// Build a fresh row from the event that creates it.
    pub fn from_event(event: &Event) -> Option<Self> {
        match event {
            Event::ClassScheduled {
                id,
                name,
                trainer_id,
                room_id,
                window,
                capacity,
                fee,
            } => Some(Self {
                id: *id,
                name: name.clone(),
                trainer_id: *trainer_id,
                room_id: *room_id,
                window: *window,
                capacity: *capacity,
                occupied: 0,
                fee: *fee,
                registrations: Vec::new(),
            }),
            Event::ClassRestored {
                id,
                name,
                trainer_id,
                room_id,
                window,
                capacity,
                occupied,
                fee,
                registrations,
            } => Some(Self {
                id: *id,
                name: name.clone(),
                trainer_id: *trainer_id,
                room_id: *room_id,
                window: *window,
                capacity: *capacity,
                occupied: *occupied,
                fee: *fee,
                registrations: registrations.clone(),
            }),
            _ => None,
        }
    }

    /// Snapshot event that recreates this row on replay.
    pub fn snapshot(&self) -> Event {
        Event::ClassRestored {
            id: self.id,
            name: self.name.clone(),
            trainer_id: self.trainer_id,
            room_id: self.room_id,
            window: self.window,
            capacity: self.capacity,
            occupied: self.occupied,
            fee: self.fee,
            registrations: self.registrations.clone(),
        }
    }

    pub fn active_registration_for(&self, member_id: Ulid) -> Option<&Registration> {
        self.registrations
            .iter()
            .find(|r| r.member_id == member_id && r.status.is_active())
    }

    /// The member's registration still counted in `occupied`, whatever its status.
    pub fn seat_held_by(&self, member_id: Ulid) -> Option<&Registration> {
        self.registrations
            .iter()
            .find(|r| r.member_id == member_id && r.holds_seat)
    }

    pub fn registration(&self, id: Ulid) -> Option<&Registration> {
        self.registrations.iter().find(|r| r.id == id)
    }

    fn registration_mut(&mut self, id: Ulid) -> Option<&mut Registration> {
        self.registrations.iter_mut().find(|r| r.id == id)
    }

    pub fn info(&self) -> ClassInfo {
        ClassInfo {
            id: self.id,
            name: self.name.clone(),
            trainer_id: self.trainer_id,
            room_id: self.room_id,
            window: self.window,
            capacity: self.capacity,
            occupied: self.occupied,
            fee: self.fee,
        }
    }

    /// Apply a committed event. Caller holds the write lock.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ClassUpdated {
                name,
                room_id,
                window,
                capacity,
                fee,
                ..
            } => {
                self.name = name.clone();
                self.room_id = *room_id;
                self.window = *window;
                self.capacity = *capacity;
                self.fee = *fee;
            }
            Event::RegistrationConfirmed {
                id,
                member_id,
                session_id,
                created_at,
            } => {
                self.registrations.push(Registration {
                    id: *id,
                    member_id: *member_id,
                    session_id: *session_id,
                    status: RegistrationStatus::Confirmed,
                    created_at: *created_at,
                    holds_seat: true,
                });
                self.occupied = (self.occupied + 1).min(self.capacity);
            }
            Event::RegistrationCancelled { id, .. } => {
                let released = match self.registration_mut(*id) {
                    Some(reg) => {
                        reg.status = RegistrationStatus::Cancelled;
                        std::mem::take(&mut reg.holds_seat)
                    }
                    None => false,
                };
                if released {
                    self.occupied = self.occupied.saturating_sub(1);
                }
            }
            Event::AttendanceMarked { id, status, .. } => {
                if let Some(reg) = self.registration_mut(*id) {
                    reg.status = *status;
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonalSessionRow {
    pub id: Ulid,
    pub member_id: Ulid,
    pub trainer_id: Ulid,
    pub window: Span,
    pub status: PersonalSessionStatus,
    pub notes: Option<String>,
}

impl PersonalSessionRow {
    pub fn from_event(event: &Event) -> Option<Self> {
        match event {
            Event::PersonalSessionBooked {
                id,
                member_id,
                trainer_id,
                window,
                notes,
            } => Some(Self {
                id: *id,
                member_id: *member_id,
                trainer_id: *trainer_id,
                window: *window,
                status: PersonalSessionStatus::Scheduled,
                notes: notes.clone(),
            }),
            _ => None,
        }
    }

    pub fn apply(&mut self, event: &Event) {
        if let Event::PersonalSessionUpdated { status, notes, .. } = event {
            self.status = *status;
            if notes.is_some() {
                self.notes = notes.clone();
            }
        }
    }
}

/// What a trainer is committed to during a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitmentKind {
    Class,
    Personal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commitment {
    /// Class session id or personal session id.
    pub id: Ulid,
    pub window: Span,
    pub kind: CommitmentKind,
}

#[derive(Debug, Clone)]
pub struct TrainerCalendar {
    pub id: Ulid,
    pub name: String,
    /// All commitments, sorted by `window.start`.
    pub commitments: Vec<Commitment>,
}

impl TrainerCalendar {
    pub fn new(id: Ulid, name: String) -> Self {
        Self {
            id,
            name,
            commitments: Vec::new(),
        }
    }

    /// Insert commitment maintaining sort order by window.start.
    pub fn insert(&mut self, commitment: Commitment) {
        let pos = self
            .commitments
            .binary_search_by_key(&commitment.window.start, |c| c.window.start)
            .unwrap_or_else(|e| e);
        self.commitments.insert(pos, commitment);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Commitment> {
        let pos = self.commitments.iter().position(|c| c.id == id)?;
        Some(self.commitments.remove(pos))
    }

    /// Return only commitments whose window overlaps the query.
    /// Uses binary search to skip commitments starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Commitment> {
        let right_bound = self
            .commitments
            .partition_point(|c| c.window.start < query.end);
        self.commitments[..right_bound]
            .iter()
            .filter(move |c| c.window.end > query.start)
    }

    /// First commitment (other than `ignore`) that overlaps `window`.
    pub fn first_clash(&self, window: &Span, ignore: Option<Ulid>) -> Option<&Commitment> {
        self.overlapping(window).find(|c| Some(c.id) != ignore)
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ClassScheduled { id, window, .. } | Event::ClassRestored { id, window, .. } => {
                self.insert(Commitment {
                    id: *id,
                    window: *window,
                    kind: CommitmentKind::Class,
                });
            }
            Event::ClassUpdated { id, window, .. } => {
                self.remove(*id);
                self.insert(Commitment {
                    id: *id,
                    window: *window,
                    kind: CommitmentKind::Class,
                });
            }
            Event::PersonalSessionBooked { id, window, .. } => self.insert(Commitment {
                id: *id,
                window: *window,
                kind: CommitmentKind::Personal,
            }),
            Event::PersonalSessionUpdated {
                id,
                status: PersonalSessionStatus::Cancelled,
                ..
            } => {
                self.remove(*id);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: Ulid,
    /// Owning billable event: registration id or personal session id.
    pub event_id: Ulid,
    pub member_id: Ulid,
    pub amount: Decimal,
    pub description: String,
    pub status: PaymentStatus,
    pub posted_at: Ms,
    pub due_at: Ms,
    pub paid_at: Option<Ms>,
}

/// Every ledger entry ever posted for one billable event. At most one is non-void.
#[derive(Debug, Clone)]
pub struct LedgerSlot {
    pub event_id: Ulid,
    pub entries: Vec<LedgerEntry>,
}

impl LedgerSlot {
    pub fn new(event_id: Ulid) -> Self {
        Self {
            event_id,
            entries: Vec::new(),
        }
    }

    pub fn live(&self) -> Option<&LedgerEntry> {
        self.entries
            .iter()
            .find(|e| e.status != PaymentStatus::Void)
    }

    pub fn entry(&self, id: Ulid) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ChargePosted {
                id,
                event_id,
                member_id,
                amount,
                description,
                posted_at,
                due_at,
            } => self.entries.push(LedgerEntry {
                id: *id,
                event_id: *event_id,
                member_id: *member_id,
                amount: *amount,
                description: description.clone(),
                status: PaymentStatus::Pending,
                posted_at: *posted_at,
                due_at: *due_at,
                paid_at: None,
            }),
            Event::PaymentRecorded { id, paid_at, .. } => {
                if let Some(e) = self.entries.iter_mut().find(|e| e.id == *id) {
                    e.status = PaymentStatus::Paid;
                    e.paid_at = Some(*paid_at);
                }
            }
            Event::ChargeVoided { id, .. } => {
                if let Some(e) = self.entries.iter_mut().find(|e| e.id == *id) {
                    e.status = PaymentStatus::Void;
                }
            }
            Event::ChargeOverdue { id, .. } => {
                if let Some(e) = self.entries.iter_mut().find(|e| e.id == *id) {
                    e.status = PaymentStatus::Overdue;
                }
            }
            _ => {}
        }
    }
}

/// The event types — flat, no nesting. A committed transaction is a `Vec<Event>`
/// written to the WAL as one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MemberRegistered {
        id: Ulid,
        name: String,
    },
    TrainerRegistered {
        id: Ulid,
        name: String,
    },
    ClassScheduled {
        id: Ulid,
        name: String,
        trainer_id: Ulid,
        room_id: Option<Ulid>,
        window: Span,
        capacity: u32,
        fee: Decimal,
    },
    /// Full post-update snapshot of the mutable class fields.
    ClassUpdated {
        id: Ulid,
        trainer_id: Ulid,
        name: String,
        room_id: Option<Ulid>,
        window: Span,
        capacity: u32,
        fee: Decimal,
    },
    /// Compaction snapshot of a class row, registrations and their seat flags included.
    ClassRestored {
        id: Ulid,
        name: String,
        trainer_id: Ulid,
        room_id: Option<Ulid>,
        window: Span,
        capacity: u32,
        occupied: u32,
        fee: Decimal,
        registrations: Vec<Registration>,
    },
    RegistrationConfirmed {
        id: Ulid,
        member_id: Ulid,
        session_id: Ulid,
        created_at: Ms,
    },
    RegistrationCancelled {
        id: Ulid,
        session_id: Ulid,
    },
    AttendanceMarked {
        id: Ulid,
        session_id: Ulid,
        status: RegistrationStatus,
    },
    PersonalSessionBooked {
        id: Ulid,
        member_id: Ulid,
        trainer_id: Ulid,
        window: Span,
        notes: Option<String>,
    },
    PersonalSessionUpdated {
        id: Ulid,
        trainer_id: Ulid,
        status: PersonalSessionStatus,
        notes: Option<String>,
    },
    ChargePosted {
        id: Ulid,
        event_id: Ulid,
        member_id: Ulid,
        amount: Decimal,
        description: String,
        posted_at: Ms,
        due_at: Ms,
    },
    PaymentRecorded {
        id: Ulid,
        event_id: Ulid,
        paid_at: Ms,
    },
    ChargeVoided {
        id: Ulid,
        event_id: Ulid,
    },
    ChargeOverdue {
        id: Ulid,
        event_id: Ulid,
    },
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewClass {
    pub name: String,
    pub trainer_id: Ulid,
    pub room_id: Option<Ulid>,
    pub window: Span,
    pub capacity: u32,
    pub fee: Decimal,
}

/// Partial update of a class session. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ClassUpdate {
    pub name: Option<String>,
    pub room_id: Option<Option<Ulid>>,
    pub window: Option<Span>,
    pub capacity: Option<u32>,
    pub fee: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct NewPersonalSession {
    pub member_id: Ulid,
    pub trainer_id: Ulid,
    pub window: Span,
    pub fee: Decimal,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PersonalSessionUpdate {
    pub status: PersonalSessionStatus,
    pub notes: Option<String>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub id: Ulid,
    pub name: String,
    pub trainer_id: Ulid,
    pub room_id: Option<Ulid>,
    pub window: Span,
    pub capacity: u32,
    pub occupied: u32,
    pub fee: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleItem {
    pub registration_id: Ulid,
    pub session_id: Ulid,
    pub class_name: String,
    pub window: Span,
    pub room_id: Option<Ulid>,
    pub status: RegistrationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingSummary {
    pub member_id: Ulid,
    pub pending: Decimal,
    pub overdue: Decimal,
    pub paid: Decimal,
    pub voided: Decimal,
    pub entries: usize,
}

impl BillingSummary {
    /// Amount still owed (pending + overdue).
    pub fn outstanding(&self) -> Decimal {
        self.pending + self.overdue
    }
}
