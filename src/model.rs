use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

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

    /// Span of a showing: `[starts_at, starts_at + duration)`.
    pub fn showing(starts_at: Ms, duration_minutes: u32) -> Self {
        Self::new(starts_at, starts_at + Ms::from(duration_minutes) * MINUTE_MS)
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hall {
    pub id: Ulid,
    pub is_vip: bool,
    pub seat_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movie {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub hall_id: Ulid,
    pub movie_id: Ulid,
    pub starts_at: Ms,
    /// Cached `starts_at + movie.duration`. Movies are immutable, so this never goes stale.
    pub ends_at: Ms,
}

impl Session {
    pub fn span(&self) -> Span {
        Span::new(self.starts_at, self.ends_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Ulid,
    pub session_id: Ulid,
    pub user_id: Ulid,
    pub seat: u32,
    /// Minor currency units.
    pub price: u64,
}

/// A ticket joined with its session and movie, the shape returned to buyers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketReceipt {
    pub ticket: Ticket,
    pub hall_id: Ulid,
    pub movie_name: String,
    pub starts_at: Ms,
}

/// One scheduled session as seen by the conflict checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub session_id: Ulid,
    pub span: Span,
}

/// Per-hall schedule: the hall row plus its sessions, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct HallSchedule {
    pub hall: Hall,
    pub slots: Vec<Slot>,
}

impl HallSchedule {
    pub fn new(hall: Hall) -> Self {
        Self {
            hall,
            slots: Vec::new(),
        }
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, session_id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.session_id == session_id)?;
        Some(self.slots.remove(pos))
    }
}

/// Per-session seat ledger: the session row plus its live tickets.
#[derive(Debug, Clone)]
pub struct SeatLedger {
    pub session: Session,
    /// Hall capacity, copied at scheduling time (halls never resize).
    pub seat_count: u32,
    /// Highest seat ever issued. Only moves forward; deletions don't lower it.
    pub high_water: u32,
    /// Live tickets, sorted by seat.
    pub tickets: Vec<Ticket>,
}

impl SeatLedger {
    pub fn new(session: Session, seat_count: u32) -> Self {
        Self {
            session,
            seat_count,
            high_water: 0,
            tickets: Vec::new(),
        }
    }

    pub fn issue(&mut self, ticket: Ticket) {
        self.high_water = self.high_water.max(ticket.seat);
        let pos = self
            .tickets
            .binary_search_by_key(&ticket.seat, |t| t.seat)
            .unwrap_or_else(|e| e);
        self.tickets.insert(pos, ticket);
    }

    pub fn remove(&mut self, ticket_id: Ulid) -> Option<Ticket> {
        let pos = self.tickets.iter().position(|t| t.id == ticket_id)?;
        Some(self.tickets.remove(pos))
    }
}

/// Flat event types. A committed transaction is a batch of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    HallCreated(Hall),
    HallDeleted { id: Ulid },
    MovieCreated(Movie),
    MovieDeleted { id: Ulid },
    SessionScheduled(Session),
    SessionDeleted { id: Ulid, hall_id: Ulid },
    TicketIssued(Ticket),
    TicketDeleted { id: Ulid, session_id: Ulid },
    /// Snapshot-only: restores a session's high-water mark after compaction.
    SeatHighWater { session_id: Ulid, seat: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(start: Ms, end: Ms) -> Slot {
        Slot {
            session_id: Ulid::new(),
            span: Span::new(start, end),
        }
    }

    fn schedule() -> HallSchedule {
        HallSchedule::new(Hall {
            id: Ulid::new(),
            is_vip: false,
            seat_count: 10,
        })
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn showing_span_uses_minutes() {
        let s = Span::showing(1_000, 120);
        assert_eq!(s.end - s.start, 120 * MINUTE_MS);
        assert_eq!(s.start, 1_000);
    }

    #[test]
    fn slots_stay_sorted() {
        let mut hs = schedule();
        hs.insert_slot(slot(300, 400));
        hs.insert_slot(slot(100, 200));
        hs.insert_slot(slot(200, 300));
        let starts: Vec<_> = hs.slots.iter().map(|s| s.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_slot_by_session() {
        let mut hs = schedule();
        let keep = slot(0, 50);
        let gone = slot(100, 150);
        hs.insert_slot(keep);
        hs.insert_slot(gone);
        assert_eq!(hs.remove_slot(gone.session_id), Some(gone));
        assert_eq!(hs.remove_slot(gone.session_id), None);
        assert_eq!(hs.slots, vec![keep]);
    }

    #[test]
    fn high_water_survives_removal() {
        let session = Session {
            id: Ulid::new(),
            hall_id: Ulid::new(),
            movie_id: Ulid::new(),
            starts_at: 0,
            ends_at: 100,
        };
        let mut ledger = SeatLedger::new(session.clone(), 5);
        let mut ids = Vec::new();
        for seat in 1..=3 {
            let t = Ticket {
                id: Ulid::new(),
                session_id: session.id,
                user_id: Ulid::new(),
                seat,
                price: 900,
            };
            ids.push(t.id);
            ledger.issue(t);
        }
        ledger.remove(ids[2]);
        assert_eq!(ledger.high_water, 3);
        assert_eq!(ledger.tickets.len(), 2);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::TicketIssued(Ticket {
            id: Ulid::new(),
            session_id: Ulid::new(),
            user_id: Ulid::new(),
            seat: 7,
            price: 1250,
        });
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
