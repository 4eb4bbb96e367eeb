//! The capacity store: halls, movies, sessions and tickets.
//!
//! Reads outside a transaction see committed state. Everything the booking
//! core does runs through a [`StoreTx`], which can take a hall-scoped or
//! session-scoped lock that is held until commit or rollback.

mod memory;

pub use memory::{MemoryStore, MemoryTx};

use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("{id} is still referenced by {by}")]
    Referenced { id: Ulid, by: &'static str },
    #[error("seat {seat} already taken in session {session_id}")]
    SeatTaken { session_id: Ulid, seat: u32 },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("transaction misuse: {0}")]
    TxMisuse(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("store closed")]
    Closed,
    #[error("store task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait CapacityStore: Send + Sync + 'static {
    type Tx: StoreTx;

    /// Open a transaction. Its writes stay invisible until [`StoreTx::commit`].
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn hall(&self, id: Ulid) -> Result<Option<Hall>, StoreError>;
    async fn movie(&self, id: Ulid) -> Result<Option<Movie>, StoreError>;
    async fn session(&self, id: Ulid) -> Result<Option<Session>, StoreError>;
    async fn ticket(&self, id: Ulid) -> Result<Option<Ticket>, StoreError>;

    async fn halls(&self) -> Result<Vec<Hall>, StoreError>;
    async fn movies(&self) -> Result<Vec<Movie>, StoreError>;
    /// All sessions, or only those of one hall, ordered by start time.
    async fn sessions(&self, hall_id: Option<Ulid>) -> Result<Vec<Session>, StoreError>;
    /// Live tickets of a session, ordered by seat.
    async fn tickets(&self, session_id: Ulid) -> Result<Vec<Ticket>, StoreError>;

    async fn insert_hall(&self, hall: Hall) -> Result<(), StoreError>;
    async fn insert_movie(&self, movie: Movie) -> Result<(), StoreError>;

    async fn delete_hall(&self, id: Ulid) -> Result<(), StoreError>;
    async fn delete_movie(&self, id: Ulid) -> Result<(), StoreError>;
    async fn delete_session(&self, id: Ulid) -> Result<(), StoreError>;
    /// Removes the ticket. Its seat is not handed out again.
    async fn delete_ticket(&self, id: Ulid) -> Result<(), StoreError>;
}

/// An open transaction.
///
/// Dropping a transaction without committing rolls it back: locks are
/// released and staged writes are discarded.
#[async_trait]
pub trait StoreTx: Send + 'static {
    /// Lock a hall's schedule until the transaction ends. One hall per transaction.
    async fn lock_hall(&mut self, hall_id: Ulid) -> Result<(), StoreError>;
    /// Lock a session's seats until the transaction ends. One session per transaction.
    async fn lock_session(&mut self, session_id: Ulid) -> Result<(), StoreError>;

    async fn movie(&mut self, id: Ulid) -> Result<Option<Movie>, StoreError>;
    /// Sessions scheduled in a hall as `[start, end)` slots sorted by start.
    async fn hall_slots(&mut self, hall_id: Ulid) -> Result<Vec<Slot>, StoreError>;
    /// `MAX(seat)` for the session, 0 when no seat was ever issued.
    async fn max_seat(&mut self, session_id: Ulid) -> Result<u32, StoreError>;
    /// Seat count of the hall the session plays in.
    async fn seat_count(&mut self, session_id: Ulid) -> Result<u32, StoreError>;

    async fn insert_session(&mut self, session: Session) -> Result<(), StoreError>;
    async fn insert_ticket(&mut self, ticket: Ticket) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
    async fn rollback(self) -> Result<(), StoreError>;
}
