mod booking;
mod catalog;
mod error;
mod schedule;
mod seats;

pub use booking::TicketRequest;
pub use error::{EngineError, ErrorKind, INTERNAL_FAILURE_MESSAGE};
pub use schedule::{check_conflict, conflicting_slot, find_conflict};
pub use seats::allocate_seat;

use std::time::Duration;

use tracing::error;

use crate::limits::*;
use crate::model::Ms;
use crate::store::{CapacityStore, StoreTx};

/// The booking core on top of a capacity store.
///
/// Every mutation that reads shared capacity (seat numbers, hall schedules)
/// runs inside one store transaction holding the matching lock, so two
/// callers can never both act on the same stale read.
pub struct Engine<S: CapacityStore> {
    store: S,
    booking_timeout: Duration,
}

impl<S: CapacityStore> Engine<S> {
    pub fn new(store: S, booking_timeout: Duration) -> Self {
        Self {
            store,
            booking_timeout,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn booking_timeout(&self) -> Duration {
        self.booking_timeout
    }
}

/// Roll back after `cause`. A rollback that itself fails escalates to internal.
async fn abort<T: StoreTx>(tx: T, cause: EngineError) -> EngineError {
    match tx.rollback().await {
        Ok(()) => cause,
        Err(source) => {
            error!(%cause, %source, "rollback failed");
            EngineError::RollbackFailed {
                cause: Box::new(cause),
                source,
            }
        }
    }
}

pub(crate) fn validate_timestamp(ts: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&ts) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}
