use ulid::Ulid;

use crate::store::StoreTx;

use super::EngineError;

/// Next free seat for `session_id`, decided inside the caller's transaction.
///
/// Takes the session lock first, so the `MAX(seat)` read and the caller's
/// insert are atomic with respect to every other allocation for the session.
/// Seats are `max ever issued + 1`; a full hall is
/// [`EngineError::CapacityExhausted`], never an internal failure.
pub async fn allocate_seat<T: StoreTx>(tx: &mut T, session_id: Ulid) -> Result<u32, EngineError> {
    tx.lock_session(session_id).await?;
    let base = tx.max_seat(session_id).await?;
    let seat_count = tx.seat_count(session_id).await?;
    if base >= seat_count {
        return Err(EngineError::CapacityExhausted {
            session_id,
            seat_count,
        });
    }
    Ok(base + 1)
}
