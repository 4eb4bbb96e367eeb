use std::time::Duration;

use metrics::counter;
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::{Ticket, TicketReceipt};
use crate::observability::{TICKETS_ISSUED_TOTAL, TICKETS_REJECTED_TOTAL};
use crate::store::{CapacityStore, StoreTx};

use super::seats::allocate_seat;
use super::{Engine, EngineError, ErrorKind, abort};

// Roughly thirty years.
const FAR_DEADLINE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A purchase as submitted by a client. The seat is never client-chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketRequest {
    pub id: Ulid,
    pub session_id: Ulid,
    pub user_id: Ulid,
    pub price: u64,
}

impl<S: CapacityStore> Engine<S> {
    /// Issue a ticket for `request` on behalf of `authenticated`.
    ///
    /// The request must name the authenticated user; a mismatch is rejected
    /// before the store is touched. Allocation and insert share one
    /// transaction bounded by the booking timeout. On any failure the
    /// transaction is rolled back and no ticket exists, no retries.
    pub async fn create_ticket(
        &self,
        request: TicketRequest,
        authenticated: Ulid,
    ) -> Result<TicketReceipt, EngineError> {
        if request.user_id != authenticated {
            counter!(TICKETS_REJECTED_TOTAL, "reason" => "owner").increment(1);
            warn!(requested = %request.user_id, %authenticated, "ticket rejected: user mismatch");
            return Err(EngineError::NotOwner {
                requested: request.user_id,
                authenticated,
            });
        }

        let deadline = booking_deadline(Instant::now(), self.booking_timeout);
        let timed_out = EngineError::TimedOut(self.booking_timeout);

        let mut tx = match timeout_at(deadline, self.store.begin()).await {
            Ok(tx) => tx?,
            Err(_) => return Err(timed_out),
        };

        let seat = match timeout_at(deadline, issue_in(&mut tx, &request)).await {
            Ok(Ok(seat)) => seat,
            Ok(Err(e)) => {
                if e.kind() == ErrorKind::CapacityExhausted {
                    counter!(TICKETS_REJECTED_TOTAL, "reason" => "sold_out").increment(1);
                    warn!(session_id = %request.session_id, "ticket rejected: sold out");
                }
                return Err(abort(tx, e).await);
            }
            Err(_) => return Err(abort(tx, timed_out).await),
        };
        if Instant::now() >= deadline {
            return Err(abort(tx, timed_out).await);
        }
        tx.commit().await?;

        counter!(TICKETS_ISSUED_TOTAL).increment(1);
        info!(ticket_id = %request.id, session_id = %request.session_id, seat, "ticket issued");

        self.ticket(request.id).await
    }
}

/// `now + timeout`, saturating to a far deadline instead of overflowing.
fn booking_deadline(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_DEADLINE))
        .unwrap_or(now)
}

async fn issue_in<T: StoreTx>(tx: &mut T, request: &TicketRequest) -> Result<u32, EngineError> {
    let seat = allocate_seat(tx, request.session_id).await?;
    tx.insert_ticket(Ticket {
        id: request.id,
        session_id: request.session_id,
        user_id: request.user_id,
        seat,
        price: request.price,
    })
    .await?;
    Ok(seat)
}
