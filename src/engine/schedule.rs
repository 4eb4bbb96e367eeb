use metrics::counter;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::MAX_VALID_TIMESTAMP_MS;
use crate::model::*;
use crate::observability::SESSIONS_REJECTED_TOTAL;
use crate::store::{CapacityStore, StoreTx};

use super::{Engine, EngineError, abort, validate_timestamp};

/// First slot overlapping `proposed`. `slots` must be sorted by start and
/// pairwise disjoint, so only the last slot starting before `proposed.end`
/// can reach into it.
pub fn find_conflict(slots: &[Slot], proposed: &Span) -> Option<Slot> {
    let right_bound = slots.partition_point(|s| s.span.start < proposed.end);
    slots[..right_bound]
        .iter()
        .rev()
        .find(|s| s.span.overlaps(proposed))
        .copied()
}

/// `Ok(true)` if a showing of `duration_minutes` starting at `starts_at` fits
/// in the hall without overlapping any session. Touching endpoints are fine.
///
/// Read-only. Call it with the hall locked in `tx` when the answer feeds an insert.
pub async fn check_conflict<T: StoreTx>(
    tx: &mut T,
    hall_id: Ulid,
    duration_minutes: u32,
    starts_at: Ms,
) -> Result<bool, EngineError> {
    Ok(conflicting_slot(tx, hall_id, &Span::showing(starts_at, duration_minutes))
        .await?
        .is_none())
}

/// The scheduled slot `proposed` would collide with, if any.
pub async fn conflicting_slot<T: StoreTx>(tx: &mut T, hall_id: Ulid, proposed: &Span) -> Result<Option<Slot>, EngineError> {
    let slots = tx.hall_slots(hall_id).await?;
    Ok(find_conflict(&slots, proposed))
}

impl<S: CapacityStore> Engine<S> {
    /// Schedule a session. Check and insert run under the hall lock, so two
    /// overlapping requests can't both pass the check.
    pub async fn create_session(
        &self,
        id: Ulid,
        hall_id: Ulid,
        movie_id: Ulid,
        starts_at: Ms,
    ) -> Result<Session, EngineError> {
        validate_timestamp(starts_at)?;

        let mut tx = self.store.begin().await?;
        if let Err(e) = schedule_in(&mut tx, id, hall_id, movie_id, starts_at).await {
            if let EngineError::ScheduleConflict { with, .. } = &e {
                counter!(SESSIONS_REJECTED_TOTAL).increment(1);
                warn!(%hall_id, %with, starts_at, "session rejected: overlapping schedule");
            }
            return Err(abort(tx, e).await);
        }
        tx.commit().await?;
        debug!(%id, %hall_id, %movie_id, starts_at, "session scheduled");

        self.store.session(id).await?.ok_or(EngineError::NotFound(id))
    }
}

async fn schedule_in<T: StoreTx>(
    tx: &mut T,
    id: Ulid,
    hall_id: Ulid,
    movie_id: Ulid,
    starts_at: Ms,
) -> Result<(), EngineError> {
    let movie = tx.movie(movie_id).await?.ok_or(EngineError::NotFound(movie_id))?;
    let span = Span::showing(starts_at, movie.duration_minutes);
    if span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }

    tx.lock_hall(hall_id).await?;
    if let Some(existing) = conflicting_slot(tx, hall_id, &span).await? {
        return Err(EngineError::ScheduleConflict {
            hall_id,
            with: existing.session_id,
        });
    }

    tx.insert_session(Session {
        id,
        hall_id,
        movie_id,
        starts_at,
        ends_at: span.end,
    })
    .await?;
    Ok(())
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

    #[test]
    fn empty_hall_has_no_conflict() {
        assert_eq!(find_conflict(&[], &Span::new(0, 100)), None);
    }

    #[test]
    fn skips_past_and_future_slots() {
        let slots = vec![slot(100, 200), slot(450, 600), slot(1000, 1100)];
        let hit = find_conflict(&slots, &Span::new(500, 800)).unwrap();
        assert_eq!(hit.span, Span::new(450, 600));
        assert_eq!(find_conflict(&slots, &Span::new(600, 1000)), None);
    }

    #[test]
    fn adjacent_slots_do_not_conflict() {
        let slots = vec![slot(100, 200)];
        assert_eq!(find_conflict(&slots, &Span::new(200, 300)), None);
        assert_eq!(find_conflict(&slots, &Span::new(0, 100)), None);
    }

    #[test]
    fn containment_conflicts_both_ways() {
        let slots = vec![slot(100, 400)];
        assert!(find_conflict(&slots, &Span::new(200, 300)).is_some());
        assert!(find_conflict(&slots, &Span::new(0, 500)).is_some());
    }

    #[test]
    fn starting_before_and_ending_inside() {
        let slots = vec![slot(100, 200), slot(300, 400)];
        let hit = find_conflict(&slots, &Span::new(250, 350)).unwrap();
        assert_eq!(hit.span, Span::new(300, 400));
        let hit = find_conflict(&slots, &Span::new(150, 250)).unwrap();
        assert_eq!(hit.span, Span::new(100, 200));
    }
}
