use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::CapacityStore;

use super::{Engine, EngineError};

fn validate_movie(name: &str, duration_minutes: u32) -> Result<(), EngineError> {
    if !(MIN_MOVIE_DURATION_MINUTES..=MAX_MOVIE_DURATION_MINUTES).contains(&duration_minutes) {
        return Err(EngineError::Validation("duration of movie is incorrect"));
    }
    let len = name.trim().chars().count();
    if len == 0 || len > MAX_MOVIE_NAME_LEN {
        return Err(EngineError::Validation("name of movie is incorrect"));
    }
    Ok(())
}

impl<S: CapacityStore> Engine<S> {
    // ── Halls ────────────────────────────────────────────

    pub async fn create_hall(&self, id: Ulid, is_vip: bool, seat_count: u32) -> Result<Hall, EngineError> {
        if seat_count > MAX_HALL_SEATS {
            return Err(EngineError::LimitExceeded("too many seats"));
        }
        self.store
            .insert_hall(Hall {
                id,
                is_vip,
                seat_count,
            })
            .await?;
        debug!(%id, seat_count, "hall created");
        self.hall(id).await
    }

    pub async fn hall(&self, id: Ulid) -> Result<Hall, EngineError> {
        self.store.hall(id).await?.ok_or(EngineError::NotFound(id))
    }

    pub async fn list_halls(&self) -> Result<Vec<Hall>, EngineError> {
        Ok(self.store.halls().await?)
    }

    pub async fn delete_hall(&self, id: Ulid) -> Result<(), EngineError> {
        self.store.delete_hall(id).await?;
        debug!(%id, "hall deleted");
        Ok(())
    }

    // ── Movies ───────────────────────────────────────────

    pub async fn create_movie(
        &self,
        id: Ulid,
        name: &str,
        duration_minutes: u32,
    ) -> Result<Movie, EngineError> {
        validate_movie(name, duration_minutes)?;
        self.store
            .insert_movie(Movie {
                id,
                name: name.trim().to_string(),
                duration_minutes,
            })
            .await?;
        debug!(%id, duration_minutes, "movie created");
        self.movie(id).await
    }

    pub async fn movie(&self, id: Ulid) -> Result<Movie, EngineError> {
        self.store.movie(id).await?.ok_or(EngineError::NotFound(id))
    }

    pub async fn list_movies(&self) -> Result<Vec<Movie>, EngineError> {
        Ok(self.store.movies().await?)
    }

    pub async fn delete_movie(&self, id: Ulid) -> Result<(), EngineError> {
        self.store.delete_movie(id).await?;
        debug!(%id, "movie deleted");
        Ok(())
    }

    // ── Sessions ─────────────────────────────────────────

    pub async fn session(&self, id: Ulid) -> Result<Session, EngineError> {
        self.store.session(id).await?.ok_or(EngineError::NotFound(id))
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, EngineError> {
        Ok(self.store.sessions(None).await?)
    }

    pub async fn sessions_in_hall(&self, hall_id: Ulid) -> Result<Vec<Session>, EngineError> {
        self.hall(hall_id).await?;
        Ok(self.store.sessions(Some(hall_id)).await?)
    }

    pub async fn delete_session(&self, id: Ulid) -> Result<(), EngineError> {
        self.store.delete_session(id).await?;
        debug!(%id, "session deleted");
        Ok(())
    }

    // ── Tickets ──────────────────────────────────────────

    /// A ticket joined with its session and movie.
    pub async fn ticket(&self, id: Ulid) -> Result<TicketReceipt, EngineError> {
        let ticket = self.store.ticket(id).await?.ok_or(EngineError::NotFound(id))?;
        self.receipt(ticket).await
    }

    pub async fn tickets_for_session(&self, session_id: Ulid) -> Result<Vec<TicketReceipt>, EngineError> {
        let session = self.session(session_id).await?;
        let movie = self.movie(session.movie_id).await?;
        let tickets = self.store.tickets(session_id).await?;
        Ok(tickets
            .into_iter()
            .map(|ticket| TicketReceipt {
                ticket,
                hall_id: session.hall_id,
                movie_name: movie.name.clone(),
                starts_at: session.starts_at,
            })
            .collect())
    }

    /// Every ticket, grouped by session.
    pub async fn list_tickets(&self) -> Result<Vec<TicketReceipt>, EngineError> {
        let mut receipts = Vec::new();
        for session in self.list_sessions().await? {
            match self.tickets_for_session(session.id).await {
                Ok(tickets) => receipts.extend(tickets),
                // Deleted since the listing.
                Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(receipts)
    }

    /// Hard delete. The seat is not handed out again.
    pub async fn delete_ticket(&self, id: Ulid) -> Result<(), EngineError> {
        self.store.delete_ticket(id).await?;
        debug!(%id, "ticket deleted");
        Ok(())
    }

    async fn receipt(&self, ticket: Ticket) -> Result<TicketReceipt, EngineError> {
        let session = self.session(ticket.session_id).await?;
        let movie = self.movie(session.movie_id).await?;
        Ok(TicketReceipt {
            ticket,
            hall_id: session.hall_id,
            movie_name: movie.name,
            starts_at: session.starts_at,
        })
    }
}
