use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

use super::{CapacityStore, StoreError, StoreTx};

type SharedSchedule = Arc<RwLock<HallSchedule>>;
type SharedLedger = Arc<RwLock<SeatLedger>>;
type Ack = oneshot::Sender<io::Result<()>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append { batch: Vec<Event>, response: Ack },
    Compact { response: Ack },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is queued, write the
/// whole group, fsync once, then acknowledge every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { batch, response } => {
                let mut group = vec![(batch, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { batch, response }) => group.push((batch, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_group(&mut wal, &mut group);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_group(wal: &mut Wal, group: &mut Vec<(Vec<Event>, Ack)>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(group.len() as f64);
    let started = Instant::now();

    let mut result: io::Result<()> = Ok(());
    for (batch, _) in group.iter() {
        if let Err(e) = wal.append_buffered(batch) {
            result = Err(e);
            break;
        }
    }
    let mut result = result.and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        error!("WAL group commit failed: {e}");
        // Partially written records must not sit in front of later groups.
        if let Err(discard) = wal.discard_unsynced() {
            error!("WAL truncate after failed commit failed: {discard}");
            result = Err(discard);
        }
    }
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    for (_, ack) in group.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = ack.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let _ = response.send(compact_wal(wal));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { batch, response } => flush_group(wal, &mut vec![(batch, response)]),
    }
}

/// Fold the log into a snapshot and swap it in. This runs on the writer task,
/// so every acknowledged commit is already on disk and none can interleave.
fn compact_wal(wal: &mut Wal) -> io::Result<()> {
    let recovered = Recovered::from_batches(Wal::replay(wal.path())?);
    let snapshot = recovered.snapshot();
    Wal::write_compact_file(wal.path(), &snapshot)?;
    wal.swap_compact_file()?;
    info!(events = snapshot.len(), "WAL compacted");
    Ok(())
}

// ── Recovery ─────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MovieEntry {
    movie: Movie,
    /// Sessions currently scheduled for this movie.
    sessions: usize,
}

/// Plain, unshared state rebuilt from the log.
#[derive(Default)]
struct Recovered {
    schedules: HashMap<Ulid, HallSchedule>,
    movies: HashMap<Ulid, MovieEntry>,
    ledgers: HashMap<Ulid, SeatLedger>,
}

impl Recovered {
    fn from_batches(batches: Vec<Vec<Event>>) -> Self {
        let mut state = Self::default();
        for event in batches.into_iter().flatten() {
            state.apply(event);
        }
        state
    }

    fn apply(&mut self, event: Event) {
        match event {
            Event::HallCreated(hall) => {
                self.schedules.insert(hall.id, HallSchedule::new(hall));
            }
            Event::HallDeleted { id } => {
                self.schedules.remove(&id);
            }
            Event::MovieCreated(movie) => {
                self.movies.insert(movie.id, MovieEntry { movie, sessions: 0 });
            }
            Event::MovieDeleted { id } => {
                self.movies.remove(&id);
            }
            Event::SessionScheduled(session) => {
                let Some(hs) = self.schedules.get_mut(&session.hall_id) else {
                    return;
                };
                hs.insert_slot(Slot {
                    session_id: session.id,
                    span: session.span(),
                });
                if let Some(entry) = self.movies.get_mut(&session.movie_id) {
                    entry.sessions += 1;
                }
                let seat_count = hs.hall.seat_count;
                self.ledgers.insert(session.id, SeatLedger::new(session, seat_count));
            }
            Event::SessionDeleted { id, hall_id } => {
                if let Some(hs) = self.schedules.get_mut(&hall_id) {
                    hs.remove_slot(id);
                }
                if let Some(ledger) = self.ledgers.remove(&id)
                    && let Some(entry) = self.movies.get_mut(&ledger.session.movie_id)
                {
                    entry.sessions = entry.sessions.saturating_sub(1);
                }
            }
            Event::TicketIssued(ticket) => {
                if let Some(ledger) = self.ledgers.get_mut(&ticket.session_id) {
                    ledger.issue(ticket);
                }
            }
            Event::TicketDeleted { id, session_id } => {
                if let Some(ledger) = self.ledgers.get_mut(&session_id) {
                    ledger.remove(id);
                }
            }
            Event::SeatHighWater { session_id, seat } => {
                if let Some(ledger) = self.ledgers.get_mut(&session_id) {
                    ledger.high_water = ledger.high_water.max(seat);
                }
            }
        }
    }

    /// Minimal event list that rebuilds this state. Halls and movies come
    /// first so sessions always find their parents on replay.
    fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();
        events.extend(self.schedules.values().map(|hs| Event::HallCreated(hs.hall.clone())));
        events.extend(self.movies.values().map(|e| Event::MovieCreated(e.movie.clone())));
        for ledger in self.ledgers.values() {
            events.push(Event::SessionScheduled(ledger.session.clone()));
            events.extend(ledger.tickets.iter().cloned().map(Event::TicketIssued));
            let top_live = ledger.tickets.last().map_or(0, |t| t.seat);
            if ledger.high_water > top_live {
                events.push(Event::SeatHighWater {
                    session_id: ledger.session.id,
                    seat: ledger.high_water,
                });
            }
        }
        events
    }
}

// ── Store ────────────────────────────────────────────────

struct Inner {
    /// Immutable hall rows, readable without touching schedule locks.
    halls: DashMap<Ulid, Hall>,
    schedules: DashMap<Ulid, SharedSchedule>,
    movies: DashMap<Ulid, MovieEntry>,
    sessions: DashMap<Ulid, SharedLedger>,
    /// Reverse lookup: ticket id → session id
    ticket_sessions: DashMap<Ulid, Ulid>,
    /// Serializes hall and movie creation/deletion.
    catalog: Mutex<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Inner {
    fn from_recovered(recovered: Recovered, wal_tx: mpsc::Sender<WalCommand>) -> Self {
        let inner = Self {
            halls: DashMap::new(),
            schedules: DashMap::new(),
            movies: DashMap::new(),
            sessions: DashMap::new(),
            ticket_sessions: DashMap::new(),
            catalog: Mutex::new(()),
            wal_tx,
        };
        for (id, hs) in recovered.schedules {
            inner.halls.insert(id, hs.hall.clone());
            inner.schedules.insert(id, Arc::new(RwLock::new(hs)));
        }
        for (id, entry) in recovered.movies {
            inner.movies.insert(id, entry);
        }
        for (id, ledger) in recovered.ledgers {
            for ticket in &ledger.tickets {
                inner.ticket_sessions.insert(ticket.id, id);
            }
            inner.sessions.insert(id, Arc::new(RwLock::new(ledger)));
        }
        inner
    }

    async fn wal_append(&self, batch: Vec<Event>) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { batch, response: tx })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await
            .map_err(|_| StoreError::Closed)?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    fn schedule(&self, hall_id: &Ulid) -> Option<SharedSchedule> {
        self.schedules.get(hall_id).map(|e| e.value().clone())
    }

    fn ledger(&self, session_id: &Ulid) -> Option<SharedLedger> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }
}

/// True if `held` is still the entry registered under `id` (not deleted or replaced
/// while we waited for its lock).
fn still_current<T>(map: &DashMap<Ulid, Arc<T>>, id: &Ulid, held: &Arc<T>) -> bool {
    map.get(id).is_some_and(|e| Arc::ptr_eq(e.value(), held))
}

/// Run a mutation on its own task so a dropped caller can't stop it between
/// the WAL append and the in-memory apply.
async fn detached<T, F>(fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

/// In-memory capacity store made durable by a group-commit WAL.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, batches) = Wal::recover(&wal_path)?;
        let recovered = Recovered::from_batches(batches);
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let inner = Inner::from_recovered(recovered, wal_tx);
        info!(
            halls = inner.halls.len(),
            movies = inner.movies.len(),
            sessions = inner.sessions.len(),
            tickets = inner.ticket_sessions.len(),
            "capacity store recovered from {}",
            wal_path.display()
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub async fn appends_since_compact(&self) -> Result<u64, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await
            .map_err(|_| StoreError::Closed)
    }

    pub async fn compact(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await
            .map_err(|_| StoreError::Closed)?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }
}

#[async_trait]
impl CapacityStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        Ok(MemoryTx {
            inner: self.inner.clone(),
            hall: None,
            session: None,
            pending: Vec::new(),
        })
    }

    async fn hall(&self, id: Ulid) -> Result<Option<Hall>, StoreError> {
        Ok(self.inner.halls.get(&id).map(|h| h.value().clone()))
    }

    async fn movie(&self, id: Ulid) -> Result<Option<Movie>, StoreError> {
        Ok(self.inner.movies.get(&id).map(|e| e.movie.clone()))
    }

    async fn session(&self, id: Ulid) -> Result<Option<Session>, StoreError> {
        let Some(ledger) = self.inner.ledger(&id) else {
            return Ok(None);
        };
        let guard = ledger.read().await;
        Ok(Some(guard.session.clone()))
    }

    async fn ticket(&self, id: Ulid) -> Result<Option<Ticket>, StoreError> {
        let Some(session_id) = self.inner.ticket_sessions.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(ledger) = self.inner.ledger(&session_id) else {
            return Ok(None);
        };
        let guard = ledger.read().await;
        Ok(guard.tickets.iter().find(|t| t.id == id).cloned())
    }

    async fn halls(&self) -> Result<Vec<Hall>, StoreError> {
        let mut halls: Vec<Hall> = self.inner.halls.iter().map(|e| e.value().clone()).collect();
        halls.sort_by_key(|h| h.id);
        Ok(halls)
    }

    async fn movies(&self) -> Result<Vec<Movie>, StoreError> {
        let mut movies: Vec<Movie> = self.inner.movies.iter().map(|e| e.movie.clone()).collect();
        movies.sort_by_key(|m| m.id);
        Ok(movies)
    }

    async fn sessions(&self, hall_id: Option<Ulid>) -> Result<Vec<Session>, StoreError> {
        let ledgers: Vec<SharedLedger> = self.inner.sessions.iter().map(|e| e.value().clone()).collect();
        let mut sessions = Vec::with_capacity(ledgers.len());
        for ledger in ledgers {
            let guard = ledger.read().await;
            if hall_id.is_none_or(|h| h == guard.session.hall_id) {
                sessions.push(guard.session.clone());
            }
        }
        sessions.sort_by_key(|s| (s.starts_at, s.id));
        Ok(sessions)
    }

    async fn tickets(&self, session_id: Ulid) -> Result<Vec<Ticket>, StoreError> {
        let Some(ledger) = self.inner.ledger(&session_id) else {
            return Ok(vec![]);
        };
        let guard = ledger.read().await;
        Ok(guard.tickets.clone())
    }

    async fn insert_hall(&self, hall: Hall) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        detached(async move {
            let _catalog = inner.catalog.lock().await;
            if inner.halls.contains_key(&hall.id) {
                return Err(StoreError::AlreadyExists(hall.id));
            }
            if inner.halls.len() >= MAX_HALLS {
                return Err(StoreError::LimitExceeded("too many halls"));
            }
            inner.wal_append(vec![Event::HallCreated(hall.clone())]).await?;
            inner
                .schedules
                .insert(hall.id, Arc::new(RwLock::new(HallSchedule::new(hall.clone()))));
            inner.halls.insert(hall.id, hall);
            Ok(())
        })
        .await
    }

    async fn insert_movie(&self, movie: Movie) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        detached(async move {
            let _catalog = inner.catalog.lock().await;
            if inner.movies.contains_key(&movie.id) {
                return Err(StoreError::AlreadyExists(movie.id));
            }
            if inner.movies.len() >= MAX_MOVIES {
                return Err(StoreError::LimitExceeded("too many movies"));
            }
            inner.wal_append(vec![Event::MovieCreated(movie.clone())]).await?;
            inner.movies.insert(movie.id, MovieEntry { movie, sessions: 0 });
            Ok(())
        })
        .await
    }

    async fn delete_hall(&self, id: Ulid) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        detached(async move {
            let _catalog = inner.catalog.lock().await;
            let schedule = inner.schedule(&id).ok_or(StoreError::NotFound(id))?;
            let guard = schedule.write().await;
            if !guard.slots.is_empty() {
                return Err(StoreError::Referenced { id, by: "sessions" });
            }
            inner.wal_append(vec![Event::HallDeleted { id }]).await?;
            inner.schedules.remove(&id);
            inner.halls.remove(&id);
            Ok(())
        })
        .await
    }

    async fn delete_movie(&self, id: Ulid) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        detached(async move {
            let _catalog = inner.catalog.lock().await;
            // Remove first so a scheduling commit can't slip a session in
            // between the check and the delete; restore if the WAL refuses.
            let Some((_, entry)) = inner.movies.remove_if(&id, |_, e| e.sessions == 0) else {
                return Err(if inner.movies.contains_key(&id) {
                    StoreError::Referenced { id, by: "sessions" }
                } else {
                    StoreError::NotFound(id)
                });
            };
            if let Err(e) = inner.wal_append(vec![Event::MovieDeleted { id }]).await {
                inner.movies.insert(id, entry);
                return Err(e);
            }
            Ok(())
        })
        .await
    }

    async fn delete_session(&self, id: Ulid) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        detached(async move {
            let ledger = inner.ledger(&id).ok_or(StoreError::NotFound(id))?;
            let guard = ledger.clone().write_owned().await;
            if !still_current(&inner.sessions, &id, &ledger) {
                return Err(StoreError::NotFound(id));
            }
            if !guard.tickets.is_empty() {
                return Err(StoreError::Referenced { id, by: "tickets" });
            }
            let hall_id = guard.session.hall_id;
            let schedule = inner.schedule(&hall_id).ok_or(StoreError::NotFound(hall_id))?;
            let mut hs = schedule.write().await;

            inner.wal_append(vec![Event::SessionDeleted { id, hall_id }]).await?;
            hs.remove_slot(id);
            inner.sessions.remove(&id);
            if let Some(mut entry) = inner.movies.get_mut(&guard.session.movie_id) {
                entry.sessions = entry.sessions.saturating_sub(1);
            }
            Ok(())
        })
        .await
    }

    async fn delete_ticket(&self, id: Ulid) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        detached(async move {
            let session_id = inner
                .ticket_sessions
                .get(&id)
                .map(|e| *e.value())
                .ok_or(StoreError::NotFound(id))?;
            let ledger = inner.ledger(&session_id).ok_or(StoreError::NotFound(id))?;
            let mut guard = ledger.write().await;
            if !guard.tickets.iter().any(|t| t.id == id) {
                return Err(StoreError::NotFound(id));
            }
            inner.wal_append(vec![Event::TicketDeleted { id, session_id }]).await?;
            guard.remove(id);
            inner.ticket_sessions.remove(&id);
            Ok(())
        })
        .await
    }
}

// ── Transactions ─────────────────────────────────────────

/// Rows and references claimed ahead of the WAL append, undone if it fails.
#[derive(Default)]
struct Claims {
    /// Fresh ledgers, inserted write-locked so nobody books into them before they are durable.
    sessions: Vec<(Ulid, OwnedRwLockWriteGuard<SeatLedger>)>,
    tickets: Vec<Ulid>,
    movie_refs: Vec<Ulid>,
}

impl Claims {
    fn release(self, inner: &Inner) {
        for (id, _guard) in &self.sessions {
            inner.sessions.remove(id);
        }
        for id in &self.tickets {
            inner.ticket_sessions.remove(id);
        }
        for movie_id in &self.movie_refs {
            if let Some(mut entry) = inner.movies.get_mut(movie_id) {
                entry.sessions = entry.sessions.saturating_sub(1);
            }
        }
    }
}

pub struct MemoryTx {
    inner: Arc<Inner>,
    hall: Option<(Ulid, OwnedRwLockWriteGuard<HallSchedule>)>,
    session: Option<(Ulid, OwnedRwLockWriteGuard<SeatLedger>)>,
    pending: Vec<Event>,
}

impl MemoryTx {
    async fn with_ledger<R, F>(&self, session_id: Ulid, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&SeatLedger) -> R + Send,
    {
        if let Some((held, guard)) = &self.session
            && *held == session_id
        {
            return Ok(f(&**guard));
        }
        let ledger = self
            .inner
            .ledger(&session_id)
            .ok_or(StoreError::NotFound(session_id))?;
        let guard = ledger.read().await;
        Ok(f(&*guard))
    }

    fn staged_tickets(&self, session_id: Ulid) -> impl Iterator<Item = &Ticket> {
        self.pending.iter().filter_map(move |e| match e {
            Event::TicketIssued(t) if t.session_id == session_id => Some(t),
            _ => None,
        })
    }

    fn claim(&self, pending: &[Event]) -> Result<Claims, StoreError> {
        let mut claims = Claims::default();
        for event in pending {
            let claimed = match event {
                Event::SessionScheduled(session) => self.claim_session(session, &mut claims),
                Event::TicketIssued(ticket) => self.claim_ticket(ticket, &mut claims),
                _ => Ok(()),
            };
            if let Err(e) = claimed {
                claims.release(&self.inner);
                return Err(e);
            }
        }
        Ok(claims)
    }

    fn claim_session(&self, session: &Session, claims: &mut Claims) -> Result<(), StoreError> {
        let seat_count = self
            .inner
            .halls
            .get(&session.hall_id)
            .map(|h| h.seat_count)
            .ok_or(StoreError::NotFound(session.hall_id))?;
        {
            let mut movie = self
                .inner
                .movies
                .get_mut(&session.movie_id)
                .ok_or(StoreError::NotFound(session.movie_id))?;
            movie.sessions += 1;
        }
        claims.movie_refs.push(session.movie_id);

        let ledger = Arc::new(RwLock::new(SeatLedger::new(session.clone(), seat_count)));
        let guard = ledger
            .clone()
            .try_write_owned()
            .map_err(|_| StoreError::TxMisuse("fresh ledger already locked"))?;
        match self.inner.sessions.entry(session.id) {
            Entry::Occupied(_) => return Err(StoreError::AlreadyExists(session.id)),
            Entry::Vacant(slot) => {
                slot.insert(ledger);
            }
        }
        claims.sessions.push((session.id, guard));
        Ok(())
    }

    fn claim_ticket(&self, ticket: &Ticket, claims: &mut Claims) -> Result<(), StoreError> {
        match self.inner.ticket_sessions.entry(ticket.id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(ticket.id)),
            Entry::Vacant(slot) => {
                slot.insert(ticket.session_id);
                claims.tickets.push(ticket.id);
                Ok(())
            }
        }
    }

    async fn apply_commit(mut self) -> Result<(), StoreError> {
        let pending = std::mem::take(&mut self.pending);
        let claims = self.claim(&pending)?;

        if let Err(e) = self.inner.wal_append(pending.clone()).await {
            claims.release(&self.inner);
            return Err(e);
        }

        for event in pending {
            match event {
                Event::SessionScheduled(session) => {
                    if let Some((_, hs)) = self.hall.as_mut() {
                        hs.insert_slot(Slot {
                            session_id: session.id,
                            span: session.span(),
                        });
                    }
                }
                Event::TicketIssued(ticket) => {
                    if let Some((_, ledger)) = self.session.as_mut() {
                        ledger.issue(ticket);
                    }
                }
                _ => {}
            }
        }
        // Claims drop here, unlocking freshly scheduled sessions.
        Ok(())
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_hall(&mut self, hall_id: Ulid) -> Result<(), StoreError> {
        match &self.hall {
            Some((held, _)) if *held == hall_id => return Ok(()),
            Some(_) => return Err(StoreError::TxMisuse("transaction already holds another hall")),
            None => {}
        }
        let schedule = self.inner.schedule(&hall_id).ok_or(StoreError::NotFound(hall_id))?;
        let guard = schedule.clone().write_owned().await;
        if !still_current(&self.inner.schedules, &hall_id, &schedule) {
            return Err(StoreError::NotFound(hall_id));
        }
        self.hall = Some((hall_id, guard));
        Ok(())
    }

    async fn lock_session(&mut self, session_id: Ulid) -> Result<(), StoreError> {
        match &self.session {
            Some((held, _)) if *held == session_id => return Ok(()),
            Some(_) => {
                return Err(StoreError::TxMisuse("transaction already holds another session"));
            }
            None => {}
        }
        let ledger = self
            .inner
            .ledger(&session_id)
            .ok_or(StoreError::NotFound(session_id))?;
        let guard = ledger.clone().write_owned().await;
        if !still_current(&self.inner.sessions, &session_id, &ledger) {
            return Err(StoreError::NotFound(session_id));
        }
        self.session = Some((session_id, guard));
        Ok(())
    }

    async fn movie(&mut self, id: Ulid) -> Result<Option<Movie>, StoreError> {
        Ok(self.inner.movies.get(&id).map(|e| e.movie.clone()))
    }

    async fn hall_slots(&mut self, hall_id: Ulid) -> Result<Vec<Slot>, StoreError> {
        let mut slots = match &self.hall {
            Some((held, guard)) if *held == hall_id => guard.slots.clone(),
            _ => {
                let schedule = self.inner.schedule(&hall_id).ok_or(StoreError::NotFound(hall_id))?;
                let guard = schedule.read().await;
                guard.slots.clone()
            }
        };
        for event in &self.pending {
            if let Event::SessionScheduled(s) = event
                && s.hall_id == hall_id
            {
                let pos = slots.partition_point(|x| x.span.start <= s.starts_at);
                slots.insert(
                    pos,
                    Slot {
                        session_id: s.id,
                        span: s.span(),
                    },
                );
            }
        }
        Ok(slots)
    }

    async fn max_seat(&mut self, session_id: Ulid) -> Result<u32, StoreError> {
        let committed = self.with_ledger(session_id, |l| l.high_water).await?;
        let staged = self.staged_tickets(session_id).map(|t| t.seat).max().unwrap_or(0);
        Ok(committed.max(staged))
    }

    async fn seat_count(&mut self, session_id: Ulid) -> Result<u32, StoreError> {
        self.with_ledger(session_id, |l| l.seat_count).await
    }

    async fn insert_session(&mut self, session: Session) -> Result<(), StoreError> {
        self.lock_hall(session.hall_id).await?;
        let staged = self
            .pending
            .iter()
            .any(|e| matches!(e, Event::SessionScheduled(s) if s.id == session.id));
        if staged || self.inner.sessions.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists(session.id));
        }
        if let Some((_, hs)) = &self.hall
            && hs.slots.len() >= MAX_SESSIONS_PER_HALL
        {
            return Err(StoreError::LimitExceeded("too many sessions in hall"));
        }
        self.pending.push(Event::SessionScheduled(session));
        Ok(())
    }

    async fn insert_ticket(&mut self, ticket: Ticket) -> Result<(), StoreError> {
        self.lock_session(ticket.session_id).await?;
        let staged_id = self.pending.iter().any(|e| matches!(e, Event::TicketIssued(t) if t.id == ticket.id));
        if staged_id || self.inner.ticket_sessions.contains_key(&ticket.id) {
            return Err(StoreError::AlreadyExists(ticket.id));
        }
        // Unique (session_id, seat), the same guarantee a relational store
        // would give with a composite unique index.
        let committed_taken = self
            .with_ledger(ticket.session_id, |l| {
                l.tickets.binary_search_by_key(&ticket.seat, |t| t.seat).is_ok()
            })
            .await?;
        let staged_taken = self.staged_tickets(ticket.session_id).any(|t| t.seat == ticket.seat);
        if committed_taken || staged_taken {
            return Err(StoreError::SeatTaken {
                session_id: ticket.session_id,
                seat: ticket.seat,
            });
        }
        self.pending.push(Event::TicketIssued(ticket));
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        detached(self.apply_commit()).await
    }

    async fn rollback(self) -> Result<(), StoreError> {
        debug!(discarded = self.pending.len(), "transaction rolled back");
        Ok(())
    }
}
