use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use metrics::{counter, histogram};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, METADATA_USER, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::auth::CineseatAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind, TicketRequest};
use crate::model::*;
use crate::observability::{AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError, Table};
use crate::store::MemoryStore;

pub type SharedEngine = Arc<Engine<MemoryStore>>;

pub struct CineseatHandler {
    engine: SharedEngine,
    query_parser: Arc<CineseatQueryParser>,
}

impl CineseatHandler {
    pub fn new(engine: SharedEngine) -> Self {
        Self {
            engine,
            query_parser: Arc::new(CineseatQueryParser),
        }
    }

    /// Run one statement for `login` and record RED metrics for it.
    async fn run(&self, login: Option<&str>, query: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        debug!(command = label, "executing");

        let started = Instant::now();
        let result = self.execute_command(login, cmd, format).await;
        histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, login: Option<&str>, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertHall {
                id,
                is_vip,
                seat_count,
                returning,
            } => {
                let hall = engine.create_hall(id, is_vip, seat_count).await.map_err(engine_err)?;
                Ok(inserted(returning, schema(Table::Halls, format), |e| encode_hall(e, &hall)))
            }
            Command::InsertMovie {
                id,
                name,
                duration_minutes,
                returning,
            } => {
                let movie = engine
                    .create_movie(id, &name, duration_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(returning, schema(Table::Movies, format), |e| encode_movie(e, &movie)))
            }
            Command::InsertSession {
                id,
                hall_id,
                movie_id,
                starts_at,
                returning,
            } => {
                let session = engine
                    .create_session(id, hall_id, movie_id, starts_at)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(returning, schema(Table::Sessions, format), |e| encode_session(e, &session)))
            }
            Command::InsertTicket {
                id,
                session_id,
                user_id,
                price,
                returning,
            } => {
                let authenticated = authenticated_user(login)?;
                let request = TicketRequest {
                    id,
                    session_id,
                    user_id,
                    price,
                };
                let receipt = engine
                    .create_ticket(request, authenticated)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(returning, schema(Table::Tickets, format), |e| encode_ticket(e, &receipt)))
            }
            Command::DeleteHall { id } => {
                engine.delete_hall(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::DeleteMovie { id } => {
                engine.delete_movie(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::DeleteSession { id } => {
                engine.delete_session(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::DeleteTicket { id } => {
                engine.delete_ticket(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectHalls { id } => {
                let halls = match id {
                    Some(id) => optional(engine.hall(id).await)?,
                    None => engine.list_halls().await.map_err(engine_err)?,
                };
                rows(schema(Table::Halls, format), &halls, encode_hall)
            }
            Command::SelectMovies { id } => {
                let movies = match id {
                    Some(id) => optional(engine.movie(id).await)?,
                    None => engine.list_movies().await.map_err(engine_err)?,
                };
                rows(schema(Table::Movies, format), &movies, encode_movie)
            }
            Command::SelectSessions { id, hall_id } => {
                let mut sessions = match hall_id {
                    Some(hall_id) => engine.sessions_in_hall(hall_id).await.map_err(engine_err)?,
                    None => engine.list_sessions().await.map_err(engine_err)?,
                };
                if let Some(id) = id {
                    sessions.retain(|s| s.id == id);
                }
                rows(schema(Table::Sessions, format), &sessions, encode_session)
            }
            Command::SelectTickets { id, session_id } => {
                let mut receipts = match (id, session_id) {
                    (_, Some(session_id)) => engine.tickets_for_session(session_id).await.map_err(engine_err)?,
                    (Some(id), None) => optional(engine.ticket(id).await)?,
                    (None, None) => engine.list_tickets().await.map_err(engine_err)?,
                };
                if let Some(id) = id {
                    receipts.retain(|r| r.ticket.id == id);
                }
                rows(schema(Table::Tickets, format), &receipts, encode_ticket)
            }
        }
    }
}

/// The login name is the caller's user id.
fn authenticated_user(login: Option<&str>) -> PgWireResult<Ulid> {
    login.and_then(|u| Ulid::from_string(u).ok()).ok_or_else(|| {
        counter!(AUTH_FAILURES_TOTAL).increment(1);
        warn!(login = login.unwrap_or("<none>"), "login name is not a user id");
        user_error("28000", "login user name must be a user id (ULID) to buy tickets".into())
    })
}

/// A lookup by id turned into zero or one rows.
fn optional<T>(result: Result<T, EngineError>) -> PgWireResult<Vec<T>> {
    match result {
        Ok(row) => Ok(vec![row]),
        Err(EngineError::NotFound(_)) => Ok(vec![]),
        Err(e) => Err(engine_err(e)),
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn columns(table: Table) -> Vec<(&'static str, Type)> {
    match table {
        Table::Halls => vec![("id", Type::VARCHAR), ("vip", Type::BOOL), ("seats", Type::INT8)],
        Table::Movies => vec![("id", Type::VARCHAR), ("name", Type::VARCHAR), ("duration", Type::INT8)],
        Table::Sessions => vec![
            ("id", Type::VARCHAR),
            ("hall_id", Type::VARCHAR),
            ("movie_id", Type::VARCHAR),
            ("starts_at", Type::INT8),
            ("ends_at", Type::INT8),
        ],
        Table::Tickets => vec![
            ("id", Type::VARCHAR),
            ("session_id", Type::VARCHAR),
            ("user_id", Type::VARCHAR),
            ("seat", Type::INT8),
            ("price", Type::INT8),
            ("hall_id", Type::VARCHAR),
            ("movie_name", Type::VARCHAR),
            ("starts_at", Type::INT8),
        ],
    }
}

/// Row description for `table`, each column in the format the client asked for.
fn schema(table: Table, format: &Format) -> Vec<FieldInfo> {
    columns(table)
        .into_iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new(name.into(), None, None, ty, format.format_for(i)))
        .collect()
}

fn encode_hall(e: &mut DataRowEncoder, hall: &Hall) -> PgWireResult<()> {
    e.encode_field(&hall.id.to_string())?;
    e.encode_field(&hall.is_vip)?;
    e.encode_field(&i64::from(hall.seat_count))
}

fn encode_movie(e: &mut DataRowEncoder, movie: &Movie) -> PgWireResult<()> {
    e.encode_field(&movie.id.to_string())?;
    e.encode_field(&movie.name)?;
    e.encode_field(&i64::from(movie.duration_minutes))
}

fn encode_session(e: &mut DataRowEncoder, session: &Session) -> PgWireResult<()> {
    e.encode_field(&session.id.to_string())?;
    e.encode_field(&session.hall_id.to_string())?;
    e.encode_field(&session.movie_id.to_string())?;
    e.encode_field(&session.starts_at)?;
    e.encode_field(&session.ends_at)
}

fn encode_ticket(e: &mut DataRowEncoder, receipt: &TicketReceipt) -> PgWireResult<()> {
    let t = &receipt.ticket;
    e.encode_field(&t.id.to_string())?;
    e.encode_field(&t.session_id.to_string())?;
    e.encode_field(&t.user_id.to_string())?;
    e.encode_field(&i64::from(t.seat))?;
    let price = i64::try_from(t.price)
        .map_err(|_| user_error("22003", format!("price {} out of range", t.price)))?;
    e.encode_field(&price)?;
    e.encode_field(&receipt.hall_id.to_string())?;
    e.encode_field(&receipt.movie_name)?;
    e.encode_field(&receipt.starts_at)
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn inserted(
    returning: bool,
    schema: Vec<FieldInfo>,
    encode: impl Fn(&mut DataRowEncoder) -> PgWireResult<()>,
) -> Response {
    if !returning {
        return Response::Execution(Tag::new("INSERT").with_rows(1));
    }
    let schema = Arc::new(schema);
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encode(&mut encoder).map(|()| encoder.take_row());
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn client_login<C: ClientInfo>(client: &C) -> Option<String> {
    client.metadata().get(METADATA_USER).cloned()
}

#[async_trait]
impl SimpleQueryHandler for CineseatHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let login = client_login(client);
        Ok(vec![self.run(login.as_deref(), query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CineseatQueryParser;

#[async_trait]
impl QueryParser for CineseatQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    sql::result_table(sql)
        .map(|table| schema(table, format))
        .unwrap_or_default()
}

#[async_trait]
impl ExtendedQueryHandler for CineseatHandler {
    type Statement = String;
    type QueryParser = CineseatQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let login = client_login(client);
        let sql = substitute_params(portal);
        self.run(login.as_deref(), &sql, &portal.result_column_format).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement, &Format::UnifiedText),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute_text_params(&portal.statement.statement, &params)
}

fn substitute_text_params(sql: &str, params: &[Option<String>]) -> String {
    // One left-to-right pass; substituted text is never rescanned.
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(text)) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    result.push_str(rest);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CineseatFactory {
    handler: Arc<CineseatHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<CineseatAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CineseatFactory {
    pub fn new(engine: SharedEngine, password: String) -> Self {
        let auth_source = CineseatAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CineseatHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CineseatFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: SharedEngine,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(CineseatFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::ScheduleConflict { .. } => "23P01",
        EngineError::NotOwner { .. } => "42501",
        EngineError::NotFound(_) => "02000",
        _ => match e.kind() {
            ErrorKind::Validation => "22023",
            ErrorKind::CapacityExhausted => "53400",
            ErrorKind::Internal => "XX000",
        },
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.kind() == ErrorKind::Internal {
        error!("internal failure: {e:?}");
    }
    user_error(sqlstate(&e), e.public_message())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
