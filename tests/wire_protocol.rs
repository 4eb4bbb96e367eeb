use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use cineseat::engine::Engine;
use cineseat::store::MemoryStore;
use cineseat::wire;

const PASSWORD: &str = "cineseat";
const HOUR: i64 = 3_600_000;
/// 2026-01-01T00:00:00Z
const DAY: i64 = 1_767_225_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("cineseat_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = MemoryStore::open(dir.join("cineseat.wal")).unwrap();
    let engine = Arc::new(Engine::new(store, Duration::from_secs(5)));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect_as(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("cineseat")
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn connect(addr: SocketAddr) -> Client {
    connect_as(addr, "admin").await
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// SQLSTATE of a failed statement.
async fn error_code(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

async fn create_hall(client: &Client, seats: u32) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO halls (id, vip, seats) VALUES ('{id}', false, {seats})"))
        .await
        .unwrap();
    id
}

async fn create_movie(client: &Client, name: &str, minutes: u32) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO movies (id, name, duration) VALUES ('{id}', '{name}', {minutes})"
        ))
        .await
        .unwrap();
    id
}

fn session_sql(id: Ulid, hall: Ulid, movie: Ulid, starts_at: i64) -> String {
    format!("INSERT INTO sessions (id, hall_id, movie_id, starts_at) VALUES ('{id}', '{hall}', '{movie}', {starts_at})")
}

async fn create_session(client: &Client, hall: Ulid, movie: Ulid, starts_at: i64) -> Ulid {
    let id = Ulid::new();
    client.batch_execute(&session_sql(id, hall, movie, starts_at)).await.unwrap();
    id
}

fn ticket_sql(id: Ulid, session: Ulid, user: Ulid, price: u64) -> String {
    format!(
        "INSERT INTO tickets (id, session_id, user_id, price) VALUES ('{id}', '{session}', '{user}', {price}) RETURNING *"
    )
}

// ── Catalog ──────────────────────────────────────────────────

#[tokio::test]
async fn catalog_crud() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let hall = create_hall(&client, 40).await;
    let movie = create_movie(&client, "Stalker", 161).await;

    let halls = rows(&client, "SELECT * FROM halls").await;
    assert_eq!(halls.len(), 1);
    assert_eq!(halls[0].get("id"), Some(hall.to_string().as_str()));
    assert_eq!(halls[0].get("seats"), Some("40"));

    let movies = rows(&client, &format!("SELECT * FROM movies WHERE id = '{movie}'")).await;
    assert_eq!(movies.len(), 1);
    assert_eq!(movies[0].get("name"), Some("Stalker"));
    assert_eq!(movies[0].get("duration"), Some("161"));

    client
        .batch_execute(&format!("DELETE FROM movies WHERE id = '{movie}'"))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM movies").await.is_empty());
    assert!(rows(&client, &format!("SELECT * FROM movies WHERE id = '{movie}'")).await.is_empty());
}

#[tokio::test]
async fn invalid_movie_is_rejected() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let too_short = format!("INSERT INTO movies (id, name, duration) VALUES ('{}', 'Short', 10)", Ulid::new());
    assert_eq!(error_code(&client, &too_short).await, "22023");

    let blank = format!("INSERT INTO movies (id, name, duration) VALUES ('{}', '   ', 90)", Ulid::new());
    assert_eq!(error_code(&client, &blank).await, "22023");
}

#[tokio::test]
async fn referenced_hall_cannot_be_deleted() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let hall = create_hall(&client, 10).await;
    let movie = create_movie(&client, "Solaris", 90).await;
    let session = create_session(&client, hall, movie, DAY + 13 * HOUR).await;

    assert_eq!(error_code(&client, &format!("DELETE FROM halls WHERE id = '{hall}'")).await, "22023");

    client
        .batch_execute(&format!("DELETE FROM sessions WHERE id = '{session}'"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("DELETE FROM halls WHERE id = '{hall}'"))
        .await
        .unwrap();
}

#[tokio::test]
async fn unknown_statement_is_syntax_error() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    assert_eq!(error_code(&client, "SELEKT nonsense").await, "42601");
    assert_eq!(error_code(&client, "SELECT * FROM popcorn").await, "42601");
}

// ── Scheduling ───────────────────────────────────────────────

#[tokio::test]
async fn overlapping_session_is_rejected() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let hall = create_hall(&client, 2).await;
    let movie = create_movie(&client, "Mirror", 90).await;
    create_session(&client, hall, movie, DAY + 13 * HOUR).await;

    // 13:00-14:30 is taken; 14:00 overlaps, 14:30 starts exactly at the end.
    let overlapping = session_sql(Ulid::new(), hall, movie, DAY + 14 * HOUR);
    let err = client.simple_query(&overlapping).await.unwrap_err();
    let db = err.as_db_error().unwrap();
    assert_eq!(db.code().code(), "23P01");
    assert_eq!(db.message(), "this time is already in use");

    create_session(&client, hall, movie, DAY + 14 * HOUR + HOUR / 2).await;

    // A different hall has its own schedule.
    let other_hall = create_hall(&client, 2).await;
    create_session(&client, other_hall, movie, DAY + 14 * HOUR).await;

    let sessions = rows(&client, &format!("SELECT * FROM sessions WHERE hall_id = '{hall}'")).await;
    assert_eq!(sessions.len(), 2);
}

#[tokio::test]
async fn session_for_unknown_movie_is_not_found() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let hall = create_hall(&client, 2).await;
    let sql = session_sql(Ulid::new(), hall, Ulid::new(), DAY);
    assert_eq!(error_code(&client, &sql).await, "02000");
}

// ── Tickets ──────────────────────────────────────────────────

#[tokio::test]
async fn buy_ticket_returns_receipt() {
    let addr = start_test_server().await;
    let admin = connect(addr).await;
    let hall = create_hall(&admin, 3).await;
    let movie = create_movie(&admin, "Nostalghia", 125).await;
    let starts_at = DAY + 19 * HOUR;
    let session = create_session(&admin, hall, movie, starts_at).await;

    let user = Ulid::new();
    let buyer = connect_as(addr, &user.to_string()).await;

    let first = rows(&buyer, &ticket_sql(Ulid::new(), session, user, 1250)).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].get("seat"), Some("1"));
    assert_eq!(first[0].get("price"), Some("1250"));
    assert_eq!(first[0].get("hall_id"), Some(hall.to_string().as_str()));
    assert_eq!(first[0].get("movie_name"), Some("Nostalghia"));
    assert_eq!(first[0].get("starts_at"), Some(starts_at.to_string().as_str()));

    let second = rows(&buyer, &ticket_sql(Ulid::new(), session, user, 1250)).await;
    assert_eq!(second[0].get("seat"), Some("2"));

    let listed = rows(&admin, &format!("SELECT * FROM tickets WHERE session_id = '{session}'")).await;
    assert_eq!(listed.len(), 2);

    let all = rows(&admin, "SELECT * FROM tickets").await;
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn ticket_for_another_user_is_refused() {
    let addr = start_test_server().await;
    let admin = connect(addr).await;
    let hall = create_hall(&admin, 3).await;
    let movie = create_movie(&admin, "Ivanovo Detstvo", 95).await;
    let session = create_session(&admin, hall, movie, DAY).await;

    let user = Ulid::new();
    let buyer = connect_as(addr, &user.to_string()).await;
    let sql = ticket_sql(Ulid::new(), session, Ulid::new(), 900);
    assert_eq!(error_code(&buyer, &sql).await, "42501");

    // A login that is not a user id can't buy at all.
    let sql = ticket_sql(Ulid::new(), session, user, 900);
    assert_eq!(error_code(&admin, &sql).await, "28000");

    assert!(
        rows(&admin, &format!("SELECT * FROM tickets WHERE session_id = '{session}'"))
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn sold_out_session_reports_capacity() {
    let addr = start_test_server().await;
    let admin = connect(addr).await;
    let hall = create_hall(&admin, 2).await;
    let movie = create_movie(&admin, "Andrei Rublev", 205).await;
    let session = create_session(&admin, hall, movie, DAY).await;

    let user = Ulid::new();
    let buyer = connect_as(addr, &user.to_string()).await;
    for _ in 0..2 {
        rows(&buyer, &ticket_sql(Ulid::new(), session, user, 700)).await;
    }
    assert_eq!(error_code(&buyer, &ticket_sql(Ulid::new(), session, user, 700)).await, "53400");

    // Refunding a ticket does not hand its seat back out.
    let listed = rows(&admin, &format!("SELECT * FROM tickets WHERE session_id = '{session}'")).await;
    let refunded = listed[0].get("id").unwrap().to_string();
    admin
        .batch_execute(&format!("DELETE FROM tickets WHERE id = '{refunded}'"))
        .await
        .unwrap();
    assert_eq!(error_code(&buyer, &ticket_sql(Ulid::new(), session, user, 700)).await, "53400");
}

#[tokio::test]
async fn concurrent_buyers_never_share_a_seat() {
    let addr = start_test_server().await;
    let admin = connect(addr).await;
    let hall = create_hall(&admin, 20).await;
    let movie = create_movie(&admin, "The Sacrifice", 149).await;
    let session = create_session(&admin, hall, movie, DAY).await;

    let mut handles = Vec::new();
    for _ in 0..25 {
        handles.push(tokio::spawn(async move {
            let user = Ulid::new();
            let client = connect_as(addr, &user.to_string()).await;
            client.simple_query(&ticket_sql(Ulid::new(), session, user, 500)).await.is_ok()
        }));
    }
    let mut sold = 0;
    for h in handles {
        if h.await.unwrap() {
            sold += 1;
        }
    }
    assert_eq!(sold, 20);

    let listed = rows(&admin, &format!("SELECT * FROM tickets WHERE session_id = '{session}'")).await;
    let mut seats: Vec<u32> = listed.iter().map(|r| r.get("seat").unwrap().parse().unwrap()).collect();
    seats.sort_unstable();
    assert_eq!(seats, (1..=20).collect::<Vec<_>>());
}

// ── Extended query protocol ──────────────────────────────────

#[tokio::test]
async fn extended_protocol_with_parameters() {
    let addr = start_test_server().await;
    let admin = connect(addr).await;
    let hall = create_hall(&admin, 5).await;
    let movie = create_movie(&admin, "Zerkalo", 108).await;
    let session = create_session(&admin, hall, movie, DAY).await;

    let user = Ulid::new();
    let buyer = connect_as(addr, &user.to_string()).await;
    let ticket = Ulid::new().to_string();
    let row = buyer
        .query_one(
            "INSERT INTO tickets (id, session_id, user_id, price) VALUES ($1, $2, $3, $4) RETURNING *",
            &[&ticket, &session.to_string(), &user.to_string(), &"1500"],
        )
        .await
        .unwrap();
    assert_eq!(row.get::<_, String>("id"), ticket);
    assert_eq!(row.get::<_, i64>("seat"), 1);
    assert_eq!(row.get::<_, i64>("price"), 1500);
    assert_eq!(row.get::<_, String>("movie_name"), "Zerkalo");

    let listed = admin
        .query("SELECT * FROM tickets WHERE session_id = $1", &[&session.to_string()])
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get::<_, String>("user_id"), user.to_string());

    let halls = admin.query("SELECT * FROM halls WHERE id = $1", &[&hall.to_string()]).await.unwrap();
    assert_eq!(halls.len(), 1);
    assert!(!halls[0].get::<_, bool>("vip"));
    assert_eq!(halls[0].get::<_, i64>("seats"), 5);
}
