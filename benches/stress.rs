use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
/// 2026-01-01T00:00:00Z
const DAY: i64 = 1_767_225_600_000;

async fn connect(host: &str, port: u16, user: &str) -> Client {
    let password = std::env::var("CINESEAT_PASSWORD").unwrap_or_else(|_| "cineseat".into());
    let mut config = Config::new();
    config.host(host).port(port).dbname("cineseat").user(user).password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

/// A hall of `seats` with one movie, ready for sessions.
async fn setup_hall(client: &Client, seats: u32) -> (Ulid, Ulid) {
    let hall = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO halls (id, vip, seats) VALUES ('{hall}', false, {seats})"))
        .await
        .unwrap();
    let movie = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO movies (id, name, duration) VALUES ('{movie}', 'Bench', 60)"))
        .await
        .unwrap();
    (hall, movie)
}

async fn create_session(client: &Client, hall: Ulid, movie: Ulid, starts_at: i64) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO sessions (id, hall_id, movie_id, starts_at) VALUES ('{id}', '{hall}', '{movie}', {starts_at})"
        ))
        .await?;
    Ok(id)
}

async fn buy(client: &Client, session: Ulid, user: Ulid) -> Result<(), tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO tickets (id, session_id, user_id, price) VALUES ('{id}', '{session}', '{user}', 1000)"
        ))
        .await
}

async fn phase1_sequential(host: &str, port: u16) {
    let user = Ulid::new();
    let client = connect(host, port, &user.to_string()).await;
    let n = 2000;
    let (hall, movie) = setup_hall(&client, n as u32).await;
    let session = create_session(&client, hall, movie, DAY).await.unwrap();

    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for _ in 0..n {
        let t = Instant::now();
        buy(&client, session, user).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} tickets in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("purchase latency", &mut latencies);
}

/// Many buyers race for one session; exactly `seats` must win.
async fn phase2_contended(host: &str, port: u16) {
    let seats = 500u32;
    let n_tasks = 50;
    let n_per_task = 20;

    let admin = connect(host, port, "admin").await;
    let (hall, movie) = setup_hall(&admin, seats).await;
    let session = create_session(&admin, hall, movie, DAY).await.unwrap();

    let sold = Arc::new(AtomicUsize::new(0));
    let refused = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        let sold = sold.clone();
        let refused = refused.clone();
        handles.push(tokio::spawn(async move {
            let user = Ulid::new();
            let client = connect(&host, port, &user.to_string()).await;
            for _ in 0..n_per_task {
                match buy(&client, session, user).await {
                    Ok(()) => sold.fetch_add(1, Ordering::Relaxed),
                    Err(_) => refused.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let sold = sold.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} buyers x {n_per_task} attempts = {total} total in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    println!("  sold={sold} refused={} seats={seats}", refused.load(Ordering::Relaxed));
    assert_eq!(sold, seats as usize, "oversold or undersold");
}

/// Independent sessions in separate halls don't serialize on each other.
async fn phase3_parallel_sessions(host: &str, port: u16) {
    let n_halls = 10;
    let n_per_hall = 200;

    let admin = connect(host, port, "admin").await;
    let mut sessions = Vec::new();
    for _ in 0..n_halls {
        let (hall, movie) = setup_hall(&admin, n_per_hall).await;
        sessions.push(create_session(&admin, hall, movie, DAY).await.unwrap());
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for session in sessions {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let user = Ulid::new();
            let client = connect(&host, port, &user.to_string()).await;
            for _ in 0..n_per_hall {
                buy(&client, session, user).await.unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_halls * n_per_hall as usize;
    println!(
        "  {n_halls} sessions x {n_per_hall} tickets = {total} total in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
}

/// Hall scheduling: back-to-back sessions plus deliberate overlaps.
async fn phase4_scheduling(host: &str, port: u16) {
    let client = connect(host, port, "admin").await;
    let (hall, movie) = setup_hall(&client, 10).await;

    let n = 1000;
    let mut latencies = Vec::with_capacity(n);
    let mut rejected = 0;
    for i in 0..n as i64 {
        // Odd slots start half an hour into the previous showing.
        let starts_at = DAY + (i / 2) * HOUR + (i % 2) * HOUR / 2;
        let t = Instant::now();
        if create_session(&client, hall, movie, starts_at).await.is_err() {
            rejected += 1;
        }
        latencies.push(t.elapsed());
    }
    println!("  {n} session requests, {rejected} rejected as overlapping");
    print_latency("schedule latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("CINESEAT_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("CINESEAT_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid CINESEAT_PORT");

    println!("=== cineseat stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential purchase throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended purchases on one session");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] purchases across independent sessions");
    phase3_parallel_sessions(&host, port).await;

    println!("\n[phase 4] scheduling with overlaps");
    phase4_scheduling(&host, port).await;

    println!("\n=== benchmark complete ===");
}
