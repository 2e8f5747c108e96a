use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const DAYS: u32 = 30;
const SLOT_MINUTES: u32 = 15;

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("duet")
        .user("duet")
        .password("duet");

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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn date(day: u32) -> String {
    format!("2024-07-{:02}", day + 1)
}

fn clock(slot: u32) -> String {
    let minutes = slot * SLOT_MINUTES;
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Register someone free 00:00-23:45 UTC on every benchmark date.
async fn free_person(client: &tokio_postgres::Client) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO people (id, email) VALUES ('{id}', '{id}@bench.invalid')"
        ))
        .await
        .unwrap();
    let values: Vec<String> = (0..DAYS)
        .map(|d| format!("('{id}', '{}', '00:00', '23:45', 'UTC')", date(d)))
        .collect();
    client
        .simple_query(&format!(
            r#"INSERT INTO availability (person_id, date, start, "end", tz) VALUES {}"#,
            values.join(", ")
        ))
        .await
        .unwrap();
    id
}

async fn book(
    client: &tokio_postgres::Client,
    host_id: Ulid,
    attendee_id: Ulid,
    day: u32,
    slot: u32,
) -> Result<(), tokio_postgres::Error> {
    let id = Ulid::new();
    let d = date(day);
    client
        .simple_query(&format!(
            r#"INSERT INTO appointments (id, host_id, attendee_id, start, "end", tz)
               VALUES ('{id}', '{host_id}', '{attendee_id}', '{d} {}', '{d} {}', 'UTC')"#,
            clock(slot),
            clock(slot + 1)
        ))
        .await
        .map(|_| ())
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let a = free_person(&client).await;
    let b = free_person(&client).await;

    let slots_per_day = 23 * 60 / SLOT_MINUTES;
    let n = 2000;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        book(&client, a, b, i / slots_per_day, i % slots_per_day).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients race for the same slots of one pair. Every slot must be won
/// exactly once; the rest see an exclusion violation.
async fn phase2_contention(host: &str, port: u16) {
    let n_tasks = 20;
    let n_slots = 48;

    let setup = connect(host, port).await;
    let a = free_person(&setup).await;
    let b = free_person(&setup).await;

    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let host = host.to_string();
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for slot in 0..n_slots {
                let (h, att) = if t % 2 == 0 { (a, b) } else { (b, a) };
                match book(&client, h, att, 0, slot).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(_) => lost.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let lost = lost.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_slots} slots in {:.2}s: {won} booked, {lost} rejected",
        elapsed.as_secs_f64()
    );
    assert_eq!(won, n_slots as usize, "each slot must be booked exactly once");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let setup = connect(host, port).await;
    let a = free_person(&setup).await;
    let b = free_person(&setup).await;

    let writer_host = host.to_string();
    let writer = tokio::spawn(async move {
        let client = connect(&writer_host, port).await;
        for i in 0..1000 {
            let _ = book(&client, a, b, 1 + i / 90, i % 90).await;
        }
    });

    let reader = connect(host, port).await;
    let mut latencies = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && !writer.is_finished() {
        let t = Instant::now();
        reader
            .simple_query(&format!(
                "SELECT * FROM availability WHERE person_id = '{a}' AND date >= '{}' AND date <= '{}' AND tz = 'America/New_York'",
                date(0),
                date(DAYS - 1)
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    writer.await.unwrap();
    print_latency("read latency (30-day availability)", &mut latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let a = free_person(&client).await;
            let b = free_person(&client).await;
            for i in 0..ops_per_conn {
                book(&client, a, b, 0, i).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("DUET_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("DUET_PORT")
        .unwrap_or_else(|_| "5434".into())
        .parse()
        .expect("invalid DUET_PORT");

    println!("=== duet stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended booking");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] read latency under booking load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
