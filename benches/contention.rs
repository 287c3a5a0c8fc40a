use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("slotbook")
        .user("slotbook")
        .password(std::env::var("SLOTBOOK_PASSWORD").unwrap_or_else(|_| "slotbook".into()));

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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn insert_sql(court: &str, day: u32, slot: u32, owner: &str) -> String {
    format!(
        "INSERT INTO reservations (resource_id, date, time_slot, owner_id) VALUES ('{court}', '2030-01-{:02}', '{:02}:00', '{owner}')",
        day % 28 + 1,
        slot % 24
    )
}

fn is_conflict(e: &tokio_postgres::Error) -> bool {
    e.code().map(|c| c.code()) == Some("23505")
}

/// One client booking distinct slots back to back.
async fn phase1_sequential(host: &str, port: u16, run: &str) {
    let client = connect(host, port).await;
    let n = 500;
    let court = format!("{run}-seq");
    let mut latencies = Vec::with_capacity(n);

    let start = Instant::now();
    for i in 0..n as u32 {
        let t = Instant::now();
        client
            .simple_query(&insert_sql(&court, i / 24, i, "bench"))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    println!(
        "  {n} creates in {:.2}s ({:.0} ops/s)",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("create", &mut latencies);
}

/// Many clients race for the same slots; every slot must end up with one winner.
async fn phase2_hot_slots(host: &str, port: u16, run: &str) {
    let racers = 32;
    let slots = 50u32;
    let court = format!("{run}-hot");
    let won = Arc::new(AtomicUsize::new(0));
    let conflicted = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for r in 0..racers {
        let host = host.to_string();
        let court = court.clone();
        let won = won.clone();
        let conflicted = conflicted.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for slot in 0..slots {
                match client.simple_query(&insert_sql(&court, 0, slot, &format!("racer{r}"))).await {
                    Ok(_) => won.fetch_add(1, Ordering::Relaxed),
                    Err(e) if is_conflict(&e) => conflicted.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let conflicted = conflicted.load(Ordering::Relaxed);
    println!(
        "  {racers} racers x {slots} slots: {won} won, {conflicted} conflicted in {:.2}s",
        elapsed.as_secs_f64()
    );
    if won == slots as usize {
        println!("  OK: exactly one winner per slot");
    } else {
        println!("  FAIL: expected {slots} winners, got {won}");
    }
}

/// List latency while writers keep booking.
async fn phase3_list_under_load(host: &str, port: u16, run: &str) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..4u32 {
        let host = host.to_string();
        let court = format!("{run}-load-{w}");
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut i = 0u32;
            while !stop.load(Ordering::Relaxed) && i < 24 * 28 {
                let _ = client.simple_query(&insert_sql(&court, i / 24, i, "writer")).await;
                i += 1;
            }
        }));
    }

    let client = connect(host, port).await;
    let mut latencies = Vec::new();
    let query = format!("SELECT * FROM reservations WHERE resource_id = '{run}-load-0'");
    for _ in 0..200 {
        let t = Instant::now();
        client.simple_query(&query).await.unwrap();
        latencies.push(t.elapsed());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }
    print_latency("list by court", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTBOOK_PORT");

    // Courts are namespaced per run so repeated runs against one server don't collide.
    let run = format!("bench-{}", Ulid::new());

    println!("=== slotbook contention benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential create throughput");
    phase1_sequential(&host, port, &run).await;

    println!("\n[phase 2] hot-slot contention");
    phase2_hot_slots(&host, port, &run).await;

    println!("\n[phase 3] list latency under write load");
    phase3_list_under_load(&host, port, &run).await;

    println!("\n=== benchmark complete ===");
}
