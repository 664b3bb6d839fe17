use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000;
/// Far enough in the future that nothing reads as done during the run.
const BASE: i64 = 4_102_444_800_000; // 2100-01-01

async fn connect(host: &str, port: u16, user: Ulid, db: &str) -> Client {
    let password = std::env::var("SLOTWISE_PASSWORD").unwrap_or_else(|_| "slotwise".into());
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(db)
        .user(&user.to_string())
        .password(password);

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

/// Register a service and publish `n` hourly slots. Returns the slot ids.
async fn publish(client: &Client, provider: Ulid, n: usize) -> Vec<Ulid> {
    let sid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, provider_id) VALUES ('{sid}', '{provider}')"
        ))
        .await
        .unwrap();

    let slots: Vec<Ulid> = (0..n).map(|_| Ulid::new()).collect();
    for (chunk_idx, chunk) in slots.chunks(500).enumerate() {
        let values: Vec<String> = chunk
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let date = BASE + ((chunk_idx * 500 + i) as i64) * HOUR;
                format!("('{id}', '{sid}', {date})")
            })
            .collect();
        client
            .batch_execute(&format!(
                "INSERT INTO appointments (id, service_id, appointment_date) VALUES {}",
                values.join(", ")
            ))
            .await
            .unwrap();
    }
    slots
}

fn claim_sql(slot: Ulid) -> String {
    format!("UPDATE appointments SET status = 'scheduled' WHERE id = '{slot}'")
}

/// Every client claims every slot in the same order: one winner per slot,
/// everyone else collects a conflict.
async fn phase1_hot_slots(host: &str, port: u16) {
    let db = format!("bench_{}", Ulid::new());
    let provider = Ulid::new();
    let owner = connect(host, port, provider, &db).await;
    let n_slots = 200;
    let n_clients = 16;
    let slots = Arc::new(publish(&owner, provider, n_slots).await);

    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_clients {
        let host = host.to_string();
        let db = db.clone();
        let slots = slots.clone();
        let wins = wins.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, Ulid::new(), &db).await;
            let mut latencies = Vec::with_capacity(slots.len());
            for slot in slots.iter() {
                let t = Instant::now();
                match client.batch_execute(&claim_sql(*slot)).await {
                    Ok(()) => wins.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.code().map(|c| c.code()) == Some("40001") => {
                        conflicts.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) => panic!("unexpected claim error: {e}"),
                };
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in handles {
        latencies.extend(h.await.unwrap());
    }
    let elapsed = start.elapsed();

    let won = wins.load(Ordering::Relaxed);
    let lost = conflicts.load(Ordering::Relaxed);
    println!(
        "  {n_clients} clients x {n_slots} slots in {:.2}s: {won} claimed, {lost} conflicts",
        elapsed.as_secs_f64()
    );
    assert_eq!(won, n_slots, "every slot must have exactly one winner");
    print_latency("claim latency", &mut latencies);
}

/// Each client claims its own disjoint slots: pure write throughput.
async fn phase2_disjoint_claims(host: &str, port: u16) {
    let db = format!("bench_{}", Ulid::new());
    let provider = Ulid::new();
    let owner = connect(host, port, provider, &db).await;
    let n_clients = 10;
    let per_client = 200;
    let slots = publish(&owner, provider, n_clients * per_client).await;

    let start = Instant::now();
    let mut handles = Vec::new();
    for chunk in slots.chunks(per_client) {
        let host = host.to_string();
        let db = db.clone();
        let chunk = chunk.to_vec();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, Ulid::new(), &db).await;
            for slot in chunk {
                client.batch_execute(&claim_sql(slot)).await.unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_clients * per_client;
    println!(
        "  {total} claims in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
}

/// Partition reads for a user with a long history.
async fn phase3_my_appointments(host: &str, port: u16) {
    let db = format!("bench_{}", Ulid::new());
    let provider = Ulid::new();
    let owner = connect(host, port, provider, &db).await;
    let user = Ulid::new();
    let client = connect(host, port, user, &db).await;

    let slots = publish(&owner, provider, 1000).await;
    for slot in &slots {
        client.batch_execute(&claim_sql(*slot)).await.unwrap();
    }

    let now = BASE + 500 * HOUR;
    let n = 500;
    let mut latencies = Vec::with_capacity(n);
    for i in 0..n {
        let bucket = if i % 2 == 0 { "upcoming" } else { "past" };
        let t = Instant::now();
        client
            .simple_query(&format!(
                "SELECT * FROM my_appointments WHERE now = {now} AND bucket = '{bucket}' LIMIT 20"
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    print_latency("my_appointments latency (1000 rows, page of 20)", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTWISE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTWISE_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTWISE_PORT");

    println!("=== slotwise claim contention benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant (unique dbname)

    println!("[phase 1] contended claims on hot slots");
    phase1_hot_slots(&host, port).await;

    println!("\n[phase 2] disjoint claim throughput");
    phase2_disjoint_claims(&host, port).await;

    println!("\n[phase 3] my_appointments read latency");
    phase3_my_appointments(&host, port).await;

    println!("\n=== benchmark complete ===");
}
