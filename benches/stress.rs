use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

async fn connect(host: &str, port: u16, user: &str) -> tokio_postgres::Client {
    let password = std::env::var("GEARBOOK_PASSWORD").unwrap_or_else(|_| "gearbook".into());
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("gearbook")
        .user(user)
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

fn day(offset: i64) -> NaiveDate {
    Utc::now().date_naive() + chrono::Duration::days(offset)
}

fn booking_sql(item_id: Ulid, start: NaiveDate, end: NaiveDate) -> String {
    format!(
        "INSERT INTO bookings (item_id, start_date, end_date, total_price) \
         VALUES ('{item_id}', '{start}', '{end}', '0.00')"
    )
}

/// List a fresh item owned by `owner`. Stays can be up to a year long.
async fn new_item(client: &tokio_postgres::Client, owner: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO items (id, owner_id, name, price_per_day, max_rental_days) \
             VALUES ('{id}', '{owner}', 'bench item', '25.00', 365)"
        ))
        .await
        .unwrap();
    id
}

async fn setup(host: &str, port: u16) -> String {
    let owner = format!("bench_owner_{}", Ulid::new());
    let client = connect(host, port, &owner).await;
    client
        .batch_execute("INSERT INTO users (name) VALUES ('Bench Owner')")
        .await
        .unwrap();
    println!("  registered owner {owner}");
    owner
}

async fn phase1_sequential(host: &str, port: u16, owner: &str) {
    let client = connect(host, port, "bench_renter").await;
    let item = new_item(&client, owner).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n as i64 {
        let t = Instant::now();
        client
            .batch_execute(&booking_sql(item, day(1 + i), day(2 + i)))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many renters race for the same few ranges. Exactly one booking per range
/// may win; everyone else must see Overlap or Conflict.
async fn phase2_contention(host: &str, port: u16, owner: &str) {
    let setup_client = connect(host, port, "bench_renter").await;
    let item = new_item(&setup_client, owner).await;

    let n_tasks = 20;
    let n_ranges = 50i64;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let host = host.to_string();
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &format!("bench_renter_{t}")).await;
            for r in 0..n_ranges {
                let s = day(1 + r * 3);
                match client.batch_execute(&booking_sql(item, s, day(3 + r * 3))).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(e) => {
                        let code = e.as_db_error().map(|db| db.code().code().to_string());
                        assert!(
                            matches!(code.as_deref(), Some("23P01") | Some("40001")),
                            "unexpected error: {e}"
                        );
                        lost.fetch_add(1, Ordering::Relaxed)
                    }
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks as i64 * n_ranges;
    println!(
        "  {n_tasks} tasks x {n_ranges} ranges = {total} attempts in {:.2}s: {} booked, {} rejected",
        elapsed.as_secs_f64(),
        won.load(Ordering::Relaxed),
        lost.load(Ordering::Relaxed),
    );
    assert_eq!(won.load(Ordering::Relaxed), n_ranges as usize, "double booking detected");

    let messages = setup_client
        .simple_query(&format!(
            "SELECT * FROM bookings WHERE item_id = '{item}' AND status <> 'cancelled'"
        ))
        .await
        .unwrap();
    let rows = messages
        .iter()
        .filter(|m| matches!(m, SimpleQueryMessage::Row(_)))
        .count();
    assert_eq!(rows, n_ranges as usize);
}

async fn phase3_read_under_load(host: &str, port: u16, owner: &str) {
    let setup_client = connect(host, port, "bench_renter").await;
    let read_item = new_item(&setup_client, owner).await;
    for i in 0..200 {
        setup_client
            .batch_execute(&booking_sql(read_item, day(1 + i * 2), day(2 + i * 2)))
            .await
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let owner = owner.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &format!("bench_writer_{w}")).await;
            let item = new_item(&client, &owner).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) && i < 20_000 {
                let _ = client
                    .batch_execute(&booking_sql(item, day(1 + i), day(2 + i)))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &format!("bench_reader_{r}")).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader as i64 {
                let sql = if i % 2 == 0 {
                    format!(
                        "SELECT * FROM disabled_dates WHERE item_id = '{read_item}' \
                         AND calendar_day >= '{}' AND calendar_day < '{}'",
                        day(0),
                        day(90)
                    )
                } else {
                    format!(
                        "SELECT * FROM quote WHERE item_id = '{read_item}' \
                         AND start_date = '{}' AND end_date = '{}'",
                        day(2 + i % 300),
                        day(4 + i % 300)
                    )
                };
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16, owner: &str) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let host = host.to_string();
        let owner = owner.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &format!("bench_storm_{c}")).await;
            let item = new_item(&client, &owner).await;
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&booking_sql(item, day(1 + i), day(2 + i)))
                    .await
                    .unwrap();
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
    let host = std::env::var("GEARBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("GEARBOOK_PORT")
        .unwrap_or_else(|_| "5434".into())
        .parse()
        .expect("invalid GEARBOOK_PORT");

    println!("=== gearbook stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[setup]");
    let owner = setup(&host, port).await;

    println!("\n[phase 1] sequential booking throughput");
    phase1_sequential(&host, port, &owner).await;

    println!("\n[phase 2] contended bookings");
    phase2_contention(&host, port, &owner).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port, &owner).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port, &owner).await;

    println!("\n=== benchmark complete ===");
}
