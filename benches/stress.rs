//! Load generator against a running clinicd. Needs a token for a user with
//! a clinic (`CLINICD_BENCH_TOKEN`) whose tenant is `CLINICD_BENCH_TENANT`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

type Conn = Framed<TcpStream, LinesCodec>;

struct Target {
    addr: String,
    token: String,
    tenant: String,
}

async fn connect(target: &Target) -> Conn {
    let stream = TcpStream::connect(&target.addr).await.expect("connect failed");
    let mut conn = Framed::new(stream, LinesCodec::new());
    conn.send(json!({"op": "auth", "token": target.token}).to_string())
        .await
        .expect("send auth");
    let ready = next_frame(&mut conn).await;
    assert_eq!(ready["type"], "ready", "auth failed: {ready}");
    conn
}

async fn next_frame(conn: &mut Conn) -> Value {
    let line = conn.next().await.expect("connection closed").expect("read failed");
    serde_json::from_str(&line).expect("bad frame")
}

/// Send a request and wait for its reply, skipping pushed events.
async fn call(conn: &mut Conn, request: Value) -> Value {
    conn.send(request.to_string()).await.expect("send");
    loop {
        let frame = next_frame(conn).await;
        if frame["type"] != "event" {
            return frame;
        }
    }
}

fn booking(doctor: &str, day: u32, hour: u32) -> Value {
    json!({
        "op": "create-appointment",
        "patientId": format!("bench-{}", Ulid::new()),
        "doctorId": doctor,
        "date": format!("2030-01-{:02}T{hour:02}:00:00Z", day % 28 + 1),
    })
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

async fn phase1_sequential(target: &Target) {
    let mut conn = connect(target).await;
    let doctor = format!("bench-dr-{}", Ulid::new());
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        // 8 bookings a day, an hour apart
        let req = booking(&doctor, (i / 8) as u32, 9 + (i % 8) as u32);
        let t = Instant::now();
        let reply = call(&mut conn, req).await;
        latencies.push(t.elapsed());
        assert_eq!(reply["status"], 201, "{reply}");
    }

    let elapsed = start.elapsed();
    println!(
        "  {n} bookings in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("create-appointment", &mut latencies);
}

/// Many connections race for the same doctor and time.
async fn phase2_contended(target: &Arc<Target>) {
    let rounds = 50;
    let racers = 10;
    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    for round in 0..rounds {
        let doctor = format!("bench-contended-{}", Ulid::new());
        let mut handles = Vec::new();
        for _ in 0..racers {
            let target = target.clone();
            let doctor = doctor.clone();
            let wins = wins.clone();
            let conflicts = conflicts.clone();
            handles.push(tokio::spawn(async move {
                let mut conn = connect(&target).await;
                let reply = call(&mut conn, booking(&doctor, round, 10)).await;
                match reply["status"].as_u64() {
                    Some(201) => wins.fetch_add(1, Ordering::Relaxed),
                    Some(409) => conflicts.fetch_add(1, Ordering::Relaxed),
                    _ => panic!("unexpected reply: {reply}"),
                };
            }));
        }
        for h in handles {
            h.await.expect("racer panicked");
        }
    }

    let wins = wins.load(Ordering::Relaxed);
    println!(
        "  {rounds} rounds x {racers} racers in {:.2}s: {wins} booked, {} conflicts",
        start.elapsed().as_secs_f64(),
        conflicts.load(Ordering::Relaxed)
    );
    assert_eq!(wins, rounds as usize, "double booking detected");
}

async fn phase3_slots_under_load(target: &Arc<Target>) {
    let doctor = format!("bench-dr-{}", Ulid::new());
    let writer_target = target.clone();
    let writer_doctor = doctor.clone();
    let writer = tokio::spawn(async move {
        let mut conn = connect(&writer_target).await;
        for i in 0..1000u32 {
            call(&mut conn, booking(&writer_doctor, i / 8, 9 + i % 8)).await;
        }
    });

    let mut conn = connect(target).await;
    let mut latencies = Vec::new();
    while !writer.is_finished() {
        let t = Instant::now();
        let reply = call(
            &mut conn,
            json!({"op": "slots", "doctor": doctor, "date": "2030-01-01"}),
        )
        .await;
        latencies.push(t.elapsed());
        assert_eq!(reply["status"], 200, "{reply}");
    }
    writer.await.expect("writer panicked");
    print_latency("slots", &mut latencies);
}

/// Watchers in the tenant room, one writer touching patients.
async fn phase4_fanout(target: &Arc<Target>) {
    let n_watchers = 50;
    let n_events = 200;
    let received = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for _ in 0..n_watchers {
        let mut conn = connect(target).await;
        let joined = call(&mut conn, json!({"op": "join-tenant", "tenantId": target.tenant})).await;
        assert_eq!(joined["type"], "joined", "{joined}");
        let received = received.clone();
        handles.push(tokio::spawn(async move {
            let deadline = tokio::time::sleep(Duration::from_secs(10));
            tokio::pin!(deadline);
            let mut seen = 0;
            while seen < n_events {
                tokio::select! {
                    _ = &mut deadline => break,
                    frame = next_frame(&mut conn) => {
                        if frame["event"] == "patient-updated" {
                            seen += 1;
                        }
                    }
                }
            }
            received.fetch_add(seen, Ordering::Relaxed);
        }));
    }

    let mut writer = connect(target).await;
    let start = Instant::now();
    for i in 0..n_events {
        call(
            &mut writer,
            json!({"op": "put-document", "kind": "patient", "id": format!("bench-patient-{i}"), "document": {"n": i}}),
        )
        .await;
    }
    for h in handles {
        let _ = h.await;
    }

    let expected = n_watchers * n_events;
    let got = received.load(Ordering::Relaxed);
    println!(
        "  {n_watchers} watchers x {n_events} events: {got}/{expected} delivered in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("CLINICD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port = std::env::var("CLINICD_PORT").unwrap_or_else(|_| "7400".into());
    let target = Arc::new(Target {
        addr: format!("{host}:{port}"),
        token: std::env::var("CLINICD_BENCH_TOKEN").unwrap_or_else(|_| "bench".into()),
        tenant: std::env::var("CLINICD_BENCH_TENANT").unwrap_or_else(|_| "bench-clinic".into()),
    });

    println!("=== clinicd stress benchmark ===");
    println!("target: {}\n", target.addr);

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&target).await;

    println!("\n[phase 2] contended booking");
    phase2_contended(&target).await;

    println!("\n[phase 3] slot query latency under write load");
    phase3_slots_under_load(&target).await;

    println!("\n[phase 4] change fan-out");
    phase4_fanout(&target).await;

    println!("\n=== benchmark complete ===");
}
