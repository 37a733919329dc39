use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use courtbook::catalog::{Facility, FacilityKind, SlotSeed};
use courtbook::model::*;
use courtbook::{BookingError, BookingService, Config, FacilityCatalog};

const GYM_SLOTS: usize = 64;
const GYM_CAPACITY: u32 = 10_000;
const HOT_CAPACITY: u32 = 50;

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

struct Layout {
    gym: Vec<Ulid>,
    hot: Ulid,
}

fn catalog() -> (FacilityCatalog, Layout) {
    let gym: Vec<Ulid> = (0..GYM_SLOTS).map(|_| Ulid::new()).collect();
    let hot = Ulid::new();
    let gym_seeds = gym
        .iter()
        .enumerate()
        .map(|(i, id)| SlotSeed {
            id: Some(*id),
            court_id: None,
            start_time: format!("{:02}:{:02}", i / 4, (i % 4) * 15),
            end_time: format!("{:02}:{:02}", i / 4, (i % 4) * 15 + 14),
            max_bookings: GYM_CAPACITY,
        })
        .collect();
    let catalog = FacilityCatalog::new(vec![
        Facility {
            name: "gym".into(),
            kind: FacilityKind::Standard,
            price: 50,
            slots: gym_seeds,
        },
        Facility {
            name: "pool".into(),
            kind: FacilityKind::Standard,
            price: 80,
            slots: vec![SlotSeed {
                id: Some(hot),
                court_id: None,
                start_time: "07:00".into(),
                end_time: "08:00".into(),
                max_bookings: HOT_CAPACITY,
            }],
        },
    ])
    .expect("valid bench catalog");
    (catalog, Layout { gym, hot })
}

async fn phase1_sequential(service: &BookingService, layout: &Layout) {
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let slot = SlotReference::Normal(layout.gym[i % layout.gym.len()]);
        let t = Instant::now();
        service
            .create_booking(&format!("seq{i}"), "gym", slot)
            .await
            .expect("sequential admission");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("admission latency", &mut latencies);
}

async fn phase2_concurrent(service: &Arc<BookingService>, layout: &Layout) {
    let n_tasks = 32;
    let n_per_task = 200;
    let start = Instant::now();

    let handles: Vec<_> = (0..n_tasks)
        .map(|t| {
            let service = service.clone();
            let slots = layout.gym.clone();
            tokio::spawn(async move {
                let mut latencies = Vec::with_capacity(n_per_task);
                for j in 0..n_per_task {
                    let slot = SlotReference::Normal(slots[(t * 7 + j) % slots.len()]);
                    let at = Instant::now();
                    service
                        .create_booking(&format!("conc{t}_{j}"), "gym", slot)
                        .await
                        .expect("concurrent admission");
                    latencies.push(at.elapsed());
                }
                latencies
            })
        })
        .collect();

    let mut all = Vec::new();
    for latencies in futures::future::join_all(handles).await {
        all.extend(latencies.expect("task panicked"));
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    print_latency("admission latency", &mut all);
}

async fn phase3_contention(service: &Arc<BookingService>, layout: &Layout) {
    let n = 1000;
    let hot = SlotReference::Normal(layout.hot);
    let start = Instant::now();

    let attempts = (0..n).map(|i| {
        let service = service.clone();
        tokio::spawn(async move {
            let at = Instant::now();
            let result = service.create_booking(&format!("hot{i}"), "pool", hot).await;
            (result, at.elapsed())
        })
    });

    let mut admitted = 0;
    let mut full = 0;
    let mut latencies = Vec::with_capacity(n);
    for outcome in futures::future::join_all(attempts).await {
        let (result, latency) = outcome.expect("task panicked");
        latencies.push(latency);
        match result {
            Ok(_) => admitted += 1,
            Err(BookingError::SlotFull { .. }) => full += 1,
            Err(e) => println!("  unexpected rejection: {e}"),
        }
    }

    let occupancy = service
        .list_slots("pool")
        .await
        .expect("list pool")
        .into_iter()
        .find(|s| s.id == layout.hot)
        .map_or(0, |s| s.current_bookings);
    println!(
        "  {n} callers on a {HOT_CAPACITY}-seat slot in {:.2}s: {admitted} admitted, {full} full, occupancy {occupancy}",
        start.elapsed().as_secs_f64()
    );
    assert!(admitted <= HOT_CAPACITY as usize, "slot overbooked");
    assert_eq!(occupancy as usize, admitted, "occupancy must match admitted bookings");
    print_latency("contended admission latency", &mut latencies);
}

async fn phase4_cancel_churn(service: &Arc<BookingService>, layout: &Layout) {
    let n = 500;
    let mut latencies = Vec::with_capacity(n);
    for i in 0..n {
        let slot = SlotReference::Normal(layout.gym[i % layout.gym.len()]);
        let booking = service
            .create_booking(&format!("churn{i}"), "gym", slot)
            .await
            .expect("churn admission");
        let t = Instant::now();
        service
            .update_booking_status(booking.id, BookingStatus::Canceled)
            .await
            .expect("cancel");
        latencies.push(t.elapsed());
    }
    print_latency("cancel + release latency", &mut latencies);
}

async fn phase5_lifecycle(service: &BookingService) {
    let start = Instant::now();
    let report = service
        .lifecycle()
        .run_once(now_ms() + 86_400_000)
        .await
        .expect("lifecycle run");
    println!(
        "  archived {} bookings, reset {} facilities in {:.2}s",
        report.archived,
        report.reset.len(),
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let data_dir = std::env::temp_dir().join(format!("courtbook_bench_{}", Ulid::new()));
    let config = Config {
        data_dir: data_dir.clone(),
        ..Config::default()
    };
    let (catalog, layout) = catalog();
    let service = Arc::new(
        BookingService::open(&config, catalog)
            .await
            .expect("open service"),
    );

    println!("=== courtbook stress benchmark ===");
    println!("data dir: {}\n", data_dir.display());

    println!("[phase 1] sequential admission throughput");
    phase1_sequential(&service, &layout).await;

    println!("\n[phase 2] concurrent admission throughput");
    phase2_concurrent(&service, &layout).await;

    println!("\n[phase 3] contention on one slot");
    phase3_contention(&service, &layout).await;

    println!("\n[phase 4] cancel churn");
    phase4_cancel_churn(&service, &layout).await;

    println!("\n[phase 5] lifecycle run");
    phase5_lifecycle(&service).await;

    let _ = std::fs::remove_dir_all(&data_dir);
    println!("\n=== done ===");
}
