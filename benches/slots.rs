use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Weekday};
use rust_decimal::Decimal;
use ulid::Ulid;

use slotwise::clock::FixedClock;
use slotwise::config::EngineConfig;
use slotwise::engine::{Engine, NewAppointment, ServiceLayout};
use slotwise::model::*;
use slotwise::notify::NotifyHub;
use slotwise::store::InMemoryStore;

const STAFF: usize = 20;

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 2).expect("valid date")
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
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

struct Salon {
    engine: Arc<Engine>,
    branch: Ulid,
    service: Ulid,
    staff: Vec<Ulid>,
}

fn setup() -> Salon {
    let store = Arc::new(InMemoryStore::new());
    let branch = Ulid::new();
    store.put_branch(Branch {
        id: branch,
        name: Some("bench".into()),
        timezone: chrono_tz::Tz::UTC,
        settings: BranchSettings::default(),
    });
    store.put_working_hours(WorkingHours {
        branch_id: branch,
        weekday: Weekday::Mon,
        open_minute: 8 * 60,
        close_minute: 20 * 60,
        closed: false,
    });
    let service = Ulid::new();
    store.put_service(Service {
        id: service,
        name: "colour".into(),
        duration_minutes: 45,
        buffer_minutes: 15,
        price: Decimal::new(6000, 2),
        required_specializations: Default::default(),
    });

    let mut staff = Vec::with_capacity(STAFF);
    for _ in 0..STAFF {
        let id = Ulid::new();
        store.put_staff(StaffMember {
            id,
            branch_id: branch,
            name: None,
            specializations: Default::default(),
            services: [service].into_iter().collect(),
        });
        store.put_schedule(StaffSchedule {
            staff_id: id,
            date: monday(),
            start_minute: 8 * 60,
            end_minute: 20 * 60,
            available: true,
        });
        staff.push(id);
    }

    let clock = Arc::new(FixedClock::new(local_midnight(monday(), chrono_tz::Tz::UTC) - DAY_MS));
    let engine = Engine::in_memory(store, Arc::new(NotifyHub::new()), EngineConfig::default())
        .with_clock(clock);
    println!("  {STAFF} staff, 12h day, 60 minute service");
    Salon {
        engine: Arc::new(engine),
        branch,
        service,
        staff,
    }
}

async fn phase1_bookings(salon: &Salon) {
    let day = local_midnight(monday(), chrono_tz::Tz::UTC);
    let mut latencies = Vec::new();
    let mut rejected = 0;
    let start = Instant::now();

    for (i, staff) in salon.staff.iter().enumerate() {
        // Every other hour, staggered per staff member.
        for h in (8 + (i % 2) as Ms..19).step_by(2) {
            let t = Instant::now();
            let res = salon
                .engine
                .create_appointment(NewAppointment {
                    branch_id: salon.branch,
                    staff_id: *staff,
                    customer_id: Ulid::new(),
                    service_ids: vec![salon.service],
                    start: day + h * HOUR_MS,
                    layout: ServiceLayout::Sequential,
                    idempotency_key: None,
                    force: false,
                })
                .await;
            latencies.push(t.elapsed());
            if res.is_err() {
                rejected += 1;
            }
        }
    }

    let elapsed = start.elapsed();
    let n = latencies.len();
    println!(
        "  {n} bookings ({rejected} rejected) in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("booking latency", &mut latencies);
}

async fn phase2_slot_queries(salon: &Salon) {
    let n_readers = 8;
    let reads_per_reader = 200;
    let mut handles = Vec::new();

    for _ in 0..n_readers {
        let engine = salon.engine.clone();
        let branch = salon.branch;
        let service = salon.service;
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            let mut found = 0;
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                if let Ok(slots) = engine
                    .get_available_slots(branch, &[service], monday(), None, Some(15))
                    .await
                {
                    found += slots.len();
                }
                latencies.push(t.elapsed());
            }
            (latencies, found)
        }));
    }

    let mut all = Vec::new();
    let mut found = 0;
    for h in handles {
        if let Ok((latencies, n)) = h.await {
            all.extend(latencies);
            found = n / reads_per_reader;
        }
    }
    println!("  {found} free slots per query");
    print_latency("slot query (all staff)", &mut all);
}

async fn phase3_conflict_storm(salon: &Salon) {
    let day = local_midnight(monday(), chrono_tz::Tz::UTC);
    let mut latencies = Vec::new();
    let mut resolved = 0;

    for staff in &salon.staff {
        let t = Instant::now();
        let Ok(forced) = salon
            .engine
            .create_appointment(NewAppointment {
                branch_id: salon.branch,
                staff_id: *staff,
                customer_id: Ulid::new(),
                service_ids: vec![salon.service],
                start: day + 10 * HOUR_MS,
                layout: ServiceLayout::Sequential,
                idempotency_key: None,
                force: true,
            })
            .await
        else {
            continue;
        };
        if let Ok(results) = salon.engine.detect_and_resolve(forced.id).await {
            resolved += results.iter().filter(|(_, o)| o.is_resolved()).count();
        }
        latencies.push(t.elapsed());
    }

    println!("  {} forced bookings, {resolved} conflicts auto-resolved", latencies.len());
    print_latency("detect + resolve", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== slotwise benchmark ===\n");

    println!("[setup]");
    let salon = setup();

    println!("\n[phase 1] sequential booking throughput");
    phase1_bookings(&salon).await;

    println!("\n[phase 2] concurrent slot queries");
    phase2_slot_queries(&salon).await;

    println!("\n[phase 3] forced double bookings through the resolver");
    phase3_conflict_storm(&salon).await;

    println!("\n=== benchmark complete ===");
}
