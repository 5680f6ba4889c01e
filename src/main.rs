use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use slotwise::config::EngineConfig;
use slotwise::engine::Engine;
use slotwise::notify::NotifyHub;
use slotwise::store::{Fixture, InMemoryStore};

const USAGE: &str = "usage:
  slotwise slots <branch> <YYYY-MM-DD> <service[,service...]> [staff]
  slotwise check <staff> <start_ms> <minutes>
  slotwise detect <appointment>
  slotwise serve";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("SLOTWISE_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    slotwise::observability::init(metrics_port);

    let fixture_path =
        std::env::var("SLOTWISE_FIXTURE").unwrap_or_else(|_| "./fixture.json".into());
    let reap_secs: u64 = std::env::var("SLOTWISE_REAP_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(300);

    let fixture: Fixture = serde_json::from_str(&std::fs::read_to_string(&fixture_path)?)?;
    let store = Arc::new(InMemoryStore::from_fixture(fixture));
    let engine = Arc::new(Engine::in_memory(
        store,
        Arc::new(NotifyHub::new()),
        EngineConfig::from_env(),
    ));

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["slots", branch, date, services, rest @ ..] => {
            let staff = match rest.first() {
                Some(s) => Some(s.parse::<Ulid>()?),
                None => None,
            };
            let service_ids = services
                .split(',')
                .map(str::parse::<Ulid>)
                .collect::<Result<Vec<_>, _>>()?;
            let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")?;
            let slots = engine
                .get_available_slots(branch.parse()?, &service_ids, date, staff, None)
                .await?;
            println!("{}", serde_json::to_string_pretty(&slots)?);
        }
        ["check", staff, start, minutes] => {
            let free = engine
                .is_slot_available(staff.parse()?, start.parse()?, minutes.parse()?)
                .await?;
            println!("{}", serde_json::json!({ "available": free }));
        }
        ["detect", appointment] => {
            let results = engine.detect_and_resolve(appointment.parse()?).await?;
            let out: Vec<_> = results
                .into_iter()
                .map(|(conflict, outcome)| serde_json::json!({ "conflict": conflict, "outcome": outcome }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        ["serve"] => {
            info!("slotwise serving fixture {fixture_path}");
            info!("  waitlist reaper: every {reap_secs}s");
            info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));
            let reaper = tokio::spawn(slotwise::reaper::run_waitlist_reaper(
                engine.clone(),
                Duration::from_secs(reap_secs),
            ));
            tokio::signal::ctrl_c().await?;
            info!("shutdown signal received");
            reaper.abort();
            info!("slotwise stopped");
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
    Ok(())
}
