//! songbid-runner: headless host for the settlement engine.
//!
//! Usage:
//!   songbid-runner --seed 42 --bids 50 --db run.db
//!   songbid-runner --ipc-mode --db live.db --config engine.json
//!
//! IPC mode reads one JSON command per line on stdin and writes one
//! JSON envelope per line on stdout.

mod display;

use anyhow::Result;
use display::format_minor_units;
use rand::Rng;
use rand_pcg::Pcg64Mcg;
use songbid_core::{
    api,
    config::EngineConfig,
    engine::SettlementEngine,
    error::EngineError,
    request::{NewRequest, RequestStatus, SongRef},
    store::SettlementStore,
};
use std::{
    env,
    io::{self, BufRead, Write},
    sync::Arc,
    time::Duration,
};

const CATALOG: [(&str, &str); 6] = [
    ("Blue Monday", "New Order"),
    ("Windowlicker", "Aphex Twin"),
    ("Strings of Life", "Rhythim Is Rhythim"),
    ("Xtal", "Aphex Twin"),
    ("Energy Flash", "Joey Beltram"),
    ("Born Slippy", "Underworld"),
];

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let bids = parse_arg(&args, "--bids", 25usize);
    let fans = parse_arg(&args, "--fans", 5usize).max(1);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = str_arg(&args, "--db").unwrap_or(":memory:");

    let config = match str_arg(&args, "--config") {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let store = if db == ":memory:" {
        SettlementStore::in_memory()?
    } else {
        SettlementStore::open_with_timeout(db, Duration::from_millis(config.busy_timeout_ms))?
    };
    store.migrate()?;

    let engine = SettlementEngine::builder(Arc::new(store)).config(config).build()?;

    if ipc_mode {
        run_ipc_loop(&engine)?;
    } else {
        println!("songbid-runner");
        println!("  seed:      {seed}");
        println!("  bids:      {bids}");
        println!("  fans:      {fans}");
        println!("  db:        {db}");
        println!();
        run_demo(&engine, seed, bids, fans)?;
        print_summary(&engine, fans)?;
    }

    engine.flush();
    Ok(())
}

fn run_ipc_loop(engine: &SettlementEngine) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        let line = buffer.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }
        let response = api::handle_line(engine, line);
        writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
        stdout.flush()?;
    }
    Ok(())
}

/// Seeded traffic: fans bid at one DJ, who works through the inbox.
fn run_demo(engine: &SettlementEngine, seed: u64, bids: usize, fans: usize) -> Result<()> {
    let mut rng = Pcg64Mcg::new(seed as u128);
    let dj = "dj-main";

    for _ in 0..bids {
        let fan = format!("fan-{}", rng.gen_range(0..fans));
        let (title, artist) = CATALOG[rng.gen_range(0..CATALOG.len())];
        let amount = rng.gen_range(1..=40) * 50;
        let created = engine.create(NewRequest {
            requester_id: fan.clone(),
            dj_id:        dj.to_string(),
            song:         SongRef::new(title, artist),
            amount,
            message:      None,
        })?;

        // Some fans change their mind before the DJ gets to it.
        if rng.gen_bool(0.15) {
            engine.cancel(&created.request_id, &fan)?;
        }
    }

    for request in engine.inbox(dj, Some(RequestStatus::Pending))? {
        let outcome = if rng.gen_bool(0.7) {
            engine.accept(&request.request_id, dj)
        } else {
            engine.reject(&request.request_id, dj)
        };
        if let Err(err) = outcome {
            log::warn!("decision on {} failed: {err}", request.request_id);
        }
    }

    let available = engine.balance_of(dj)?.available;
    if available > 0 {
        match engine.payout(dj, available / 2) {
            Ok(_) | Err(EngineError::InvalidAmount { .. }) => {}
            Err(err) => return Err(err.into()),
        }
    }

    engine.flush();
    Ok(())
}

fn print_summary(engine: &SettlementEngine, fans: usize) -> Result<()> {
    let currency = engine.config().currency.as_str();
    let dj = "dj-main";

    println!("=== DJ SUMMARY ===");
    if let Some(stat) = engine.stats().dj_stat(dj)? {
        println!("  requests:       {}", stat.total_requests);
        println!("  accepted:       {}", stat.accepted_count);
        println!("  rejected:       {}", stat.rejected_count);
        println!("  cancelled:      {}", stat.cancelled_count);
        println!("  pending:        {}", stat.pending_count);
        println!("  earnings:       {}", format_minor_units(stat.total_earnings, currency));
        println!("  paid out:       {}", format_minor_units(stat.total_paid_out, currency));
    }
    let balance = engine.balance_of(dj)?;
    println!("  available:      {}", format_minor_units(balance.available, currency));

    println!();
    println!("=== TOP FANS ===");
    for (rank, fan) in engine.stats().top_fans(dj, fans)?.iter().enumerate() {
        println!(
            "  {}. {:<8} spent {} over {} accepted",
            rank + 1,
            fan.fan_id,
            format_minor_units(fan.total_spent, currency),
            fan.accepted_count
        );
    }

    println!();
    let violations = engine.audit()?;
    let drift = !engine.stats().verify(dj)?;
    println!("=== CHECKS ===");
    println!("  conservation:   {}", if violations.is_empty() { "ok" } else { "VIOLATED" });
    println!("  stats drift:    {}", if drift { "DRIFT" } else { "none" });
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn str_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}
