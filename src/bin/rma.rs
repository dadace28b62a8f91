//! RMA CLI: drives a simulated multi-rank cluster
//!
//! Commands:
//!   rma counter  every rank increments a shared counter with fetch_and_op
//!   rma cas      every rank races to claim one slot with compare_and_swap
//!   rma config   print or write the default configuration

use rma_core::{
    Datatype, EngineStats, ReduceOp, RmaConfig, RmaEngine, RmaError, RmaResult, SimNetwork,
};
use std::env;
use std::sync::Arc;
use std::time::Instant;

const CONFIG_FILE: &str = "rma.json";

fn print_usage() {
    println!(
        r#"
RMA core: one-sided remote memory access over a simulated fabric

Usage: rma <command> [options] [--config <path>]

Commands:
  counter [ranks] [iters]   Shared counter on rank 0 via fetch_and_op(sum)
  cas     [ranks]           Claim a slot on rank 0 via compare_and_swap
  config  [path]            Print the default config, or write it to <path>

Without --config, {} in the current directory is used when present.

Examples:
  rma counter 8 1000
  rma cas 16 --config cluster.json
  rma config rma.json
"#,
        CONFIG_FILE
    );
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let mut args: Vec<String> = env::args().collect();
    let config_path = take_config_flag(&mut args);
    if args.len() < 2 {
        print_usage();
        return;
    }

    let outcome = match args[1].as_str() {
        "counter" => cmd_counter(&args[2..], config_path.as_deref()),
        "cas" => cmd_cas(&args[2..], config_path.as_deref()),
        "config" => cmd_config(&args[2..]),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            Ok(())
        }
    };

    if let Err(e) = outcome {
        eprintln!("  Error: {}", e);
        std::process::exit(1);
    }
}

/// Strip `--config <path>` from the argument list
fn take_config_flag(args: &mut Vec<String>) -> Option<String> {
    let pos = args.iter().position(|a| a == "--config")?;
    args.remove(pos);
    if pos < args.len() {
        Some(args.remove(pos))
    } else {
        eprintln!("  --config needs a path, ignoring");
        None
    }
}

fn load_config(path: Option<&str>) -> RmaResult<RmaConfig> {
    match path {
        Some(p) => RmaConfig::load(p),
        None => RmaConfig::load_or_default(CONFIG_FILE),
    }
}

fn print_stats(rank: usize, stats: &EngineStats) {
    println!("  rank {:>3}: {}", rank, stats.summary());
}

fn cmd_counter(args: &[String], config_path: Option<&str>) -> RmaResult<()> {
    let mut config = load_config(config_path)?;
    if let Some(ranks) = args.first().and_then(|s| s.parse().ok()) {
        config.sim.ranks = ranks;
    }
    let iters: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(1000);
    config.validate()?;

    let network = SimNetwork::new(&config.sim);
    let engines: Vec<RmaEngine<_>> = (0..config.sim.ranks)
        .map(|rank| RmaEngine::attach(&network, rank, config.engine.clone()))
        .collect();

    println!(
        "\n  Counter: {} ranks x {} increments ({:?}, {:?})",
        config.sim.ranks, iters, config.engine.acquire_mode, config.sim.cache_policy
    );
    let started = Instant::now();
    let results: Vec<RmaResult<()>> = std::thread::scope(|s| {
        let handles: Vec<_> = engines
            .iter()
            .map(|engine| {
                s.spawn(move || -> RmaResult<()> {
                    let one = 1u64.to_ne_bytes();
                    let mut prior = [0u8; 8];
                    for _ in 0..iters {
                        engine.fetch_and_op(&one, &mut prior, Datatype::U64, 0, 0, ReduceOp::Sum)?;
                    }
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(panicked())))
            .collect()
    });
    for result in results {
        result?;
    }
    let elapsed = started.elapsed();

    let counter = read_u64(&network, 0, 0);
    let expected = config.sim.ranks as u64 * iters;
    println!("  {}", "=".repeat(60));
    for engine in &engines {
        print_stats(engine.rank(), &engine.stats());
    }
    println!("  {}", "=".repeat(60));
    println!("  Counter:  {} (expected {})", counter, expected);
    println!("  Elapsed:  {:.2?}", elapsed);
    if counter != expected {
        eprintln!("  Lost updates: {}", expected.saturating_sub(counter));
        std::process::exit(2);
    }
    Ok(())
}

fn cmd_cas(args: &[String], config_path: Option<&str>) -> RmaResult<()> {
    let mut config = load_config(config_path)?;
    if let Some(ranks) = args.first().and_then(|s| s.parse().ok()) {
        config.sim.ranks = ranks;
    }
    config.validate()?;

    let network = SimNetwork::new(&config.sim);
    let engines: Vec<RmaEngine<_>> = (0..config.sim.ranks)
        .map(|rank| RmaEngine::attach(&network, rank, config.engine.clone()))
        .collect();

    println!("\n  CAS race: {} ranks claim slot 0 of rank 0", config.sim.ranks);
    // Slot holds 0 while free, owner rank + 1 once claimed
    let claims: Vec<RmaResult<bool>> = std::thread::scope(|s| {
        let handles: Vec<_> = engines
            .iter()
            .map(|engine| {
                s.spawn(move || -> RmaResult<bool> {
                    let mine = (engine.rank() as u64 + 1).to_ne_bytes();
                    let free = 0u64.to_ne_bytes();
                    let mut seen = [0u8; 8];
                    engine.compare_and_swap(&mine, &free, &mut seen, Datatype::U64, 0, 0)?;
                    Ok(seen == free)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(panicked())))
            .collect()
    });

    let mut winners = Vec::new();
    for (rank, claim) in claims.into_iter().enumerate() {
        if claim? {
            winners.push(rank);
        }
    }
    let owner = read_u64(&network, 0, 0);
    println!("  {}", "=".repeat(40));
    println!("  Winners:  {:?}", winners);
    println!("  Slot:     {}", owner);
    if winners.len() != 1 || owner != winners[0] as u64 + 1 {
        eprintln!("  Expected exactly one winner owning the slot");
        std::process::exit(2);
    }
    Ok(())
}

fn cmd_config(args: &[String]) -> RmaResult<()> {
    let config = RmaConfig::default();
    match args.first() {
        Some(path) => {
            config.save(path)?;
            println!("  Wrote default configuration to {}", path);
        }
        None => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}

fn panicked() -> RmaError {
    RmaError::Config("rank thread panicked".into())
}

fn read_u64(network: &Arc<SimNetwork>, rank: usize, offset: usize) -> u64 {
    let bytes = network.read_memory(rank, offset, 8);
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes);
    u64::from_ne_bytes(word)
}
