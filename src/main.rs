use anyhow::Result;
use clap::Parser;
use log::info;
use std::time::Duration;

use smart_traffic::simulation::{SimConfig, SimWorld};

#[derive(Parser)]
#[command(name = "smart_traffic")]
#[command(about = "Multi-agent city traffic simulation")]
struct Cli {
    /// Grid columns
    #[arg(long, default_value = "20")]
    width: u32,

    /// Grid rows
    #[arg(long, default_value = "20")]
    height: u32,

    /// Number of ordinary vehicles
    #[arg(long, default_value = "10")]
    vehicles: usize,

    /// Number of emergency vehicles
    #[arg(long, default_value = "5")]
    emergency: usize,

    /// Seconds of simulated time to run
    #[arg(long, default_value = "30")]
    seconds: u64,

    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Seconds between incident reporter rounds
    #[arg(long, default_value = "3.0")]
    incident_interval: f64,

    /// Put a traffic light on every node whose coordinates are multiples of this
    #[arg(long, default_value = "4")]
    light_spacing: u32,

    /// Vehicle capacity of every road
    #[arg(long, default_value = "5")]
    capacity: u32,

    /// Print the final city snapshot as JSON
    #[arg(long)]
    snapshot: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = env_logger::Env::default().default_filter_or("warn,smart_traffic=info");
    env_logger::Builder::from_env(env).init();
    let cli = Cli::parse();

    let config = SimConfig {
        width: cli.width,
        height: cli.height,
        vehicle_count: cli.vehicles,
        emergency_count: cli.emergency,
        incident_interval: cli.incident_interval,
        light_spacing: cli.light_spacing,
        default_capacity: cli.capacity,
        seed: cli.seed,
        ..SimConfig::default()
    };

    println!("Running smart traffic simulation...");
    println!(
        "Grid: {}x{}, vehicles: {}, emergency: {}, duration: {}s",
        cli.width, cli.height, cli.vehicles, cli.emergency, cli.seconds
    );

    let mut world = SimWorld::start(config)?;
    world.draw_map();

    // Print progress once per simulated second
    let mut outcome = Ok(());
    for second in 1..=cli.seconds {
        outcome = world.run_for(Duration::from_secs(1)).await;
        if outcome.is_err() {
            break;
        }
        if second % 10 == 0 || second == cli.seconds {
            println!("--- After {second}s ---");
            world.draw_map();
        }
    }

    let report = world.shutdown().await;
    info!("=== SIMULATION COMPLETE ===");
    info!("Elapsed time: {:.2}s", report.elapsed);
    info!("Trips completed: {}", report.summary.trips_completed);
    info!("Emergency responses: {}", report.summary.ev_responses);
    info!("Incidents reported: {}", report.incidents_reported);

    report.print_summary();
    if cli.snapshot {
        println!("{}", report.snapshot.to_json()?);
    }
    outcome
}
