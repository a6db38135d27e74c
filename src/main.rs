use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use serde::Serialize;

use telemetry_stream::config::CONFIG_ENV_VAR;
use telemetry_stream::processor::{HealthReport, PerformanceStatistics};
use telemetry_stream::simulate::{self, DetectionQuality, SimulationConfig};
use telemetry_stream::{ProcessorConfig, StreamProcessor};

#[derive(Parser)]
#[command(
    name = "telemetry-stream",
    about = "Real-time sensor telemetry processing with online anomaly detection",
    version,
    long_about = None
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic sensor stream through the processor
    Simulate {
        /// Number of readings to generate
        #[arg(long, default_value = "10000")]
        points: usize,

        /// Sensor ids (comma separated); defaults to the excavation set
        #[arg(long, value_delimiter = ',')]
        sensors: Vec<String>,

        /// Fraction of readings replaced by N(0, 10) outliers
        #[arg(long, default_value = "0.05")]
        outlier_rate: f64,

        /// Seed for the generator and the processor
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,

        /// Submissions kept in flight at once
        #[arg(long, default_value = "1")]
        concurrency: usize,

        /// Use the deep-excavation preset instead of the config file
        #[arg(long)]
        excavation: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    ShowConfig {
        /// Show the deep-excavation preset
        #[arg(long)]
        excavation: bool,
    },
}

#[derive(Serialize)]
struct SimulationSummary {
    points: usize,
    results: usize,
    detection: DetectionQuality,
    statistics: PerformanceStatistics,
    health: HealthReport,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn resolve_config(path: Option<&PathBuf>, excavation: bool) -> Result<ProcessorConfig> {
    if excavation {
        return Ok(ProcessorConfig::excavation());
    }
    match path {
        Some(path) => ProcessorConfig::load(path),
        None => Ok(ProcessorConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Simulate {
            points,
            sensors,
            outlier_rate,
            seed,
            workers,
            concurrency,
            excavation,
            json,
        } => {
            let mut config = resolve_config(cli.config.as_ref(), excavation)?;
            config.seed = Some(seed);
            if let Some(workers) = workers {
                config.workers.num_workers = workers;
            }

            let mut sim = SimulationConfig {
                points,
                outlier_rate,
                seed,
                ..SimulationConfig::default()
            };
            if !sensors.is_empty() {
                sim.sensors = sensors;
            }
            let readings = simulate::generate(&sim).context("invalid simulation parameters")?;

            let processor = StreamProcessor::new(config).context("invalid processor configuration")?;
            tracing::info!(points, sensors = sim.sensors.len(), outlier_rate, "Starting simulation");
            processor.start().await;

            let results: Vec<_> = stream::iter(readings)
                .map(|data| processor.submit(data))
                .buffer_unordered(concurrency.max(1))
                .filter_map(|r| async move { r })
                .collect()
                .await;

            processor.stop().await;

            let summary = SimulationSummary {
                points,
                results: results.len(),
                detection: DetectionQuality::from_results(&results),
                statistics: processor.get_performance_statistics(),
                health: processor.get_system_health(),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Commands::ShowConfig { excavation } => {
            let config = if excavation || cli.config.is_some() {
                resolve_config(cli.config.as_ref(), excavation)?
            } else {
                ProcessorConfig::load_or_default()
            };
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn print_summary(summary: &SimulationSummary) {
    let s = &summary.statistics.system;
    let flow = &summary.statistics.flow;
    let q = &summary.detection;

    println!("\n=== Telemetry Stream Simulation ===");
    println!("{:<22} : {}", "Readings", summary.points);
    println!("{:<22} : {}", "Processed", s.total_processed);
    println!(
        "{:<22} : {} (admission {}, queue full {}, stopped {}, fault {})",
        "Dropped",
        s.total_dropped,
        s.drops.admission,
        s.drops.queue_full,
        s.drops.stopped,
        s.drops.pipeline_fault
    );
    println!("{:<22} : {}", "Anomalies", s.total_anomalies);
    println!("{:<22} : {:.2}%", "Anomaly rate", s.anomaly_rate * 100.0);
    println!("{:<22} : {:.1}/s", "Throughput", s.throughput);
    println!(
        "{:<22} : avg {:.3} ms, p95 {:.3} ms, max {:.3} ms",
        "Processing time",
        s.processing_time.avg * 1000.0,
        s.processing_time.p95 * 1000.0,
        s.processing_time.max * 1000.0
    );
    println!("{:<22} : {:.2}", "Backpressure", flow.backpressure_factor);
    println!(
        "{:<22} : precision {:.2}, recall {:.2}",
        "Detection",
        q.precision(),
        q.recall()
    );

    println!("\n{:<24} | {:>8} | {:>9} | {:>9} | Phase", "Sensor", "Points", "Anomalies", "Threshold");
    println!("{:-<24}-|-{:-<8}-|-{:-<9}-|-{:-<9}-|-{:-<10}", "", "", "", "", "");
    for (sensor, c) in &summary.statistics.sensors {
        println!(
            "{:<24} | {:>8} | {:>9} | {:>9.2} | {:?}",
            sensor, c.total_points, c.anomalies_detected, c.threshold, c.phase
        );
    }

    let h = &summary.health;
    println!("\n=== Health ===");
    println!("Score: {} ({})", h.health_score, h.grade);
    for rec in &h.recommendations {
        println!(" - {}", rec);
    }
    println!();
}
