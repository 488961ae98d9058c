//! # wlam
//!
//! CLI runner for the WLAM environmental sensor simulator.

use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wlam_lora::PathLossBreakdown;
use wlam_runner::metrics_export;
use wlam_runner::{load_model, run_recorded, run_sweep, RunnerError, SimTime, SweepConfig};

// ============================================================================
// Duration Parsing
// ============================================================================

/// Seconds from a plain number (`90`) or unit groups (`10m`, `1d2h30m45s`).
/// A trailing bare number counts as seconds.
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        return if secs.is_finite() && secs > 0.0 {
            Ok(secs)
        } else {
            Err(format!("duration '{}' must be a finite number of seconds above zero", s))
        };
    }

    let mut total = 0.0;
    let mut number = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        if number.is_empty() {
            return Err(format!("Invalid duration '{}': unexpected '{}'", s, c));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", number, s))?;
        let unit = match c {
            's' => 1.0,
            'm' => 60.0,
            'h' => 3600.0,
            'd' => 86_400.0,
            _ => return Err(format!("unit '{}' in '{}' is not one of s, m, h, d", c, s)),
        };
        total += value * unit;
        number.clear();
    }
    if !number.is_empty() {
        let value: f64 = number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", number, s))?;
        total += value;
    }

    if total == 0.0 {
        return Err(format!("Invalid duration '{}'", s));
    }
    Ok(total)
}

/// Run length from the CLI value or the model's `duration_s`.
fn run_length(cli: Option<f64>, model_s: f64) -> Result<SimTime, RunnerError> {
    let secs = cli.unwrap_or(model_s);
    if !secs.is_finite() || secs <= 0.0 {
        return Err(RunnerError::ConfigError(format!("duration must be positive, got {}", secs)));
    }
    Ok(SimTime::from_secs(secs))
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// How to export the metrics snapshot.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum MetricsOutputFormat {
    /// Pretty JSON snapshot.
    Json,
    /// Prometheus text format.
    Prometheus,
}

/// WLAM - LoRa environmental sensor network simulator
#[derive(Parser, Debug)]
#[command(name = "wlam")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Simulate a YAML scenario
    Run(RunConfig),
    /// Run a spreading factor / power / node count grid over one template node
    Sweep(SweepArgs),
    /// Print the free-space and vegetation loss of a link
    PathLoss(PathLossArgs),
    /// Describe every metric the simulator records
    Metrics,
}

/// Configuration for a single run
#[derive(Parser, Debug)]
pub struct RunConfig {
    /// Path to the YAML model file
    pub model: PathBuf,

    /// Simulation duration (e.g. 3600, 90m, 1d2h); defaults to the model's duration_s
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<f64>,

    /// Random seed; defaults to the model's seed
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Export collected metrics at the end of the run
    #[arg(long, value_enum)]
    pub metrics_output: Option<MetricsOutputFormat>,

    /// Write exported metrics to this file instead of stdout
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Write a JSON-lines trace of uplinks and deliveries to this file
    #[arg(long)]
    pub trace: Option<PathBuf>,
}

/// Configuration for a parameter sweep
#[derive(Parser, Debug)]
pub struct SweepArgs {
    /// Path to the YAML model file; its first node is the template
    pub model: PathBuf,

    /// Spreading factors to sweep
    #[arg(long, value_delimiter = ',', default_values_t = [7u8, 12])]
    pub spreading_factors: Vec<u8>,

    /// Transmit powers to sweep, in dBm
    #[arg(long, value_delimiter = ',', default_values_t = [-5.0f64], allow_hyphen_values = true)]
    pub tx_powers: Vec<f64>,

    /// Node counts to sweep
    #[arg(long, value_delimiter = ',', default_values_t = [10usize, 50, 100])]
    pub node_counts: Vec<usize>,

    /// Runs per configuration
    #[arg(long, default_value = "1")]
    pub repetitions: u32,

    /// Duration of each run; defaults to the model's duration_s
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<f64>,

    /// Base seed; defaults to the model's seed
    #[arg(short, long)]
    pub seed: Option<u64>,
}

/// Link to evaluate with the path-loss model
#[derive(Parser, Debug)]
pub struct PathLossArgs {
    /// Distance between node and gateway in meters
    #[arg(long)]
    pub distance_m: f64,

    /// Carrier frequency in Hz
    #[arg(long, default_value = "868100000")]
    pub frequency_hz: f64,

    /// Depth of vegetation along the path in meters
    #[arg(long, default_value = "0")]
    pub vegetation_depth_m: f64,
}

// ============================================================================
// Commands
// ============================================================================

fn run_command(config: RunConfig) -> Result<(), RunnerError> {
    let model = load_model(&config.model)?;
    let seed = config.seed.unwrap_or(model.simulation.seed);
    let duration = run_length(config.duration, model.simulation.duration_s)?;

    let trace: Option<Box<dyn Write>> = match &config.trace {
        Some(path) => Some(Box::new(BufWriter::new(File::create(path)?))),
        None => None,
    };

    info!("Running {} for {} with seed {}", config.model.display(), duration, seed);
    let output = run_recorded(&model, seed, duration, trace)?;

    let metrics_to_stdout = config.metrics_output.is_some() && config.metrics_file.is_none();
    if !metrics_to_stdout {
        println!("{}", serde_json::to_string_pretty(&output.stats)?);
    }

    if let Some(format) = config.metrics_output {
        let mut writer: Box<dyn Write> = match &config.metrics_file {
            Some(path) => Box::new(BufWriter::new(File::create(path)?)),
            None => Box::new(std::io::stdout()),
        };
        match format {
            MetricsOutputFormat::Json => metrics_export::export_json(&output.metrics, &mut writer)?,
            MetricsOutputFormat::Prometheus => metrics_export::export_prometheus(&output.metrics, &mut writer)?,
        }
        writer.flush()?;
    }
    Ok(())
}

fn sweep_command(args: SweepArgs) -> Result<(), RunnerError> {
    let model = load_model(&args.model)?;
    let config = SweepConfig {
        spreading_factors: args.spreading_factors,
        tx_powers_dbm: args.tx_powers,
        node_counts: args.node_counts,
        repetitions: args.repetitions,
        seed: args.seed.unwrap_or(model.simulation.seed),
        duration: run_length(args.duration, model.simulation.duration_s)?,
    };
    let results = run_sweep(&model, &config)?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn path_loss_command(args: PathLossArgs) -> Result<(), RunnerError> {
    let breakdown = PathLossBreakdown::compute(args.distance_m, args.frequency_hz, args.vegetation_depth_m);
    println!("{}", serde_json::to_string_pretty(&breakdown)?);
    Ok(())
}

fn print_metrics_info() {
    use wlam_metrics::metric_defs;

    println!("WLAM Available Metrics");
    println!("======================\n");
    println!("All metrics carry the labels:");
    println!("  - node: node name");
    println!("  - node_type: kind of node (sensor)");
    println!("Gateway metrics are labelled with the transmitting node.");
    println!();

    let categories = [
        ("Sensor Readings", "wlam.sensor."),
        ("Application", "wlam.app."),
        ("Radio", "wlam.radio."),
        ("Gateway", "wlam.gateway."),
    ];
    for (category, prefix) in categories {
        println!("## {}\n", category);
        for metric in metric_defs::ALL.iter().filter(|m| m.name.starts_with(prefix)) {
            println!("  {}", metric.name);
            println!("    Type: {}", metric.kind);
            let unit = metric.unit_str();
            if !unit.is_empty() {
                println!("    Unit: {}", unit);
            }
            println!("    Description: {}", metric.description);
            if !metric.labels.is_empty() {
                println!("    Extra labels: {}", metric.labels.join(", "));
            }
            println!();
        }
    }
}

fn main() -> Result<(), RunnerError> {
    // RUST_LOG, defaulting to warnings only
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(config) => run_command(config)?,
        Commands::Sweep(args) => sweep_command(args)?,
        Commands::PathLoss(args) => path_loss_command(args)?,
        Commands::Metrics => print_metrics_info(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_seconds() {
        assert_eq!(parse_duration("90"), Ok(90.0));
        assert_eq!(parse_duration(" 1.5 "), Ok(1.5));
    }

    #[test]
    fn test_parse_single_units() {
        assert_eq!(parse_duration("30s"), Ok(30.0));
        assert_eq!(parse_duration("10m"), Ok(600.0));
        assert_eq!(parse_duration("2h"), Ok(7200.0));
        assert_eq!(parse_duration("1d"), Ok(86_400.0));
    }

    #[test]
    fn test_parse_combined_units() {
        assert_eq!(parse_duration("1h30m"), Ok(5400.0));
        assert_eq!(parse_duration("1d2h"), Ok(93_600.0));
        assert_eq!(parse_duration("1m30"), Ok(90.0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn test_parse_rejects_non_finite_and_negative() {
        for bad in ["inf", "-inf", "nan", "NaN", "-5", "0"] {
            assert!(parse_duration(bad).is_err(), "{} accepted", bad);
        }
        assert!(Cli::try_parse_from(["wlam", "run", "m.yaml", "--duration", "inf"]).is_err());
        assert!(Cli::try_parse_from(["wlam", "sweep", "m.yaml", "-d", "nan"]).is_err());
    }

    #[test]
    fn test_run_length_checks_model_value() {
        assert_eq!(run_length(None, 60.0).unwrap(), SimTime::from_secs(60.0));
        assert_eq!(run_length(Some(30.0), 60.0).unwrap(), SimTime::from_secs(30.0));
        for bad in [-5.0, 0.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(run_length(None, bad), Err(RunnerError::ConfigError(_))), "{} accepted", bad);
        }
    }

    #[test]
    fn test_cli_parses_sweep_lists() {
        let cli = Cli::try_parse_from([
            "wlam",
            "sweep",
            "model.yaml",
            "--spreading-factors",
            "7,9,12",
            "--tx-powers",
            "-5,14",
        ])
        .unwrap();
        match cli.command {
            Commands::Sweep(args) => {
                assert_eq!(args.spreading_factors, vec![7, 9, 12]);
                assert_eq!(args.tx_powers, vec![-5.0, 14.0]);
                assert_eq!(args.node_counts, vec![10, 50, 100]);
                assert_eq!(args.repetitions, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
