//! ClvForge: customer lifetime value estimation CLI
//!
//! Loads a transaction log, fits the purchase-timing and spend models, scores
//! every customer and writes the estimate table.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use clvforge::{load_events, run, Args, ClvReport, Tier};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = args.to_config()?;
    let start_time = Instant::now();

    // Step 1: Load events
    if args.verbose {
        println!("Step 1: Loading transaction log");
        println!("  Input file: {}", args.input);
    }
    let events = load_events(&args.input, &args.columns())?;
    println!("✓ Events loaded: {}", events.len());

    // Step 2: Fit and score
    if args.verbose {
        println!("\nStep 2: Fitting models");
        println!("  Timing model: {:?}", config.timing_model);
        println!("  Time unit: {:?}", config.unit);
        if let Some(cutoff) = config.cutoff {
            println!("  Calibration cutoff: {}", cutoff.to_rfc3339());
        }
    }
    let report = run(&events, &config).context("CLV estimation failed")?;
    print_summary(&report, config.scoring.horizon);

    // Step 3: Export
    let output = Path::new(&args.output);
    report.values.write_csv(output)?;
    let params_path = output.with_extension("params.csv");
    write_parameters(&report, &params_path)?;

    println!("\n=== Pipeline Complete ===");
    println!("Total processing time: {:.2}s", start_time.elapsed().as_secs_f64());
    println!("Estimates saved to: {}", output.display());
    println!("Parameters saved to: {}", params_path.display());

    Ok(())
}

fn print_summary(report: &ClvReport, horizon: f64) {
    println!("\n=== Purchase Timing ===");
    println!("Parameters: {:?}", report.timing.params.as_array());
    println!(
        "Log-likelihood: {:.3} ({} customers, {} iterations)",
        report.timing.log_likelihood, report.timing.customers, report.timing.iterations
    );
    if !report.timing.at_bound.is_empty() {
        println!("Parameters at the cap: {:?}", report.timing.at_bound);
    }

    println!("\n=== Spend ===");
    let spend = report.spend.params;
    println!("Parameters: p={:.4}, q={:.4}, gamma={:.4}", spend.p, spend.q, spend.gamma);
    if !report.spend.at_bound.is_empty() {
        println!("Parameters at the cap: {:?}", report.spend.at_bound);
    }
    match spend.population_mean() {
        Some(mean) => println!("Population mean spend: {:.2}", mean),
        None => println!("Population mean spend: undefined (q <= 1)"),
    }

    if let Some(holdout) = &report.holdout {
        println!("\n=== Holdout Validation ===");
        println!(
            "Predicted: {:.1}, actual: {} over {} customers",
            holdout.predicted_total,
            holdout.actual_total,
            holdout.customers.len()
        );
        println!("Mean absolute error: {:.3}", holdout.mean_absolute_error);
        if !report.excluded_from_fit.is_empty() {
            println!("Customers first seen after cutoff: {}", report.excluded_from_fit.len());
        }
    }

    println!("\n=== Customer Value (horizon {}) ===", horizon);
    let total = report.values.estimates.len();
    for tier in [Tier::High, Tier::Medium, Tier::Low, Tier::Undefined] {
        let count = report.values.tier_count(tier);
        let percentage = if total == 0 { 0.0 } else { count as f64 / total as f64 * 100.0 };
        println!("{:<9} {} customers ({:.1}%)", tier.as_str(), count, percentage);
    }
}

fn write_parameters(report: &ClvReport, path: &Path) -> Result<()> {
    use polars::prelude::{CsvWriter, SerWriter};

    let mut df = report.parameters_frame()?;
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
    Ok(())
}
