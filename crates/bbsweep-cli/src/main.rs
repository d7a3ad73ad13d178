use anyhow::{anyhow, Result};
use bbsweep_analysis::{
    completion_tables, load_log, time_distribution, CompletionCell, CompletionTable,
    TimeDistribution,
};
use bbsweep_runner::{
    describe_profile, load_config, new_run_id, run_sweep, write_run_manifest, ResultLog,
    SolverProcess, SweepError, SweepSummary, SweepTotals,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bbsweep", version, about = "Branch-and-bound DAG scheduler sweep harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sweep profile against the solver, appending one result line
    /// per trial to the results log.
    Sweep {
        #[arg(long, default_value = "sweep.yaml")]
        config: PathBuf,
        #[arg(long)]
        profile: String,
        #[arg(long)]
        json: bool,
    },
    /// Aggregate a results log into completion tables, and optionally the
    /// elapsed-time distribution for one machine count and bound variant.
    Report {
        #[arg(long)]
        log: PathBuf,
        #[arg(long)]
        machines: Option<u32>,
        #[arg(long)]
        bound: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved profile and instance-file availability without
    /// running anything.
    Describe {
        #[arg(long, default_value = "sweep.yaml")]
        config: PathBuf,
        #[arg(long)]
        profile: String,
        #[arg(long)]
        json: bool,
    },
    /// Write a starter sweep.yaml.
    Init {
        #[arg(long, default_value = "sweep.yaml")]
        config: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => emit_json(&payload),
        Ok(None) => {}
        Err(err) => {
            // A failed solver build is the one fatal condition with its own
            // exit status; everything else is an operational error.
            let code = match err.downcast_ref::<SweepError>() {
                Some(SweepError::Build { .. }) => 2,
                _ => 1,
            };
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string()));
            } else {
                eprintln!("error: {:#}", err);
            }
            std::process::exit(code);
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Sweep {
            config,
            profile,
            json,
        } => {
            let cfg = load_config(&config)?;
            let prof = cfg.profile(&profile)?.clone();
            let run_id = new_run_id();
            let manifest_path = write_run_manifest(&cfg, &profile, &prof, &run_id)?;
            let mut log = ResultLog::append(&cfg.results_log).map_err(SweepError::Io)?;
            let solver = SolverProcess::new(&cfg.solver.path);
            let totals = run_sweep(&cfg, &prof, &solver, &mut log)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sweep",
                    "run_id": run_id,
                    "profile": profile,
                    "manifest": manifest_path.display().to_string(),
                    "results_log": cfg.results_log.display().to_string(),
                    "totals": totals,
                })));
            }
            println!("run_id: {}", run_id);
            println!("manifest: {}", manifest_path.display());
            println!("results_log: {}", cfg.results_log.display());
            print_totals(&totals);
        }
        Commands::Report {
            log,
            machines,
            bound,
            json,
        } => {
            let distribution_key = match (machines, bound) {
                (Some(m), Some(b)) => Some((m, b)),
                (None, None) => None,
                _ => {
                    return Err(anyhow!(
                        "--machines and --bound must be given together"
                    ))
                }
            };
            let outcome = load_log(&log)?;
            let tables = completion_tables(&outcome.index);
            let distribution = distribution_key
                .map(|(m, b)| time_distribution(&outcome.index, m, &b));
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "report",
                    "records": outcome.records,
                    "malformed_lines": outcome.malformed,
                    "completion": tables,
                    "times": distribution,
                })));
            }
            println!(
                "records: {} (malformed lines skipped: {})",
                outcome.records, outcome.malformed
            );
            for table in &tables {
                print_completion_table(table);
            }
            if let Some(dist) = &distribution {
                print_time_distribution(dist);
            }
        }
        Commands::Describe {
            config,
            profile,
            json,
        } => {
            let cfg = load_config(&config)?;
            let summary = describe_profile(&cfg, &profile)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary,
                })));
            }
            print_summary(&summary);
        }
        Commands::Init { config, force } => {
            if config.exists() && !force {
                return Err(anyhow!(
                    "config already exists (use --force): {}",
                    config.display()
                ));
            }
            std::fs::write(&config, DEFAULT_CONFIG)?;
            println!("wrote: {}", config.display());
            println!("next: bbsweep describe --config {} --profile size-sweep", config.display());
        }
    }
    Ok(None)
}

fn print_totals(totals: &SweepTotals) {
    println!("trials: {}", totals.trials);
    println!("finished: {}", totals.finished);
    println!("timeouts: {}", totals.timeouts);
    println!("skipped_instances: {}", totals.skipped_instances);
    println!("invocation_failures: {}", totals.invocation_failures);
}

fn print_completion_table(table: &CompletionTable) {
    println!();
    println!("completion % (m = {})", table.machine_count);
    print!("{:>6}", "n");
    for bound in &table.bound_variants {
        print!("{:>12}", bound);
    }
    println!();
    for row in &table.rows {
        print!("{:>6}", row.node_count);
        for cell in &row.cells {
            match cell {
                CompletionCell::Rate(pct) => print!("{:>12.1}", pct),
                CompletionCell::NoData => print!("{:>12}", "no data"),
            }
        }
        println!();
    }
}

fn print_time_distribution(dist: &TimeDistribution) {
    println!();
    println!(
        "scheduling times (m = {}, bound = {})",
        dist.machine_count, dist.bound_variant
    );
    println!("{:>6}{:>10}{:>11}{:>10}", "n", "finished", "timed_out", "mean_s");
    for entry in &dist.entries {
        let mean = if entry.finished_seconds.is_empty() {
            "-".to_string()
        } else {
            let sum: f64 = entry.finished_seconds.iter().sum();
            format!("{:.3}", sum / entry.finished_seconds.len() as f64)
        };
        println!(
            "{:>6}{:>10}{:>11}{:>10}",
            entry.node_count,
            entry.finished_seconds.len(),
            entry.timed_out,
            mean
        );
    }
}

fn print_summary(summary: &SweepSummary) {
    println!("profile: {}", summary.profile);
    println!("variants: {}", summary.variants.join(", "));
    println!("sizes: {:?}", summary.sizes);
    println!("machines: {:?}", summary.machines);
    println!("instances_per_point: {}", summary.instances_per_point);
    println!("timeout_secs: {}", summary.timeout_secs);
    match summary.skip_threshold {
        Some(k) => println!("skip_threshold: {}", k),
        None => println!("skip_threshold: none (exhaustive)"),
    }
    println!("enumerated_points: {}", summary.enumerated_points);
    println!("max_trials: {}", summary.max_trials);
    for avail in &summary.instance_files {
        println!(
            "instances[{}]: {} ({} .rcp files)",
            avail.size,
            avail.dir.display(),
            avail.found
        );
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Sweep { json, .. }
        | Commands::Report { json, .. }
        | Commands::Describe { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

const DEFAULT_CONFIG: &str = "\
solver:
  path: ./bbexps
  build:
    program: make
    clean_args: [clean]
    build_args: []
variants:
  - name: Fernandez
    build_args: [BOUND=FERNANDEZ]
  - name: Fujita
    build_args: [BOUND=FUJITA]
instances:
  template: series/data{size}01/Pat{index}.rcp
results_log: results.log
profiles:
  size-sweep:
    sizes: [12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25]
    machines: [4, 8, 16]
    instances_per_point: 30
    timeout_secs: 60
    skip_threshold: 12
    size_caps:
      - { machines: 4, max_size: 23 }
  wide-machines:
    sizes: [20]
    machines: [16, 32, 64]
    instances_per_point: 100
    timeout_secs: 60
";
