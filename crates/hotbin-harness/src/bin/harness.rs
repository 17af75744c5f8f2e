//! CLI entrypoint for the hotbin harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hotbin_harness::structured_log::{LogLevel, sha256_hex};
use hotbin_harness::{
    ArtifactIndex, HarnessError, LogEmitter, LogEntry, WorkloadConfig, bin_table, render_bin_table,
    run_workload, validate_log_file,
};
use hotbin_membrane::TcacheOptions;

/// Workload and invariant tooling for hotbin.
#[derive(Debug, Parser)]
#[command(name = "hotbin-harness")]
#[command(about = "Workload and invariant harness for hotbin")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a seeded multi-thread workload and check counters and leaks.
    Workload {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Operations per thread.
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Seed (decimal or 0x...).
        #[arg(long, default_value = "0xC0FFEE")]
        seed: String,
        /// Conf string (`key:value,...`) applied over the defaults.
        #[arg(long, default_value = "")]
        conf: String,
        /// Install a user hook with this byte interval.
        #[arg(long)]
        hook_interval: Option<u64>,
        /// Flip the global slow path while the workload runs.
        #[arg(long)]
        toggle_slow: bool,
        /// Structured JSONL log output path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Artifact index output path (requires `--log`).
        #[arg(long, requires = "log")]
        artifact_index: Option<PathBuf>,
        /// Report JSON output path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the per-bin capacity table for a conf string.
    BinInfo {
        #[arg(long, default_value = "")]
        conf: String,
        /// Emit JSON instead of a text table.
        #[arg(long)]
        json: bool,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        #[arg(long)]
        input: PathBuf,
    },
}

fn parse_seed(seed: &str) -> Result<u64, String> {
    let cleaned = seed.replace('_', "");
    let parsed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse::<u64>(),
    };
    parsed.map_err(|e| format!("invalid seed `{seed}`: {e}"))
}

fn write_or_print(path: Option<&PathBuf>, contents: &str) -> Result<(), HarnessError> {
    match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, contents)?;
        }
        None => println!("{contents}"),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Workload {
            threads,
            ops,
            seed,
            conf,
            hook_interval,
            toggle_slow,
            log,
            artifact_index,
            output,
        } => {
            let cfg = WorkloadConfig {
                threads,
                ops_per_thread: ops,
                seed: parse_seed(&seed)?,
                conf,
                hook_interval,
                toggle_slow,
                ..WorkloadConfig::default()
            };
            eprintln!(
                "Running workload: {} threads x {} ops, seed {:#x}",
                cfg.threads, cfg.ops_per_thread, cfg.seed
            );
            let (report, records) = run_workload(&cfg)?;
            let checked = report.check();
            let report_json = serde_json::to_string_pretty(&report)?;

            if let Some(log_path) = &log {
                let run_id = format!("workload-{:x}", cfg.seed);
                let mut emitter = LogEmitter::to_file(log_path, &run_id)?;
                emitter.emit_entry(
                    LogEntry::new("", LogLevel::Info, "workload_start")
                        .with_details(serde_json::json!({
                            "threads": cfg.threads,
                            "ops_per_thread": cfg.ops_per_thread,
                            "conf": cfg.conf,
                        })),
                )?;
                emitter.emit_records(&records)?;
                let (level, outcome) = match &checked {
                    Ok(()) => (LogLevel::Info, "pass".to_string()),
                    Err(err) => (LogLevel::Error, err.to_string()),
                };
                emitter.emit_entry(
                    LogEntry::new("", level, "workload_end")
                        .with_outcome(outcome)
                        .with_count(records.len())
                        .with_duration_ms(report.duration_ms),
                )?;
                emitter.flush()?;
                eprintln!("Wrote {} log lines to {}", emitter.lines(), log_path.display());

                if let Some(index_path) = &artifact_index {
                    let mut index = ArtifactIndex::new(run_id);
                    index.add_file(log_path, "log")?;
                    index.add_bytes("report.json", "report", report_json.as_bytes());
                    write_or_print(Some(index_path), &index.to_json()?)?;
                    eprintln!(
                        "Artifact index {} (report sha256 {})",
                        index_path.display(),
                        sha256_hex(report_json.as_bytes())
                    );
                }
            }
            write_or_print(output.as_ref(), &report_json)?;
            checked?;
        }
        Command::BinInfo { conf, json } => {
            let opts = TcacheOptions::from_conf_str(&conf).map_err(HarnessError::from)?;
            let rows = bin_table(&opts);
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print!("{}", render_bin_table(&rows));
            }
        }
        Command::ValidateLog { input } => {
            let (lines, errors) = validate_log_file(&input)?;
            for err in &errors {
                eprintln!("{err}");
            }
            if !errors.is_empty() {
                let invalid = errors
                    .iter()
                    .map(|e| e.line_number)
                    .collect::<std::collections::BTreeSet<_>>()
                    .len();
                let err = HarnessError::InvalidLog { lines, invalid };
                eprintln!("{err}");
                return Err(err.into());
            }
            eprintln!("{} valid log lines in {}", lines, input.display());
        }
    }

    Ok(())
}
