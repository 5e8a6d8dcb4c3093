//! Volley CLI entrypoint.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process::ExitCode;

use volley::{
    Config, ExitStatus, Reporter, RunOptions, RunSummary, ScenarioPath, VolleyDuration,
};

#[derive(Debug, Parser)]
#[command(name = "volley")]
#[command(about = "virtual-user load generation for channel-based RPC services")]
struct Cli {
    /// Path to config file. Missing configs are treated as "defaults".
    #[arg(long, global = true, default_value = "volley.toml")]
    config: PathBuf,

    /// Working directory for execution.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Log level.
    #[arg(long, global = true, default_value = "info")]
    log: String,

    /// Machine-readable output to stdout (JSON).
    #[arg(long, global = true)]
    json: bool,

    /// Disable color output.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a scenario file with N virtual users
    Run {
        scenario: PathBuf,

        /// Number of concurrent virtual users.
        #[arg(long, default_value_t = 1)]
        vus: u64,

        /// Seed for per-user random streams (think jitter); random otherwise.
        #[arg(long)]
        seed: Option<u64>,

        /// Channel-response timeout override (e.g. "5s").
        #[arg(long)]
        timeout: Option<VolleyDuration>,

        /// Reporter format.
        #[arg(long, default_value = "pretty")]
        reporter: Reporter,

        /// Write report.json to this path instead of the runs directory.
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Validate a scenario file and print its compiled step summary
    Check { scenario: PathBuf },

    /// Print environment + capability backend info
    Env,

    /// Print version and build info
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_global_args(std::env::args()));

    if let Err(err) = init_tracing(&cli.log) {
        // Tracing is best-effort; if it fails, we still continue.
        eprintln!("warning: failed to init tracing: {err:#}");
    }

    let cwd = cli
        .cwd
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    if let Err(err) = std::env::set_current_dir(&cwd) {
        return print_error_and_exit(
            &cli,
            anyhow::anyhow!(err).context(format!("failed to set cwd to {}", cwd.display())),
        );
    }

    let config = Config::load_optional(&cli.config);

    match run_command(&cli, &config) {
        Ok(code) => code,
        Err(err) => print_error_and_exit(&cli, err),
    }
}

fn run_command(cli: &Cli, config: &Config) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Command::Run {
            scenario,
            vus,
            seed,
            timeout,
            reporter,
            report,
        } => {
            let timeout = timeout
                .as_ref()
                .map(|d| {
                    let secs = d.0.as_secs();
                    if secs == 0 {
                        anyhow::bail!("timeout must be at least 1s");
                    }
                    Ok(secs)
                })
                .transpose()?;
            let runtime = tokio::runtime::Runtime::new()?;
            let run = runtime.block_on(volley::run_scenario(
                config,
                ScenarioPath::new(scenario.clone()),
                &RunOptions {
                    vus: *vus,
                    seed: *seed,
                    timeout,
                    report_to: report.clone(),
                },
            ))?;
            print_run_summary(cli, *reporter, &run.summary)?;
            Ok(exit_code_for_status(run.summary.status))
        }

        Command::Check { scenario } => {
            let report = volley::check_scenario(ScenarioPath::new(scenario.clone()))?;
            print_json_or_text(cli, &report)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Env => {
            let info = volley::env_info();
            print_json_or_text(cli, &info)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Version => {
            let info = volley::version_info();
            print_json_or_text(cli, &info)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn normalize_global_args(args: impl IntoIterator<Item = String>) -> Vec<String> {
    let all: Vec<String> = args.into_iter().collect();
    if all.is_empty() {
        return all;
    }

    let mut globals = Vec::new();
    let mut rest = Vec::new();

    let mut i = 1usize;
    while i < all.len() {
        let arg = &all[i];
        match arg.as_str() {
            "--json" | "--no-color" => {
                globals.push(arg.clone());
                i += 1;
            }
            "--config" | "--cwd" | "--log" => {
                globals.push(arg.clone());
                if i + 1 < all.len() {
                    globals.push(all[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => {
                rest.push(arg.clone());
                i += 1;
            }
        }
    }

    let mut normalized = vec![all[0].clone()];
    normalized.extend(globals);
    normalized.extend(rest);
    normalized
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

fn print_run_summary(cli: &Cli, reporter: Reporter, summary: &RunSummary) -> anyhow::Result<()> {
    if cli.json {
        print_json_or_text(cli, summary)?;
    } else if matches!(reporter, Reporter::Json) {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        println!("{}", summary.pretty());
    }
    Ok(())
}

fn print_json_or_text<T: serde::Serialize>(cli: &Cli, value: &T) -> anyhow::Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}

fn print_error_and_exit(cli: &Cli, err: anyhow::Error) -> ExitCode {
    let msg = format!("{err:#}");
    if cli.json {
        let out = serde_json::json!({
            "status": "error",
            "code": "error",
            "message": msg,
        });
        println!("{out}");
    } else {
        eprintln!("{msg}");
    }
    ExitCode::from(2)
}

fn exit_code_for_status(status: ExitStatus) -> ExitCode {
    match status {
        ExitStatus::Pass => ExitCode::SUCCESS,
        ExitStatus::Fail => ExitCode::from(1),
        ExitStatus::Error => ExitCode::from(2),
    }
}
