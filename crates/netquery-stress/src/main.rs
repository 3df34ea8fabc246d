use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

use netquery::config::Config;
use netquery::logging::{ensure_log_error, init_logging};
use netquery::metrics;

mod stresstest;
mod workloads;

use stresstest::{perform_stresstest, print_reports};
use workloads::WorkloadsConfig;

/// Command line interface parser.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,
}

fn main() {
    if let Err(error) = execute() {
        ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref())?;

    // SAFETY: No runtime has been started yet, so this is still single-threaded.
    unsafe { init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("netquery-stress")
        .build()
        .context("failed to start tokio runtime")?;

    let reports = runtime.block_on(perform_stresstest(&config, workloads, cli.duration))?;
    print_reports(&reports, cli.duration);

    Ok(())
}
