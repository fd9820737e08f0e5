#![deny(clippy::expect_used, clippy::unwrap_used)]

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use mimalloc::MiMalloc;
use tracing_subscriber::EnvFilter;

use rtbench_core::collector::CollectorService;
use rtbench_core::config::{CollectorConfig, MockConfig, TesterConfig};
use rtbench_core::mock::MockService;
use rtbench_core::tester::TesterService;

mod cli;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    init_logging(cli.log.as_deref(), cli.debug)?;
    rtbench_core::tls::init_crypto();

    match cli.command {
        cli::Commands::Test(args) => {
            let service = TesterService::bind(TesterConfig {
                port: args.port,
                target: args.target,
                collector: args.collector,
                cas: args.cas,
                cert: args.cert,
                key: args.key,
                skip_name_check: args.skip_name_check,
            })
            .context("failed to start tester service")?;
            service.serve().await?;
        }
        cli::Commands::Collect(args) => {
            let service = CollectorService::bind(CollectorConfig {
                port: args.port,
                csv_path: args.csv,
            })
            .context("failed to start collector service")?;
            service.serve().await?;
        }
        cli::Commands::Mock(args) => {
            let service = MockService::bind(MockConfig {
                port: args.port,
                cas: args.cas,
                cert: args.cert,
                key: args.key,
            })
            .context("failed to start mock service")?;
            service.serve().await?;
        }
    }

    Ok(())
}

fn init_logging(log: Option<&Path>, debug: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(true)
        .with_line_number(true);

    match log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("error initializing log at {}", path.display()))?;
            if path.extension().is_some_and(|ext| ext == "json") {
                builder.json().with_writer(Mutex::new(file)).init();
            } else {
                builder.with_ansi(false).with_writer(Mutex::new(file)).init();
            }
        }
        None => builder.init(),
    }
    Ok(())
}
