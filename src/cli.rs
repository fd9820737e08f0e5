use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use rtbench_core::config::DEFAULT_PORT;

#[derive(Parser, Debug)]
#[command(name = "rtbench", version, about, long_about = None)]
pub struct Cli {
    /// Path to the log file; stderr when omitted. A `.json` extension
    /// selects structured JSON log lines.
    #[arg(long, global = true)]
    pub log: Option<PathBuf>,

    /// Enable debug mode for verbose logging.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run rtbench in test mode: generate paced load against a target.
    Test(TestArgs),
    /// Run rtbench in collect mode: gather results into a CSV file.
    Collect(CollectArgs),
    /// Run rtbench in mock mode: serve synthetic delayed responses.
    Mock(MockArgs),
}

#[derive(Args, Debug)]
pub struct TestArgs {
    /// Target IP and port to benchmark.
    #[arg(long)]
    pub target: String,

    /// Collector IP and port.
    #[arg(long)]
    pub collector: String,

    /// Path to the trusted CA certificate bundle (PEM file).
    #[arg(long)]
    pub cas: Option<PathBuf>,

    /// Skip target name verification for HTTPS requests.
    #[arg(long)]
    pub skip_name_check: bool,

    /// Path to the tester's client certificate (PEM file).
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Path to the tester's private key (PEM file).
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Port on which rtbench in test mode will listen.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

#[derive(Args, Debug)]
pub struct CollectArgs {
    /// Path to the CSV results file.
    #[arg(long)]
    pub csv: PathBuf,

    /// Port on which rtbench in collect mode will listen.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

#[derive(Args, Debug)]
pub struct MockArgs {
    /// Path to the client CA certificate bundle (PEM file); enables
    /// mutual TLS.
    #[arg(long)]
    pub cas: Option<PathBuf>,

    /// Path to the mock's server certificate (PEM file).
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Path to the mock's private key (PEM file).
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Port on which rtbench in mock mode will listen.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}
