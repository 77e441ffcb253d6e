use anyhow::Result;
use clap::Parser;

use build_tracer::cli::{Cli, Config};
use build_tracer::runner::RpmbuildTracer;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!("{err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;
    let mut tracer = RpmbuildTracer::new(config);
    tracer.run()
}
