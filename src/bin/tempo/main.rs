use clap::Parser;
use miette::{IntoDiagnostic, Result};

mod common;
mod daemon;
mod init;

#[derive(Parser)]
#[clap(name = "Tempo")]
#[clap(bin_name = "tempo")]
#[clap(author, version, about, long_about = None)]
enum Tempo {
    /// Create the schema tables for a fresh deployment.
    Init(init::Args),
    /// Run the ingestion/query service with background maintenance.
    Daemon(daemon::Args),
}

fn main() -> Result<()> {
    let args = Tempo::parse();

    match args {
        Tempo::Init(x) => init::run(&x).into_diagnostic()?,
        Tempo::Daemon(x) => daemon::run(&x).into_diagnostic()?,
    };

    Ok(())
}
