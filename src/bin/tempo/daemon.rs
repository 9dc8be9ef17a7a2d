use std::path::PathBuf;
use std::sync::Arc;

use tempo::datastore::Datastore;
use tempo::prelude::*;
use tempo::schema::Schema;
use tempo_core::Clock;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
pub async fn run(args: &Args) -> Result<(), Error> {
    let config = super::common::load_config(args.config.as_ref())?;
    super::common::setup_tracing(&config.logging)?;

    let store = super::common::open_store(&config)?;

    let schema = Schema::open(store, &config, Clock::system())?;
    schema.start_maintenance();

    let credentials = schema.get_credentials()?;
    let datastore = Arc::new(Datastore::new(schema, &config.query));

    let server = tokio::spawn(tempo::serve::serve(
        config.serve.clone(),
        Arc::clone(&datastore),
        credentials,
    ));

    tokio::signal::ctrl_c().await.map_err(Error::IO)?;
    tracing::info!("shutting down");

    server.abort();
    datastore.close();

    Ok(())
}
