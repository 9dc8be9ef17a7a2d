use std::path::PathBuf;

use tempo::model::Credential;
use tempo::prelude::*;
use tempo::schema::Schema;
use tempo_core::Clock;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed an initial credential with this access key id.
    #[arg(long, requires = "secret_key")]
    access_key: Option<String>,

    /// Secret for the seeded credential.
    #[arg(long, requires = "access_key")]
    secret_key: Option<String>,
}

pub fn run(args: &Args) -> Result<(), Error> {
    let config = super::common::load_config(args.config.as_ref())?;
    super::common::setup_tracing(&config.logging)?;

    let store = super::common::open_store(&config)?;

    Schema::create(store.clone(), &config, Clock::system())?;

    if let (Some(access_key), Some(secret_key)) = (&args.access_key, &args.secret_key) {
        let schema = Schema::open(store, &config, Clock::system())?;
        schema.put_credential(&Credential {
            access_key_id: access_key.clone(),
            secret_access_key: secret_key.clone(),
            state: "ACTIVE".into(),
            permissions: vec!["*:read".into(), "*:write".into()],
        })?;
        tracing::info!(%access_key, "seeded credential");
    }

    tracing::info!("schema initialized");
    Ok(())
}
