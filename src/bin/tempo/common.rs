use std::path::PathBuf;

use tracing::Level;
use tracing_subscriber::{filter::Targets, prelude::*};

use tempo::adapters::StoreAdapter;
use tempo::prelude::*;
use tempo::Config;

pub fn load_config(explicit_file: Option<&PathBuf>) -> Result<Config, Error> {
    let mut builder = ::config::Config::builder();

    builder = match explicit_file {
        Some(path) => builder.add_source(::config::File::from(path.clone())),
        None => builder.add_source(::config::File::with_name("tempo").required(false)),
    };

    builder = builder.add_source(::config::Environment::with_prefix("TEMPO").separator("__"));

    builder
        .build()
        .map_err(Error::config)?
        .try_deserialize()
        .map_err(Error::config)
}

pub fn setup_tracing(config: &tempo::LoggingConfig) -> Result<(), Error> {
    let level = config
        .max_level
        .as_deref()
        .map(|raw| raw.parse::<Level>())
        .transpose()
        .map_err(Error::config)?
        .unwrap_or(Level::INFO);

    let filter = Targets::new()
        .with_target("tempo", level)
        .with_target("tower_http", level);

    tracing_subscriber::fmt()
        .with_max_level(level)
        .finish()
        .with(filter)
        .init();

    Ok(())
}

pub fn open_store(config: &Config) -> Result<StoreAdapter, Error> {
    Ok(StoreAdapter::open(&config.storage)?)
}
