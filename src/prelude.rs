pub use tempo_core::*;

use miette::Diagnostic;
use std::fmt::Display;
use thiserror::Error;

pub use crate::datastore::DatastoreError;
pub use crate::query::QueryError;
pub use crate::schema::SchemaError;

#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("storage error: {0}")]
    StorageError(#[from] KvError),

    #[error("schema error: {0}")]
    SchemaError(#[from] SchemaError),

    #[error("query error: {0}")]
    QueryError(#[from] QueryError),

    #[error("datastore error: {0}")]
    DatastoreError(#[from] DatastoreError),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("{0}")]
    Message(String),
}

impl Error {
    pub fn config(text: impl Display) -> Error {
        Error::ConfigError(text.to_string())
    }

    pub fn server(error: impl Display) -> Error {
        Error::ServerError(error.to_string())
    }

    pub fn message(text: impl Into<String>) -> Error {
        Error::Message(text.into())
    }
}
