//! HTTP service: datapoint ingestion, queries, and catalog listings over
//! axum, with signed-request auth in front of every route.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace};
use tracing::Level;

use tempo_core::KvStore;

use crate::auth::{self, RequestParts};
use crate::datastore::{Datastore, DatastoreError};
use crate::model::{Credential, DataPointSet, QueryRequest};
use crate::query::QueryError;

pub const DOMAIN_HEADER: &str = "x-tempo-domain";

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct ServeConfig {
    pub listen_address: SocketAddr,
    pub permissive_cors: Option<bool>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            listen_address: ([0, 0, 0, 0], 8080).into(),
            permissive_cors: None,
        }
    }
}

pub struct Facade<S: KvStore> {
    pub datastore: Arc<Datastore<S>>,
    pub credentials: Arc<HashMap<String, Credential>>,
}

impl<S: KvStore> Clone for Facade<S> {
    fn clone(&self) -> Self {
        Self {
            datastore: Arc::clone(&self.datastore),
            credentials: Arc::clone(&self.credentials),
        }
    }
}

enum Error {
    Status(StatusCode),
    Message(StatusCode, String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::Status(status) => status.into_response(),
            Error::Message(status, message) => (
                status,
                Json(serde_json::json!({ "errors": [message] })),
            )
                .into_response(),
        }
    }
}

impl From<DatastoreError> for Error {
    fn from(value: DatastoreError) -> Self {
        match value {
            DatastoreError::Query(QueryError::UnsupportedAggregator(msg)) => {
                Error::Message(StatusCode::BAD_REQUEST, msg)
            }
            DatastoreError::Model(e) => Error::Message(StatusCode::BAD_REQUEST, e.to_string()),
            _ => Error::Status(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

fn lowercase_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}

impl<S: KvStore> Facade<S> {
    /// Check the request signature and permissions; returns the domain.
    fn authorize(
        &self,
        headers: &HeaderMap,
        method: &str,
        path: &str,
        body: &[u8],
        op: &str,
    ) -> Result<String, Error> {
        let domain = headers
            .get(DOMAIN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(Error::Message(
                StatusCode::BAD_REQUEST,
                format!("missing {DOMAIN_HEADER} header"),
            ))?;

        let headers = lowercase_headers(headers);
        let parts = RequestParts {
            method,
            path,
            headers: &headers,
            body,
        };

        if !auth::authorized(&parts, &domain, op, &self.credentials, Utc::now()) {
            return Err(Error::Status(StatusCode::FORBIDDEN));
        }

        Ok(domain)
    }
}

async fn add_datapoints<S: KvStore>(
    State(facade): State<Facade<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, Error> {
    let domain = facade.authorize(&headers, "POST", "/api/v1/datapoints", &body, "write")?;

    let json = serde_json::from_slice(&body)
        .map_err(|e| Error::Message(StatusCode::BAD_REQUEST, e.to_string()))?;
    let sets = DataPointSet::from_json(json).map_err(DatastoreError::from)?;

    for set in &sets {
        facade.datastore.put_data_points(&domain, set);
    }

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct QueriesResponse {
    queries: Vec<crate::datastore::QueryOutcome>,
}

async fn query_database<S: KvStore>(
    State(facade): State<Facade<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<QueriesResponse>, Error> {
    let domain = facade.authorize(&headers, "POST", "/api/v1/datapoints/query", &body, "read")?;

    let request: QueryRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::Message(StatusCode::BAD_REQUEST, e.to_string()))?;
    let (start, end) = request.time_interval(facade.datastore.schema().now());

    let queries = request
        .metrics
        .iter()
        .map(|metric| facade.datastore.query(&domain, metric, start, end))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(QueriesResponse { queries }))
}

async fn query_metric_tags<S: KvStore>(
    State(facade): State<Facade<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, Error> {
    let domain = facade.authorize(
        &headers,
        "POST",
        "/api/v1/datapoints/query/tags",
        &body,
        "read",
    )?;

    let request: QueryRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::Message(StatusCode::BAD_REQUEST, e.to_string()))?;
    let (start, end) = request.time_interval(facade.datastore.schema().now());

    let results = request
        .metrics
        .iter()
        .map(|metric| {
            facade
                .datastore
                .query_metric_tags(&domain, metric, start, end)
                .map(|tags| serde_json::json!({ "name": metric.name, "tags": tags }))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(serde_json::json!({ "results": results })))
}

async fn delete_datapoints<S: KvStore>(
    State(facade): State<Facade<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, Error> {
    let domain = facade.authorize(
        &headers,
        "POST",
        "/api/v1/datapoints/delete",
        &body,
        "write",
    )?;

    let request: QueryRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::Message(StatusCode::BAD_REQUEST, e.to_string()))?;

    for metric in &request.metrics {
        facade.datastore.delete_data_points(&domain, metric)?;
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn get_metric_names<S: KvStore>(
    State(facade): State<Facade<S>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, Error> {
    let domain = facade.authorize(&headers, "GET", "/api/v1/metricnames", b"", "read")?;
    let names = facade.datastore.get_metric_names(&domain)?;
    Ok(Json(serde_json::json!({ "results": names })))
}

async fn get_tag_names<S: KvStore>(
    State(facade): State<Facade<S>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, Error> {
    let domain = facade.authorize(&headers, "GET", "/api/v1/tagnames", b"", "read")?;
    let names = facade.datastore.get_tag_names(&domain)?;
    Ok(Json(serde_json::json!({ "results": names })))
}

async fn get_tag_values<S: KvStore>(
    State(facade): State<Facade<S>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, Error> {
    let domain = facade.authorize(&headers, "GET", "/api/v1/tagvalues", b"", "read")?;
    let values = facade.datastore.get_tag_values(&domain)?;
    Ok(Json(serde_json::json!({ "results": values })))
}

async fn get_version() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

pub fn router<S: KvStore>(facade: Facade<S>, permissive_cors: bool) -> Router {
    Router::new()
        .route("/api/v1/datapoints", post(add_datapoints::<S>))
        .route("/api/v1/datapoints/query", post(query_database::<S>))
        .route("/api/v1/datapoints/query/tags", post(query_metric_tags::<S>))
        .route("/api/v1/datapoints/delete", post(delete_datapoints::<S>))
        .route("/api/v1/metricnames", get(get_metric_names::<S>))
        .route("/api/v1/tagnames", get(get_tag_names::<S>))
        .route("/api/v1/tagvalues", get(get_tag_values::<S>))
        .route("/api/v1/version", get(get_version))
        .with_state(facade)
        .layer(
            trace::TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(if permissive_cors {
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
        })
}

/// Serve the API until the socket closes or the task is aborted.
pub async fn serve<S: KvStore>(
    config: ServeConfig,
    datastore: Arc<Datastore<S>>,
    credentials: HashMap<String, Credential>,
) -> Result<(), crate::prelude::Error> {
    let facade = Facade {
        datastore,
        credentials: Arc::new(credentials),
    };

    let app = router(facade, config.permissive_cors.unwrap_or_default());

    let listener = tokio::net::TcpListener::bind(config.listen_address)
        .await
        .map_err(crate::prelude::Error::IO)?;

    tracing::info!(address = %config.listen_address, "serving http api");

    axum::serve(listener, app)
        .await
        .map_err(crate::prelude::Error::server)
}
