use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use distribution_api::{
    DistributeRequest, DistributionApi, DistributionReport, NoStatsSource, SnapshotFileSource,
    UnknownProduct, API_CONTRACT_VERSION,
};
use distribution_core::{DistributionError, NormalizedStores};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::filter::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: DistributionApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    kind: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ProductDistributeRequest {
    quantity: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct NormalizeRequest {
    #[serde(default)]
    stores: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    stats_source: bool,
}

#[derive(Debug, Parser)]
#[command(name = "distribution-service")]
#[command(about = "Local HTTP service for store distribution runs")]
struct Args {
    /// Snapshot file with store statistics keyed by product (JSON or YAML).
    #[arg(long)]
    stats: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Log filter in `EnvFilter` syntax. `RUST_LOG` wins when set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(status: StatusCode, kind: &'static str, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            kind,
            error: message.into(),
        }
    }

    /// Map an API failure onto a status code by its concrete error type.
    fn classify(err: &anyhow::Error) -> ServiceError {
        let (status, kind) = if let Some(core) = err.downcast_ref::<DistributionError>() {
            match core {
                DistributionError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
                DistributionError::Invariant(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "invariant")
                }
            }
        } else if err.downcast_ref::<UnknownProduct>().is_some() {
            (StatusCode::NOT_FOUND, "unknown_product")
        } else if err.downcast_ref::<NoStatsSource>().is_some() {
            (StatusCode::SERVICE_UNAVAILABLE, "no_stats_source")
        } else {
            (StatusCode::BAD_GATEWAY, "upstream")
        };

        if status.is_server_error() {
            tracing::error!(kind, "request failed: {err:#}");
        } else {
            tracing::debug!(kind, "request rejected: {err:#}");
        }
        Self::error(status, kind, format!("{err:#}"))
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/distribute", post(distribute))
        .route("/v1/products/:product_id/distribute", post(distribute_product))
        .route("/v1/normalize", post(normalize))
        .with_state(state)
}

fn init_log(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
    {
        eprintln!("failed to init logger: {err}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_log(&args.log_level);

    let api = match args.stats {
        Some(path) => DistributionApi::with_source(Arc::new(SnapshotFileSource::new(path))),
        None => DistributionApi::new(),
    };
    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "distribution service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Allocation runs block on the per-product lock and on snapshot I/O, so they
/// run off the async workers.
async fn run_blocking<F>(job: F) -> Result<DistributionReport, ServiceError>
where
    F: FnOnce() -> Result<DistributionReport> + Send + 'static,
{
    match tokio::task::spawn_blocking(job).await {
        Ok(Ok(report)) => Ok(report),
        Ok(Err(err)) => Err(ServiceState::classify(&err)),
        Err(err) => Err(ServiceState::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            format!("distribution task failed: {err}"),
        )),
    }
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok", stats_source: state.api.has_source() }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn distribute(
    State(state): State<ServiceState>,
    Json(request): Json<DistributeRequest>,
) -> Result<Json<ServiceEnvelope<DistributionReport>>, ServiceError> {
    let report = run_blocking(move || state.api.distribute(&request)).await?;
    Ok(Json(envelope(report)))
}

async fn distribute_product(
    State(state): State<ServiceState>,
    Path(product_id): Path<String>,
    Json(request): Json<ProductDistributeRequest>,
) -> Result<Json<ServiceEnvelope<DistributionReport>>, ServiceError> {
    let report =
        run_blocking(move || state.api.distribute_product(&product_id, &request.quantity)).await?;
    Ok(Json(envelope(report)))
}

async fn normalize(
    State(state): State<ServiceState>,
    Json(request): Json<NormalizeRequest>,
) -> Json<ServiceEnvelope<NormalizedStores>> {
    Json(envelope(state.api.normalize_preview(&request.stores)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use distribution_api::InMemorySource;
    use http::Request;
    use tower::ServiceExt;

    fn bakery_state() -> ServiceState {
        let source = InMemorySource::new().with_product(
            "rye-loaf",
            vec![
                serde_json::json!({"storeId": 1, "stockNow": 0, "normTarget": 10}),
                serde_json::json!({"store_id": 2, "current_stock": 5, "stock_norm": 10}),
            ],
        );
        ServiceState { api: DistributionApi::with_source(Arc::new(source)) }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(router: Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string())),
            None => builder.body(axum::body::Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let response = send(app(bakery_state()), "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value.pointer("/data/stats_source"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let response = send(app(bakery_state()), "GET", "/v1/openapi", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/products/{product_id}/distribute"));
        assert!(body.contains("/v1/normalize"));
    }

    #[tokio::test]
    async fn inline_distribution_places_every_unit() {
        let payload = serde_json::json!({
            "productId": "rye-loaf",
            "quantity": 16,
            "stores": [
                {"storeId": 1, "stockNow": 0, "normTarget": 10},
                {"storeId": 2, "stockNow": 5, "normTarget": 10}
            ]
        });
        let response = send(app(bakery_state()), "POST", "/v1/distribute", Some(payload)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value.pointer("/api_contract_version"), Some(&serde_json::json!("api.v1")));
        assert_eq!(value.pointer("/data/distributed/1"), Some(&serde_json::json!(11)));
        assert_eq!(value.pointer("/data/distributed/2"), Some(&serde_json::json!(5)));
        assert_eq!(value.pointer("/data/remaining"), Some(&serde_json::json!(0)));
    }

    #[tokio::test]
    async fn product_distribution_uses_configured_source() {
        let router = app(bakery_state());
        let response = send(
            router,
            "POST",
            "/v1/products/rye-loaf/distribute",
            Some(serde_json::json!({"quantity": 5})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        // Hygiene 1 to store 1; needs 9 and 5 against 4 left: floor shares 2 and 1;
        // the last unit goes to store 1 by input order.
        assert_eq!(value.pointer("/data/distributed/1"), Some(&serde_json::json!(4)));
        assert_eq!(value.pointer("/data/distributed/2"), Some(&serde_json::json!(1)));
        assert_eq!(
            value.pointer("/data/trace/deficitMode"),
            Some(&serde_json::json!("proportional"))
        );
    }

    #[tokio::test]
    async fn validation_errors_map_to_bad_request() {
        let router = app(bakery_state());
        let empty = serde_json::json!({"productId": "rye-loaf", "quantity": 10, "stores": []});
        let response = send(router.clone(), "POST", "/v1/distribute", Some(empty)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(value.get("kind").and_then(Value::as_str), Some("validation"));

        let negative = serde_json::json!({"quantity": -1});
        let response =
            send(router, "POST", "/v1/products/rye-loaf/distribute", Some(negative)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_product_maps_to_not_found() {
        let response = send(
            app(bakery_state()),
            "POST",
            "/v1/products/eclair/distribute",
            Some(serde_json::json!({"quantity": 3})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let value = response_json(response).await;
        assert_eq!(value.get("kind").and_then(Value::as_str), Some("unknown_product"));
    }

    #[tokio::test]
    async fn product_route_without_source_is_unavailable() {
        let state = ServiceState { api: DistributionApi::new() };
        let response = send(
            app(state),
            "POST",
            "/v1/products/rye-loaf/distribute",
            Some(serde_json::json!({"quantity": 3})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unreadable_snapshot_maps_to_bad_gateway() {
        let missing = std::env::temp_dir()
            .join(format!("distribution-service-{}.json", ulid::Ulid::new()));
        let state = ServiceState {
            api: DistributionApi::with_source(Arc::new(SnapshotFileSource::new(missing))),
        };
        let response = send(
            app(state),
            "POST",
            "/v1/products/rye-loaf/distribute",
            Some(serde_json::json!({"quantity": 3})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let value = response_json(response).await;
        assert_eq!(value.get("kind").and_then(Value::as_str), Some("upstream"));
    }

    #[test]
    fn invariant_failures_map_to_internal_error() {
        let err = anyhow::Error::new(DistributionError::Invariant("lost units".to_string()));
        let mapped = ServiceState::classify(&err);
        assert_eq!(mapped.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(mapped.kind, "invariant");
    }

    #[tokio::test]
    async fn normalize_reports_issues_without_allocating() {
        let payload = serde_json::json!({
            "stores": [
                {"storeId": 1, "stockNow": "7"},
                {"stockNow": 2},
                "not a record"
            ]
        });
        let response = send(app(bakery_state()), "POST", "/v1/normalize", Some(payload)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value.pointer("/data/stores/0/stockNow"), Some(&serde_json::json!(7)));
        assert_eq!(
            value.pointer("/data/issues").and_then(Value::as_array).map(Vec::len),
            Some(2)
        );
    }
}
