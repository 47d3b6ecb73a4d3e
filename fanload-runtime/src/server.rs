use crate::{
    error::{ApiError, RuntimeError},
    registry::{RunRegistry, RunStatus},
};
use axum::{
    extract::{rejection::JsonRejection, Json, Path, Request, State},
    http::HeaderValue,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use fanload::broker::Broker;
use fanload::orchestrator::Batches;
use fanload_core::{HarnessConfig, RunConfig};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
#[allow(unused)]
use tracing::{debug, error, info, instrument, Instrument};
use uuid::Uuid;

pub(crate) const RUN_ID: &str = "x-run-id";
pub(crate) const REQUEST_ID: &str = "x-request-id";

pub(crate) async fn server_task<B: Broker>(
    port: u16,
    state: ServerState<B>,
) -> Result<(), RuntimeError> {
    let app = router(state);

    let socket_addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(socket_addr).await?;

    info!("Listening on {socket_addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

pub(crate) fn router<B: Broker>(state: ServerState<B>) -> Router {
    Router::new()
        .route("/", get(trigger::<B>))
        .route("/run", post(run::<B>))
        .route("/runs/:id", get(status::<B>))
        .with_state(Arc::new(state))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(request_id)),
        )
}

pub(crate) struct ServerState<B> {
    broker: B,
    harness: HarnessConfig,
    registry: RunRegistry,
}

impl<B: Broker> ServerState<B> {
    pub(crate) fn new(broker: B, harness: HarnessConfig) -> Self {
        Self {
            broker,
            harness,
            registry: RunRegistry::default(),
        }
    }

    /// Start `parallel_batch` runs in the background and register them under a new id.
    fn start(&self, harness: &HarnessConfig) -> Result<Uuid, ApiError> {
        let batches = Batches::new(&self.broker, harness)?;
        let id = Uuid::new_v4();
        let subjects = batches
            .runs()
            .iter()
            .map(|run| run.subject().to_string())
            .collect();
        self.registry.start(id, subjects)?;

        let registry = self.registry.clone();
        tokio::spawn(
            async move {
                let results = batches.execute().await;
                if let Err(err) = registry.finish(id, results) {
                    error!("Unable to record results of run {id}: {err}");
                }
            }
            .in_current_span(),
        );
        info!("Started run {id} with {} batches", harness.parallel_batch);
        Ok(id)
    }
}

#[instrument(skip_all)]
async fn trigger<B: Broker>(
    State(state): State<Arc<ServerState<B>>>,
) -> Result<Response, ApiError> {
    let id = state.start(&state.harness)?;
    Ok(started(id))
}

#[instrument(skip_all)]
async fn run<B: Broker>(
    State(state): State<Arc<ServerState<B>>>,
    config: Result<Json<RunConfig>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(config) = config.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    config
        .validate()
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;

    let harness = HarnessConfig {
        run: config,
        ..state.harness.clone()
    };
    let id = state.start(&harness)?;
    Ok(started(id))
}

async fn status<B: Broker>(
    State(state): State<Arc<ServerState<B>>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunStatus>, ApiError> {
    state
        .registry
        .get(&id)?
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

fn started(id: Uuid) -> Response {
    (
        [(RUN_ID, id.to_string())],
        Json(json!({ "Message": "OK !" })),
    )
        .into_response()
}

async fn request_id(request: Request, next: Next) -> Response {
    let id = Uuid::new_v4();
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response.headers_mut().insert(REQUEST_ID, value);
    }
    info!(
        "{method} {uri} ({id}) completed with {} in {:?}",
        response.status(),
        start.elapsed()
    );
    response
}
