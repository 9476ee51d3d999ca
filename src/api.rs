//! REST API for the placement engine.
//!
//! Exposes the scene and the engine operations over HTTP. Uses Axum as the
//! web framework and supports CORS.
//!
//! The scene lives behind a mutex; long-running work (annealing, the packing
//! pipelines) runs on a working copy that is written back when it finishes.
//! While such a run is active every mutating endpoint answers 409.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Router,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
};
use log::{error, info};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
use serde_json::json;
use std::sync::OnceLock;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use utoipa::{OpenApi, ToSchema};

use crate::compaction::{global_compaction, shake_and_settle};
use crate::config::ApiConfig;
use crate::engine::EngineConfig;
use crate::error::EngineError;
use crate::geometry::Pose;
use crate::model::{Layout, ObjectId, ObjectKind, ObjectSpec, PlacedObject, Scene, ZoneId};
use crate::optimizer::{AnnealConfig, AnnealReport, AnnealState, Annealer, CancelToken};
use crate::penetration::relocate;
use crate::pipeline::{self, PackOutcome, PackReport};
use crate::placement::{PlacementOptions, Scoring, place_with_fallback, rescue_to_staging};
use crate::types::Vec3;
use crate::voxel::{self, VoidReport, VoxelScore};

#[derive(Clone)]
struct ApiState {
    scene: Arc<Mutex<Scene>>,
    engine: EngineConfig,
    anneal: AnnealConfig,
    /// Cancel token of the active run, if any.
    active_run: Arc<Mutex<Option<CancelToken>>>,
}

impl ApiState {
    fn new(layout: Layout, engine: EngineConfig, anneal: AnnealConfig) -> Self {
        Self {
            scene: Arc::new(Mutex::new(Scene::new(layout))),
            engine,
            anneal,
            active_run: Arc::new(Mutex::new(None)),
        }
    }

    fn scene(&self) -> MutexGuard<'_, Scene> {
        self.scene.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_run(&self) -> MutexGuard<'_, Option<CancelToken>> {
        self.active_run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_busy(&self) -> bool {
        self.active_run().is_some()
    }

    /// Marks a run as active. Fails with 409 when another run holds the slot.
    fn begin_run(&self) -> Result<RunGuard, Response> {
        let mut slot = self.active_run();
        if slot.is_some() {
            return Err(busy_error());
        }
        let token = CancelToken::new();
        *slot = Some(token.clone());
        Ok(RunGuard {
            slot: Arc::clone(&self.active_run),
            token,
        })
    }

    /// Locks the scene for a mutation, or 409 while a run is active.
    ///
    /// The busy check happens under the scene lock. Runs claim the slot before
    /// they clone the scene, so a mutation that passes the check is always
    /// part of the run's working copy.
    fn idle_scene(&self) -> Result<MutexGuard<'_, Scene>, Response> {
        let scene = self.scene();
        if self.is_busy() {
            return Err(busy_error());
        }
        Ok(scene)
    }
}

/// Runs `work` against the idle scene on the blocking pool.
async fn with_idle_scene<T, F>(state: &ApiState, work: F) -> Result<T, Response>
where
    F: FnOnce(&mut Scene, &EngineConfig) -> Result<T, Response> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let mut scene = state.idle_scene()?;
        work(&mut *scene, &state.engine)
    })
    .await;
    match joined {
        Ok(result) => result,
        Err(err) => Err(internal_error(err.to_string())),
    }
}

/// Releases the active-run slot when dropped.
struct RunGuard {
    slot: Arc<Mutex<Option<CancelToken>>>,
    token: CancelToken,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

static OPENAPI_DOC: OnceLock<utoipa::openapi::OpenApi> = OnceLock::new();

// SRI hashes verified against https://unpkg.com/swagger-ui-dist@5.17.14/ on 2025-10-29.
const SWAGGER_UI_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
    <head>
        <meta charset="utf-8" />
        <title>stow-it API Docs</title>
        <link
            rel="stylesheet"
            href="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui.css"
            integrity="sha384-wxLW6kwyHktdDGr6Pv1zgm/VGJh99lfUbzSn6HNHBENZlCN7W602k9VkGdxuFvPn"
            crossorigin="anonymous"
        />
    </head>
    <body>
        <div id="swagger-ui"></div>
        <script
            src="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui-bundle.js"
            integrity="sha384-wmyclcVGX/WhUkdkATwhaK1X1JtiNrr2EoYJ+diV3vj4v6OC5yCeSu+yW13SYJep"
            crossorigin="anonymous"
        ></script>
        <script
            src="https://unpkg.com/swagger-ui-dist@5.17.14/swagger-ui-standalone-preset.js"
            integrity="sha384-2YH8WDRaj7V2OqU/trsmzSagmk/E2SutiCsGkdgoQwC9pNUJV1u/141DHB6jgs8t"
            crossorigin="anonymous"
        ></script>
        <script>
            window.onload = function () {
                const ui = SwaggerUIBundle({
                    url: "/docs/openapi.json",
                    dom_id: "#swagger-ui",
                    presets: [SwaggerUIBundle.presets.apis, SwaggerUIStandalonePreset],
                    layout: "StandaloneLayout",
                });
                window.ui = ui;
            };
        </script>
    </body>
    </html>"##;

fn openapi_doc() -> &'static utoipa::openapi::OpenApi {
    OPENAPI_DOC.get_or_init(ApiDoc::openapi)
}

/// Read-only projection of an object for renderers.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ObjectView {
    pub id: ObjectId,
    pub kind: ObjectKind,
    #[schema(value_type = Vec<f64>)]
    pub dimensions: (f64, f64, f64),
    #[schema(example = json!([0.0, 5.0, 0.0]))]
    pub position: [f64; 3],
    /// Rotation about the vertical axis, in radians.
    pub yaw: f64,
    /// `None` when the position lies in neither zone.
    pub zone: Option<ZoneId>,
    pub color_tag: Option<String>,
}

impl ObjectView {
    fn of(object: &PlacedObject, layout: &Layout) -> Self {
        let p = object.pose.position;
        Self {
            id: object.id,
            kind: object.spec.kind,
            dimensions: object.spec.dimensions,
            position: [p.x, p.y, p.z],
            yaw: object.pose.yaw,
            zone: layout.zone_of(&p),
            color_tag: object.spec.color_tag.clone(),
        }
    }
}

/// Target pose of a user relocation.
#[derive(Deserialize, ToSchema, Debug, Clone)]
pub struct MoveRequest {
    #[schema(example = json!([10.0, 20.0, -5.0]))]
    pub position: [f64; 3],
    /// Keeps the current yaw when absent.
    #[serde(default)]
    pub yaw: Option<f64>,
}

/// Options of a container placement. Every field is optional.
#[derive(Deserialize, ToSchema, Debug, Clone, Default)]
#[serde(default)]
pub struct PlaceRequest {
    pub step_scale: Option<f64>,
    pub padding: Option<f64>,
    pub scoring: Option<Scoring>,
}

/// Overrides for an annealing or packing run.
#[derive(Deserialize, ToSchema, Debug, Clone, Default)]
#[serde(default)]
pub struct RunRequest {
    pub steps: Option<usize>,
    pub seed: Option<u64>,
}

/// Compaction passes and shake iterations.
#[derive(Deserialize, ToSchema, Debug, Clone)]
#[serde(default)]
pub struct CompactRequest {
    pub passes: usize,
    pub shake: usize,
    pub seed: Option<u64>,
}

impl Default for CompactRequest {
    fn default() -> Self {
        Self {
            passes: 2,
            shake: 1,
            seed: None,
        }
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub struct PlacementResponse {
    pub zone: ZoneId,
    pub object: ObjectView,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct OptimizeResponse {
    pub state: AnnealState,
    pub steps_run: usize,
    pub accepted: usize,
    pub start_energy: f64,
    pub best_energy: f64,
    /// Number of sampled timeline frames.
    pub timeline_frames: usize,
}

impl From<&AnnealReport> for OptimizeResponse {
    fn from(report: &AnnealReport) -> Self {
        Self {
            state: report.state,
            steps_run: report.steps_run,
            accepted: report.accepted,
            start_energy: report.start_energy,
            best_energy: report.best_energy,
            timeline_frames: report.timeline.len(),
        }
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub struct CompactResponse {
    pub moves: usize,
    pub void: VoidReport,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct CancelResponse {
    /// Whether a run was active and has been asked to stop.
    pub cancelled: bool,
}

#[derive(Serialize, ToSchema)]
struct ErrorResponse {
    error: String,
    details: String,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: details.into(),
        }
    }
}

fn error_response(status: StatusCode, error: impl Into<String>, details: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(error, details))).into_response()
}

fn json_deserialize_error(err: JsonRejection) -> Response {
    error_response(StatusCode::UNPROCESSABLE_ENTITY, "Invalid JSON data", err.to_string())
}

fn validation_error(details: impl Into<String>) -> Response {
    error_response(StatusCode::UNPROCESSABLE_ENTITY, "Invalid input data", details)
}

fn busy_error() -> Response {
    error_response(
        StatusCode::CONFLICT,
        "optimizer_busy",
        "An optimization run is active; cancel it or wait for it to finish",
    )
}

fn engine_error(err: EngineError) -> Response {
    let status = match err {
        EngineError::DegenerateGeometry(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::UnknownObject(_) => StatusCode::NOT_FOUND,
        EngineError::PlacementFailed { .. } | EngineError::ResidualOverlap { .. } => StatusCode::CONFLICT,
    };
    error_response(status, err.code(), err.to_string())
}

fn internal_error(details: impl Into<String>) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error", details)
}

fn parse_json<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    payload.map(|Json(value)| value).map_err(json_deserialize_error)
}

fn view_of(scene: &Scene, id: ObjectId) -> Result<ObjectView, Response> {
    scene
        .require(id)
        .map(|object| ObjectView::of(object, &scene.layout))
        .map_err(engine_error)
}

fn anneal_config(base: &AnnealConfig, request: &RunRequest) -> AnnealConfig {
    let mut config = *base;
    if let Some(steps) = request.steps {
        config.steps = steps;
    }
    if request.seed.is_some() {
        config.seed = request.seed;
    }
    config
}

#[derive(OpenApi)]
#[openapi(
    paths(
        list_objects,
        create_object,
        delete_object,
        clear_objects,
        move_object,
        place_object,
        measure_void,
        optimize,
        optimize_stream,
        cancel_optimize,
        compact,
        auto_pack,
        pack_max
    ),
    components(
        schemas(
            ObjectSpec,
            ObjectKind,
            ObjectView,
            ZoneId,
            MoveRequest,
            PlaceRequest,
            Scoring,
            RunRequest,
            CompactRequest,
            PlacementResponse,
            OptimizeResponse,
            CompactResponse,
            CancelResponse,
            ErrorResponse,
            VoidReport,
            VoxelScore,
            AnnealState,
            PackOutcome,
            PackReport
        )
    ),
    tags(
        (name = "objects", description = "Object set and manual placement"),
        (name = "optimization", description = "Scoring, annealing and packing pipelines")
    )
)]
struct ApiDoc;

fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new().allow_methods(Any).allow_origin(Any).allow_headers(Any);

    Router::new()
        .route("/objects", get(list_objects).post(create_object).delete(clear_objects))
        .route("/objects/{id}", delete(delete_object))
        .route("/objects/{id}/move", post(move_object))
        .route("/objects/{id}/place", post(place_object))
        .route("/void", get(measure_void))
        .route("/optimize", post(optimize))
        .route("/optimize_stream", post(optimize_stream))
        .route("/optimize/cancel", post(cancel_optimize))
        .route("/compact", post(compact))
        .route("/auto_pack", post(auto_pack))
        .route("/pack_max", post(pack_max))
        // API documentation
        .route("/docs/openapi.json", get(serve_openapi_json))
        .route("/docs", get(serve_openapi_ui))
        .layer(cors)
        .with_state(state)
}

/// Starts the API server and serves until it terminates.
///
/// Configures CORS for cross-origin requests from the renderer.
pub async fn start_api_server(config: ApiConfig, layout: Layout, engine: EngineConfig, anneal: AnnealConfig) {
    let app = router(ApiState::new(layout, engine, anneal));

    let addr = config.socket_addr();
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Could not bind API server to {}: {}", addr, err);
            return;
        }
    };

    info!("Server running on http://{}:{}", config.display_host(), config.port());
    if config.binds_to_all_interfaces() && config.uses_default_host() {
        info!("Local access: http://localhost:{}", config.port());
    }
    info!("Documentation: GET /docs, GET /docs/openapi.json");

    if let Err(err) = axum::serve(listener, app).await {
        error!("API server terminated with an error: {err}");
    }
}

/// Handler for GET /objects.
#[utoipa::path(
    get,
    path = "/objects",
    responses((status = 200, description = "Every object with its pose and zone", body = [ObjectView])),
    tag = "objects"
)]
async fn list_objects(State(state): State<ApiState>) -> Json<Vec<ObjectView>> {
    let scene = state.scene();
    Json(scene.objects.iter().map(|o| ObjectView::of(o, &scene.layout)).collect())
}

/// Handler for POST /objects.
///
/// Builds the object and queues it into the staging zone.
#[utoipa::path(
    post,
    path = "/objects",
    request_body = ObjectSpec,
    responses(
        (status = 201, description = "Object created in the staging zone", body = ObjectView),
        (status = UNPROCESSABLE_ENTITY, description = "Degenerate dimensions or invalid JSON", body = ErrorResponse),
        (status = CONFLICT, description = "Staging is full or an optimization run is active", body = ErrorResponse)
    ),
    tag = "objects"
)]
async fn create_object(State(state): State<ApiState>, payload: Result<Json<ObjectSpec>, JsonRejection>) -> Response {
    let spec = match parse_json(payload) {
        Ok(spec) => spec,
        Err(response) => return response,
    };
    let mut scene = match state.idle_scene() {
        Ok(scene) => scene,
        Err(response) => return response,
    };
    let start = Pose::new(scene.layout.staging.aabb().center(), 0.0);
    let id = match scene.add(spec, start) {
        Ok(id) => id,
        Err(err) => return engine_error(err),
    };
    if let Err(err) = rescue_to_staging(&mut scene, id, &state.engine) {
        let _ = scene.remove(id);
        return engine_error(err);
    }
    if let Some(object) = scene.get(id) {
        info!("created {} object {}", object.shape.kind_name(), id);
    }
    match view_of(&scene, id) {
        Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
        Err(response) => response,
    }
}

/// Handler for DELETE /objects/{id}.
#[utoipa::path(
    delete,
    path = "/objects/{id}",
    params(("id" = u64, Path, description = "Object id")),
    responses(
        (status = 204, description = "Object deleted"),
        (status = NOT_FOUND, description = "Unknown object", body = ErrorResponse),
        (status = CONFLICT, description = "An optimization run is active", body = ErrorResponse)
    ),
    tag = "objects"
)]
async fn delete_object(State(state): State<ApiState>, Path(id): Path<ObjectId>) -> Response {
    let mut scene = match state.idle_scene() {
        Ok(scene) => scene,
        Err(response) => return response,
    };
    match scene.remove(id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => engine_error(err),
    }
}

/// Handler for DELETE /objects.
#[utoipa::path(
    delete,
    path = "/objects",
    responses(
        (status = 204, description = "All objects deleted"),
        (status = CONFLICT, description = "An optimization run is active", body = ErrorResponse)
    ),
    tag = "objects"
)]
async fn clear_objects(State(state): State<ApiState>) -> Response {
    match state.idle_scene() {
        Ok(mut scene) => scene.clear(),
        Err(response) => return response,
    }
    StatusCode::NO_CONTENT.into_response()
}

/// Handler for POST /objects/{id}/move.
///
/// Clamps the target into its zone, settles it and resolves penetration.
/// A relocation that cannot be separated is rejected and the object stays
/// where it was.
#[utoipa::path(
    post,
    path = "/objects/{id}/move",
    params(("id" = u64, Path, description = "Object id")),
    request_body = MoveRequest,
    responses(
        (status = 200, description = "Legal pose after relocation", body = ObjectView),
        (status = NOT_FOUND, description = "Unknown object", body = ErrorResponse),
        (status = UNPROCESSABLE_ENTITY, description = "Non-finite target", body = ErrorResponse),
        (status = CONFLICT, description = "Residual overlap or an active optimization run", body = ErrorResponse)
    ),
    tag = "objects"
)]
async fn move_object(
    State(state): State<ApiState>,
    Path(id): Path<ObjectId>,
    payload: Result<Json<MoveRequest>, JsonRejection>,
) -> Response {
    let request = match parse_json(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let [x, y, z] = request.position;
    let target = Vec3::new(x, y, z);
    if !target.is_finite() || request.yaw.is_some_and(|yaw| !yaw.is_finite()) {
        return validation_error("position and yaw must be finite numbers");
    }
    let mut scene = match state.idle_scene() {
        Ok(scene) => scene,
        Err(response) => return response,
    };
    let yaw = match scene.pose_of(id) {
        Ok(pose) => request.yaw.unwrap_or(pose.yaw),
        Err(err) => return engine_error(err),
    };
    if let Err(err) = relocate(&mut scene, id, Pose::new(target, yaw), &state.engine) {
        return engine_error(err);
    }
    match view_of(&scene, id) {
        Ok(view) => Json(view).into_response(),
        Err(response) => response,
    }
}

/// Handler for POST /objects/{id}/place.
///
/// Container search with staging fallback.
#[utoipa::path(
    post,
    path = "/objects/{id}/place",
    params(("id" = u64, Path, description = "Object id")),
    request_body = PlaceRequest,
    responses(
        (status = 200, description = "Zone and pose the object ended up in", body = PlacementResponse),
        (status = NOT_FOUND, description = "Unknown object", body = ErrorResponse),
        (status = UNPROCESSABLE_ENTITY, description = "Invalid options", body = ErrorResponse),
        (status = CONFLICT, description = "Neither zone has room, or an optimization run is active", body = ErrorResponse)
    ),
    tag = "objects"
)]
async fn place_object(
    State(state): State<ApiState>,
    Path(id): Path<ObjectId>,
    payload: Result<Json<PlaceRequest>, JsonRejection>,
) -> Response {
    let request = match parse_json(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let defaults = PlacementOptions::default();
    let options = PlacementOptions::new(
        request.step_scale.unwrap_or(defaults.step_scale),
        request.padding.unwrap_or(defaults.padding),
        request.scoring.unwrap_or(defaults.scoring),
    );
    if !(options.step_scale.is_finite() && options.step_scale > 0.0) {
        return validation_error("step_scale must be greater than 0");
    }
    if !(options.padding.is_finite() && options.padding >= 0.0) {
        return validation_error("padding must not be negative");
    }

    let placed = with_idle_scene(&state, move |scene, engine| {
        let (zone, _) = place_with_fallback(scene, id, &options, engine).map_err(engine_error)?;
        let object = view_of(scene, id)?;
        Ok(PlacementResponse { zone, object })
    })
    .await;
    match placed {
        Ok(body) => Json(body).into_response(),
        Err(response) => response,
    }
}

/// Handler for GET /void.
///
/// Container void report plus fragmentation and energy, at quality settings.
#[utoipa::path(
    get,
    path = "/void",
    responses((status = 200, description = "Container packing quality", body = VoxelScore)),
    tag = "optimization"
)]
async fn measure_void(State(state): State<ApiState>) -> Json<VoxelScore> {
    let scene = state.scene();
    Json(voxel::score(&scene, ZoneId::Container, &state.engine))
}

/// Handler for POST /optimize.
///
/// Runs annealing on a working copy and writes the best snapshot back.
#[utoipa::path(
    post,
    path = "/optimize",
    request_body = RunRequest,
    responses(
        (status = 200, description = "Run summary", body = OptimizeResponse),
        (status = CONFLICT, description = "Another run is active", body = ErrorResponse)
    ),
    tag = "optimization"
)]
async fn optimize(State(state): State<ApiState>, payload: Result<Json<RunRequest>, JsonRejection>) -> Response {
    let request = match parse_json(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let guard = match state.begin_run() {
        Ok(guard) => guard,
        Err(response) => return response,
    };
    let config = anneal_config(&state.anneal, &request);
    let engine = state.engine;
    let mut working = state.scene().clone();
    let token = guard.token.clone();

    let joined = tokio::task::spawn_blocking(move || {
        Annealer::new(config, engine, token).run(&mut working, |_| {})
    })
    .await;

    let response = match joined {
        Ok(Ok(report)) => {
            state.scene().restore(&report.best);
            Json(OptimizeResponse::from(&report)).into_response()
        }
        Ok(Err(err)) => engine_error(err),
        Err(err) => internal_error(err.to_string()),
    };
    drop(guard);
    response
}

/// Handler for POST /optimize_stream (SSE).
///
/// Streams annealing events in real-time as Server-Sent Events
/// (text/event-stream). The best snapshot is written back before the
/// `Finished` event is sent.
#[utoipa::path(
    post,
    path = "/optimize_stream",
    request_body = RunRequest,
    responses(
        (
            status = 200,
            description = "Streams annealing events in real-time",
            content_type = "text/event-stream",
            body = String
        ),
        (status = CONFLICT, description = "Another run is active", body = ErrorResponse)
    ),
    tag = "optimization"
)]
async fn optimize_stream(State(state): State<ApiState>, payload: Result<Json<RunRequest>, JsonRejection>) -> Response {
    let request = match parse_json(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let guard = match state.begin_run() {
        Ok(guard) => guard,
        Err(response) => return response,
    };
    let config = anneal_config(&state.anneal, &request);
    let engine = state.engine;
    let mut working = state.scene().clone();
    let shared = Arc::clone(&state.scene);

    let (tx, rx) = mpsc::channel::<String>(32);

    tokio::task::spawn_blocking(move || {
        let send = |json: String| {
            // Receiver has closed the stream; remaining events are discarded.
            let _ = tx.blocking_send(json);
        };
        let mut annealer = Annealer::new(config, engine, guard.token.clone());
        if let Ok(json) = serde_json::to_string(&annealer.start(&working)) {
            send(json);
        }
        while annealer.should_continue(&working) {
            match annealer.step(&mut working) {
                Ok(Some(event)) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        send(json);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    error!("streamed annealing aborted: {}", err);
                    break;
                }
            }
        }
        let (report, finished) = annealer.finish(&mut working);
        shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .restore(&report.best);
        drop(guard);
        if let Ok(json) = serde_json::to_string(&finished) {
            send(json);
        }
    });

    let stream = ReceiverStream::new(rx).map(|msg| Ok::<_, std::convert::Infallible>(Event::default().data(msg)));
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(std::time::Duration::from_secs(10))
                .text("keep-alive"),
        )
        .into_response()
}

/// Handler for POST /optimize/cancel.
///
/// Cancellation is cooperative; the run stops at its next step boundary.
#[utoipa::path(
    post,
    path = "/optimize/cancel",
    responses((status = 200, description = "Whether a run was asked to stop", body = CancelResponse)),
    tag = "optimization"
)]
async fn cancel_optimize(State(state): State<ApiState>) -> Json<CancelResponse> {
    let cancelled = match state.active_run().as_ref() {
        Some(token) => {
            token.cancel();
            true
        }
        None => false,
    };
    if cancelled {
        info!("optimization run cancelled by request");
    }
    Json(CancelResponse { cancelled })
}

/// Handler for POST /compact.
#[utoipa::path(
    post,
    path = "/compact",
    request_body = CompactRequest,
    responses(
        (status = 200, description = "Kept moves and the resulting void", body = CompactResponse),
        (status = CONFLICT, description = "An optimization run is active", body = ErrorResponse)
    ),
    tag = "optimization"
)]
async fn compact(State(state): State<ApiState>, payload: Result<Json<CompactRequest>, JsonRejection>) -> Response {
    let request = match parse_json(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let mut rng = match request.seed.or(state.anneal.seed) {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let compacted = with_idle_scene(&state, move |scene, engine| {
        let moves = global_compaction(scene, request.passes, &mut rng, engine).map_err(engine_error)?;
        shake_and_settle(scene, request.shake, &mut rng, engine).map_err(engine_error)?;
        let void = voxel::measure_void(scene, ZoneId::Container, engine);
        Ok(CompactResponse { moves, void })
    })
    .await;
    match compacted {
        Ok(body) => Json(body).into_response(),
        Err(response) => response,
    }
}

/// Which packing flow a request runs.
#[derive(Clone, Copy, Debug)]
enum Flow {
    AutoPack,
    PackMax,
}

async fn run_flow(state: ApiState, request: RunRequest, flow: Flow) -> Response {
    let guard = match state.begin_run() {
        Ok(guard) => guard,
        Err(response) => return response,
    };
    let config = anneal_config(&state.anneal, &request);
    let engine = state.engine;
    let mut working = state.scene().clone();
    let shared = Arc::clone(&state.scene);
    let runtime = tokio::runtime::Handle::current();

    // Pipelines yield only between objects, so they run off the async workers.
    let joined = tokio::task::spawn_blocking(move || {
        let token = guard.token.clone();
        let result: Result<PackReport, EngineError> = runtime.block_on(async {
            match flow {
                Flow::AutoPack => pipeline::auto_pack(&mut working, &engine, &config, &token).await,
                Flow::PackMax => pipeline::pack_to_the_max(&mut working, &engine, &config, &token).await,
            }
        });
        if result.is_ok() {
            shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .restore(&working.snapshot());
        }
        drop(guard);
        result
    })
    .await;

    match joined {
        Ok(Ok(report)) => Json(report).into_response(),
        Ok(Err(err)) => engine_error(err),
        Err(err) => internal_error(err.to_string()),
    }
}

/// Handler for POST /auto_pack.
///
/// Volume-ranked placement of every object, then compaction and annealing.
#[utoipa::path(
    post,
    path = "/auto_pack",
    request_body = RunRequest,
    responses(
        (status = 200, description = "Where objects ended up and the final void", body = PackReport),
        (status = CONFLICT, description = "Another run is active", body = ErrorResponse)
    ),
    tag = "optimization"
)]
async fn auto_pack(State(state): State<ApiState>, payload: Result<Json<RunRequest>, JsonRejection>) -> Response {
    match parse_json(payload) {
        Ok(request) => run_flow(state, request, Flow::AutoPack).await,
        Err(response) => response,
    }
}

/// Handler for POST /pack_max.
///
/// Staged objects first, a full auto pack, a last pass over leftovers, then
/// shake, reorientation and a second annealing run.
#[utoipa::path(
    post,
    path = "/pack_max",
    request_body = RunRequest,
    responses(
        (status = 200, description = "Where objects ended up and the final void", body = PackReport),
        (status = CONFLICT, description = "Another run is active", body = ErrorResponse)
    ),
    tag = "optimization"
)]
async fn pack_max(State(state): State<ApiState>, payload: Result<Json<RunRequest>, JsonRejection>) -> Response {
    match parse_json(payload) {
        Ok(request) => run_flow(state, request, Flow::PackMax).await,
        Err(response) => response,
    }
}

async fn serve_openapi_json(State(_state): State<ApiState>) -> impl IntoResponse {
    Json(openapi_doc())
}

async fn serve_openapi_ui(State(_state): State<ApiState>) -> impl IntoResponse {
    Html(SWAGGER_UI_HTML)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> ApiState {
        ApiState::new(
            Layout::new(Vec3::splat(30.0), Vec3::splat(60.0), 10.0),
            EngineConfig::default(),
            AnnealConfig::builder().steps(10).seed(Some(1)).build(),
        )
    }

    async fn create(state: &ApiState, spec: ObjectSpec) -> Response {
        create_object(State(state.clone()), Ok(Json(spec))).await
    }

    #[test]
    fn openapi_doc_lists_expected_paths() {
        let doc = openapi_doc();
        let paths = &doc.paths.paths;
        for path in [
            "/objects",
            "/objects/{id}",
            "/objects/{id}/move",
            "/objects/{id}/place",
            "/void",
            "/optimize",
            "/optimize_stream",
            "/optimize/cancel",
            "/compact",
            "/auto_pack",
            "/pack_max",
        ] {
            assert!(paths.contains_key(path), "OpenAPI documentation is missing the {} path", path);
        }
    }

    #[test]
    fn openapi_doc_contains_key_schemas() {
        let doc = openapi_doc();
        let components = doc
            .components
            .as_ref()
            .expect("OpenAPI documentation contains no components");
        let schemas = &components.schemas;
        for name in [
            "ObjectSpec",
            "ObjectView",
            "VoxelScore",
            "PackReport",
            "ErrorResponse",
            "PlaceRequest",
            "Scoring",
        ] {
            assert!(
                schemas.contains_key(name),
                "Expected schema '{}' is missing from OpenAPI spec",
                name
            );
        }
    }

    #[test]
    fn engine_errors_map_to_status_codes() {
        let cases = [
            (EngineError::DegenerateGeometry("width".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (EngineError::UnknownObject(4), StatusCode::NOT_FOUND),
            (
                EngineError::PlacementFailed {
                    id: 1,
                    zone: ZoneId::Staging,
                },
                StatusCode::CONFLICT,
            ),
            (EngineError::ResidualOverlap { id: 1, other: 2 }, StatusCode::CONFLICT),
        ];
        for (err, status) in cases {
            assert_eq!(engine_error(err).status(), status);
        }
    }

    #[test]
    fn object_spec_parses_wire_names() {
        let json = r#"{"kind": "t_l", "dimensions": [3, 3, 3], "color_tag": "red"}"#;
        let spec: ObjectSpec = serde_json::from_str(json).expect("spec should parse");
        assert_eq!(spec.kind, ObjectKind::TetL);
        assert!(!spec.has_cavity);
        assert_eq!(spec.color_tag.as_deref(), Some("red"));
    }

    #[test]
    fn request_bodies_default_missing_fields() {
        let place: PlaceRequest = serde_json::from_str("{}").expect("empty body");
        assert!(place.scoring.is_none());
        let place: PlaceRequest = serde_json::from_str(r#"{"scoring": "heuristic"}"#).expect("scoring");
        assert_eq!(place.scoring, Some(Scoring::Heuristic));
        assert_eq!(serde_json::to_value(Scoring::Energy).expect("scoring"), "energy");
        let compact: CompactRequest = serde_json::from_str("{}").expect("empty body");
        assert_eq!(compact.passes, 2);
        assert_eq!(compact.shake, 1);
    }

    #[test]
    fn run_request_overrides_anneal_defaults() {
        let base = AnnealConfig::default();
        let config = anneal_config(
            &base,
            &RunRequest {
                steps: Some(50),
                seed: Some(9),
            },
        );
        assert_eq!(config.steps, 50);
        assert_eq!(config.seed, Some(9));
        assert_eq!(anneal_config(&base, &RunRequest::default()).steps, base.steps);
    }

    #[tokio::test]
    async fn created_objects_queue_into_staging() {
        let state = test_state();
        for _ in 0..3 {
            let response = create(&state, ObjectSpec::cube(8.0, 8.0, 8.0)).await;
            assert_eq!(response.status(), StatusCode::CREATED);
        }
        let Json(objects) = list_objects(State(state.clone())).await;
        assert_eq!(objects.len(), 3);
        assert!(objects.iter().all(|o| o.zone == Some(ZoneId::Staging)));
    }

    #[tokio::test]
    async fn degenerate_objects_are_rejected() {
        let state = test_state();
        let response = create(&state, ObjectSpec::cube(0.0, 8.0, 8.0)).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(state.scene().is_empty());
    }

    #[tokio::test]
    async fn place_moves_object_into_container() {
        let state = test_state();
        create(&state, ObjectSpec::cube(10.0, 10.0, 10.0)).await;
        let response = place_object(State(state.clone()), Path(1), Ok(Json(PlaceRequest::default()))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let scene = state.scene();
        assert_eq!(scene.ids_in_zone(ZoneId::Container), vec![1]);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let state = test_state();
        let response = delete_object(State(state.clone()), Path(42)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let request = MoveRequest {
            position: [0.0, 5.0, 0.0],
            yaw: None,
        };
        let response = move_object(State(state), Path(42), Ok(Json(request))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mutations_conflict_while_a_run_is_active() {
        let state = test_state();
        let Ok(guard) = state.begin_run() else {
            panic!("run slot should be free");
        };
        assert!(state.begin_run().is_err());
        assert_eq!(create(&state, ObjectSpec::cube(5.0, 5.0, 5.0)).await.status(), StatusCode::CONFLICT);
        assert_eq!(clear_objects(State(state.clone())).await.status(), StatusCode::CONFLICT);

        let Json(cancel) = cancel_optimize(State(state.clone())).await;
        assert!(cancel.cancelled);
        assert!(guard.token.is_cancelled());

        drop(guard);
        assert!(!state.is_busy());
        assert_eq!(create(&state, ObjectSpec::cube(5.0, 5.0, 5.0)).await.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn scene_work_runs_on_the_blocking_pool() {
        let state = test_state();
        let caller = std::thread::current().id();
        let worker = with_idle_scene(&state, |_, _| Ok(std::thread::current().id())).await;
        let Ok(worker) = worker else {
            panic!("idle scene should be available");
        };
        assert_ne!(worker, caller);
    }

    #[tokio::test]
    async fn heavy_mutations_conflict_while_a_run_is_active() {
        let state = test_state();
        create(&state, ObjectSpec::cube(10.0, 10.0, 10.0)).await;
        let before = state.scene().snapshot();
        let Ok(guard) = state.begin_run() else {
            panic!("run slot should be free");
        };
        assert!(state.idle_scene().is_err());

        let response = place_object(State(state.clone()), Path(1), Ok(Json(PlaceRequest::default()))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let response = compact(State(state.clone()), Ok(Json(CompactRequest::default()))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let request = MoveRequest {
            position: [0.0, 5.0, 0.0],
            yaw: None,
        };
        let response = move_object(State(state.clone()), Path(1), Ok(Json(request))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(state.scene().snapshot(), before);

        drop(guard);
        assert!(state.idle_scene().is_ok());
    }

    #[tokio::test]
    async fn auto_pack_writes_back_and_releases_the_slot() {
        let state = test_state();
        create(&state, ObjectSpec::cube(8.0, 8.0, 8.0)).await;
        create(&state, ObjectSpec::cube(6.0, 6.0, 6.0)).await;
        let request = RunRequest {
            steps: Some(5),
            seed: Some(3),
        };
        let response = auto_pack(State(state.clone()), Ok(Json(request))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!state.is_busy());
        assert_eq!(state.scene().ids_in_zone(ZoneId::Container).len(), 2);
    }

    #[tokio::test]
    async fn optimize_releases_the_run_slot() {
        let state = test_state();
        create(&state, ObjectSpec::cube(6.0, 6.0, 6.0)).await;
        place_object(State(state.clone()), Path(1), Ok(Json(PlaceRequest::default()))).await;
        let response = optimize(State(state.clone()), Ok(Json(RunRequest::default()))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!state.is_busy());
    }
}
