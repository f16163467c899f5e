// HTTP surface over the in-memory map state
// Serves the committed sources/layers/popup to a rendering client and accepts commands

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::api::{HttpTransitApi, TransitApi};
use crate::config::{FilterSet, LiveMapConfig};
use crate::live_map::{FollowOutcome, LiveMap};
use crate::sink::MapState;

pub struct AppState<A> {
    pub live_map: Arc<LiveMap<A, MapState>>,
    pub surface: Arc<MapState>,
}

impl<A> Clone for AppState<A> {
    fn clone(&self) -> Self {
        AppState {
            live_map: Arc::clone(&self.live_map),
            surface: Arc::clone(&self.surface),
        }
    }
}

impl<A: TransitApi> AppState<A> {
    pub fn new(api: Arc<A>, config: &LiveMapConfig) -> Self {
        let surface = Arc::new(MapState::new());
        let live_map = Arc::new(LiveMap::new(api, Arc::clone(&surface), config));
        AppState { live_map, surface }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

// ============================================================================
// Map State
// ============================================================================

async fn get_layers<A: TransitApi>(state: web::Data<AppState<A>>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(state.surface.layers()))
}

async fn get_source<A: TransitApi>(
    state: web::Data<AppState<A>>,
    path: web::Path<String>,
) -> HttpResponse {
    let name = path.into_inner();
    match state.surface.source(&name) {
        Some(collection) => HttpResponse::Ok().json(ApiResponse::success(collection)),
        None => HttpResponse::NotFound()
            .json(ApiResponse::<()>::error(format!("Source '{}' not found", name))),
    }
}

async fn get_popup<A: TransitApi>(state: web::Data<AppState<A>>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(state.surface.popup()))
}

// ============================================================================
// Vehicles & Selection
// ============================================================================

async fn get_vehicles<A: TransitApi>(state: web::Data<AppState<A>>) -> HttpResponse {
    let vehicles = state.live_map.vehicles();
    HttpResponse::Ok().json(ApiResponse::success(vehicles.as_slice()))
}

async fn select_vehicle<A: TransitApi>(
    state: web::Data<AppState<A>>,
    path: web::Path<String>,
) -> HttpResponse {
    let vehicle_id = path.into_inner();
    match state.live_map.select(&vehicle_id) {
        Some(selection) => HttpResponse::Ok().json(ApiResponse::success(selection)),
        None => HttpResponse::NotFound().json(ApiResponse::<()>::error(format!(
            "Vehicle '{}' is not on the map",
            vehicle_id
        ))),
    }
}

#[derive(Serialize)]
struct FollowResponse {
    selection: crate::selection::Selection,
    overlay: crate::overlay::OverlayOutcome,
}

async fn follow_vehicle<A: TransitApi>(
    state: web::Data<AppState<A>>,
    path: web::Path<String>,
) -> HttpResponse {
    let vehicle_id = path.into_inner();
    match state.live_map.follow(&vehicle_id).await {
        FollowOutcome::Following { selection, overlay } => {
            HttpResponse::Ok().json(ApiResponse::success(FollowResponse { selection, overlay }))
        }
        FollowOutcome::NotFound => HttpResponse::NotFound().json(ApiResponse::<()>::error(
            format!("Vehicle '{}' is not on the map", vehicle_id),
        )),
    }
}

async fn clear_selection<A: TransitApi>(state: web::Data<AppState<A>>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(state.live_map.clear_selection()))
}

// ============================================================================
// Route Overlay
// ============================================================================

async fn get_route<A: TransitApi>(state: web::Data<AppState<A>>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(state.live_map.route_status()))
}

async fn close_route<A: TransitApi>(state: web::Data<AppState<A>>) -> HttpResponse {
    state.live_map.close_route();
    HttpResponse::Ok().json(ApiResponse::success(state.live_map.route_status()))
}

// ============================================================================
// Filters & Control
// ============================================================================

async fn get_filters<A: TransitApi>(state: web::Data<AppState<A>>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(state.live_map.filters()))
}

async fn put_filters<A: TransitApi>(
    state: web::Data<AppState<A>>,
    filters: web::Json<FilterSet>,
) -> HttpResponse {
    state.live_map.set_filters(filters.into_inner());
    HttpResponse::Ok().json(ApiResponse::success(state.live_map.filters()))
}

async fn force_refresh<A: TransitApi>(state: web::Data<AppState<A>>) -> HttpResponse {
    info!("🔄 Manual refresh requested");
    match state.live_map.refresh().await {
        Ok(outcome) => HttpResponse::Ok().json(ApiResponse::success(outcome)),
        Err(e) => {
            warn!("❌ Manual refresh failed: {}", e);
            HttpResponse::BadGateway().json(ApiResponse::<()>::error(e.to_string()))
        }
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    vehicles: usize,
    last_sequence: u64,
    overlay: crate::overlay::OverlayState,
    cached_names: usize,
}

async fn health_check<A: TransitApi>(state: web::Data<AppState<A>>) -> HttpResponse {
    let live_map = &state.live_map;
    HttpResponse::Ok().json(ApiResponse::success(Health {
        status: "healthy",
        vehicles: live_map.vehicles().len(),
        last_sequence: live_map.poller().last_committed_sequence(),
        overlay: live_map.overlay().state(),
        cached_names: live_map.names().len(),
    }))
}

/// Registers every route. Shared by the server and the HTTP tests.
pub fn configure<A: TransitApi>(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check::<A>)).service(
        web::scope("/api")
            .route("/map/layers", web::get().to(get_layers::<A>))
            .route("/map/sources/{name}", web::get().to(get_source::<A>))
            .route("/map/popup", web::get().to(get_popup::<A>))
            .route("/vehicles", web::get().to(get_vehicles::<A>))
            .route("/vehicles/{id}/select", web::post().to(select_vehicle::<A>))
            .route("/vehicles/{id}/follow", web::post().to(follow_vehicle::<A>))
            .route("/selection", web::delete().to(clear_selection::<A>))
            .route("/route", web::get().to(get_route::<A>))
            .route("/route", web::delete().to(close_route::<A>))
            .route("/filters", web::get().to(get_filters::<A>))
            .route("/filters", web::put().to(put_filters::<A>))
            .route("/refresh", web::post().to(force_refresh::<A>)),
    );
}

// ============================================================================
// Server Startup
// ============================================================================

pub async fn run_server(config: LiveMapConfig) -> std::io::Result<()> {
    let api = HttpTransitApi::new(&config).map_err(|e| {
        error!("❌ Failed to create upstream client: {}", e);
        std::io::Error::other(e.to_string())
    })?;
    let app_state = AppState::new(Arc::new(api), &config);

    // Background feed polling
    let polling = app_state.live_map.spawn_polling();

    info!("🚀 Live map server running on http://{}:{}", config.host, config.port);
    info!("📡 Vehicle feed: {}", config.feed_url);
    info!(
        "🔄 Feed every {}ms, route overlay every {}ms",
        config.feed_interval.as_millis(),
        config.overlay_interval.as_millis()
    );

    let server_state = app_state.clone();
    let result = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(configure::<HttpTransitApi>)
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await;

    app_state.live_map.shutdown();
    polling.abort();
    result
}
