use std::sync::Arc;

use axum::{routing::get, Router};

use appointment_cell::router::appointment_routes;
use appointment_cell::SchedulingService;
use shared_config::AppConfig;

pub fn create_router(config: Arc<AppConfig>, scheduling: Arc<SchedulingService>) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic scheduling API is running!" }))
        .nest("/appointments", appointment_routes(config, scheduling))
}
