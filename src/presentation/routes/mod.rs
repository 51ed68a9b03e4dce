use crate::{
    application::handlers::{
        health::health_check_handler,
        orders::place_order,
        performance::{get_performance_report, save_performance_report},
        products::{create_product, get_product},
    },
    AppState,
};
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub fn api_router() -> Router<AppState> {
    Router::new()
        // Orders and products
        .route("/orders", post(place_order))
        .route("/products", post(create_product))
        .route("/products/:product_id", get(get_product))
        // Performance reporting
        .route("/performance", get(get_performance_report))
        .route("/performance/report", post(save_performance_report))
}

/// Create the main router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check_handler))
        .nest("/api", api_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
