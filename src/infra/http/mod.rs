pub mod api;
mod middleware;

pub use api::ApiState;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Router, middleware as axum_middleware, routing::get};

use crate::application::error::ErrorReport;

/// Full HTTP surface of a node.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(api::build_api_router())
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}

async fn health(State(state): State<ApiState>) -> Response {
    match state.repository.store().health_check().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}
