pub mod error;
pub mod handlers;
pub mod models;
pub mod state;

pub use state::ApiState;

use axum::{Router, routing::get};

pub fn build_api_router() -> Router<ApiState> {
    let collection = get(handlers::missing_key)
        .post(handlers::add_key_value)
        .put(handlers::update_key_value)
        .delete(handlers::remove_by_key);

    Router::new()
        .route("/v1", collection.clone())
        .route("/v1/", collection)
        .route("/v1/{key}", get(handlers::get_value_by_key))
}
