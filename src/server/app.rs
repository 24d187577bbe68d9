use axum::{middleware, routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::api::{api_routes, public_routes};
use crate::sse::sse_handler;

use super::{api_key_auth, AppState};

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = api_routes().route_layer(middleware::from_fn_with_state(
        state.clone(),
        api_key_auth,
    ));

    Router::new()
        .route("/sse", get(sse_handler))
        .merge(public_routes())
        .nest("/api/v1", protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
