pub mod middleware;
pub mod rest;
pub mod state;

pub use middleware::{require_identity, Principal};
pub use rest::{
    borrow_handler, inventory_handler, list_transactions_handler, list_user_borrows_handler,
    return_handler, ApiDoc,
};

use axum::{
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderName, Method,
    },
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

/// Builds the full web application: circulation routes behind the identity
/// middleware, plus the Swagger UI.
pub fn router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(app_state.config.cors_origin.clone())
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            ACCEPT,
            HeaderName::from_static(middleware::USER_ID_HEADER),
            HeaderName::from_static(middleware::USER_ROLE_HEADER),
        ]);

    let circulation_routes = Router::new()
        .route("/circulation/borrow", post(borrow_handler))
        .route("/circulation/return", post(return_handler))
        .route("/users/{user_id}/borrows", get(list_user_borrows_handler))
        .route("/transactions", get(list_transactions_handler))
        .route("/books/{book_id}/inventory", get(inventory_handler))
        .layer(axum_middleware::from_fn(require_identity));

    let api_router = Router::new()
        .merge(circulation_routes)
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
