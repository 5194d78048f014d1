use crate::models::AppState;
use axum::Router;

pub mod customer_routes;
pub mod home_routes;
pub mod menu_routes;
pub mod reservation_routes;
pub mod resource_routes;
pub mod session_routes;
pub mod settings_routes;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/menus", menu_routes::router())
        .nest("/api/v1/resources", resource_routes::router())
        .nest("/api/v1", reservation_routes::router())
        .nest("/api/v1", customer_routes::router())
        .nest("/api/v1", settings_routes::router())
        .nest("/api/v1", session_routes::router())
        .merge(home_routes::router())
        .with_state(state)
}
