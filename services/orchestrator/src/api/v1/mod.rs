//! API v1 routes.

mod locks;
mod steps;
mod sync;

use axum::Router;

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/locks", locks::routes())
        .nest("/sync", sync::routes())
        .nest("/steps", steps::routes())
}
