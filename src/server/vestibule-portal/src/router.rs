//! HTTP routing for registered portals.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use http::{Request, StatusCode};
use tracing::error;

use crate::portal::Portal;
use crate::registry::PortalRegistry;

/// Builds a router serving every registered portal below its mount path.
pub fn router(registry: &PortalRegistry) -> Router {
    registry
        .iter()
        .fold(Router::new(), |router, portal| router.merge(portal_routes(portal)))
}

/// Routes for one portal: the mount path itself and everything below it.
pub fn portal_routes(portal: &Arc<Portal>) -> Router {
    let base = portal.auth_url_path().trim_end_matches('/');
    let routes = if base.is_empty() {
        Router::new()
            .route("/", any(serve))
            .route("/{*rest}", any(serve))
    } else {
        Router::new()
            .route(base, any(serve))
            .route(&format!("{}/", base), any(serve))
            .route(&format!("{}/{{*rest}}", base), any(serve))
    };
    routes.with_state(Arc::clone(portal))
}

async fn serve(State(portal): State<Arc<Portal>>, req: Request<Body>) -> Response {
    match portal.handle(req).await {
        Ok(response) => response,
        Err(e) => {
            error!(
                instance_name = portal.name(),
                error = %e,
                "Portal request failed"
            );
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        },
    }
}
