//! Readiness flag and probe endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};

/// Process-wide readiness, set once startup completes.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// A flag that starts unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the service ready to authenticate traffic.
    pub fn set_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether startup has completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Router answering `GET /` with 200 once ready and 503 before.
pub fn readiness_router(readiness: Readiness) -> Router {
    Router::new().route("/", get(probe)).with_state(readiness)
}

async fn probe(State(readiness): State<Readiness>) -> Response {
    if readiness.is_ready() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not ready").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn status(router: Router) -> StatusCode {
        router
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn probe_tracks_flag() {
        let readiness = Readiness::new();
        let router = readiness_router(readiness.clone());

        assert_eq!(status(router.clone()).await, StatusCode::SERVICE_UNAVAILABLE);

        readiness.set_ready();

        assert_eq!(status(router).await, StatusCode::OK);
    }
}
