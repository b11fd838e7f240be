pub mod health;
pub mod payment;
pub mod status;

pub use health::*;
pub use payment::*;
pub use status::*;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

use crate::app::PaywallApp;

/// Wires every exposed route. The simulate endpoint is only mounted on
/// development servers running the simulated verifier.
pub fn router(app: Arc<PaywallApp>) -> Router {
    let dev_simulation = app.config().dev_mode() && app.simulated().is_some();

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/payment-info", get(payment_info))
        .route("/api/x402-payment/verify", post(verify_payment))
        .route("/api/monitor/event", post(monitor_event));

    if dev_simulation {
        router = router.route("/api/x402-payment/simulate", post(simulate_payment));
    }

    router
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app)
}
