use axum::extract::State;
use axum::Json;
use std::sync::Arc;

use crate::app::PaywallApp;
use crate::models::HealthStatus;

pub async fn health_check(State(app): State<Arc<PaywallApp>>) -> Json<HealthStatus> {
    Json(app.health().await)
}
