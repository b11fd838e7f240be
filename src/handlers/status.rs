use axum::extract::State;
use axum::Json;
use std::sync::Arc;

use crate::app::PaywallApp;
use crate::models::SystemStatus;

pub async fn get_status(State(app): State<Arc<PaywallApp>>) -> Json<SystemStatus> {
    Json(app.status().await)
}
