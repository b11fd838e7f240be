use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::app::PaywallApp;
use crate::error::PaywallError;
use crate::models::{
    LedgerFormat, PaymentClaim, PaymentInfo, SimulateRequest, SimulateResponse, VerifyRequest,
    VerifyResponse,
};

/// Manual trigger of the full grant pipeline. Responds only after the
/// whitelist entry, firewall rule and expiry timer are all in place.
pub async fn verify_payment(
    State(app): State<Arc<PaywallApp>>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, PaywallError> {
    let grant = app.process_payment(&request).await?;

    Ok(Json(VerifyResponse {
        success: true,
        verified: true,
        entry_id: grant.entry.id,
        rule_id: grant.rule_id,
        ip: grant.entry.ip_address,
        reason: grant.entry.reason,
        request_id: Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
    }))
}

/// Payment instructions for clients that hit the paywall. Echoes the caller's
/// IP back so the SDK can use it as the default `clientIP` claim.
pub async fn payment_info(
    State(app): State<Arc<PaywallApp>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Json<PaymentInfo> {
    let config = app.config();
    Json(PaymentInfo {
        payment_address: config.payment_address.clone(),
        payment_amount: config.price_octas,
        payment_currency: config.currency.to_string(),
        network: config.network.clone(),
        whitelist_duration_seconds: config.whitelist_duration_secs,
        client_ip: client_ip(&headers, connect.map(|ConnectInfo(addr)| addr)),
    })
}

/// Mints a deterministic test transaction. Only routed in development with
/// the simulated verifier; the guard here covers direct calls anyway.
pub async fn simulate_payment(
    State(app): State<Arc<PaywallApp>>,
    Json(request): Json<SimulateRequest>,
) -> Result<Json<SimulateResponse>, PaywallError> {
    let Some(simulated) = app.simulated() else {
        return Err(PaywallError::ConfigInvalid(
            "Simulation requires VERIFIER_MODE=simulated".to_string(),
        ));
    };

    let config = app.config();
    let recipient = request
        .recipient
        .unwrap_or_else(|| config.payment_address.clone());
    let amount = request.amount.unwrap_or(config.price_octas);
    let tx = simulated.generate(LedgerFormat::Move, &recipient, amount);

    tracing::debug!(hash = %tx.hash, succeeded = tx.succeeded, "Simulated transaction minted");
    Ok(Json(SimulateResponse {
        transaction_hash: tx.hash,
        format: tx.format.as_str().to_string(),
    }))
}

/// External claim feed (webhook shape). Accepted claims are queued for the
/// monitoring loop; the pipeline outcome is not awaited here.
pub async fn monitor_event(
    State(app): State<Arc<PaywallApp>>,
    Json(claim): Json<PaymentClaim>,
) -> Result<StatusCode, PaywallError> {
    app.submit_claim(claim).await?;
    Ok(StatusCode::ACCEPTED)
}

/// First `X-Forwarded-For` hop when present, socket address otherwise.
fn client_ip(headers: &HeaderMap, addr: Option<SocketAddr>) -> Option<String> {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    addr.map(|addr| addr.ip().to_string())
}
