use anyhow::Result;
use botpaywall::client::PaywallClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    dotenvy::dotenv().ok();

    let base_url =
        std::env::var("PAYWALL_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let client_ip = std::env::var("AGENT_CLIENT_IP").unwrap_or_else(|_| "8.8.8.8".to_string());

    println!("Bot Paywall Test Agent");
    println!("======================");
    println!("Server: {}", base_url);
    println!("Claimed IP: {}", client_ip);
    println!();

    let client = PaywallClient::new(&base_url)?;

    println!("Step 1: Fetching payment instructions...");
    let info = client.payment_info().await?;
    println!(
        "   [OK] Price: {} octas {} to {}",
        info.payment_amount, info.payment_currency, info.payment_address
    );
    println!(
        "   Network: {}, whitelist duration: {}s",
        info.network, info.whitelist_duration_seconds
    );
    println!();

    // A simulated transaction can land as failed; mint a fresh one and try
    // again like a real agent whose transfer got dropped.
    let mut verified = None;
    for attempt in 1..=3 {
        println!("Step 2: Minting a simulated payment (attempt {})...", attempt);
        let tx = client
            .simulate_payment(Some(&info.payment_address), Some(info.payment_amount))
            .await?;
        println!("   [OK] Transaction: {} ({})", tx.transaction_hash, tx.format);
        println!();

        println!("Step 3: Verifying the payment...");
        match client.verify_payment(&tx.transaction_hash, &client_ip).await {
            Ok(response) => {
                println!("   [OK] Whitelisted!");
                println!("   Entry: {}", response.entry_id);
                println!("   Firewall rule: {}", response.rule_id);
                println!("   Reason: {}", response.reason);
                verified = Some(response);
                break;
            }
            Err(e) => {
                println!("   [FAILED] {}", e);
                println!();
            }
        }
    }

    if verified.is_none() {
        println!("[ERROR] No attempt produced a grant; check the server logs.");
        return Ok(());
    }

    println!();
    println!("Step 4: System status after the grant...");
    let status = client.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}
