use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::PaywallError;

/// Edge firewall that enforces the whitelist. `allow` must be safe to call
/// again for an IP that already has a rule, and `revoke` must be idempotent:
/// revoking an already-gone rule succeeds.
#[async_trait]
pub trait WhitelistProvider: Send + Sync {
    /// Creates (or reuses) an allow rule for the IP and returns its rule id.
    async fn allow(&self, ip: &str, ttl_secs: u64) -> Result<String, PaywallError>;

    async fn revoke(&self, rule_id: &str) -> Result<(), PaywallError>;

    /// Looks up the rule currently covering the IP, if any. Timers recreated
    /// after a restart have no rule id and resolve it through this.
    async fn find_rule(&self, ip: &str) -> Result<Option<String>, PaywallError>;

    async fn ping(&self) -> bool;

    fn mode(&self) -> &'static str;
}

/// Validates a dotted-quad IPv4 address and returns its canonical form
/// (leading zeros stripped). Private and loopback ranges are rejected unless
/// `allow_private` is set, which development mode does so local agents can
/// whitelist themselves.
pub fn validate_ip(ip: &str, allow_private: bool) -> Result<String, PaywallError> {
    let trimmed = ip.trim();
    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.len() != 4 {
        return Err(PaywallError::InvalidIp(format!(
            "expected a dotted quad, got '{}'",
            trimmed
        )));
    }

    let mut octets = [0u8; 4];
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PaywallError::InvalidIp(format!(
                "octet '{}' is not a decimal number",
                part
            )));
        }
        octets[i] = part.parse().map_err(|_| {
            PaywallError::InvalidIp(format!("octet '{}' is out of range", part))
        })?;
    }

    if !allow_private && is_private(octets) {
        return Err(PaywallError::InvalidIp(format!(
            "private or loopback address '{}'",
            trimmed
        )));
    }

    Ok(format!(
        "{}.{}.{}.{}",
        octets[0], octets[1], octets[2], octets[3]
    ))
}

fn is_private(octets: [u8; 4]) -> bool {
    match octets {
        [10, ..] => true,
        [172, b, ..] => (16..=31).contains(&b),
        [192, 168, ..] => true,
        [127, ..] => true,
        _ => false,
    }
}

/// Whitelists IPs through the Cloudflare zone firewall access-rules API.
pub struct CloudflareProvider {
    client: reqwest::Client,
    api_base: String,
    api_token: String,
    zone_id: String,
}

#[derive(Deserialize, Debug)]
struct CloudflareResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<CloudflareApiError>,
    result: Option<T>,
}

#[derive(Deserialize, Debug)]
struct CloudflareApiError {
    #[allow(dead_code)]
    code: i64,
    message: String,
}

#[derive(Deserialize, Debug)]
struct AccessRule {
    id: String,
}

impl CloudflareProvider {
    pub fn new(api_base: &str, api_token: &str, zone_id: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        tracing::info!(zone = zone_id, "Cloudflare provider initialized");

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            zone_id: zone_id.to_string(),
        })
    }

    fn rules_url(&self) -> String {
        format!(
            "{}/zones/{}/firewall/access_rules/rules",
            self.api_base, self.zone_id
        )
    }

    async fn find_existing(&self, ip: &str) -> Result<Option<String>, PaywallError> {
        let response = self
            .client
            .get(self.rules_url())
            .bearer_auth(&self.api_token)
            .query(&[("configuration.value", ip)])
            .send()
            .await
            .map_err(|e| PaywallError::Provider(e.to_string()))?;

        let body: CloudflareResponse<Vec<AccessRule>> = response
            .json()
            .await
            .map_err(|e| PaywallError::Provider(e.to_string()))?;

        if !body.success {
            return Err(PaywallError::Provider(first_error(&body.errors)));
        }

        Ok(body
            .result
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|rule| rule.id))
    }
}

#[async_trait]
impl WhitelistProvider for CloudflareProvider {
    async fn allow(&self, ip: &str, ttl_secs: u64) -> Result<String, PaywallError> {
        // Cloudflare rejects duplicate rules, so check for one up front and
        // reuse it. A renewed grant keeps the rule that already covers the IP.
        if let Some(existing) = self.find_existing(ip).await? {
            tracing::info!(ip = ip, rule_id = %existing, "Reusing existing whitelist rule");
            return Ok(existing);
        }

        let payload = serde_json::json!({
            "mode": "whitelist",
            "configuration": {
                "target": "ip",
                "value": ip,
            },
            "notes": format!("Automated bot payment - {}s subscription", ttl_secs),
        });

        let response = self
            .client
            .post(self.rules_url())
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PaywallError::Provider(e.to_string()))?;

        let body: CloudflareResponse<AccessRule> = response
            .json()
            .await
            .map_err(|e| PaywallError::Provider(e.to_string()))?;

        if !body.success {
            return Err(PaywallError::Provider(first_error(&body.errors)));
        }

        let rule = body
            .result
            .ok_or_else(|| PaywallError::Provider("Create returned no rule".to_string()))?;
        tracing::info!(ip = ip, rule_id = %rule.id, "Whitelist rule created");
        Ok(rule.id)
    }

    async fn revoke(&self, rule_id: &str) -> Result<(), PaywallError> {
        let url = format!("{}/{}", self.rules_url(), rule_id);
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| PaywallError::Provider(e.to_string()))?;

        // Already gone counts as revoked.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(rule_id = rule_id, "Whitelist rule was already gone");
            return Ok(());
        }

        let body: CloudflareResponse<AccessRule> = response
            .json()
            .await
            .map_err(|e| PaywallError::Provider(e.to_string()))?;

        if !body.success {
            return Err(PaywallError::Provider(first_error(&body.errors)));
        }

        tracing::info!(rule_id = rule_id, "Whitelist rule removed");
        Ok(())
    }

    async fn find_rule(&self, ip: &str) -> Result<Option<String>, PaywallError> {
        self.find_existing(ip).await
    }

    async fn ping(&self) -> bool {
        let url = format!("{}/user/tokens/verify", self.api_base);
        match self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn mode(&self) -> &'static str {
        "cloudflare"
    }
}

fn first_error(errors: &[CloudflareApiError]) -> String {
    errors
        .first()
        .map(|e| e.message.clone())
        .unwrap_or_else(|| "Cloudflare request failed".to_string())
}

/// In-process provider for development and tests. Rules live in a map and
/// enforce nothing; the value is exercising the full grant/revoke lifecycle
/// without touching a real edge.
#[derive(Default)]
pub struct MemoryProvider {
    rules: RwLock<HashMap<String, String>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn active_rules(&self) -> usize {
        self.rules.read().await.len()
    }

    pub async fn is_allowed(&self, ip: &str) -> bool {
        self.rules.read().await.values().any(|v| v == ip)
    }
}

#[async_trait]
impl WhitelistProvider for MemoryProvider {
    async fn allow(&self, ip: &str, _ttl_secs: u64) -> Result<String, PaywallError> {
        let mut rules = self.rules.write().await;
        if let Some((id, _)) = rules.iter().find(|(_, v)| v.as_str() == ip) {
            return Ok(id.clone());
        }
        let rule_id = Uuid::new_v4().to_string();
        rules.insert(rule_id.clone(), ip.to_string());
        tracing::info!(ip = ip, rule_id = %rule_id, "Memory whitelist rule created");
        Ok(rule_id)
    }

    async fn revoke(&self, rule_id: &str) -> Result<(), PaywallError> {
        self.rules.write().await.remove(rule_id);
        Ok(())
    }

    async fn find_rule(&self, ip: &str) -> Result<Option<String>, PaywallError> {
        Ok(self
            .rules
            .read()
            .await
            .iter()
            .find(|(_, v)| v.as_str() == ip)
            .map(|(id, _)| id.clone()))
    }

    async fn ping(&self) -> bool {
        true
    }

    fn mode(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[test]
    fn accepts_public_addresses() {
        assert_eq!(validate_ip("8.8.8.8", false).unwrap(), "8.8.8.8");
        assert_eq!(validate_ip(" 1.2.3.4 ", false).unwrap(), "1.2.3.4");
    }

    #[test]
    fn canonicalizes_leading_zeros() {
        assert_eq!(validate_ip("8.8.008.8", false).unwrap(), "8.8.8.8");
        assert_eq!(validate_ip("010.1.1.1", true).unwrap(), "10.1.1.1");
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in [
            "",
            "8.8.8",
            "8.8.8.8.8",
            "256.1.1.1",
            "1.2.3.abc",
            "1..2.3",
            "1.2.3.-4",
            "not an ip",
        ] {
            assert!(
                validate_ip(bad, true).is_err(),
                "accepted malformed ip: {:?}",
                bad
            );
        }
    }

    #[test]
    fn private_ranges_need_dev_mode() {
        for private in ["10.0.0.1", "172.16.0.1", "172.31.255.255", "192.168.1.1", "127.0.0.1"] {
            assert!(validate_ip(private, false).is_err(), "{} should be rejected", private);
            assert!(validate_ip(private, true).is_ok(), "{} should pass in dev", private);
        }
        // 172.15 and 172.32 are public.
        assert!(validate_ip("172.15.0.1", false).is_ok());
        assert!(validate_ip("172.32.0.1", false).is_ok());
    }

    #[tokio::test]
    async fn cloudflare_allow_posts_rule_when_none_exists() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/zones/zone-1/firewall/access_rules/rules")
            .match_query(Matcher::UrlEncoded(
                "configuration.value".into(),
                "8.8.8.8".into(),
            ))
            .with_status(200)
            .with_body(r#"{"success":true,"errors":[],"result":[]}"#)
            .create_async()
            .await;
        let mock = server
            .mock("POST", "/zones/zone-1/firewall/access_rules/rules")
            .match_header("authorization", "Bearer test-token")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "mode": "whitelist",
                "configuration": {"target": "ip", "value": "8.8.8.8"},
                "notes": "Automated bot payment - 60s subscription",
            })))
            .with_status(200)
            .with_body(r#"{"success":true,"errors":[],"result":{"id":"rule-123"}}"#)
            .create_async()
            .await;

        let provider = CloudflareProvider::new(&server.url(), "test-token", "zone-1")
            .expect("client builds");
        let rule_id = provider.allow("8.8.8.8", 60).await.expect("rule created");
        assert_eq!(rule_id, "rule-123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn cloudflare_allow_reuses_existing_rule_without_posting() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/zones/zone-1/firewall/access_rules/rules")
            .match_query(Matcher::UrlEncoded(
                "configuration.value".into(),
                "8.8.8.8".into(),
            ))
            .with_status(200)
            .with_body(r#"{"success":true,"errors":[],"result":[{"id":"rule-existing"}]}"#)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/zones/zone-1/firewall/access_rules/rules")
            .expect(0)
            .create_async()
            .await;

        let provider = CloudflareProvider::new(&server.url(), "test-token", "zone-1")
            .expect("client builds");
        let rule_id = provider.allow("8.8.8.8", 60).await.expect("rule reused");
        assert_eq!(rule_id, "rule-existing");
        create.assert_async().await;
    }

    #[tokio::test]
    async fn cloudflare_allow_surfaces_provider_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/zones/zone-1/firewall/access_rules/rules")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"success":true,"errors":[],"result":[]}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/zones/zone-1/firewall/access_rules/rules")
            .with_status(200)
            .with_body(r#"{"success":false,"errors":[{"code":9106,"message":"missing token"}],"result":null}"#)
            .create_async()
            .await;

        let provider = CloudflareProvider::new(&server.url(), "test-token", "zone-1")
            .expect("client builds");
        match provider.allow("8.8.8.8", 60).await {
            Err(PaywallError::Provider(message)) => assert!(message.contains("missing token")),
            other => panic!("expected provider failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cloudflare_revoke_deletes_rule() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/zones/zone-1/firewall/access_rules/rules/rule-123")
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .with_body(r#"{"success":true,"errors":[],"result":{"id":"rule-123"}}"#)
            .create_async()
            .await;

        let provider = CloudflareProvider::new(&server.url(), "test-token", "zone-1")
            .expect("client builds");
        provider.revoke("rule-123").await.expect("revoked");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn cloudflare_find_rule_queries_by_ip() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/zones/zone-1/firewall/access_rules/rules")
            .match_query(Matcher::UrlEncoded(
                "configuration.value".into(),
                "8.8.8.8".into(),
            ))
            .with_status(200)
            .with_body(r#"{"success":true,"errors":[],"result":[{"id":"rule-found"}]}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/zones/zone-1/firewall/access_rules/rules")
            .match_query(Matcher::UrlEncoded(
                "configuration.value".into(),
                "9.9.9.9".into(),
            ))
            .with_status(200)
            .with_body(r#"{"success":true,"errors":[],"result":[]}"#)
            .create_async()
            .await;

        let provider = CloudflareProvider::new(&server.url(), "test-token", "zone-1")
            .expect("client builds");
        assert_eq!(
            provider.find_rule("8.8.8.8").await.expect("lookup"),
            Some("rule-found".to_string())
        );
        assert_eq!(provider.find_rule("9.9.9.9").await.expect("lookup"), None);
    }

    #[tokio::test]
    async fn cloudflare_revoke_is_idempotent_on_missing_rule() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/zones/zone-1/firewall/access_rules/rules/rule-gone")
            .with_status(404)
            .create_async()
            .await;

        let provider = CloudflareProvider::new(&server.url(), "test-token", "zone-1")
            .expect("client builds");
        assert!(provider.revoke("rule-gone").await.is_ok());
    }

    #[tokio::test]
    async fn memory_provider_grant_and_revoke() {
        let provider = MemoryProvider::new();

        let rule_id = provider.allow("8.8.8.8", 60).await.expect("allowed");
        assert!(provider.is_allowed("8.8.8.8").await);
        assert_eq!(provider.active_rules().await, 1);
        assert_eq!(
            provider.find_rule("8.8.8.8").await.expect("lookup"),
            Some(rule_id.clone())
        );
        assert_eq!(provider.find_rule("9.9.9.9").await.expect("lookup"), None);

        // Same IP reuses the rule.
        let again = provider.allow("8.8.8.8", 60).await.expect("allowed");
        assert_eq!(rule_id, again);
        assert_eq!(provider.active_rules().await, 1);

        provider.revoke(&rule_id).await.expect("revoked");
        assert!(!provider.is_allowed("8.8.8.8").await);

        // Revoking again is fine.
        provider.revoke(&rule_id).await.expect("still fine");
    }
}
