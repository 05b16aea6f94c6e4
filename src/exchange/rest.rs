//! Signed REST client for the exchange
//!
//! Every private request is a URL-encoded form body carrying a
//! monotonically increasing nonce, signed with HMAC-SHA512 under the
//! user's secret. The public key travels in a separate header.
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha512;
use tracing::debug;

use crate::config::Settings;
use crate::error::{classify_exchange_message, EngineError, Result};
use crate::types::{OrderType, PairInfo, Side};
use crate::utils::RateLimiter;

type HmacSha512 = Hmac<Sha512>;

/// Per-user signing material. Credential storage and validation live
/// outside the core.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub key: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: u8,
    #[serde(default)]
    error: Option<String>,
    #[serde(rename = "return")]
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct AccountInfoData {
    balance: HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct WsTokenData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct GetOrderData {
    order: RemoteOrder,
}

/// Exchange-side view of a single order.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteOrder {
    pub status: String,
    pub price: f64,
    #[serde(rename = "amount")]
    pub original_amount: f64,
    #[serde(rename = "remain")]
    pub remaining_amount: f64,
}

impl RemoteOrder {
    pub fn executed_amount(&self) -> f64 {
        (self.original_amount - self.remaining_amount).max(0.0)
    }

    pub fn is_open(&self) -> bool {
        self.status.eq_ignore_ascii_case("open")
    }

    pub fn is_filled(&self) -> bool {
        self.status.eq_ignore_ascii_case("filled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.eq_ignore_ascii_case("cancelled")
    }
}

#[derive(Debug, Deserialize)]
struct PairRaw {
    id: String,
    base: String,
    quote: String,
    volume_precision: u32,
    price_precision: u32,
    min_base_amount: f64,
    min_quote_amount: f64,
    tick_size: f64,
}

pub struct RestClient {
    http: Client,
    base_url: String,
    nonce: AtomicI64,
    place_limit: RateLimiter,
    cancel_limit: RateLimiter,
    public_limit: RateLimiter,
}

impl RestClient {
    pub fn new(settings: &Settings) -> Self {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        RestClient {
            http,
            base_url: settings.rest_base_url.clone(),
            nonce: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
            place_limit: RateLimiter::per_second(settings.rate_limit_place_per_sec),
            cancel_limit: RateLimiter::per_second(settings.rate_limit_cancel_per_sec),
            public_limit: RateLimiter::per_minute(settings.rate_limit_public_per_min),
        }
    }

    fn next_nonce(&self) -> i64 {
        self.nonce.fetch_add(1, Ordering::SeqCst)
    }

    fn sign(secret: &str, body: &str) -> String {
        let mut mac =
            HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn encode_form(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn call_signed<T: serde::de::DeserializeOwned>(
        &self,
        creds: &ApiCredentials,
        method: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T> {
        params.insert(0, ("method", method.to_string()));
        params.push(("nonce", self.next_nonce().to_string()));
        let body = Self::encode_form(&params);
        let signature = Self::sign(&creds.secret, &body);

        debug!("REST {} -> {}", method, self.base_url);

        let response = self
            .http
            .post(format!("{}/tapi", self.base_url))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Key", &creds.key)
            .header("Sign", signature)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(EngineError::Exchange(format!("HTTP {}: {}", status, text)));
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&text)?;
        if envelope.success != 1 {
            let message = envelope.error.unwrap_or_else(|| "unknown exchange error".to_string());
            return Err(classify_exchange_message(&message));
        }
        envelope
            .data
            .ok_or_else(|| EngineError::Exchange(format!("{}: empty return payload", method)))
    }

    /// Account balances keyed by currency symbol.
    pub async fn account_info(&self, creds: &ApiCredentials) -> Result<HashMap<String, f64>> {
        self.public_limit.acquire().await;
        let data: AccountInfoData = self.call_signed(creds, "getInfo", Vec::new()).await?;
        Ok(data.balance)
    }

    /// Place an order. `amount` is the base amount, except for market
    /// buys where the exchange takes the quote amount to spend.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_order(
        &self,
        creds: &ApiCredentials,
        pair: &str,
        side: Side,
        order_type: OrderType,
        price: f64,
        amount: f64,
        client_order_id: &str,
    ) -> Result<String> {
        self.place_limit.acquire().await;
        let params = vec![
            ("pair", pair.to_string()),
            ("type", side.as_str().to_string()),
            ("order_type", order_type.as_str().to_string()),
            ("price", format!("{}", price)),
            ("amount", format!("{}", amount)),
            ("client_order_id", client_order_id.to_string()),
        ];
        let data: PlaceOrderData = self.call_signed(creds, "trade", params).await?;
        Ok(data.order_id)
    }

    pub async fn cancel_order(
        &self,
        creds: &ApiCredentials,
        pair: &str,
        exchange_order_id: &str,
        side: Side,
    ) -> Result<()> {
        self.cancel_limit.acquire().await;
        let params = vec![
            ("pair", pair.to_string()),
            ("order_id", exchange_order_id.to_string()),
            ("type", side.as_str().to_string()),
        ];
        let _: serde_json::Value = self.call_signed(creds, "cancelOrder", params).await?;
        Ok(())
    }

    pub async fn get_order(
        &self,
        creds: &ApiCredentials,
        pair: &str,
        exchange_order_id: &str,
    ) -> Result<RemoteOrder> {
        self.public_limit.acquire().await;
        let params = vec![
            ("pair", pair.to_string()),
            ("order_id", exchange_order_id.to_string()),
        ];
        let data: GetOrderData = self.call_signed(creds, "getOrder", params).await?;
        Ok(data.order)
    }

    /// Short-lived token used to authenticate the private WebSocket.
    pub async fn ws_token(&self, creds: &ApiCredentials) -> Result<String> {
        self.public_limit.acquire().await;
        let data: WsTokenData = self.call_signed(creds, "wsToken", Vec::new()).await?;
        Ok(data.token)
    }

    /// Pair metadata from the public surface.
    pub async fn pairs(&self) -> Result<Vec<PairInfo>> {
        self.public_limit.acquire().await;
        let response = self
            .http
            .get(format!("{}/api/pairs", self.base_url))
            .send()
            .await?;
        let raw: Vec<PairRaw> = response.json().await?;
        Ok(raw
            .into_iter()
            .map(|p| PairInfo {
                id: p.id,
                base: p.base,
                quote: p.quote,
                volume_precision: p.volume_precision,
                price_precision: p.price_precision,
                min_base_amount: p.min_base_amount,
                min_quote_amount: p.min_quote_amount,
                tick_size: p.tick_size,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_is_deterministic_hex_sha512() {
        let a = RestClient::sign("secret", "method=getInfo&nonce=1");
        let b = RestClient::sign("secret", "method=getInfo&nonce=1");
        assert_eq!(a, b);
        // SHA-512 digest is 64 bytes, 128 hex characters.
        assert_eq!(a.len(), 128);

        let c = RestClient::sign("other", "method=getInfo&nonce=1");
        assert_ne!(a, c);
    }

    #[test]
    fn test_encode_form_preserves_order() {
        let body = RestClient::encode_form(&[
            ("method", "trade".to_string()),
            ("pair", "btcidr".to_string()),
        ]);
        assert_eq!(body, "method=trade&pair=btcidr");
    }

    #[test]
    fn test_nonce_is_monotonic() {
        let settings = Settings::default();
        let client = RestClient::new(&settings);
        let n1 = client.next_nonce();
        let n2 = client.next_nonce();
        let n3 = client.next_nonce();
        assert!(n1 < n2 && n2 < n3);
    }

    #[test]
    fn test_remote_order_executed_amount() {
        let order = RemoteOrder {
            status: "open".to_string(),
            price: 100.0,
            original_amount: 2.0,
            remaining_amount: 0.5,
        };
        assert_eq!(order.executed_amount(), 1.5);
        assert!(order.is_open());
    }
}
