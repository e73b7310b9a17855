use anyhow::Result;
use bigdecimal::BigDecimal;
use num_traits::FromPrimitive;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// HTTP client for the payment service's balance query. The lookup is
/// advisory: any failure within the timeout window counts as "could not
/// verify", never as a hang.
#[derive(Clone)]
pub struct PaymentsClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: f64,
}

impl PaymentsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Current balance for `user_id`, or `None` when it cannot be resolved
    /// (no account, payment service unreachable, timeout).
    pub async fn user_balance(&self, user_id: Uuid) -> Option<BigDecimal> {
        let url = format!("{}/accounts/{}/balance", self.base_url, user_id);

        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(%user_id, error = %e, "payment service unreachable");
                return None;
            }
        };

        if response.status() != StatusCode::OK {
            warn!(%user_id, status = %response.status(), "balance lookup failed");
            return None;
        }

        match response.json::<BalanceResponse>().await {
            Ok(body) => BigDecimal::from_f64(body.balance),
            Err(e) => {
                warn!(%user_id, error = %e, "malformed balance response");
                None
            }
        }
    }
}
