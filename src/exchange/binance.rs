//! Binance spot REST client for public market data.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::GatewayError;

use super::types::{ApiErrorBody, DelistSchedule, TickerPrice};
use super::{with_retry, MarketData, PriceMap, RetryPolicy};

const BINANCE_API_BASE: &str = "https://api.binance.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for Binance market data (read-only operations).
pub struct BinanceMarketClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl BinanceMarketClient {
    /// Create a new client with default settings.
    pub fn new(api_key: Option<String>) -> Result<Self> {
        Self::with_base_url(BINANCE_API_BASE.to_string(), api_key)
    }

    /// Create with custom base URL (for testnet or testing).
    pub fn with_base_url(base_url: String, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            api_key,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Send a GET request and decode the body, classifying exchange errors.
    async fn get_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }

    async fn fetch_tickers(&self) -> Result<Vec<TickerPrice>, GatewayError> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);
        debug!(url = %url, "Fetching ticker prices");
        with_retry("ticker prices", &self.retry, || self.get_json(self.client.get(&url))).await
    }
}

fn classify_failure(status: StatusCode, body: &str) -> GatewayError {
    // 429 is a request-weight limit, 418 an IP ban after ignoring 429s
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return GatewayError::RateLimited(format!("{} - {}", status, body));
    }
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) => GatewayError::from_exchange_code(err.code, err.msg),
        Err(_) if status.is_server_error() => GatewayError::Network(format!("{} - {}", status, body)),
        Err(_) => GatewayError::InvalidResponse(format!("{} - {}", status, body)),
    }
}

#[async_trait]
impl MarketData for BinanceMarketClient {
    async fn prices(&self, quote: &str) -> Result<PriceMap, GatewayError> {
        let tickers = self.fetch_tickers().await?;
        Ok(tickers
            .into_iter()
            .filter(|t| t.symbol.ends_with(quote))
            .map(|t| (t.symbol, t.price))
            .collect())
    }

    async fn price(&self, symbol: &str) -> Result<rust_decimal::Decimal, GatewayError> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);
        let ticker: TickerPrice = with_retry("ticker price", &self.retry, || {
            self.get_json(self.client.get(&url).query(&[("symbol", symbol)]))
        })
        .await?;
        Ok(ticker.price)
    }

    async fn delisting(&self) -> Result<HashSet<String>, GatewayError> {
        // The delist schedule needs an API key; without one only the
        // configured list applies.
        let Some(api_key) = &self.api_key else {
            return Ok(HashSet::new());
        };

        let url = format!("{}/sapi/v1/spot/delist-schedule", self.base_url);
        debug!(url = %url, "Fetching delist schedule");
        let schedule: Vec<DelistSchedule> = with_retry("delist schedule", &self.retry, || {
            self.get_json(self.client.get(&url).header("X-MBX-APIKEY", api_key))
        })
        .await?;

        Ok(schedule.into_iter().flat_map(|s| s.symbols).collect())
    }
}
