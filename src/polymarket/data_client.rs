use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::config::DataApiConfig;

use super::types::{ApiMarket, ApiPosition, ApiTrade};

/// Hard cap on page size accepted by the trades endpoint.
pub const MAX_PAGE_LIMIT: u32 = 1000;

#[derive(Debug, Error)]
pub enum DataClientError {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("rate limited after retry budget")]
    RateLimited,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication rejected")]
    Auth,
}

/// Filter for the paged trades endpoint.
#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    pub user: Option<String>,
    pub market: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl TradeFilter {
    pub fn for_user(address: &str) -> Self {
        Self {
            user: Some(address.to_lowercase()),
            ..Self::default()
        }
    }

    fn page_limit(&self) -> u32 {
        self.limit.unwrap_or(MAX_PAGE_LIMIT).min(MAX_PAGE_LIMIT)
    }
}

/// Sliding-window token bucket. Each request takes one token; tokens refill
/// continuously at `rate_per_minute`.
struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_minute: u32) -> Self {
        Self {
            capacity: rate_per_minute,
            tokens: rate_per_minute as f64,
            refill_per_sec: rate_per_minute as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity as f64);
        self.last_refill = now;
    }

    /// Time to wait before a token is available; zero when one is taken now.
    fn acquire_delay(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        }
    }
}

/// Read-only client for the broker's public data API: paged trades,
/// positions, and market metadata. Rate-limited and retrying.
#[derive(Clone)]
pub struct DataClient {
    http: Client,
    config: DataApiConfig,
    bucket: Arc<Mutex<TokenBucket>>,
}

impl DataClient {
    pub fn new(http: Client, config: DataApiConfig) -> Self {
        let bucket = Arc::new(Mutex::new(TokenBucket::new(config.rate_per_minute)));
        Self {
            http,
            config,
            bucket,
        }
    }

    /// One raw page of trades at the given offset, straight off the wire.
    async fn fetch_page_raw(
        &self,
        filter: &TradeFilter,
        offset: u32,
    ) -> Result<Vec<ApiTrade>, DataClientError> {
        let mut query: Vec<(&str, String)> = vec![
            ("limit", filter.page_limit().to_string()),
            ("offset", offset.to_string()),
        ];
        if let Some(user) = &filter.user {
            query.push(("user", user.clone()));
        }
        if let Some(market) = &filter.market {
            query.push(("market", market.clone()));
        }

        let url = format!("{}/trades", self.config.base_url);
        self.get_json(&url, &query).await
    }

    /// One page of trades at the given offset, trimmed to the filter's
    /// `since` cutoff (the endpoint has no server-side time filter).
    pub async fn get_trades_page(
        &self,
        filter: &TradeFilter,
        offset: u32,
    ) -> Result<Vec<ApiTrade>, DataClientError> {
        let mut trades = self.fetch_page_raw(filter, offset).await?;
        if let Some(since) = filter.since {
            trades.retain(|t| t.traded_at().map(|ts| ts >= since).unwrap_or(true));
        }
        Ok(trades)
    }

    /// Lazy finite sequence over all pages matching the filter.
    pub fn get_trades(&self, filter: TradeFilter) -> TradePage {
        TradePage {
            client: self.clone(),
            filter,
            offset: 0,
            done: false,
        }
    }

    pub async fn get_positions(&self, user: &str) -> Result<Vec<ApiPosition>, DataClientError> {
        let url = format!("{}/positions", self.config.base_url);
        self.get_json(&url, &[("user", user.to_lowercase())]).await
    }

    /// Markets; with `active_only` the closed ones are filtered out. Only
    /// this path may feed live trading; historical-only listings are not a
    /// valid source of current markets.
    pub async fn get_markets(&self, active_only: bool) -> Result<Vec<ApiMarket>, DataClientError> {
        let url = format!("{}/markets", self.config.base_url);
        let query: Vec<(&str, String)> = if active_only {
            vec![("closed", "false".into())]
        } else {
            vec![]
        };
        let mut markets: Vec<ApiMarket> = self.get_json(&url, &query).await?;
        if active_only {
            markets.retain(|m| !m.closed.unwrap_or(false));
        }
        Ok(markets)
    }

    /// Top-K active markets by open interest (volume as fallback), flattened
    /// to asset IDs for the stream subscription set.
    pub async fn top_asset_ids(&self, k: usize) -> Result<Vec<String>, DataClientError> {
        let mut markets = self.get_markets(true).await?;
        markets.sort_by(|a, b| {
            let oa = a.open_interest.or(a.volume).unwrap_or_default();
            let ob = b.open_interest.or(b.volume).unwrap_or_default();
            ob.cmp(&oa)
        });

        let mut ids: Vec<String> = markets
            .iter()
            .take(k)
            .flat_map(|m| m.token_ids())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, DataClientError> {
        let mut attempt: u32 = 0;

        loop {
            loop {
                let delay = self.bucket.lock().await.acquire_delay(Instant::now());
                if delay.is_zero() {
                    break;
                }
                sleep(delay).await;
            }

            let response = self
                .http
                .get(url)
                .query(query)
                .timeout(self.config.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => match resp.status() {
                    status if status.is_success() => {
                        return resp
                            .json::<T>()
                            .await
                            .map_err(|e| DataClientError::Protocol(e.to_string()));
                    }
                    StatusCode::TOO_MANY_REQUESTS => {
                        if attempt >= self.config.max_retries {
                            return Err(DataClientError::RateLimited);
                        }
                        let wait = retry_after(&resp).unwrap_or_else(|| backoff_delay(attempt));
                        tracing::warn!(url, wait_secs = wait.as_secs(), "Data API rate limited");
                        sleep(wait).await;
                    }
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                        return Err(DataClientError::Auth);
                    }
                    status if status.is_server_error() => {
                        if attempt >= self.config.max_retries {
                            return Err(DataClientError::Transient(format!(
                                "server error {status} after {attempt} retries"
                            )));
                        }
                        sleep(backoff_delay(attempt)).await;
                    }
                    status => {
                        return Err(DataClientError::Protocol(format!(
                            "unexpected status {status}"
                        )));
                    }
                },
                Err(e) => {
                    if attempt >= self.config.max_retries {
                        return Err(DataClientError::Transient(e.to_string()));
                    }
                    tracing::debug!(url, error = %e, "Data API request failed, retrying");
                    sleep(backoff_delay(attempt)).await;
                }
            }

            attempt += 1;
        }
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// 1s → 16s doubling backoff.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(4))
}

/// Cursor over the paged trades endpoint. A short page ends the sequence.
pub struct TradePage {
    client: DataClient,
    filter: TradeFilter,
    offset: u32,
    done: bool,
}

impl TradePage {
    pub async fn next_page(&mut self) -> Result<Option<Vec<ApiTrade>>, DataClientError> {
        if self.done {
            return Ok(None);
        }

        let mut page = self.client.fetch_page_raw(&self.filter, self.offset).await?;
        let limit = self.filter.page_limit();

        // A short page on the wire ends the sequence; the time trim below
        // must not, or trimmed pages would truncate the walk early.
        if (page.len() as u32) < limit {
            self.done = true;
        }
        self.offset += limit;

        if let Some(since) = self.filter.since {
            page.retain(|t| t.traded_at().map(|ts| ts >= since).unwrap_or(true));
        }

        if page.is_empty() && self.done {
            Ok(None)
        } else {
            Ok(Some(page))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_16s() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(9), Duration::from_secs(16));
    }

    #[test]
    fn filter_limit_is_capped() {
        let filter = TradeFilter {
            limit: Some(5000),
            ..TradeFilter::default()
        };
        assert_eq!(filter.page_limit(), MAX_PAGE_LIMIT);

        let filter = TradeFilter {
            limit: Some(100),
            ..TradeFilter::default()
        };
        assert_eq!(filter.page_limit(), 100);
    }

    #[test]
    fn token_bucket_depletes_and_refills() {
        let mut bucket = TokenBucket::new(60); // one token per second
        let start = Instant::now();

        for _ in 0..60 {
            assert_eq!(bucket.acquire_delay(start), Duration::ZERO);
        }

        // Bucket empty: the next acquire must wait about one second.
        let wait = bucket.acquire_delay(start);
        assert!(wait > Duration::from_millis(900) && wait <= Duration::from_secs(1));

        // After two seconds of refill, a token is available again.
        let later = start + Duration::from_secs(2);
        assert_eq!(bucket.acquire_delay(later), Duration::ZERO);
    }
}
