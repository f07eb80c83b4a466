use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use crate::error::{Error, Result};
use crate::models::Candle;

pub const KRAKEN_API_BASE: &str = "https://api.kraken.com";

/// OHLC interval for 4h candles, in minutes
pub const INTERVAL_4H_MIN: u32 = 240;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 1000;
const REQUEST_TIMEOUT_SECS: u64 = 15;
const PAIRS_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

type KrakenRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Anything that can serve exchange candles
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Exchange clock, epoch seconds
    async fn server_time(&self) -> Result<i64>;

    /// Candles for a `BASE/QUOTE` pair, oldest first
    async fn ohlc(&self, pair: &str, interval_min: u32, since: Option<i64>) -> Result<Vec<Candle>>;
}

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
struct KrakenResponse<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ServerTime {
    unixtime: i64,
}

#[derive(Debug, Deserialize)]
struct AssetPairRaw {
    base: String,
    quote: String,
    #[serde(default)]
    pair_decimals: Option<u32>,
    #[serde(default)]
    lot_decimals: Option<u32>,
    #[serde(default)]
    ordermin: Option<String>,
}

// ============== Public Types ==============

#[derive(Debug, Clone, PartialEq)]
pub struct AssetPairInfo {
    /// Kraken's key, e.g. `XXBTZEUR`
    pub internal_key: String,
    /// Readable form, e.g. `XBT/EUR`
    pub pretty_pair: String,
    pub base: String,
    pub quote: String,
    pub pair_decimals: Option<u32>,
    pub lot_decimals: Option<u32>,
    pub ordermin: Option<String>,
}

#[derive(Debug)]
struct PairsCache {
    by_pretty: HashMap<String, AssetPairInfo>,
    fetched_at: Instant,
}

/// Strip Kraken's legacy X/Z asset prefix (`XXBT` -> `XBT`, `ZEUR` -> `EUR`)
pub fn normalize_asset(code: &str) -> &str {
    code.strip_prefix(&['X', 'Z'][..]).unwrap_or(code)
}

// ============== Implementation ==============

/// Client for Kraken's public REST endpoints
///
/// Cloneable; clones share the rate limiter and the asset-pair cache.
#[derive(Clone)]
pub struct KrakenClient {
    client: Client,
    base_url: String,
    pairs: Arc<Mutex<Option<PairsCache>>>,
    rate_limiter: Arc<KrakenRateLimiter>,
    initial_backoff_ms: u64,
}

impl KrakenClient {
    /// # Arguments
    /// * `base_url` - API root, `https://api.kraken.com` in production
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            pairs: Arc::new(Mutex::new(None)),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(NonZeroU32::MIN))),
            initial_backoff_ms: INITIAL_BACKOFF_MS,
        })
    }

    /// Override the request quota (public endpoints allow about one per second)
    pub fn with_requests_per_second(mut self, rps: u32) -> Self {
        let rps = NonZeroU32::new(rps).unwrap_or(NonZeroU32::MIN);
        self.rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Rate-limited GET with retry on transport errors, 429 and 5xx
    async fn public_get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.client.get(&url).query(query).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let envelope: KrakenResponse<T> = response.json().await?;
                        return unwrap_envelope(path, envelope);
                    }

                    if status != StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
                        return Err(Error::Exchange(format!("{} returned {}", path, status)));
                    }

                    last_error = Some(Error::Exchange(format!("{} returned {}", path, status)));
                }
                Err(e) => {
                    last_error = Some(Error::Http(e));
                }
            }

            if attempt < MAX_RETRIES {
                let jitter = rand::thread_rng().gen_range(0..=self.initial_backoff_ms / 4);
                let backoff_ms = self.initial_backoff_ms * 2_u64.pow(attempt - 1) + jitter;
                tracing::warn!(
                    "Kraken {} attempt {}/{} failed: {}. Retrying in {}ms...",
                    path,
                    attempt,
                    MAX_RETRIES,
                    last_error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default(),
                    backoff_ms
                );
                sleep(Duration::from_millis(backoff_ms)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Exchange(format!("{} failed", path))))
    }

    /// Tradable pairs keyed by readable name, cached for five minutes
    pub async fn asset_pairs(&self) -> Result<HashMap<String, AssetPairInfo>> {
        let mut cache = self.pairs.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < PAIRS_CACHE_TTL {
                return Ok(cached.by_pretty.clone());
            }
        }

        let raw: HashMap<String, AssetPairRaw> = self.public_get("/0/public/AssetPairs", &[]).await?;

        // Iterate in key order so duplicate readable names resolve deterministically
        let mut keys: Vec<&String> = raw.keys().collect();
        keys.sort();

        let mut by_pretty = HashMap::new();
        for key in keys {
            let entry = &raw[key];
            let base = normalize_asset(&entry.base).to_string();
            let quote = normalize_asset(&entry.quote).to_string();
            let pretty_pair = format!("{}/{}", base, quote);
            by_pretty.entry(pretty_pair.clone()).or_insert(AssetPairInfo {
                internal_key: key.clone(),
                pretty_pair,
                base,
                quote,
                pair_decimals: entry.pair_decimals,
                lot_decimals: entry.lot_decimals,
                ordermin: entry.ordermin.clone(),
            });
        }

        tracing::debug!("Kraken pairs cached: {}", by_pretty.len());

        *cache = Some(PairsCache {
            by_pretty: by_pretty.clone(),
            fetched_at: Instant::now(),
        });

        Ok(by_pretty)
    }

    async fn resolve_internal_key(&self, pair: &str) -> Result<String> {
        let pairs = self.asset_pairs().await?;
        pairs
            .get(pair)
            .map(|info| info.internal_key.clone())
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "unknown Kraken pair \"{}\" (expected BASE/QUOTE, e.g. XBT/EUR)",
                    pair
                ))
            })
    }
}

#[async_trait]
impl CandleSource for KrakenClient {
    async fn server_time(&self) -> Result<i64> {
        let time: ServerTime = self.public_get("/0/public/Time", &[]).await?;
        Ok(time.unixtime)
    }

    async fn ohlc(&self, pair: &str, interval_min: u32, since: Option<i64>) -> Result<Vec<Candle>> {
        let internal_key = self.resolve_internal_key(pair).await?;

        let mut query = vec![
            ("pair", internal_key.clone()),
            ("interval", interval_min.to_string()),
        ];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }

        let result: HashMap<String, Value> = self.public_get("/0/public/OHLC", &query).await?;

        // Rows sit under the internal key; fall back to any array entry
        let rows = result
            .get(&internal_key)
            .or_else(|| result.iter().find(|(k, v)| *k != "last" && v.is_array()).map(|(_, v)| v))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        rows.iter().map(|row| parse_ohlc_row(pair, row)).collect()
    }
}

fn unwrap_envelope<T>(path: &str, envelope: KrakenResponse<T>) -> Result<T> {
    if !envelope.error.is_empty() {
        return Err(Error::Exchange(envelope.error.join(", ")));
    }
    envelope
        .result
        .ok_or_else(|| Error::Exchange(format!("{} returned no result", path)))
}

/// `[time, open, high, low, close, vwap, volume, count]`, prices as strings
fn parse_ohlc_row(pair: &str, row: &Value) -> Result<Candle> {
    let fields = row
        .as_array()
        .ok_or_else(|| Error::Exchange(format!("malformed OHLC row: {}", row)))?;

    let time = fields
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Exchange(format!("OHLC row without time: {}", row)))?;

    let number = |idx: usize| -> Result<f64> {
        let field = fields
            .get(idx)
            .ok_or_else(|| Error::Exchange(format!("OHLC row too short: {}", row)))?;
        match field {
            Value::String(s) => s
                .parse::<f64>()
                .map_err(|e| Error::Exchange(format!("bad OHLC number {:?}: {}", s, e))),
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| Error::Exchange(format!("bad OHLC number {}", n))),
            other => Err(Error::Exchange(format!("bad OHLC field {}", other))),
        }
    };

    Ok(Candle {
        pair: pair.to_string(),
        time,
        open: number(1)?,
        high: number(2)?,
        low: number(3)?,
        close: number(4)?,
        volume: number(6)?,
    })
}
