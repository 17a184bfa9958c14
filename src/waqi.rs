use crate::config::Config;
use crate::model::Reading;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const WAQI_API_BASE: &str = "https://api.waqi.info/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Total attempts per fetch, counting the first one.
pub const MAX_ATTEMPTS: u32 = 3;
/// Fixed pause between attempts. No backoff.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid station spec: {0}")]
    InvalidStationSpec(String),
    /// Every attempt against the upstream API failed.
    #[error("upstream unavailable after {attempts} attempts: {last}")]
    UpstreamUnavailable { attempts: u32, last: String },
    /// The upstream reported success but the payload is unusable.
    #[error("malformed upstream response: missing or invalid `{0}`")]
    MalformedResponse(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: MAX_ATTEMPTS,
            delay: RETRY_DELAY,
        }
    }
}

/// Read-side of the air quality feed. Implemented over HTTP by [`WaqiClient`];
/// tests substitute recording fakes.
#[async_trait]
pub trait AqiService: Send + Sync {
    /// Current reading for a named or numbered station (`@<id>` form included).
    async fn fetch_station(&self, station: &str) -> Result<Reading, FetchError>;
    /// Current reading for the station nearest to the coordinates.
    async fn fetch_nearest(&self, lat: f64, lng: f64) -> Result<Reading, FetchError>;
}

#[derive(Clone)]
pub struct WaqiClient {
    http: Client,
    base_url: Url,
    token: String,
    retry: RetryPolicy,
}

impl fmt::Debug for WaqiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaqiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl WaqiClient {
    pub fn new(token: String) -> Self {
        let base_url = Url::parse(WAQI_API_BASE).expect("valid default WAQI URL");
        Self::with_base_url(token, base_url)
    }

    pub fn with_base_url(token: String, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("tg-aqibot/0.1")
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let base_url = Url::parse(&cfg.waqi.base_url).context("invalid waqi.base_url")?;
        Ok(Self::with_base_url(cfg.waqi.token.clone(), base_url))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn feed_url(&self, spec: &str) -> Result<Url, FetchError> {
        let mut url = self
            .base_url
            .join(&format!("feed/{spec}/"))
            .map_err(|_| FetchError::InvalidStationSpec(spec.to_string()))?;
        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url)
    }

    /// One request against the feed endpoint. Any transport failure or
    /// non-"ok" payload status is a transient error described by the string.
    async fn request_feed(&self, url: Url) -> Result<Value, String> {
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| format!("request failed: {err}"))?;
        if !res.status().is_success() {
            return Err(format!("http status {}", res.status()));
        }
        let payload: Value = res
            .json()
            .await
            .map_err(|err| format!("invalid json body: {err}"))?;
        match payload.get("status").and_then(Value::as_str) {
            Some("ok") => Ok(payload),
            other => Err(format!("upstream status {}", other.unwrap_or("missing"))),
        }
    }

    async fn fetch_feed(&self, spec: &str) -> Result<Reading, FetchError> {
        let url = self.feed_url(spec)?;
        debug!(spec, "requesting feed");
        let payload = fetch_with_retry(self.retry, || self.request_feed(url.clone())).await?;
        match parse_reading(&payload) {
            Ok(reading) => Ok(reading),
            Err(err) => {
                warn!(%err, payload = %payload, "malformed upstream payload");
                Err(err)
            }
        }
    }
}

#[async_trait]
impl AqiService for WaqiClient {
    async fn fetch_station(&self, station: &str) -> Result<Reading, FetchError> {
        self.fetch_feed(station).await
    }

    async fn fetch_nearest(&self, lat: f64, lng: f64) -> Result<Reading, FetchError> {
        self.fetch_feed(&format!("geo:{lat:.8};{lng:.8}")).await
    }
}

/// Run `attempt` up to `policy.attempts` times, pausing `policy.delay` between
/// tries. Only transient errors are retried; a successful payload is returned
/// as-is for the caller to parse.
async fn fetch_with_retry<F, Fut>(policy: RetryPolicy, mut attempt: F) -> Result<Value, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, String>>,
{
    let mut last = String::new();
    for n in 1..=policy.attempts {
        match attempt().await {
            Ok(payload) => return Ok(payload),
            Err(err) => {
                warn!(attempt = n, error = %err, "upstream attempt failed");
                last = err;
                if n < policy.attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }
    Err(FetchError::UpstreamUnavailable {
        attempts: policy.attempts,
        last,
    })
}

/// Pull the fields the bot cares about out of an `"ok"` feed payload.
pub fn parse_reading(payload: &Value) -> Result<Reading, FetchError> {
    let data = payload
        .get("data")
        .ok_or(FetchError::MalformedResponse("data"))?;
    let city = data
        .get("city")
        .ok_or(FetchError::MalformedResponse("city"))?;
    let station_name = city
        .get("name")
        .and_then(Value::as_str)
        .ok_or(FetchError::MalformedResponse("city.name"))?;
    let geo = city
        .get("geo")
        .and_then(Value::as_array)
        .ok_or(FetchError::MalformedResponse("city.geo"))?;
    let lat = geo
        .first()
        .and_then(Value::as_f64)
        .ok_or(FetchError::MalformedResponse("city.geo[0]"))?;
    let lng = geo
        .get(1)
        .and_then(Value::as_f64)
        .ok_or(FetchError::MalformedResponse("city.geo[1]"))?;
    let url = city
        .get("url")
        .and_then(Value::as_str)
        .ok_or(FetchError::MalformedResponse("city.url"))?;
    let observed_at = data
        .get("time")
        .and_then(|t| t.get("s"))
        .and_then(Value::as_str)
        .ok_or(FetchError::MalformedResponse("time.s"))?;
    let aqi = data
        .get("aqi")
        .and_then(Value::as_f64)
        .ok_or(FetchError::MalformedResponse("aqi"))?;
    let pm25 = data
        .get("iaqi")
        .and_then(|i| i.get("pm25"))
        .and_then(|p| p.get("v"))
        .and_then(Value::as_f64)
        .ok_or(FetchError::MalformedResponse("iaqi.pm25.v"))?;
    let attribution = data
        .get("attributions")
        .and_then(|a| a.get(0))
        .and_then(|a| a.get("name"))
        .and_then(Value::as_str)
        .ok_or(FetchError::MalformedResponse("attributions[0].name"))?;
    let station_id = data
        .get("idx")
        .and_then(Value::as_i64)
        .ok_or(FetchError::MalformedResponse("idx"))?;

    Ok(Reading {
        station_name: station_name.to_string(),
        lat,
        lng,
        url: url.to_string(),
        observed_at: observed_at.to_string(),
        aqi,
        pm25,
        attribution: attribution.to_string(),
        station_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_payload() -> Value {
        json!({
            "status": "ok",
            "data": {
                "aqi": 74,
                "idx": 1451,
                "city": {
                    "name": "Beijing (北京)",
                    "geo": [39.954592, 116.468117],
                    "url": "https://aqicn.org/city/beijing"
                },
                "time": { "s": "2024-03-01 14:00:00" },
                "iaqi": { "pm25": { "v": 74 } },
                "attributions": [
                    { "name": "Beijing Environmental Protection Monitoring Center" }
                ]
            }
        })
    }

    #[test]
    fn feed_url_carries_spec_and_token() {
        let base = Url::parse("http://waqi.test/").unwrap();
        let client = WaqiClient::with_base_url("secret".into(), base);
        let url = client.feed_url("@1451").unwrap();
        assert_eq!(url.path(), "/feed/@1451/");
        assert_eq!(url.query(), Some("token=secret"));

        let url = client.feed_url("geo:39.95459200;116.46811700").unwrap();
        assert_eq!(url.path(), "/feed/geo:39.95459200;116.46811700/");
    }

    #[test]
    fn parse_ok_payload() {
        let reading = parse_reading(&ok_payload()).unwrap();
        assert_eq!(reading.station_name, "Beijing (北京)");
        assert_eq!(reading.station_id, 1451);
        assert_eq!(reading.aqi, 74.0);
        assert_eq!(reading.pm25, 74.0);
        assert_eq!(reading.observed_at, "2024-03-01 14:00:00");
        assert_eq!(reading.lat, 39.954592);
        assert_eq!(reading.lng, 116.468117);
        assert_eq!(
            reading.attribution,
            "Beijing Environmental Protection Monitoring Center"
        );
    }

    #[test]
    fn parse_rejects_missing_pm25() {
        let mut payload = ok_payload();
        payload["data"]["iaqi"] = json!({});
        let err = parse_reading(&payload).unwrap_err();
        assert!(matches!(
            err,
            FetchError::MalformedResponse("iaqi.pm25.v")
        ));
    }

    #[test]
    fn parse_rejects_non_numeric_aqi() {
        let mut payload = ok_payload();
        payload["data"]["aqi"] = json!("-");
        let err = parse_reading(&payload).unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse("aqi")));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_third_attempt() {
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_secs(5),
        };
        let mut calls = 0u32;
        let start = tokio::time::Instant::now();
        let payload = fetch_with_retry(policy, || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Err("upstream status error".to_string())
                } else {
                    Ok(ok_payload())
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(calls, 3);
        // Two inter-attempt pauses of the configured delay.
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(payload["status"], "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_after_max_attempts() {
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_secs(5),
        };
        let mut calls = 0u32;
        let err = fetch_with_retry(policy, || {
            calls += 1;
            async { Err("upstream status error".to_string()) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls, 3);
        match err {
            FetchError::UpstreamUnavailable { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.contains("upstream status"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn first_success_makes_a_single_attempt() {
        let mut calls = 0u32;
        let payload = fetch_with_retry(RetryPolicy::default(), || {
            calls += 1;
            async { Ok(ok_payload()) }
        })
        .await
        .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(payload["data"]["idx"], 1451);
    }
}
