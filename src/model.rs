use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persistent per-chat subscription. A row exists once the chat has issued
/// `/set` at least once; clearing the station keeps the row around.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub chat_id: i64,
    /// User who last issued `/set` for this chat.
    pub set_by: i64,
    /// `None` means the chat is known but currently unsubscribed.
    pub station: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One station observation as reported by the upstream feed. Fetched fresh
/// per request and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub station_name: String,
    pub lat: f64,
    pub lng: f64,
    pub url: String,
    /// Observation timestamp, verbatim from the feed (`time.s`).
    pub observed_at: String,
    pub aqi: f64,
    /// PM2.5 sub-index.
    pub pm25: f64,
    pub attribution: String,
    pub station_id: i64,
}
