use crate::model::Subscription;
use anyhow::Result;
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs and non-sqlite schemes
/// untouched. Returns the possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    // Expand leading ~/ to HOME
    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_subscription(pool: &Pool, chat_id: i64) -> Result<Option<Subscription>> {
    let sub = sqlx::query_as::<_, Subscription>(
        "SELECT chat_id, set_by, station, created_at, updated_at FROM subscriptions WHERE chat_id = ?",
    )
    .bind(chat_id)
    .fetch_optional(pool)
    .await?;
    Ok(sub)
}

/// Upsert the subscription for `chat_id`. Overwrites both the station and the
/// owner; whoever issues `/set` last owns the subscription.
#[instrument(skip_all)]
pub async fn set_station(pool: &Pool, chat_id: i64, set_by: i64, station: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO subscriptions (chat_id, set_by, station) VALUES (?, ?, ?)
         ON CONFLICT(chat_id) DO UPDATE SET
             station = excluded.station,
             set_by = excluded.set_by,
             updated_at = CURRENT_TIMESTAMP",
    )
    .bind(chat_id)
    .bind(set_by)
    .bind(station)
    .execute(pool)
    .await?;
    Ok(())
}

/// Clear the station but keep the subscription row (and its owner) around.
/// Returns whether a row existed for `chat_id`.
#[instrument(skip_all)]
pub async fn clear_station(pool: &Pool, chat_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE subscriptions SET station = NULL, updated_at = CURRENT_TIMESTAMP WHERE chat_id = ?",
    )
    .bind(chat_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Snapshot of all subscription rows, for the broadcast tick.
#[instrument(skip_all)]
pub async fn list_subscriptions(pool: &Pool) -> Result<Vec<Subscription>> {
    let subs = sqlx::query_as::<_, Subscription>(
        "SELECT chat_id, set_by, station, created_at, updated_at FROM subscriptions ORDER BY chat_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(subs)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn set_then_clear_keeps_record() {
        let pool = setup_pool().await;

        assert!(get_subscription(&pool, 7).await.unwrap().is_none());
        set_station(&pool, 7, 42, "beijing").await.unwrap();

        let sub = get_subscription(&pool, 7).await.unwrap().unwrap();
        assert_eq!(sub.set_by, 42);
        assert_eq!(sub.station.as_deref(), Some("beijing"));

        assert!(clear_station(&pool, 7).await.unwrap());
        let sub = get_subscription(&pool, 7).await.unwrap().unwrap();
        assert_eq!(sub.set_by, 42);
        assert!(sub.station.is_none());
    }

    #[tokio::test]
    async fn clear_without_record_reports_absence() {
        let pool = setup_pool().await;
        assert!(!clear_station(&pool, 1).await.unwrap());
    }

    #[tokio::test]
    async fn reset_overwrites_station_and_owner() {
        let pool = setup_pool().await;
        set_station(&pool, 7, 1, "beijing").await.unwrap();
        set_station(&pool, 7, 2, "shanghai").await.unwrap();

        let sub = get_subscription(&pool, 7).await.unwrap().unwrap();
        assert_eq!(sub.set_by, 2);
        assert_eq!(sub.station.as_deref(), Some("shanghai"));

        let all = list_subscriptions(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn list_returns_cleared_rows_too() {
        let pool = setup_pool().await;
        set_station(&pool, 1, 1, "a").await.unwrap();
        set_station(&pool, 2, 2, "b").await.unwrap();
        clear_station(&pool, 2).await.unwrap();

        let all = list_subscriptions(&pool).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].station.as_deref(), Some("a"));
        assert!(all[1].station.is_none());
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        assert_eq!(
            prepare_sqlite_url("sqlite:///tmp/aqibot/db.sqlite?mode=rwc"),
            "sqlite:///tmp/aqibot/db.sqlite?mode=rwc"
        );
    }
}
