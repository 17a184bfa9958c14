use crate::broadcast;
use crate::db;
use crate::notify::Notifier;
use crate::waqi::AqiService;
use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

/// Minute of the hour each broadcast fires at.
pub const BROADCAST_MINUTE: u32 = 20;
/// Fixed period between fires, measured from the first one.
pub const BROADCAST_PERIOD: Duration = Duration::from_secs(3600);

/// Wall-clock time of the first broadcast at or after `now`: minute 20 of the
/// current hour if that is still ahead, otherwise minute 20 of the next one.
pub fn first_fire_after(now: DateTime<Local>) -> DateTime<Local> {
    let aligned = now
        .with_minute(BROADCAST_MINUTE)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .expect("minute and second are in range");
    if now.minute() < BROADCAST_MINUTE {
        aligned
    } else {
        aligned + ChronoDuration::hours(1)
    }
}

/// Recurring broadcast loop. Sleeps until the aligned first fire, then ticks
/// every [`BROADCAST_PERIOD`] until `shutdown` flips. Ticks run to completion;
/// shutdown is only observed between them.
pub async fn run(
    pool: db::Pool,
    reader: Arc<dyn AqiService>,
    notifier: Arc<dyn Notifier>,
    mut shutdown: watch::Receiver<bool>,
) {
    let first = first_fire_after(Local::now());
    let wait = (first - Local::now()).to_std().unwrap_or_default();
    info!(first_fire = %first, "broadcast scheduler armed");

    let start = tokio::time::Instant::now() + wait;
    let mut ticks = tokio::time::interval_at(start, BROADCAST_PERIOD);
    loop {
        tokio::select! {
            _ = ticks.tick() => {
                broadcast_tick(&pool, reader.as_ref(), notifier.as_ref()).await;
            }
            _ = shutdown.changed() => {
                info!("broadcast scheduler stopping");
                return;
            }
        }
    }
}

/// One broadcast pass over every subscription with a station set. Failures
/// are isolated per subscriber; a single bad station or unreachable chat
/// never stops the rest of the batch.
#[instrument(skip_all)]
pub async fn broadcast_tick(pool: &db::Pool, reader: &dyn AqiService, notifier: &dyn Notifier) {
    let subs = match db::list_subscriptions(pool).await {
        Ok(subs) => subs,
        Err(err) => {
            warn!(?err, "failed to list subscriptions; skipping tick");
            return;
        }
    };
    info!(subscriptions = subs.len(), "broadcast tick");
    for sub in subs {
        let Some(station) = sub.station.as_deref() else {
            continue;
        };
        if let Err(err) = broadcast::deliver(reader, notifier, sub.chat_id, station).await {
            warn!(?err, chat_id = sub.chat_id, station, "broadcast delivery failed");
        }
    }
}
