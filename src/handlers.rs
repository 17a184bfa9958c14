use crate::broadcast;
use crate::db;
use crate::notify::{Notifier, SendOpts};
use crate::waqi::AqiService;
use anyhow::Result;
use tracing::{info, instrument, warn};

pub const SET_USAGE: &str = "Usage: /set <station_id>";
pub const FIND_USAGE: &str = "Usage: /find <lat> <lng>";

const HELP_TEXT: &str = "Commands:\n\
/find <lat> <lng> - find the nearest monitoring station\n\
/set <station_id> - get hourly air quality readings for a station\n\
/unset - stop the hourly readings\n\
/now - current reading for your station";

const GENERIC_FAILURE: &str = "Something went wrong, please try again later.";

/// Inbound commands understood by the bot. Plain text is echoed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Set(Vec<String>),
    Unset,
    Now,
    Find(Vec<String>),
    Unknown,
    Echo(String),
}

impl Command {
    pub fn parse(text: &str) -> Command {
        let trimmed = text.trim();
        if !trimmed.starts_with('/') {
            return Command::Echo(trimmed.to_string());
        }
        let mut parts = trimmed.split_whitespace();
        let head = parts.next().unwrap_or_default();
        // Accept the `/cmd@botname` form used in group chats.
        let head = head.split('@').next().unwrap_or(head);
        let args: Vec<String> = parts.map(str::to_string).collect();
        match head {
            "/start" => Command::Start,
            "/help" => Command::Help,
            "/set" => Command::Set(args),
            "/unset" => Command::Unset,
            "/now" => Command::Now,
            "/find" => Command::Find(args),
            _ => Command::Unknown,
        }
    }
}

#[instrument(skip_all, fields(chat_id))]
pub async fn handle_update(
    pool: &db::Pool,
    reader: &dyn AqiService,
    notifier: &dyn Notifier,
    chat_id: i64,
    user_id: i64,
    text: &str,
) -> Result<()> {
    match Command::parse(text) {
        Command::Start => {
            notifier.notify(chat_id, "Hi!", SendOpts::default()).await?;
        }
        Command::Help => {
            notifier
                .notify(chat_id, HELP_TEXT, SendOpts::default())
                .await?;
        }
        Command::Set(args) => handle_set(pool, reader, notifier, chat_id, user_id, &args).await?,
        Command::Unset => handle_unset(pool, notifier, chat_id).await?,
        Command::Now => handle_now(pool, reader, notifier, chat_id).await?,
        Command::Find(args) => handle_find(reader, notifier, chat_id, &args).await?,
        Command::Unknown => {
            notifier
                .notify(chat_id, "Unknown command.", SendOpts::default())
                .await?;
        }
        Command::Echo(text) => {
            notifier.notify(chat_id, &text, SendOpts::default()).await?;
        }
    }
    Ok(())
}

async fn handle_set(
    pool: &db::Pool,
    reader: &dyn AqiService,
    notifier: &dyn Notifier,
    chat_id: i64,
    user_id: i64,
    args: &[String],
) -> Result<()> {
    let [station] = args else {
        notifier
            .notify(chat_id, SET_USAGE, SendOpts::default())
            .await?;
        return Ok(());
    };

    if let Err(err) = db::set_station(pool, chat_id, user_id, station).await {
        warn!(?err, chat_id, "failed to store subscription");
        notifier
            .notify(chat_id, GENERIC_FAILURE, SendOpts::default())
            .await?;
        return Ok(());
    }
    info!(chat_id, station, "subscription set");
    notifier
        .notify(chat_id, "Notification successfully set!", SendOpts::default())
        .await?;

    // First reading right away; the hourly schedule takes over from here.
    if let Err(err) = broadcast::deliver(reader, notifier, chat_id, station).await {
        warn!(?err, chat_id, station, "initial delivery failed");
    }
    Ok(())
}

async fn handle_unset(pool: &db::Pool, notifier: &dyn Notifier, chat_id: i64) -> Result<()> {
    match db::get_subscription(pool, chat_id).await {
        Err(err) => {
            warn!(?err, chat_id, "failed to read subscription");
            notifier
                .notify(chat_id, GENERIC_FAILURE, SendOpts::default())
                .await?;
        }
        Ok(None) => {
            notifier
                .notify(chat_id, "You have no active timer", SendOpts::default())
                .await?;
        }
        Ok(Some(_)) => {
            if let Err(err) = db::clear_station(pool, chat_id).await {
                warn!(?err, chat_id, "failed to clear subscription");
                notifier
                    .notify(chat_id, GENERIC_FAILURE, SendOpts::default())
                    .await?;
                return Ok(());
            }
            info!(chat_id, "subscription cleared");
            notifier
                .notify(chat_id, "Timer successfully unset!", SendOpts::default())
                .await?;
        }
    }
    Ok(())
}

async fn handle_now(
    pool: &db::Pool,
    reader: &dyn AqiService,
    notifier: &dyn Notifier,
    chat_id: i64,
) -> Result<()> {
    let station = match db::get_subscription(pool, chat_id).await {
        Err(err) => {
            warn!(?err, chat_id, "failed to read subscription");
            notifier
                .notify(chat_id, GENERIC_FAILURE, SendOpts::default())
                .await?;
            return Ok(());
        }
        Ok(sub) => sub.and_then(|s| s.station),
    };
    let Some(station) = station else {
        notifier
            .notify(chat_id, "Set a station with /set first.", SendOpts::default())
            .await?;
        return Ok(());
    };

    if let Err(err) = broadcast::deliver(reader, notifier, chat_id, &station).await {
        warn!(?err, chat_id, station, "on-demand delivery failed");
        notifier
            .notify(
                chat_id,
                "Could not fetch the current reading, please try again later.",
                SendOpts::default(),
            )
            .await?;
    }
    Ok(())
}

async fn handle_find(
    reader: &dyn AqiService,
    notifier: &dyn Notifier,
    chat_id: i64,
    args: &[String],
) -> Result<()> {
    let coords = match args {
        [lat, lng] => lat.parse::<f64>().ok().zip(lng.parse::<f64>().ok()),
        _ => None,
    };
    let Some((lat, lng)) = coords else {
        notifier
            .notify(chat_id, FIND_USAGE, SendOpts::default())
            .await?;
        return Ok(());
    };

    info!(lat, lng, "find station");
    match reader.fetch_nearest(lat, lng).await {
        Ok(reading) => {
            notifier
                .notify(
                    chat_id,
                    &broadcast::format_station(&reading),
                    SendOpts::default(),
                )
                .await?;
        }
        Err(err) => {
            warn!(?err, lat, lng, "nearest station lookup failed");
            notifier
                .notify(
                    chat_id,
                    "Could not reach the air quality service, please try again later.",
                    SendOpts::default(),
                )
                .await?;
        }
    }
    Ok(())
}
