use crate::aqi;
use crate::model::Reading;
use crate::notify::{Notifier, SendOpts};
use crate::waqi::AqiService;
use anyhow::Result;
use tracing::info;

/// Readings at or below this AQI are delivered without a notification sound.
pub const ALERT_THRESHOLD: f64 = 100.0;

/// The broadcast message template. Numbers are bolded via markdown.
pub fn format_reading(r: &Reading) -> String {
    format!(
        "{} - {}\nAQI: \t*{}*\nPM 2.5 AQI:\t *{}*\nConcentration: *{}* ug/m3",
        r.station_name,
        r.observed_at,
        r.aqi,
        r.pm25,
        aqi::concentration(r.pm25)
    )
}

/// The `/find` reply: where the station is and who runs it.
pub fn format_station(r: &Reading) -> String {
    format!(
        "name: {} @ {};{}\nid: {}\nlink: {}\nauthority: {}",
        r.station_name, r.lat, r.lng, r.station_id, r.url, r.attribution
    )
}

/// Fetch the station's current reading and push it to `chat_id`. Unhealthy
/// readings ring; everything else arrives silently.
pub async fn deliver(
    reader: &dyn AqiService,
    notifier: &dyn Notifier,
    chat_id: i64,
    station: &str,
) -> Result<()> {
    let reading = reader.fetch_station(station).await?;
    let silent = reading.aqi <= ALERT_THRESHOLD;
    let text = format_reading(&reading);
    notifier
        .notify(
            chat_id,
            &text,
            SendOpts {
                silent,
                markdown: true,
            },
        )
        .await?;
    info!(chat_id, station, aqi = reading.aqi, "delivered reading");
    Ok(())
}
