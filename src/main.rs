use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::prelude::*;
use tokio::sync::watch;
use tracing::{error, info};

use tg_aqibot::notify::{Notifier, TelegramNotifier};
use tg_aqibot::waqi::{AqiService, WaqiClient};
use tg_aqibot::{config, db, handlers, scheduler};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let reader: Arc<dyn AqiService> = Arc::new(WaqiClient::from_config(&cfg)?);
    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(bot.clone()));

    // Spawn the hourly broadcast scheduler; shutdown flips after the repl exits.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sched = tokio::spawn(scheduler::run(
        pool.clone(),
        reader.clone(),
        notifier.clone(),
        shutdown_rx,
    ));

    info!("starting telegram bot");
    teloxide::repl(bot, move |_bot: Bot, msg: Message| {
        let pool = pool.clone();
        let reader = reader.clone();
        let notifier = notifier.clone();
        async move {
            let (Some(user), Some(text)) = (msg.from(), msg.text()) else {
                return respond(());
            };
            let user_id = user.id.0 as i64;
            if let Err(err) = handlers::handle_update(
                &pool,
                reader.as_ref(),
                notifier.as_ref(),
                msg.chat.id.0,
                user_id,
                text,
            )
            .await
            {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    let _ = shutdown_tx.send(true);
    sched.await?;
    info!("shutdown complete");
    Ok(())
}
