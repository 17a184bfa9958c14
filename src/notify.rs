use anyhow::Result;
use async_trait::async_trait;
use teloxide::payloads::SendMessageSetters;
use teloxide::prelude::*;
use teloxide::types::{ChatId, ParseMode};

/// Per-message send options. `silent` suppresses the client-side notification
/// sound; `markdown` enables markup parsing for the bold reading numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOpts {
    pub silent: bool,
    pub markdown: bool,
}

/// Outbound side of the chat transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, chat_id: i64, text: &str, opts: SendOpts) -> Result<()>;
}

pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, chat_id: i64, text: &str, opts: SendOpts) -> Result<()> {
        let mut req = self
            .bot
            .send_message(ChatId(chat_id), text)
            .disable_notification(opts.silent);
        if opts.markdown {
            req = req.parse_mode(ParseMode::Markdown);
        }
        req.await?;
        Ok(())
    }
}
