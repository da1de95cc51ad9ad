use teloxide::Bot;
use teloxide::prelude::Requester;
use teloxide::types::ChatId;
use tracing::{debug, warn};

use crate::config::AppConfig;

/// Fire-and-forget operator notifications (credential renewal outcomes).
/// Delivery failures are logged and dropped; nothing in the orchestration
/// path ever waits on or fails because of a notification.
pub struct Notifier {
    channel: Option<(Bot, ChatId)>,
}

impl Notifier {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let channel = match (
            cfg.telegram_bot_token.is_empty(),
            cfg.telegram_chat_id.parse::<i64>(),
        ) {
            (false, Ok(chat_id)) => Some((Bot::new(&cfg.telegram_bot_token), ChatId(chat_id))),
            (false, Err(_)) => {
                warn!("notifier disabled: PRISM_TELEGRAM_CHAT_ID is not a numeric chat id");
                None
            }
            _ => None,
        };
        Self { channel }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self { channel: None }
    }

    pub fn send(&self, text: String) {
        let Some((bot, chat_id)) = self.channel.clone() else {
            debug!("notification dropped (no channel configured): {text}");
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = bot.send_message(chat_id, text).await {
                warn!("notification delivery failed: {e}");
            }
        });
    }
}
