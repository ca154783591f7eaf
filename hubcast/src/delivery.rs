use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::hubs::HubCatalog;
use crate::model::{Article, ChatId};
use crate::rate_limit::RequestPacer;
use crate::telegram::{TelegramClient, TelegramError};

/// Result of handing one article to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Accepted,
    Rejected(String),
}

/// Transport that delivers one article to one chat. Never retried by the engine.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(&self, chat: ChatId, article: &Article) -> DispatchOutcome;
}

/// Longest `retry_after` the dispatcher is willing to sleep through.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Sends articles as HTML messages through the Bot API.
///
/// Platform rate limits are handled here: sends are paced, and a 429 is retried once
/// after the advertised `retry_after`.
pub struct TelegramDispatcher {
    client: Arc<TelegramClient>,
    catalog: Arc<HubCatalog>,
    pacer: RequestPacer,
}

impl TelegramDispatcher {
    pub fn new(client: Arc<TelegramClient>, catalog: Arc<HubCatalog>, send_interval: Duration) -> Self {
        Self {
            client,
            catalog,
            pacer: RequestPacer::new(send_interval),
        }
    }
}

#[async_trait]
impl Dispatcher for TelegramDispatcher {
    async fn send(&self, chat: ChatId, article: &Article) -> DispatchOutcome {
        let text = format_article(&self.catalog, article);

        let mut retried = false;
        loop {
            self.pacer.wait().await;
            match self.client.send_message(chat, &text, true).await {
                Ok(()) => {
                    debug!(chat_id = %chat, article = %article.id, "article sent");
                    return DispatchOutcome::Accepted;
                }
                Err(TelegramError::RetryAfter(wait)) if !retried && wait <= MAX_RETRY_AFTER => {
                    warn!(chat_id = %chat, ?wait, "telegram rate limit hit, retrying once");
                    retried = true;
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return DispatchOutcome::Rejected(e.to_string()),
            }
        }
    }
}

/// Telegram HTML body for one article.
pub fn format_article(catalog: &HubCatalog, article: &Article) -> String {
    format!(
        "<b>{}</b>\n<a href=\"{}\">{}</a>",
        escape_html(catalog.display_name(&article.hub)),
        escape_html(&article.url),
        escape_html(&article.title),
    )
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
