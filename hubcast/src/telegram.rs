//! Minimal Telegram Bot API client: `sendMessage` and long-polling `getUpdates`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::model::ChatId;

#[derive(Error, Debug)]
pub enum TelegramError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate limited by Telegram, retry after {0:?}")]
    RetryAfter(Duration),

    #[error("Telegram API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("invalid Bot API url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<i64>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
    disable_web_page_preview: bool,
}

#[derive(Debug, Serialize)]
struct GetUpdatesRequest {
    offset: i64,
    timeout: u64,
    allowed_updates: Vec<&'static str>,
}

pub struct TelegramClient {
    client: reqwest::Client,
    /// `<api_url>/bot<token>/`
    endpoint: Url,
}

impl TelegramClient {
    pub fn new(api_url: &str, token: &str, request_timeout: Duration) -> Result<Self, TelegramError> {
        // Tokens contain ':', so the path is assembled as text rather than joined.
        let endpoint = Url::parse(&format!("{}/bot{}/", api_url.trim_end_matches('/'), token))?;
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, endpoint })
    }

    pub async fn send_message(&self, chat: ChatId, text: &str, html: bool) -> Result<(), TelegramError> {
        let body = SendMessageRequest {
            chat_id: chat.0,
            text,
            parse_mode: html.then_some("HTML"),
            disable_web_page_preview: false,
        };
        let _: serde_json::Value = self.call("sendMessage", &body, None).await?;
        Ok(())
    }

    /// Long-polls for updates after `offset`. The HTTP timeout is extended by the poll
    /// timeout so an idle poll is not reported as a failure.
    pub async fn get_updates(&self, offset: i64, poll_timeout: Duration) -> Result<Vec<Update>, TelegramError> {
        let body = GetUpdatesRequest {
            offset,
            timeout: poll_timeout.as_secs(),
            allowed_updates: vec!["message"],
        };
        self.call("getUpdates", &body, Some(poll_timeout)).await
    }

    async fn call<B, T>(&self, method: &str, body: &B, extra_timeout: Option<Duration>) -> Result<T, TelegramError>
    where
        B: Serialize + ?Sized,
        T: for<'de> Deserialize<'de>,
    {
        let url = self.endpoint.join(method)?;
        let mut request = self.client.post(url).json(body);
        if let Some(extra) = extra_timeout {
            request = request.timeout(extra + Duration::from_secs(10));
        }

        let response: ApiResponse<T> = request.send().await?.json().await?;
        if response.ok {
            if let Some(result) = response.result {
                return Ok(result);
            }
        }

        if let Some(seconds) = response.parameters.and_then(|p| p.retry_after) {
            return Err(TelegramError::RetryAfter(Duration::from_secs(seconds)));
        }
        Err(TelegramError::Api {
            code: response.error_code.unwrap_or_default(),
            description: response.description.unwrap_or_else(|| "no description".to_string()),
        })
    }
}
