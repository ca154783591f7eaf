use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::FetchError;
use crate::hubs::Hub;
use crate::model::{Article, FetchWindow};
use crate::rate_limit::RequestPacer;
use crate::scraping::{self, ListingEntry};

/// Source of candidate articles for one hub.
///
/// Implementations are called concurrently for distinct hubs and may return articles in
/// any order; the engine sorts, filters and deduplicates.
#[async_trait]
pub trait ArticleFetcher: Send + Sync {
    async fn fetch(&self, hub: &Hub, window: &FetchWindow) -> Result<Vec<Article>, FetchError>;

    /// Extra time a fetch may spend queued behind the requests of `concurrent_hubs`
    /// fetches running alongside it. Added to the engine's per-hub timeout.
    fn pacing_allowance(&self, _concurrent_hubs: usize) -> Duration {
        Duration::ZERO
    }
}

/// Listing pages a typical hub needs before reaching a page older than the window.
const EXPECTED_PAGES_PER_HUB: u32 = 3;

/// Fetches Habr hub listing pages, newest first, until a page is entirely older than the
/// window (or `max_pages` is reached).
pub struct HabrFetcher {
    client: Client,
    base_url: Url,
    max_pages: u32,
    max_retries: u32,
    window_slack: ChronoDuration,
    pacer: Arc<RequestPacer>,
}

impl HabrFetcher {
    pub fn new(base_url: Url, pacer: Arc<RequestPacer>) -> Result<Self, FetchError> {
        Self::with_client(
            base_url,
            pacer,
            Duration::from_secs(10),
            "Mozilla/5.0 (compatible; hubcast/0.1; +https://github.com/hubcast/hubcast)",
        )
    }

    pub fn with_client(
        base_url: Url,
        pacer: Arc<RequestPacer>,
        request_timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            client,
            base_url,
            max_pages: 50,
            max_retries: 3,
            window_slack: ChronoDuration::minutes(5),
            pacer,
        })
    }

    pub fn from_config(cfg: &common::FetcherConfig) -> anyhow::Result<Self> {
        let pacer = Arc::new(RequestPacer::new(Duration::from_millis(
            cfg.request_interval_ms.unwrap_or(1000),
        )));
        let user_agent = cfg.user_agent.clone().unwrap_or_else(|| {
            "Mozilla/5.0 (compatible; hubcast/0.1; +https://github.com/hubcast/hubcast)".to_string()
        });
        let fetcher = Self::with_client(
            cfg.base_url()?,
            pacer,
            Duration::from_secs(cfg.request_timeout_seconds.unwrap_or(10)),
            &user_agent,
        )?
        .with_limits(cfg.max_pages.unwrap_or(50), cfg.max_retries.unwrap_or(3));
        Ok(fetcher)
    }

    pub fn with_limits(mut self, max_pages: u32, max_retries: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self.max_retries = max_retries.max(1);
        self
    }

    fn listing_url(&self, hub: &Hub, page: u32) -> Result<Url, FetchError> {
        self.base_url
            .join(&format!("ru/hubs/{}/articles/page{}/", hub.id, page))
            .map_err(|e| FetchError::Parse(format!("bad listing url for hub {}: {}", hub.id, e)))
    }

    /// GET with retries on network errors, 5xx and 429. `Ok(None)` means the page does
    /// not exist (404), which ends pagination.
    async fn get_page(&self, url: &Url) -> Result<Option<String>, FetchError> {
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            if attempt > 1 {
                let backoff = Duration::from_secs(2u64.pow(attempt - 2)); // 1s, 2s, 4s...
                info!("Retrying listing fetch for {} (attempt {}/{}) after {:?}...", url, attempt, self.max_retries, backoff);
                tokio::time::sleep(backoff).await;
            }

            self.pacer.wait().await;
            match self.client.get(url.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(Some(response.text().await?));
                    } else if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                        last_error = Some(FetchError::Status(status));
                        continue;
                    } else {
                        // Other 4xx are permanent, don't retry
                        return Err(FetchError::Status(status));
                    }
                }
                Err(e) => {
                    last_error = Some(FetchError::Http(e));
                }
            }
        }

        Err(last_error.unwrap_or(FetchError::Parse("no fetch attempt was made".into())))
    }
}

#[async_trait]
impl ArticleFetcher for HabrFetcher {
    async fn fetch(&self, hub: &Hub, window: &FetchWindow) -> Result<Vec<Article>, FetchError> {
        let threshold = window.start - self.window_slack;
        let mut articles = Vec::new();

        for page in 1..=self.max_pages {
            let url = self.listing_url(hub, page)?;
            debug!(hub = %hub.id, page, %url, "fetching listing page");

            let Some(html) = self.get_page(&url).await? else {
                debug!(hub = %hub.id, page, "listing page not found, stopping");
                break;
            };
            let entries = scraping::parse_listing(&html, &self.base_url, Utc::now());
            if entries.is_empty() {
                debug!(hub = %hub.id, page, "no articles on page, stopping");
                break;
            }

            let mut page_has_recent = false;
            for entry in entries {
                let ListingEntry { id, title, url, published_at } = entry;
                let Some(published_at) = published_at else { continue };
                if published_at < threshold {
                    continue;
                }
                page_has_recent = true;
                if published_at <= window.end {
                    articles.push(Article {
                        id,
                        hub: hub.id.clone(),
                        title,
                        url: url.to_string(),
                        published_at,
                    });
                }
            }

            if !page_has_recent {
                debug!(hub = %hub.id, page, "every article on page predates the window, stopping");
                break;
            }
            if page == self.max_pages {
                warn!(hub = %hub.id, max_pages = self.max_pages, "page limit reached before the window start");
            }
        }

        info!(hub = %hub.id, count = articles.len(), "fetched hub listing");
        Ok(articles)
    }

    fn pacing_allowance(&self, concurrent_hubs: usize) -> Duration {
        let requests = u32::try_from(concurrent_hubs)
            .unwrap_or(u32::MAX)
            .saturating_mul(EXPECTED_PAGES_PER_HUB);
        self.pacer.interval().saturating_mul(requests)
    }
}
