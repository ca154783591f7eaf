//! User commands, independent of the chat transport.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::engine::{IngestionEngine, ManualDigest};
use crate::error::{Error, Result};
use crate::hubs::{HubCatalog, HubId};
use crate::model::{ChatId, Subscriber, SubscriberDefaults};
use crate::rate_limit::UserRateLimiter;
use crate::scheduler::Clock;
use crate::storage::SubscriptionStore;

/// Manual queries allowed per chat within [`MANUAL_NEWS_WINDOW`].
pub const MANUAL_NEWS_REQUESTS: u32 = 1;
pub const MANUAL_NEWS_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    /// False when the chat was already known (and has been re-activated).
    pub created: bool,
    pub subscriber: Subscriber,
}

pub struct CommandService {
    engine: Arc<IngestionEngine>,
    limiter: UserRateLimiter,
    clock: Clock,
}

impl CommandService {
    pub fn new(engine: Arc<IngestionEngine>) -> Self {
        Self {
            engine,
            limiter: UserRateLimiter::new(MANUAL_NEWS_REQUESTS, MANUAL_NEWS_WINDOW),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_limits(mut self, cfg: &common::LimitsConfig) -> Self {
        self.limiter = UserRateLimiter::new(
            cfg.manual_news_requests.unwrap_or(MANUAL_NEWS_REQUESTS),
            cfg.manual_news_window_seconds
                .map(Duration::from_secs)
                .unwrap_or(MANUAL_NEWS_WINDOW),
        );
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn catalog(&self) -> &HubCatalog {
        self.engine.catalog()
    }

    fn store(&self) -> &dyn SubscriptionStore {
        self.engine.subscriptions().as_ref()
    }

    /// Subscribes `chat`. New chats get every hub; known chats are re-activated with
    /// their selection untouched.
    pub async fn start(&self, chat: ChatId) -> Result<StartOutcome> {
        let defaults = SubscriberDefaults::all_hubs(self.catalog());
        let created = self.store().upsert(chat, &defaults).await?;
        if !created {
            self.store().set_active(chat, true).await?;
        }
        info!(chat_id = %chat, created, "subscriber started");

        let subscriber = self
            .store()
            .get(chat)
            .await?
            .ok_or(Error::SubscriberNotFound(chat))?;
        Ok(StartOutcome { created, subscriber })
    }

    /// Opts `chat` out of scheduled delivery. Unknown chats are left alone.
    pub async fn stop(&self, chat: ChatId) -> Result<()> {
        match self.store().set_active(chat, false).await {
            Ok(()) => {
                info!(chat_id = %chat, "subscriber stopped");
                Ok(())
            }
            Err(Error::SubscriberNotFound(_)) => {
                debug!(chat_id = %chat, "stop for unknown chat ignored");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Current selection; empty for unknown chats.
    pub async fn get_hubs(&self, chat: ChatId) -> Result<BTreeSet<HubId>> {
        Ok(self
            .store()
            .get(chat)
            .await?
            .map(|s| s.hubs)
            .unwrap_or_default())
    }

    /// Replaces the selection. `InvalidHub` leaves the stored selection unchanged.
    pub async fn set_hubs(&self, chat: ChatId, hubs: &BTreeSet<HubId>) -> Result<()> {
        self.store().set_hub_selection(chat, hubs).await?;
        info!(chat_id = %chat, hubs = hubs.len(), "hub selection updated");
        Ok(())
    }

    /// On-demand digest over the caller's selected hubs. Never touches the ledger.
    pub async fn manual_news(&self, chat: ChatId, hours: Option<i64>) -> Result<ManualDigest> {
        self.limiter.check(chat).map_err(Error::RateLimited)?;

        let hubs = self.get_hubs(chat).await?;
        let digest = self.engine.run_manual_query(&hubs, hours, (self.clock)()).await?;
        info!(
            chat_id = %chat,
            lookback = %digest.lookback,
            hubs = hubs.len(),
            articles = digest.articles.len(),
            failed_hubs = digest.failed_hubs.len(),
            "manual query served"
        );
        Ok(digest)
    }

    /// Forgets rate-limit history of idle chats.
    pub fn cleanup(&self) {
        self.limiter.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Article, ArticleId};
    use crate::storage::{DeliveryLedger, MemoryLedger, MemorySubscriptionStore};
    use crate::testing::{RecordingDispatcher, Script, ScriptedFetcher};
    use chrono::{DateTime, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap()
    }

    fn hubs(ids: &[&str]) -> BTreeSet<HubId> {
        ids.iter().map(|id| HubId::from(*id)).collect()
    }

    fn service() -> (CommandService, Arc<ScriptedFetcher>, Arc<MemoryLedger>) {
        let catalog = Arc::new(HubCatalog::habr());
        let fetcher = Arc::new(ScriptedFetcher::default());
        let ledger = Arc::new(MemoryLedger::new());
        let engine = Arc::new(IngestionEngine::new(
            catalog.clone(),
            fetcher.clone(),
            Arc::new(RecordingDispatcher::default()),
            ledger.clone(),
            Arc::new(MemorySubscriptionStore::new(catalog)),
        ));
        let service = CommandService::new(engine).with_clock(Arc::new(now));
        (service, fetcher, ledger)
    }

    #[tokio::test]
    async fn start_selects_every_hub() {
        let (svc, _, _) = service();
        let outcome = svc.start(ChatId(7)).await.unwrap();
        assert!(outcome.created);
        assert!(outcome.subscriber.active);
        assert_eq!(outcome.subscriber.hubs, HubCatalog::habr().ids());
    }

    #[tokio::test]
    async fn restart_reactivates_and_keeps_selection() {
        let (svc, _, _) = service();
        svc.start(ChatId(7)).await.unwrap();
        svc.set_hubs(ChatId(7), &hubs(&["linux"])).await.unwrap();
        svc.stop(ChatId(7)).await.unwrap();

        let outcome = svc.start(ChatId(7)).await.unwrap();
        assert!(!outcome.created);
        assert!(outcome.subscriber.active);
        assert_eq!(outcome.subscriber.hubs, hubs(&["linux"]));
    }

    #[tokio::test]
    async fn stop_for_unknown_chat_is_a_no_op() {
        let (svc, _, _) = service();
        svc.stop(ChatId(404)).await.unwrap();
        assert!(svc.get_hubs(ChatId(404)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_hubs_leave_selection_untouched() {
        let (svc, _, _) = service();
        svc.start(ChatId(7)).await.unwrap();
        svc.set_hubs(ChatId(7), &hubs(&["python"])).await.unwrap();

        let err = svc.set_hubs(ChatId(7), &hubs(&["python", "gardening"])).await.unwrap_err();
        assert!(matches!(err, Error::InvalidHub(_)));
        assert_eq!(svc.get_hubs(ChatId(7)).await.unwrap(), hubs(&["python"]));
    }

    #[tokio::test]
    async fn set_hubs_needs_a_subscriber() {
        let (svc, _, _) = service();
        let err = svc.set_hubs(ChatId(9), &hubs(&["python"])).await.unwrap_err();
        assert!(matches!(err, Error::SubscriberNotFound(ChatId(9))));
    }

    #[tokio::test]
    async fn manual_news_reads_only_selected_hubs() {
        let (svc, fetcher, ledger) = service();
        fetcher.set(
            "linux",
            Script::Articles(vec![Article {
                id: ArticleId::from("42"),
                hub: HubId::from("linux"),
                title: "Kernel 6.14".into(),
                url: "https://habr.com/ru/articles/42/".into(),
                published_at: now() - chrono::Duration::minutes(90),
            }]),
        );
        svc.start(ChatId(7)).await.unwrap();
        svc.set_hubs(ChatId(7), &hubs(&["linux"])).await.unwrap();

        let digest = svc.manual_news(ChatId(7), Some(3)).await.unwrap();
        assert_eq!(digest.articles.len(), 1);
        assert_eq!(digest.lookback.hours(), 3);
        assert_eq!(fetcher.fetched_hubs(), hubs(&["linux"]));
        assert_eq!(ledger.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn manual_news_with_empty_selection_fetches_nothing() {
        let (svc, fetcher, _) = service();
        svc.start(ChatId(7)).await.unwrap();
        svc.set_hubs(ChatId(7), &BTreeSet::new()).await.unwrap();

        let digest = svc.manual_news(ChatId(7), None).await.unwrap();
        assert!(digest.articles.is_empty());
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_news_is_rate_limited_per_chat() {
        let (svc, _, _) = service();
        svc.start(ChatId(1)).await.unwrap();
        svc.start(ChatId(2)).await.unwrap();

        svc.manual_news(ChatId(1), None).await.unwrap();
        match svc.manual_news(ChatId(1), None).await {
            Err(Error::RateLimited(wait)) => assert_eq!(wait, MANUAL_NEWS_WINDOW),
            other => panic!("expected RateLimited, got {:?}", other.map(|d| d.articles.len())),
        }
        svc.manual_news(ChatId(2), None).await.unwrap();

        tokio::time::advance(MANUAL_NEWS_WINDOW).await;
        svc.manual_news(ChatId(1), None).await.unwrap();
    }
}
