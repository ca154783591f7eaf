//! Ingestion engine: fetch per hub, merge, dedupe against the ledger, fan out to
//! subscribers, dispatch, commit.
//!
//! Delivery is at-least-once. An article id is written to the ledger only after its
//! sends have been attempted, so a crash (or a ledger failure) between the sends and
//! the commit leaves the article eligible for the next cycle and it will be sent again.
//!
//! Commit policy: an article is committed once at least one of its sends was accepted,
//! or when no active subscriber selected any hub it was listed under. If every send was rejected nobody got
//! it, and it stays uncommitted so the next cycle can try again.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::delivery::{DispatchOutcome, Dispatcher};
use crate::error::{FetchError, Result};
use crate::hubs::{HubCatalog, HubId};
use crate::ingestion::ArticleFetcher;
use crate::model::{Article, ArticleId, ChatId, FetchWindow, LookbackHours, Subscriber};
use crate::storage::{DeliveryLedger, SubscriptionStore};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound for one hub's fetch, on top of the fetcher's pacing allowance; a
    /// timeout counts as that hub's failure.
    pub hub_timeout: Duration,
    /// Articles this much older than the window start are still accepted.
    pub window_slack: ChronoDuration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hub_timeout: Duration::from_secs(30),
            window_slack: ChronoDuration::minutes(5),
        }
    }
}

/// A hub whose fetch failed or timed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubFailure {
    pub hub: HubId,
    pub reason: String,
}

/// Articles gathered from every requested hub, merged and sorted. `listed_in[i]` holds
/// every hub that listed `articles[i]`.
#[derive(Debug, Clone, Default)]
struct Collected {
    articles: Vec<Article>,
    listed_in: Vec<BTreeSet<HubId>>,
    failed_hubs: Vec<HubFailure>,
}

/// Output of a scheduled cycle's planning step.
#[derive(Debug, Clone)]
pub struct DeliveryPlan {
    pub window: FetchWindow,
    /// New articles, oldest first. Each id appears once, labelled with the first hub
    /// in merge order.
    pub articles: Vec<Article>,
    pub failed_hubs: Vec<HubFailure>,
    listed_in: Vec<BTreeSet<HubId>>,
    /// chat → indexes into `articles`, ascending.
    deliveries: BTreeMap<ChatId, Vec<usize>>,
}

impl DeliveryPlan {
    /// Every hub whose listing carried the article at `index`.
    pub fn hubs_of(&self, index: usize) -> Option<&BTreeSet<HubId>> {
        self.listed_in.get(index)
    }

    /// Articles planned for `chat`; empty for inactive or hub-less subscribers.
    pub fn for_subscriber(&self, chat: ChatId) -> Vec<&Article> {
        self.deliveries
            .get(&chat)
            .map(|idx| idx.iter().map(|i| &self.articles[*i]).collect())
            .unwrap_or_default()
    }

    /// Chats receiving at least one article.
    pub fn recipients(&self) -> impl Iterator<Item = ChatId> + '_ {
        self.deliveries.keys().copied()
    }

    pub fn recipients_of(&self, index: usize) -> Vec<ChatId> {
        self.deliveries
            .iter()
            .filter(|(_, idx)| idx.binary_search(&index).is_ok())
            .map(|(chat, _)| *chat)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }
}

/// Result of a manual, ledger-free query.
#[derive(Debug, Clone)]
pub struct ManualDigest {
    pub window: FetchWindow,
    pub lookback: LookbackHours,
    pub articles: Vec<Article>,
    pub failed_hubs: Vec<HubFailure>,
}

impl ManualDigest {
    pub fn is_partial(&self) -> bool {
        !self.failed_hubs.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub accepted: usize,
    pub rejected: usize,
    pub committed: Vec<ArticleId>,
    /// Articles whose every send was rejected; they stay eligible for the next cycle.
    pub uncommitted: Vec<ArticleId>,
}

#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub planned: usize,
    pub failed_hubs: Vec<HubFailure>,
    pub pruned: u64,
    pub report: DispatchReport,
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Completed(CycleSummary),
    /// Another scheduled cycle was still running.
    Skipped,
}

pub struct IngestionEngine {
    catalog: Arc<HubCatalog>,
    fetcher: Arc<dyn ArticleFetcher>,
    dispatcher: Arc<dyn Dispatcher>,
    ledger: Arc<dyn DeliveryLedger>,
    subscriptions: Arc<dyn SubscriptionStore>,
    settings: EngineSettings,
    cycle_lock: Mutex<()>,
}

impl IngestionEngine {
    pub fn new(
        catalog: Arc<HubCatalog>,
        fetcher: Arc<dyn ArticleFetcher>,
        dispatcher: Arc<dyn Dispatcher>,
        ledger: Arc<dyn DeliveryLedger>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> Self {
        Self {
            catalog,
            fetcher,
            dispatcher,
            ledger,
            subscriptions,
            settings: EngineSettings::default(),
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn catalog(&self) -> &Arc<HubCatalog> {
        &self.catalog
    }

    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionStore> {
        &self.subscriptions
    }

    pub fn is_cycle_running(&self) -> bool {
        self.cycle_lock.try_lock().is_err()
    }

    /// Plans one scheduled cycle. Reads the ledger and the subscription store, writes
    /// nothing, so repeated calls without a dispatch in between return the same plan.
    pub async fn run_scheduled_cycle(
        &self,
        hubs: &BTreeSet<HubId>,
        lookback: LookbackHours,
        now: DateTime<Utc>,
    ) -> Result<DeliveryPlan> {
        self.catalog.validate(hubs)?;
        let window = FetchWindow::lookback(now, lookback);
        let collected = self.collect(hubs, &window).await;

        let fetched = collected.articles.len();
        let mut articles = Vec::with_capacity(fetched);
        let mut listed_in = Vec::with_capacity(fetched);
        for (article, hubs) in collected.articles.into_iter().zip(collected.listed_in) {
            if !self.ledger.is_delivered(&article.id).await? {
                articles.push(article);
                listed_in.push(hubs);
            }
        }
        debug!(fetched, new = articles.len(), "filtered articles against the ledger");

        let deliveries = self.assign(&listed_in).await?;
        Ok(DeliveryPlan {
            window,
            articles,
            failed_hubs: collected.failed_hubs,
            listed_in,
            deliveries,
        })
    }

    /// Fetches and merges like a scheduled cycle but never touches the ledger.
    pub async fn run_manual_query(
        &self,
        hubs: &BTreeSet<HubId>,
        hours: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<ManualDigest> {
        self.catalog.validate(hubs)?;
        let lookback = LookbackHours::clamped(hours);
        let window = FetchWindow::lookback(now, lookback);
        let collected = self.collect(hubs, &window).await;

        Ok(ManualDigest {
            window,
            lookback,
            articles: collected.articles,
            failed_hubs: collected.failed_hubs,
        })
    }

    /// Sends the plan article by article and commits each article right after its sends.
    /// A ledger failure stops the dispatch; anything not yet committed is redelivered
    /// by the next cycle.
    pub async fn dispatch(&self, plan: &DeliveryPlan, now: DateTime<Utc>) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();

        for (index, article) in plan.articles.iter().enumerate() {
            let recipients = plan.recipients_of(index);
            let mut accepted = 0;
            for chat in &recipients {
                match self.dispatcher.send(*chat, article).await {
                    DispatchOutcome::Accepted => accepted += 1,
                    DispatchOutcome::Rejected(reason) => {
                        report.rejected += 1;
                        warn!(chat_id = %chat, article = %article.id, %reason, "send rejected");
                    }
                }
            }
            report.accepted += accepted;

            if recipients.is_empty() || accepted > 0 {
                self.ledger
                    .record_delivered(std::slice::from_ref(&article.id), now)
                    .await?;
                report.committed.push(article.id.clone());
            } else {
                warn!(article = %article.id, recipients = recipients.len(), "every send rejected, article left for the next cycle");
                report.uncommitted.push(article.id.clone());
            }
        }

        Ok(report)
    }

    /// One full scheduled run: prune, plan, dispatch. Single-flight: a call made while
    /// another is in progress returns `Skipped` at once.
    pub async fn scheduled_delivery(
        &self,
        hubs: &BTreeSet<HubId>,
        lookback: LookbackHours,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome> {
        let Ok(_running) = self.cycle_lock.try_lock() else {
            warn!(%lookback, "previous scheduled cycle still running, skipping this trigger");
            return Ok(CycleOutcome::Skipped);
        };

        let pruned = self
            .ledger
            .prune_older_than(now - LookbackHours::MAX.as_duration())
            .await?;

        let plan = self.run_scheduled_cycle(hubs, lookback, now).await?;
        info!(
            %lookback,
            articles = plan.articles.len(),
            recipients = plan.recipients().count(),
            failed_hubs = plan.failed_hubs.len(),
            "delivery plan ready"
        );

        let report = self.dispatch(&plan, now).await?;
        info!(
            accepted = report.accepted,
            rejected = report.rejected,
            committed = report.committed.len(),
            uncommitted = report.uncommitted.len(),
            "scheduled cycle finished"
        );

        Ok(CycleOutcome::Completed(CycleSummary {
            planned: plan.articles.len(),
            failed_hubs: plan.failed_hubs,
            pruned,
            report,
        }))
    }

    /// Fetches every hub concurrently, each under its own timeout, then filters, sorts
    /// and deduplicates the union. The timeout is stretched by the time the fetcher
    /// expects to spend queued behind the other hubs' requests.
    async fn collect(&self, hubs: &BTreeSet<HubId>, window: &FetchWindow) -> Collected {
        let accepted_window = window.widened(self.settings.window_slack);
        let limit = self.settings.hub_timeout + self.fetcher.pacing_allowance(hubs.len());
        debug!(hubs = hubs.len(), limit_ms = limit.as_millis() as u64, "per-hub fetch limit");

        let fetches = hubs.iter().filter_map(|id| self.catalog.get(id)).map(|hub| async move {
            let result = match tokio::time::timeout(limit, self.fetcher.fetch(hub, window)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(limit)),
            };
            (hub, result)
        });

        let mut merged = Vec::new();
        let mut collected = Collected::default();
        for (hub, result) in join_all(fetches).await {
            match result {
                Ok(articles) => {
                    let returned = articles.len();
                    let before = merged.len();
                    merged.extend(
                        articles
                            .into_iter()
                            .filter(|a| a.hub == hub.id && accepted_window.contains(a.published_at)),
                    );
                    let kept = merged.len() - before;
                    if kept < returned {
                        debug!(hub = %hub.id, dropped = returned - kept, "dropped articles outside the hub or window");
                    }
                    if kept == 0 {
                        debug!(hub = %hub.id, "no articles in window");
                    }
                }
                Err(e) => {
                    warn!(hub = %hub.id, error = %e, "hub fetch failed, continuing with other hubs");
                    collected.failed_hubs.push(HubFailure {
                        hub: hub.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        merged.sort_by(Article::merge_order);
        let mut first_seen: HashMap<ArticleId, usize> = HashMap::new();
        for article in merged {
            match first_seen.get(&article.id) {
                Some(&index) => {
                    collected.listed_in[index].insert(article.hub);
                }
                None => {
                    first_seen.insert(article.id.clone(), collected.articles.len());
                    collected.listed_in.push(BTreeSet::from([article.hub.clone()]));
                    collected.articles.push(article);
                }
            }
        }
        collected
    }

    /// Maps each active subscriber to the plan articles listed under any hub they
    /// selected, using the per-hub subscriber index rather than a population scan.
    async fn assign(&self, listed_in: &[BTreeSet<HubId>]) -> Result<BTreeMap<ChatId, Vec<usize>>> {
        let plan_hubs: BTreeSet<&HubId> = listed_in.iter().flatten().collect();

        let mut subscribers: BTreeMap<ChatId, Subscriber> = BTreeMap::new();
        for hub in plan_hubs {
            for subscriber in self.subscriptions.list_active_subscribers_for(hub).await? {
                subscribers.entry(subscriber.chat_id).or_insert(subscriber);
            }
        }

        Ok(subscribers
            .into_iter()
            .filter_map(|(chat, subscriber)| {
                let indexes: Vec<usize> = listed_in
                    .iter()
                    .enumerate()
                    .filter(|(_, hubs)| subscriber.receives_any(hubs))
                    .map(|(i, _)| i)
                    .collect();
                (!indexes.is_empty()).then_some((chat, indexes))
            })
            .collect())
    }
}
