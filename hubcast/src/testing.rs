//! Scripted adapters shared by unit tests.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use crate::delivery::{DispatchOutcome, Dispatcher};
use crate::error::FetchError;
use crate::hubs::{Hub, HubId};
use crate::ingestion::ArticleFetcher;
use crate::model::{Article, ArticleId, ChatId, FetchWindow};

#[derive(Clone)]
pub(crate) enum Script {
    Articles(Vec<Article>),
    /// Articles returned only after the delay.
    Slow(Duration, Vec<Article>),
    Fail,
    Hang,
}

/// Returns whatever was scripted for a hub; unscripted hubs are empty.
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    scripts: Mutex<HashMap<HubId, Script>>,
    calls: Mutex<Vec<(HubId, FetchWindow)>>,
    pacing_per_hub: Mutex<Duration>,
}

impl ScriptedFetcher {
    pub(crate) fn set(&self, hub: &str, script: Script) {
        self.scripts.lock().unwrap().insert(HubId::from(hub), script);
    }

    pub(crate) fn set_pacing_per_hub(&self, pacing: Duration) {
        *self.pacing_per_hub.lock().unwrap() = pacing;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn fetched_hubs(&self) -> BTreeSet<HubId> {
        self.calls.lock().unwrap().iter().map(|(hub, _)| hub.clone()).collect()
    }

    pub(crate) fn windows(&self) -> Vec<FetchWindow> {
        self.calls.lock().unwrap().iter().map(|(_, w)| *w).collect()
    }
}

#[async_trait]
impl ArticleFetcher for ScriptedFetcher {
    async fn fetch(&self, hub: &Hub, window: &FetchWindow) -> Result<Vec<Article>, FetchError> {
        self.calls.lock().unwrap().push((hub.id.clone(), *window));
        let script = self.scripts.lock().unwrap().get(&hub.id).cloned();
        match script {
            Some(Script::Articles(articles)) => Ok(articles),
            Some(Script::Slow(delay, articles)) => {
                tokio::time::sleep(delay).await;
                Ok(articles)
            }
            Some(Script::Fail) => Err(FetchError::Parse("listing layout changed".into())),
            Some(Script::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }

    fn pacing_allowance(&self, concurrent_hubs: usize) -> Duration {
        *self.pacing_per_hub.lock().unwrap() * concurrent_hubs as u32
    }
}

/// Accepts every send except to chats marked as rejecting.
#[derive(Default)]
pub(crate) struct RecordingDispatcher {
    sent: Mutex<Vec<(ChatId, ArticleId)>>,
    rejecting: Mutex<BTreeSet<ChatId>>,
    delay: Option<Duration>,
}

impl RecordingDispatcher {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub(crate) fn reject(&self, chat: ChatId) {
        self.rejecting.lock().unwrap().insert(chat);
    }

    pub(crate) fn accept(&self, chat: ChatId) {
        self.rejecting.lock().unwrap().remove(&chat);
    }

    pub(crate) fn received(&self, chat: ChatId) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == chat)
            .map(|(_, id)| id.to_string())
            .collect()
    }

    pub(crate) fn total(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn send(&self, chat: ChatId, article: &Article) -> DispatchOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.rejecting.lock().unwrap().contains(&chat) {
            return DispatchOutcome::Rejected("bot was blocked by the user".into());
        }
        self.sent.lock().unwrap().push((chat, article.id.clone()));
        DispatchOutcome::Accepted
    }
}
