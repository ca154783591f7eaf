use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{DeliveryLedger, SubscriptionStore};
use crate::error::{Error, Result};
use crate::hubs::{HubCatalog, HubId};
use crate::model::{ArticleId, ChatId, Subscriber, SubscriberDefaults};

/// In-memory ledger. Pruning takes the write lock, so readers see a record or its absence.
#[derive(Default)]
pub struct MemoryLedger {
    records: RwLock<HashMap<ArticleId, DateTime<Utc>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn delivered_at(&self, id: &ArticleId) -> Option<DateTime<Utc>> {
        self.records.read().await.get(id).copied()
    }
}

#[async_trait]
impl DeliveryLedger for MemoryLedger {
    async fn is_delivered(&self, id: &ArticleId) -> Result<bool> {
        Ok(self.records.read().await.contains_key(id))
    }

    async fn record_delivered(&self, ids: &[ArticleId], at: DateTime<Utc>) -> Result<()> {
        let mut records = self.records.write().await;
        for id in ids {
            records.entry(id.clone()).or_insert(at);
        }
        Ok(())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, delivered_at| *delivered_at >= cutoff);
        Ok((before - records.len()) as u64)
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.records.read().await.len() as u64)
    }
}

#[derive(Default)]
struct Subscriptions {
    by_chat: BTreeMap<ChatId, Subscriber>,
    /// Derived index: hub → chats whose selection contains it.
    by_hub: HashMap<HubId, BTreeSet<ChatId>>,
}

impl Subscriptions {
    fn index(&mut self, chat: ChatId, hubs: &BTreeSet<HubId>) {
        for hub in hubs {
            self.by_hub.entry(hub.clone()).or_default().insert(chat);
        }
    }

    fn unindex(&mut self, chat: ChatId, hubs: &BTreeSet<HubId>) {
        for hub in hubs {
            if let Some(chats) = self.by_hub.get_mut(hub) {
                chats.remove(&chat);
                if chats.is_empty() {
                    self.by_hub.remove(hub);
                }
            }
        }
    }
}

/// In-memory subscription store.
///
/// Every mutation happens under one write lock with no await point inside, so each
/// update is applied whole; per-chat ordering follows from that.
pub struct MemorySubscriptionStore {
    catalog: Arc<HubCatalog>,
    state: RwLock<Subscriptions>,
}

impl MemorySubscriptionStore {
    pub fn new(catalog: Arc<HubCatalog>) -> Self {
        Self {
            catalog,
            state: RwLock::new(Subscriptions::default()),
        }
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn get(&self, chat: ChatId) -> Result<Option<Subscriber>> {
        Ok(self.state.read().await.by_chat.get(&chat).cloned())
    }

    async fn upsert(&self, chat: ChatId, defaults: &SubscriberDefaults) -> Result<bool> {
        self.catalog.validate(&defaults.hubs)?;
        let mut state = self.state.write().await;
        if state.by_chat.contains_key(&chat) {
            return Ok(false);
        }
        state.index(chat, &defaults.hubs);
        state.by_chat.insert(
            chat,
            Subscriber {
                chat_id: chat,
                hubs: defaults.hubs.clone(),
                active: defaults.active,
            },
        );
        Ok(true)
    }

    async fn set_hub_selection(&self, chat: ChatId, hubs: &BTreeSet<HubId>) -> Result<()> {
        self.catalog.validate(hubs)?;
        let mut state = self.state.write().await;
        let previous = match state.by_chat.get_mut(&chat) {
            Some(subscriber) => std::mem::replace(&mut subscriber.hubs, hubs.clone()),
            None => return Err(Error::SubscriberNotFound(chat)),
        };
        state.unindex(chat, &previous);
        state.index(chat, hubs);
        Ok(())
    }

    async fn set_active(&self, chat: ChatId, active: bool) -> Result<()> {
        let mut state = self.state.write().await;
        match state.by_chat.get_mut(&chat) {
            Some(subscriber) => {
                subscriber.active = active;
                Ok(())
            }
            None => Err(Error::SubscriberNotFound(chat)),
        }
    }

    async fn list_active_subscribers_for(&self, hub: &HubId) -> Result<Vec<Subscriber>> {
        let state = self.state.read().await;
        let Some(chats) = state.by_hub.get(hub) else {
            return Ok(Vec::new());
        };
        Ok(chats
            .iter()
            .filter_map(|chat| state.by_chat.get(chat))
            .filter(|s| s.active)
            .cloned()
            .collect())
    }
}
