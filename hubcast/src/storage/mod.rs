//! Delivery ledger and subscription store.
//!
//! The two stores are independent consistency domains: nothing ever spans both in one
//! transaction. Each has an SQLite backend for production and an in-memory backend for
//! tests and throwaway runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

use crate::error::Result;
use crate::hubs::HubId;
use crate::model::{ArticleId, ChatId, Subscriber, SubscriberDefaults};

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryLedger, MemorySubscriptionStore};
pub use sqlite::{SqliteLedger, SqliteSubscriptionStore};

/// Platform-wide record of article ids already broadcast.
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    async fn is_delivered(&self, id: &ArticleId) -> Result<bool>;

    /// Idempotent: ids already present keep their original timestamp. All ids of one call
    /// are committed together or not at all.
    async fn record_delivered(&self, ids: &[ArticleId], at: DateTime<Utc>) -> Result<()>;

    /// Removes records with `delivered_at < cutoff`; a record exactly at `cutoff` stays.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn len(&self) -> Result<u64>;
}

/// Chat id → hub selection and active flag.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, chat: ChatId) -> Result<Option<Subscriber>>;

    /// Creates the subscriber with `defaults` if absent. Returns whether it was created;
    /// an existing record is left untouched.
    async fn upsert(&self, chat: ChatId, defaults: &SubscriberDefaults) -> Result<bool>;

    /// Replaces the selection atomically. `InvalidHub` if any id is outside the catalog.
    async fn set_hub_selection(&self, chat: ChatId, hubs: &BTreeSet<HubId>) -> Result<()>;

    async fn set_active(&self, chat: ChatId, active: bool) -> Result<()>;

    /// Active subscribers whose selection contains `hub`, ordered by chat id.
    async fn list_active_subscribers_for(&self, hub: &HubId) -> Result<Vec<Subscriber>>;
}

/// One async mutex per key: writers to the same key queue up, other keys proceed.
pub(crate) struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

const KEYED_LOCKS_SWEEP_AT: usize = 1024;

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() >= KEYED_LOCKS_SWEEP_AT {
                // Only the map holds an unused entry.
                locks.retain(|_, m| Arc::strong_count(m) > 1);
            }
            locks.entry(key.clone()).or_default().clone()
        };
        mutex.lock_owned().await
    }
}
