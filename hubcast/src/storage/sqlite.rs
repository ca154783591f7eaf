use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::{DeliveryLedger, KeyedLocks, SubscriptionStore};
use crate::error::{Error, Result};
use crate::hubs::{HubCatalog, HubId};
use crate::model::{ArticleId, ChatId, Subscriber, SubscriberDefaults};

/// Ledger backed by the `delivered_articles` table.
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryLedger for SqliteLedger {
    async fn is_delivered(&self, id: &ArticleId) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM delivered_articles WHERE article_id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn record_delivered(&self, ids: &[ArticleId], at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for id in ids {
            // OR IGNORE keeps the first delivered_at of an id.
            sqlx::query(
                "INSERT OR IGNORE INTO delivered_articles (article_id, delivered_at_ms) VALUES (?, ?)",
            )
            .bind(id.as_str())
            .bind(at.timestamp_millis())
            .execute(&mut tx)
            .await?;
        }
        tx.commit().await?;

        debug!(count = ids.len(), "ledger: recorded deliveries");
        Ok(())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM delivered_articles WHERE delivered_at_ms < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if removed > 0 {
            info!(removed, %cutoff, "ledger: pruned old delivery records");
        }
        Ok(removed)
    }

    async fn len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delivered_articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

/// Subscription store backed by the `subscribers` and `subscriber_hubs` tables.
///
/// `subscriber_hubs` is indexed by `(hub_id, chat_id)`, which serves
/// `list_active_subscribers_for` without a full scan.
pub struct SqliteSubscriptionStore {
    pool: SqlitePool,
    catalog: Arc<HubCatalog>,
    locks: KeyedLocks<ChatId>,
}

impl SqliteSubscriptionStore {
    pub fn new(pool: SqlitePool, catalog: Arc<HubCatalog>) -> Self {
        Self {
            pool,
            catalog,
            locks: KeyedLocks::new(),
        }
    }
}

#[async_trait]
impl SubscriptionStore for SqliteSubscriptionStore {
    async fn get(&self, chat: ChatId) -> Result<Option<Subscriber>> {
        // One transaction so the flag and the hub rows come from the same snapshot.
        let mut tx = self.pool.begin().await?;

        let active = sqlx::query_scalar::<_, bool>("SELECT active FROM subscribers WHERE chat_id = ?")
            .bind(chat.0)
            .fetch_optional(&mut tx)
            .await?;

        let Some(active) = active else {
            tx.commit().await?;
            return Ok(None);
        };

        let hubs = sqlx::query_scalar::<_, String>(
            "SELECT hub_id FROM subscriber_hubs WHERE chat_id = ? ORDER BY hub_id",
        )
        .bind(chat.0)
        .fetch_all(&mut tx)
        .await?;
        tx.commit().await?;

        Ok(Some(Subscriber {
            chat_id: chat,
            hubs: hubs.into_iter().map(HubId::new).collect(),
            active,
        }))
    }

    async fn upsert(&self, chat: ChatId, defaults: &SubscriberDefaults) -> Result<bool> {
        self.catalog.validate(&defaults.hubs)?;
        let _guard = self.locks.lock(&chat).await;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query("INSERT OR IGNORE INTO subscribers (chat_id, active) VALUES (?, ?)")
            .bind(chat.0)
            .bind(defaults.active)
            .execute(&mut tx)
            .await?
            .rows_affected()
            == 1;

        if inserted {
            for hub in &defaults.hubs {
                sqlx::query("INSERT INTO subscriber_hubs (chat_id, hub_id) VALUES (?, ?)")
                    .bind(chat.0)
                    .bind(hub.as_str())
                    .execute(&mut tx)
                    .await?;
            }
        }
        tx.commit().await?;

        if inserted {
            info!(chat_id = %chat, hubs = defaults.hubs.len(), "subscriber created");
        }
        Ok(inserted)
    }

    async fn set_hub_selection(&self, chat: ChatId, hubs: &BTreeSet<HubId>) -> Result<()> {
        self.catalog.validate(hubs)?;
        let _guard = self.locks.lock(&chat).await;

        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query_scalar::<_, i64>("SELECT 1 FROM subscribers WHERE chat_id = ?")
            .bind(chat.0)
            .fetch_optional(&mut tx)
            .await?
            .is_some();
        if !exists {
            tx.rollback().await?;
            return Err(Error::SubscriberNotFound(chat));
        }

        sqlx::query("DELETE FROM subscriber_hubs WHERE chat_id = ?")
            .bind(chat.0)
            .execute(&mut tx)
            .await?;
        for hub in hubs {
            sqlx::query("INSERT INTO subscriber_hubs (chat_id, hub_id) VALUES (?, ?)")
                .bind(chat.0)
                .bind(hub.as_str())
                .execute(&mut tx)
                .await?;
        }
        tx.commit().await?;

        info!(chat_id = %chat, hubs = hubs.len(), "hub selection replaced");
        Ok(())
    }

    async fn set_active(&self, chat: ChatId, active: bool) -> Result<()> {
        let _guard = self.locks.lock(&chat).await;

        let updated = sqlx::query("UPDATE subscribers SET active = ? WHERE chat_id = ?")
            .bind(active)
            .bind(chat.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::SubscriberNotFound(chat));
        }

        info!(chat_id = %chat, active, "subscriber status changed");
        Ok(())
    }

    async fn list_active_subscribers_for(&self, hub: &HubId) -> Result<Vec<Subscriber>> {
        let rows = sqlx::query(
            r#"
            SELECT s.chat_id, sh.hub_id
            FROM subscribers s
            JOIN subscriber_hubs sh ON sh.chat_id = s.chat_id
            WHERE s.active = 1
              AND s.chat_id IN (SELECT chat_id FROM subscriber_hubs WHERE hub_id = ?)
            ORDER BY s.chat_id, sh.hub_id
            "#,
        )
        .bind(hub.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut subscribers: Vec<Subscriber> = Vec::new();
        for row in rows {
            let chat_id = ChatId(row.get::<i64, _>("chat_id"));
            let hub_id = HubId::new(row.get::<String, _>("hub_id"));
            match subscribers.last_mut() {
                Some(last) if last.chat_id == chat_id => {
                    last.hubs.insert(hub_id);
                }
                _ => subscribers.push(Subscriber {
                    chat_id,
                    hubs: BTreeSet::from([hub_id]),
                    active: true,
                }),
            }
        }
        Ok(subscribers)
    }
}
