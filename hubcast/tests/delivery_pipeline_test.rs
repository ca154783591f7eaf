//! End-to-end scheduled delivery: Habr listings and the Bot API are served by mockito,
//! the ledger and subscribers live in an on-disk SQLite database.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use hubcast::delivery::TelegramDispatcher;
use hubcast::engine::{CycleOutcome, IngestionEngine};
use hubcast::hubs::{Hub, HubCatalog, HubId};
use hubcast::ingestion::HabrFetcher;
use hubcast::model::{ArticleId, ChatId, LookbackHours, SubscriberDefaults};
use hubcast::rate_limit::RequestPacer;
use hubcast::storage::{DeliveryLedger, SqliteLedger, SqliteSubscriptionStore, SubscriptionStore};
use hubcast::telegram::TelegramClient;

fn card(id: u32, published: DateTime<Utc>) -> String {
    format!(
        r#"<article class="tm-articles-list__item">
             <time datetime="{}"></time>
             <h2><a class="tm-title__link" href="/ru/articles/{id}/"><span>Habr article {id}</span></a></h2>
           </article>"#,
        published.to_rfc3339()
    )
}

/// Page 1 with `cards`, page 2 missing. Returns (page1, page2).
async fn listing(server: &mut ServerGuard, hub: &str, cards: &[String]) -> (Mock, Mock) {
    let page1 = server
        .mock("GET", format!("/ru/hubs/{hub}/articles/page1/").as_str())
        .with_status(200)
        .with_body(format!("<html><body>{}</body></html>", cards.join("\n")))
        .create_async()
        .await;
    let page2 = server
        .mock("GET", format!("/ru/hubs/{hub}/articles/page2/").as_str())
        .with_status(404)
        .create_async()
        .await;
    (page1, page2)
}

async fn send_to(server: &mut ServerGuard, chat: i64, times: usize) -> Mock {
    server
        .mock("POST", "/bot42:secret/sendMessage")
        .match_body(Matcher::PartialJson(json!({ "chat_id": chat })))
        .with_status(200)
        .with_body(json!({"ok": true, "result": {"message_id": 1, "chat": {"id": chat}}}).to_string())
        .expect(times)
        .create_async()
        .await
}

fn hubs(ids: &[&str]) -> BTreeSet<HubId> {
    ids.iter().map(|id| HubId::from(*id)).collect()
}

#[tokio::test]
async fn scheduled_delivery_end_to_end() {
    // 1. Storage on disk
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("hubcast.db");
    let pool = common::init_db_pool(db_path.to_str().unwrap()).await.expect("init pool");
    common::run_migrations(&pool).await.expect("migrations");

    let catalog = Arc::new(
        HubCatalog::new(vec![Hub::new("devops", "DevOps"), Hub::new("linux", "Linux")]).expect("catalog"),
    );
    let ledger = Arc::new(SqliteLedger::new(pool.clone()));
    let store = Arc::new(SqliteSubscriptionStore::new(pool.clone(), catalog.clone()));

    store
        .upsert(ChatId(100), &SubscriberDefaults { hubs: hubs(&["linux"]), active: true })
        .await
        .expect("subscriber 100");
    store
        .upsert(ChatId(200), &SubscriberDefaults::all_hubs(&catalog))
        .await
        .expect("subscriber 200");
    store
        .upsert(ChatId(300), &SubscriberDefaults { hubs: hubs(&["linux"]), active: false })
        .await
        .expect("subscriber 300");

    // 2. Habr listings: article 12 is listed under both hubs, so the linux-only
    // subscriber still gets it
    let now = Utc::now();
    let mut habr = Server::new_async().await;
    let _linux = listing(
        &mut habr,
        "linux",
        &[card(11, now - ChronoDuration::minutes(10)), card(12, now - ChronoDuration::minutes(30))],
    )
    .await;
    let _devops = listing(
        &mut habr,
        "devops",
        &[card(13, now - ChronoDuration::minutes(20)), card(12, now - ChronoDuration::minutes(30))],
    )
    .await;

    // 3. Bot API
    let mut telegram = Server::new_async().await;
    let to_100 = send_to(&mut telegram, 100, 2).await;
    let to_200 = send_to(&mut telegram, 200, 3).await;
    let to_300 = send_to(&mut telegram, 300, 0).await;

    let base = Url::parse(&format!("{}/", habr.url())).unwrap();
    let fetcher = HabrFetcher::new(base, Arc::new(RequestPacer::new(Duration::ZERO)))
        .expect("fetcher")
        .with_limits(5, 1);
    let client = TelegramClient::new(&telegram.url(), "42:secret", Duration::from_secs(5)).expect("client");
    let dispatcher = TelegramDispatcher::new(Arc::new(client), catalog.clone(), Duration::ZERO);

    let engine = IngestionEngine::new(
        catalog.clone(),
        Arc::new(fetcher),
        Arc::new(dispatcher),
        ledger.clone(),
        store.clone(),
    );

    // 4. First cycle delivers each article once per subscriber
    let lookback = LookbackHours::new(4).unwrap();
    let outcome = engine
        .scheduled_delivery(&catalog.ids(), lookback, now)
        .await
        .expect("first cycle");
    let CycleOutcome::Completed(summary) = outcome else {
        panic!("first cycle was skipped");
    };
    assert_eq!(summary.planned, 3);
    assert!(summary.failed_hubs.is_empty());
    assert_eq!(summary.report.accepted, 5);
    for id in ["11", "12", "13"] {
        assert!(ledger.is_delivered(&ArticleId::from(id)).await.unwrap(), "article {id} not recorded");
    }

    // 5. Second cycle over the same listings sends nothing new
    let outcome = engine
        .scheduled_delivery(&catalog.ids(), lookback, now + ChronoDuration::minutes(1))
        .await
        .expect("second cycle");
    let CycleOutcome::Completed(summary) = outcome else {
        panic!("second cycle was skipped");
    };
    assert_eq!(summary.planned, 0);
    assert_eq!(summary.report.accepted, 0);

    to_100.assert_async().await;
    to_200.assert_async().await;
    to_300.assert_async().await;
}

#[tokio::test]
async fn unreachable_hub_is_reported_not_fatal() {
    let pool = common::init_memory_pool().await.expect("memory pool");
    let catalog = Arc::new(
        HubCatalog::new(vec![Hub::new("devops", "DevOps"), Hub::new("linux", "Linux")]).expect("catalog"),
    );

    let now = Utc::now();
    let mut habr = Server::new_async().await;
    let _linux = listing(&mut habr, "linux", &[card(21, now - ChronoDuration::minutes(5))]).await;
    let _devops = habr
        .mock("GET", "/ru/hubs/devops/articles/page1/")
        .with_status(503)
        .create_async()
        .await;

    let base = Url::parse(&format!("{}/", habr.url())).unwrap();
    let fetcher = HabrFetcher::new(base, Arc::new(RequestPacer::new(Duration::ZERO)))
        .expect("fetcher")
        .with_limits(5, 1);
    let client = TelegramClient::new("http://127.0.0.1:9", "42:secret", Duration::from_secs(1)).expect("client");
    let engine = IngestionEngine::new(
        catalog.clone(),
        Arc::new(fetcher),
        Arc::new(TelegramDispatcher::new(Arc::new(client), catalog.clone(), Duration::ZERO)),
        Arc::new(SqliteLedger::new(pool.clone())),
        Arc::new(SqliteSubscriptionStore::new(pool, catalog.clone())),
    );

    let digest = engine
        .run_manual_query(&catalog.ids(), Some(1), now)
        .await
        .expect("manual query");
    assert_eq!(digest.articles.len(), 1);
    assert_eq!(digest.failed_hubs.len(), 1);
    assert_eq!(digest.failed_hubs[0].hub, HubId::from("devops"));
}
