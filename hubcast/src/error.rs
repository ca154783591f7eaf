use std::time::Duration;
use thiserror::Error;

use crate::hubs::HubId;
use crate::model::ChatId;

/// Errors surfaced by the engine, the stores and the command service.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown hub(s): {}", join_hubs(.0))]
    InvalidHub(Vec<HubId>),

    #[error("invalid hub catalog: {0}")]
    InvalidCatalog(String),

    #[error("lookback window must be within (0, 24] hours, got {0}")]
    InvalidWindow(i64),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("subscriber {0} not found")]
    SubscriberNotFound(ChatId),

    #[error("too many requests, retry in {}s", .0.as_secs())]
    RateLimited(Duration),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single hub fetch. Never fatal for a cycle.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("parse error: {0}")]
    Parse(String),
}

fn join_hubs(hubs: &[HubId]) -> String {
    hubs.iter().map(HubId::as_str).collect::<Vec<_>>().join(", ")
}
