//! Habr hub digests for Telegram: scheduled ingestion, delivery ledger, subscriptions
//! and the bot front end. The binary and the integration tests build on these modules.

pub mod bot;
pub mod commands;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod hubs;
pub mod ingestion;
pub mod model;
pub mod rate_limit;
pub mod scheduler;
pub mod scraping;
pub mod storage;
pub mod telegram;

#[cfg(test)]
mod testing;

pub use error::{Error, FetchError, Result};
