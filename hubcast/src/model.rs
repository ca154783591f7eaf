use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Error, Result};
use crate::hubs::{HubCatalog, HubId};

/// Source-stable article identifier (the numeric id in a Habr article URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArticleId(String);

impl ArticleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Shorter ids sort first, so numeric ids without leading zeros order numerically.
impl Ord for ArticleId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for ArticleId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ArticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArticleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One fetched post. Immutable once built by a fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: ArticleId,
    pub hub: HubId,
    pub title: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
}

impl Article {
    /// Merge order: publication time, then id, then hub.
    pub fn merge_order(&self, other: &Self) -> Ordering {
        self.published_at
            .cmp(&other.published_at)
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| self.hub.cmp(&other.hub))
    }
}

/// Telegram chat identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub chat_id: ChatId,
    /// Empty means "no hubs chosen", not "every hub".
    pub hubs: BTreeSet<HubId>,
    pub active: bool,
}

impl Subscriber {
    /// True when the subscriber is active and selected at least one of `hubs`.
    pub fn receives_any(&self, hubs: &BTreeSet<HubId>) -> bool {
        self.active && !self.hubs.is_disjoint(hubs)
    }
}

/// Values used when a subscriber record is first created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberDefaults {
    pub hubs: BTreeSet<HubId>,
    pub active: bool,
}

impl SubscriberDefaults {
    /// New subscribers start active with every catalog hub selected.
    pub fn all_hubs(catalog: &HubCatalog) -> Self {
        Self {
            hubs: catalog.ids(),
            active: true,
        }
    }
}

/// Lookback window length in whole hours, always within 1..=24.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LookbackHours(u32);

impl LookbackHours {
    pub const MAX: LookbackHours = LookbackHours(24);
    pub const MANUAL_DEFAULT: LookbackHours = LookbackHours(1);

    /// Strict constructor used by scheduled cycles.
    pub fn new(hours: i64) -> Result<Self> {
        if (1..=i64::from(Self::MAX.0)).contains(&hours) {
            Ok(Self(hours as u32))
        } else {
            Err(Error::InvalidWindow(hours))
        }
    }

    /// Lenient constructor used by manual queries: missing means 1, out of range is clamped.
    pub fn clamped(hours: Option<i64>) -> Self {
        match hours {
            None => Self::MANUAL_DEFAULT,
            Some(h) => Self(h.clamp(1, i64::from(Self::MAX.0)) as u32),
        }
    }

    pub fn hours(self) -> u32 {
        self.0
    }

    pub fn as_duration(self) -> Duration {
        Duration::hours(i64::from(self.0))
    }
}

impl fmt::Display for LookbackHours {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h", self.0)
    }
}

/// Closed time interval `[start, end]` handed to fetchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    pub fn lookback(end: DateTime<Utc>, hours: LookbackHours) -> Self {
        Self {
            start: end - hours.as_duration(),
            end,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }

    /// Same window with `start` moved back by `slack`.
    pub fn widened(&self, slack: Duration) -> Self {
        Self {
            start: self.start - slack,
            end: self.end,
        }
    }
}
