//! Habr hub listing page parsing.
//!
//! Turns the HTML of `/ru/hubs/<slug>/articles/pageN/` into `ListingEntry` values. Markup
//! changes on the site are expected, so every lookup has a looser fallback and an entry
//! that cannot be understood is skipped rather than failing the page.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use tracing::{debug, warn};
use url::Url;

use crate::model::ArticleId;

/// Timezone used by the site for human-readable dates.
pub const SITE_TIMEZONE: Tz = chrono_tz::Europe::Moscow;

const MIN_TITLE_CHARS: usize = 5;

/// One article card of a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub id: ArticleId,
    pub title: String,
    pub url: Url,
    /// `None` when the card carries no recognisable date.
    pub published_at: Option<DateTime<Utc>>,
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

/// Parses every article card on a listing page. Duplicate URLs are dropped.
pub fn parse_listing(html: &str, base: &Url, now: DateTime<Utc>) -> Vec<ListingEntry> {
    let document = Html::parse_document(html);

    let mut cards: Vec<ElementRef> = selector("article.tm-articles-list__item")
        .map(|s| document.select(&s).collect())
        .unwrap_or_default();
    if cards.is_empty() {
        cards = selector("article")
            .map(|s| document.select(&s).collect())
            .unwrap_or_default();
    }

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for card in cards {
        match parse_card(card, base, now) {
            Some(entry) => {
                if seen.insert(entry.url.clone()) {
                    entries.push(entry);
                }
            }
            None => debug!("scraping: skipped an article card without link or title"),
        }
    }

    let undated = entries.iter().filter(|e| e.published_at.is_none()).count();
    if undated > 0 {
        warn!(undated, "scraping: article cards without a publication date");
    }
    entries
}

fn parse_card(card: ElementRef, base: &Url, now: DateTime<Utc>) -> Option<ListingEntry> {
    let link = title_link(card)?;
    let href = link.value().attr("href")?;
    let url = base.join(href).ok()?;
    let id = article_id_from_path(url.path())?;

    let title = normalize_whitespace(&link.text().collect::<String>());
    if title.chars().count() < MIN_TITLE_CHARS {
        return None;
    }

    Some(ListingEntry {
        id,
        title,
        url,
        published_at: published_at(card, now),
    })
}

fn title_link(card: ElementRef) -> Option<ElementRef> {
    for css in ["a.tm-title__link", "h2 a[href]", "a[href]"] {
        if let Some(sel) = selector(css) {
            let found = card.select(&sel).find(|a| {
                a.value()
                    .attr("href")
                    .map_or(false, |href| article_id_from_path(href).is_some())
            });
            if found.is_some() {
                return found;
            }
        }
    }
    None
}

/// Extracts `<id>` from `/ru/articles/<id>/` or `/ru/companies/<name>/articles/<id>/`.
pub fn article_id_from_path(path: &str) -> Option<ArticleId> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    segments.windows(2).find_map(|pair| {
        let is_numeric = !pair[1].is_empty() && pair[1].bytes().all(|b| b.is_ascii_digit());
        (pair[0] == "articles" && is_numeric).then(|| ArticleId::new(pair[1]))
    })
}

fn published_at(card: ElementRef, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let time = selector("time").and_then(|s| card.select(&s).next())?;
    if let Some(parsed) = time.value().attr("datetime").and_then(parse_iso) {
        return Some(parsed);
    }
    let text = normalize_whitespace(&time.text().collect::<String>());
    parse_human_time(&text, now)
}

fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parses the Russian relative/absolute dates the site shows when the `datetime`
/// attribute is missing: "5 часов назад", "12 минут назад", "сегодня в 10:15",
/// "вчера в 23:40", "3 марта 2025 в 09:00".
pub fn parse_human_time(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();

    if let [amount, unit, ..] = words.as_slice() {
        if let Ok(n) = amount.parse::<i64>() {
            if unit.starts_with("час") {
                return Some(now - Duration::hours(n));
            }
            if unit.starts_with("минут") {
                return Some(now - Duration::minutes(n));
            }
        }
    }

    let local_now = now.with_timezone(&SITE_TIMEZONE);
    let day_offset = if lower.contains("сегодня") {
        Some(0)
    } else if lower.contains("вчера") {
        Some(1)
    } else {
        None
    };
    if let Some(offset) = day_offset {
        let (hour, minute) = words.iter().find_map(|w| parse_clock(w))?;
        let date = local_now.date_naive() - Duration::days(offset);
        return local_to_utc(date, hour, minute);
    }

    if let [day, month, year, "в", clock, ..] = words.as_slice() {
        let month = month_number(month)?;
        let date = NaiveDate::from_ymd_opt(year.parse().ok()?, month, day.parse().ok()?)?;
        let (hour, minute) = parse_clock(clock)?;
        return local_to_utc(date, hour, minute);
    }

    None
}

fn parse_clock(word: &str) -> Option<(u32, u32)> {
    let (h, m) = word.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

fn local_to_utc(date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    SITE_TIMEZONE
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "января", "февраля", "марта", "апреля", "мая", "июня",
        "июля", "августа", "сентября", "октября", "ноября", "декабря",
    ];
    MONTHS.iter().position(|m| *m == name).map(|i| i as u32 + 1)
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
