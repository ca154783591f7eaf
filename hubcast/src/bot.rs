//! Telegram front end: long-polls for messages and maps slash commands onto
//! [`CommandService`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::commands::CommandService;
use crate::delivery::escape_html;
use crate::engine::ManualDigest;
use crate::error::Error;
use crate::hubs::{HubCatalog, HubId};
use crate::model::{Article, ChatId, LookbackHours};
use crate::scheduler::Schedule;
use crate::telegram::{TelegramClient, Update};

/// Telegram rejects messages above 4096 characters.
const MAX_MESSAGE_CHARS: usize = 4000;
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);
const LIMITER_CLEANUP_EVERY: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Stop,
    Help,
    Hubs,
    HubsSet(Vec<String>),
    News(Option<String>),
    Unknown(String),
}

impl BotCommand {
    /// Parses `/cmd[@bot] args…`. Plain text is not a command.
    pub fn parse(text: &str) -> Option<Self> {
        let mut words = text.split_whitespace();
        let head = words.next()?.strip_prefix('/')?;
        let name = head.split('@').next().unwrap_or(head).to_lowercase();
        let args: Vec<String> = words.map(str::to_string).collect();

        Some(match name.as_str() {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "help" => Self::Help,
            "hubs" => Self::Hubs,
            "hubs_set" => Self::HubsSet(args),
            "news" => Self::News(args.into_iter().next()),
            _ => Self::Unknown(name),
        })
    }
}

pub struct Bot {
    client: Arc<TelegramClient>,
    commands: Arc<CommandService>,
    schedule_note: String,
    poll_timeout: Duration,
    shutdown: Arc<Notify>,
}

impl Bot {
    pub fn new(
        client: Arc<TelegramClient>,
        commands: Arc<CommandService>,
        schedule: &Schedule,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            client,
            commands,
            schedule_note: schedule_note(schedule),
            poll_timeout: Duration::from_secs(30),
            shutdown,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Polls until `shutdown` is notified. Each command is handled on its own task.
    pub async fn run(self) {
        let bot = Arc::new(self);
        let mut offset = 0;
        let mut last_cleanup = Instant::now();
        info!(poll_timeout = ?bot.poll_timeout, "telegram bot polling");

        loop {
            let updates = tokio::select! {
                res = bot.client.get_updates(offset, bot.poll_timeout) => res,
                _ = bot.shutdown.notified() => {
                    info!("telegram bot shutting down");
                    return;
                }
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        let bot = bot.clone();
                        tokio::spawn(async move { bot.handle_update(update).await });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "getUpdates failed, backing off");
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                }
            }

            if last_cleanup.elapsed() >= LIMITER_CLEANUP_EVERY {
                bot.commands.cleanup();
                last_cleanup = Instant::now();
            }
        }
    }

    pub async fn handle_update(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        let Some(command) = message.text.as_deref().and_then(BotCommand::parse) else {
            return;
        };
        let chat = ChatId(message.chat.id);
        debug!(chat_id = %chat, ?command, "command received");

        for reply in self.respond(chat, command).await {
            if let Err(e) = self.client.send_message(chat, &reply, true).await {
                error!(chat_id = %chat, error = %e, "failed to send reply");
                break;
            }
        }
    }

    /// HTML replies for one command, in sending order.
    pub async fn respond(&self, chat: ChatId, command: BotCommand) -> Vec<String> {
        let catalog = self.commands.catalog();
        match command {
            BotCommand::Start => match self.commands.start(chat).await {
                Ok(outcome) => vec![format!(
                    "Привет! Я присылаю новые статьи Habr по выбранным хабам.\n\n\
                     Сейчас выбрано {}.\nРассылка: {}.\n\n/help покажет все команды.",
                    plural(outcome.subscriber.hubs.len() as u64, "хаб", "хаба", "хабов"),
                    self.schedule_note
                )],
                Err(e) => vec![failure(&e)],
            },
            BotCommand::Stop => match self.commands.stop(chat).await {
                Ok(()) => vec!["Вы отписаны от рассылки. /start подпишет снова.".to_string()],
                Err(e) => vec![failure(&e)],
            },
            BotCommand::Help => vec![help_text(&self.schedule_note)],
            BotCommand::Hubs => match self.commands.get_hubs(chat).await {
                Ok(hubs) if hubs.is_empty() => {
                    vec!["Не выбрано ни одного хаба.\n/hubs_set настроит список.".to_string()]
                }
                Ok(hubs) => vec![format!(
                    "Ваши хабы ({}):\n\n{}\n\n/hubs_set изменит список.",
                    plural(hubs.len() as u64, "хаб", "хаба", "хабов"),
                    hub_list(catalog, &hubs)
                )],
                Err(e) => vec![failure(&e)],
            },
            BotCommand::HubsSet(args) if args.is_empty() => vec![format!(
                "Укажите id хабов через пробел, например:\n<code>/hubs_set linux devops</code>\n\
                 <code>/hubs_set all</code> выберет все, <code>/hubs_set none</code> ни одного.\n\n{}",
                hub_list(catalog, &catalog.ids())
            )],
            BotCommand::HubsSet(args) => {
                let hubs = parse_selection(catalog, &args);
                match self.commands.set_hubs(chat, &hubs).await {
                    Ok(()) if hubs.is_empty() => {
                        vec!["Хабы сняты. Рассылка приходить не будет.".to_string()]
                    }
                    Ok(()) => vec![format!(
                        "Готово, выбрано {}:\n\n{}",
                        plural(hubs.len() as u64, "хаб", "хаба", "хабов"),
                        hub_list(catalog, &hubs)
                    )],
                    Err(e) => vec![failure(&e)],
                }
            }
            BotCommand::News(arg) => {
                let (hours, mut replies) = parse_hours(arg.as_deref());
                match self.commands.manual_news(chat, hours).await {
                    Ok(digest) => replies.extend(render_digest(catalog, &digest)),
                    Err(e) => replies = vec![failure(&e)],
                }
                replies
            }
            BotCommand::Unknown(name) => vec![format!(
                "Неизвестная команда /{}. /help покажет список.",
                escape_html(&name)
            )],
        }
    }
}

fn failure(e: &Error) -> String {
    match e {
        Error::RateLimited(wait) => format!(
            "Слишком частые запросы. Подождите {} сек.",
            wait.as_secs().max(1)
        ),
        Error::InvalidHub(ids) => format!(
            "Неизвестные хабы: {}.\n/hubs_set без аргументов покажет доступные.",
            escape_html(&ids.iter().map(HubId::as_str).collect::<Vec<_>>().join(", "))
        ),
        Error::SubscriberNotFound(_) => "Сначала подпишитесь командой /start.".to_string(),
        other => {
            error!(error = %other, "command failed");
            "Не получилось выполнить команду, попробуйте позже.".to_string()
        }
    }
}

/// `all` and `none` are shortcuts; anything else is taken as hub ids.
fn parse_selection(catalog: &HubCatalog, args: &[String]) -> BTreeSet<HubId> {
    match args {
        [only] if only.eq_ignore_ascii_case("all") => catalog.ids(),
        [only] if only.eq_ignore_ascii_case("none") => BTreeSet::new(),
        _ => args
            .iter()
            .flat_map(|a| a.split(','))
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(|a| HubId::new(a.to_lowercase()))
            .collect(),
    }
}

/// Lookback for `/news`, plus notices for input that had to be corrected.
fn parse_hours(arg: Option<&str>) -> (Option<i64>, Vec<String>) {
    let Some(arg) = arg else {
        return (None, Vec::new());
    };
    match arg.parse::<i64>() {
        Ok(h) if h > i64::from(LookbackHours::MAX.hours()) => (
            Some(h),
            vec![format!("Максимум {} часа, беру {}.", LookbackHours::MAX.hours(), LookbackHours::MAX.hours())],
        ),
        Ok(h) => (Some(h), Vec::new()),
        Err(_) => (
            None,
            vec!["Формат: /news [часов]. Беру последний час.".to_string()],
        ),
    }
}

fn hub_list(catalog: &HubCatalog, hubs: &BTreeSet<HubId>) -> String {
    catalog
        .iter()
        .filter(|h| hubs.contains(&h.id))
        .map(|h| format!("• {} <code>{}</code>", escape_html(&h.display_name), escape_html(h.id.as_str())))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One message per hub (newest first), split to stay under the message size limit,
/// followed by a summary line.
pub fn render_digest(catalog: &HubCatalog, digest: &ManualDigest) -> Vec<String> {
    let period = match digest.lookback.hours() {
        1 => "последний час".to_string(),
        h => format!("последние {}", plural(u64::from(h), "час", "часа", "часов")),
    };

    let mut messages = Vec::new();
    let mut hubs_with_news = 0;
    for hub in catalog.iter() {
        let mut articles: Vec<&Article> = digest.articles.iter().filter(|a| a.hub == hub.id).collect();
        if articles.is_empty() {
            continue;
        }
        hubs_with_news += 1;
        articles.sort_by(|a, b| b.merge_order(a));

        let header = format!("📰 <b>{}</b>\n\n", escape_html(&hub.display_name));
        let mut current = header.clone();
        for article in articles {
            let line = format!(
                "<a href=\"{}\">{}</a>\n\n",
                escape_html(&article.url),
                escape_html(&article.title)
            );
            if current.chars().count() + line.chars().count() > MAX_MESSAGE_CHARS && current != header {
                messages.push(std::mem::replace(&mut current, header.clone()));
            }
            current.push_str(&line);
        }
        messages.push(current);
    }

    let mut summary = if digest.articles.is_empty() {
        format!("📭 За {} новых статей нет.", period)
    } else {
        format!(
            "✅ Найдено {} за {} из {}.",
            plural(digest.articles.len() as u64, "статья", "статьи", "статей"),
            period,
            plural(hubs_with_news, "хаба", "хабов", "хабов")
        )
    };
    if digest.is_partial() {
        let failed: Vec<&str> = digest
            .failed_hubs
            .iter()
            .map(|f| catalog.display_name(&f.hub))
            .collect();
        summary.push_str(&format!(
            "\nНе удалось загрузить: {}.",
            escape_html(&failed.join(", "))
        ));
    }
    messages.push(summary);
    messages
}

fn schedule_note(schedule: &Schedule) -> String {
    let times: Vec<String> = schedule
        .slots()
        .iter()
        .map(|s| s.time.format("%H:%M").to_string())
        .collect();
    format!("{} ({})", times.join(", "), schedule.timezone().name())
}

fn help_text(schedule_note: &str) -> String {
    format!(
        "Команды:\n\n\
         /start подписаться на рассылку\n\
         /stop отписаться\n\
         /hubs показать выбранные хабы\n\
         /hubs_set id… выбрать хабы (<code>all</code>, <code>none</code>)\n\
         /news [часов] статьи за последние часы, по умолчанию 1, максимум 24\n\
         /help это сообщение\n\n\
         Рассылка: {}.",
        schedule_note
    )
}

/// Russian noun agreement: 1 хаб, 2 хаба, 5 хабов, 11 хабов, 21 хаб.
pub fn plural(n: u64, one: &str, few: &str, many: &str) -> String {
    let word = match (n % 10, n % 100) {
        (_, 11..=14) => many,
        (1, _) => one,
        (2..=4, _) => few,
        _ => many,
    };
    format!("{} {}", n, word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{HubFailure, IngestionEngine};
    use crate::model::{ArticleId, FetchWindow};
    use crate::storage::{MemoryLedger, MemorySubscriptionStore};
    use crate::testing::{RecordingDispatcher, ScriptedFetcher};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn bot_against(api_url: &str) -> Bot {
        let catalog = Arc::new(HubCatalog::habr());
        let engine = Arc::new(IngestionEngine::new(
            catalog.clone(),
            Arc::new(ScriptedFetcher::default()),
            Arc::new(RecordingDispatcher::default()),
            Arc::new(MemoryLedger::new()),
            Arc::new(MemorySubscriptionStore::new(catalog)),
        ));
        let client = TelegramClient::new(api_url, "1:test", Duration::from_secs(5)).unwrap();
        Bot::new(
            Arc::new(client),
            Arc::new(CommandService::new(engine)),
            &Schedule::moscow_default(),
            Arc::new(Notify::new()),
        )
    }

    fn bot() -> Bot {
        bot_against("http://127.0.0.1:9")
    }

    fn article(id: &str, hub: &str, title: &str, minutes: i64) -> Article {
        Article {
            id: ArticleId::from(id),
            hub: HubId::from(hub),
            title: title.into(),
            url: format!("https://habr.com/ru/articles/{id}/"),
            published_at: Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap() + ChronoDuration::minutes(minutes),
        }
    }

    fn digest(hours: i64, articles: Vec<Article>, failed: &[&str]) -> ManualDigest {
        let end = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let lookback = LookbackHours::clamped(Some(hours));
        ManualDigest {
            window: FetchWindow::lookback(end, lookback),
            lookback,
            articles,
            failed_hubs: failed
                .iter()
                .map(|h| HubFailure { hub: HubId::from(*h), reason: "timed out".into() })
                .collect(),
        }
    }

    #[test]
    fn parses_commands() {
        assert_eq!(BotCommand::parse("/start"), Some(BotCommand::Start));
        assert_eq!(BotCommand::parse("/news@habr_hub_bot 3"), Some(BotCommand::News(Some("3".into()))));
        assert_eq!(
            BotCommand::parse("/hubs_set linux  devops"),
            Some(BotCommand::HubsSet(vec!["linux".into(), "devops".into()]))
        );
        assert_eq!(BotCommand::parse("/Frobnicate"), Some(BotCommand::Unknown("frobnicate".into())));
        assert_eq!(BotCommand::parse("hello"), None);
        assert_eq!(BotCommand::parse("   "), None);
    }

    #[test]
    fn russian_plurals() {
        assert_eq!(plural(1, "хаб", "хаба", "хабов"), "1 хаб");
        assert_eq!(plural(3, "хаб", "хаба", "хабов"), "3 хаба");
        assert_eq!(plural(12, "хаб", "хаба", "хабов"), "12 хабов");
        assert_eq!(plural(21, "хаб", "хаба", "хабов"), "21 хаб");
        assert_eq!(plural(114, "хаб", "хаба", "хабов"), "114 хабов");
    }

    #[test]
    fn hours_argument_notices() {
        assert_eq!(parse_hours(None), (None, Vec::new()));
        assert_eq!(parse_hours(Some("5")), (Some(5), Vec::new()));
        let (hours, notes) = parse_hours(Some("48"));
        assert_eq!(hours, Some(48));
        assert_eq!(notes.len(), 1);
        let (hours, notes) = parse_hours(Some("soon"));
        assert_eq!(hours, None);
        assert_eq!(notes.len(), 1);
    }

    #[test]
    fn selection_shortcuts() {
        let catalog = HubCatalog::habr();
        assert_eq!(parse_selection(&catalog, &["ALL".into()]), catalog.ids());
        assert!(parse_selection(&catalog, &["none".into()]).is_empty());
        let picked = parse_selection(&catalog, &["Linux,devops".into(), "python".into()]);
        assert_eq!(picked.len(), 3);
        assert!(picked.contains(&HubId::from("linux")));
    }

    #[test]
    fn digest_groups_by_hub_newest_first() {
        let catalog = HubCatalog::habr();
        let d = digest(
            3,
            vec![
                article("1", "linux", "Older <kernel>", 0),
                article("2", "devops", "CI", 10),
                article("3", "linux", "Newer", 20),
            ],
            &["python"],
        );

        let messages = render_digest(&catalog, &d);
        assert_eq!(messages.len(), 3);
        assert!(messages[0].starts_with("📰 <b>DevOps</b>"));
        let linux = &messages[1];
        assert!(linux.find("Newer").unwrap() < linux.find("Older &lt;kernel&gt;").unwrap());
        assert!(messages[2].contains("3 статьи"));
        assert!(messages[2].contains("последние 3 часа"));
        assert!(messages[2].contains("из 2 хабов"));
        assert!(messages[2].contains("Python"));
    }

    #[test]
    fn long_hub_digest_is_split() {
        let catalog = HubCatalog::habr();
        let title = "x".repeat(300);
        let articles = (0..40).map(|i| article(&i.to_string(), "linux", &title, i)).collect();
        let messages = render_digest(&catalog, &digest(1, articles, &[]));

        let bodies = &messages[..messages.len() - 1];
        assert!(bodies.len() > 1);
        assert!(bodies.iter().all(|m| m.chars().count() <= MAX_MESSAGE_CHARS));
        assert!(bodies.iter().all(|m| m.starts_with("📰 <b>Linux</b>")));
    }

    #[test]
    fn empty_digest_says_so() {
        let messages = render_digest(&HubCatalog::habr(), &digest(1, Vec::new(), &[]));
        assert_eq!(messages, vec!["📭 За последний час новых статей нет.".to_string()]);
    }

    #[tokio::test]
    async fn start_then_hubs() {
        let bot = bot();
        let replies = bot.respond(ChatId(5), BotCommand::Start).await;
        assert!(replies[0].contains("12 хабов"));
        assert!(replies[0].contains("08:00, 14:00, 18:00 (Europe/Moscow)"));

        bot.respond(ChatId(5), BotCommand::HubsSet(vec!["linux".into()])).await;
        let replies = bot.respond(ChatId(5), BotCommand::Hubs).await;
        assert!(replies[0].contains("<code>linux</code>"));
        assert!(!replies[0].contains("<code>devops</code>"));
    }

    #[tokio::test]
    async fn unknown_hub_is_reported() {
        let bot = bot();
        bot.respond(ChatId(5), BotCommand::Start).await;
        let replies = bot
            .respond(ChatId(5), BotCommand::HubsSet(vec!["linux".into(), "knitting".into()]))
            .await;
        assert!(replies[0].contains("knitting"));
    }

    #[tokio::test]
    async fn hubs_set_before_start_asks_to_subscribe() {
        let bot = bot();
        let replies = bot.respond(ChatId(5), BotCommand::HubsSet(vec!["linux".into()])).await;
        assert!(replies[0].contains("/start"));
    }

    #[tokio::test]
    async fn second_news_request_is_throttled() {
        let bot = bot();
        bot.respond(ChatId(5), BotCommand::Start).await;
        bot.respond(ChatId(5), BotCommand::HubsSet(vec!["none".into()])).await;

        let first = bot.respond(ChatId(5), BotCommand::News(None)).await;
        assert!(first[0].starts_with("📭"));
        let second = bot.respond(ChatId(5), BotCommand::News(None)).await;
        assert!(second[0].contains("Подождите"));
    }

    #[tokio::test]
    async fn update_reply_goes_through_send_message() {
        let mut server = mockito::Server::new_async().await;
        let send = server
            .mock("POST", "/bot1:test/sendMessage")
            .match_body(mockito::Matcher::PartialJsonString(r#"{"chat_id": 77}"#.into()))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"message_id":1,"chat":{"id":77}}}"#)
            .expect(1)
            .create_async()
            .await;

        let bot = bot_against(&server.url());
        let update: Update = serde_json::from_str(
            r#"{"update_id":10,"message":{"message_id":3,"chat":{"id":77},"text":"/help"}}"#,
        )
        .unwrap();
        bot.handle_update(update).await;

        send.assert_async().await;
    }
}
