//! Daily broadcast schedule and the loop that fires scheduled cycles.

use chrono::{DateTime, Duration as ChronoDuration, LocalResult, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::engine::{CycleOutcome, IngestionEngine};
use crate::error::{Error, Result};
use crate::hubs::HubId;
use crate::model::LookbackHours;

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Moscow;

/// Broadcast times of the original bot: morning digest covers the night.
const DEFAULT_SLOTS: &[(u32, u32, u32)] = &[(8, 0, 14), (14, 0, 6), (18, 0, 4)];

const MINUTES_PER_DAY: i64 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Local wall-clock time in the schedule's timezone.
    pub time: NaiveTime,
    pub lookback: LookbackHours,
}

impl Slot {
    pub fn new(time: NaiveTime, lookback: LookbackHours) -> Self {
        Self { time, lookback }
    }
}

/// Validated set of daily slots. Slots are kept sorted by time.
#[derive(Debug, Clone)]
pub struct Schedule {
    tz: Tz,
    slots: Vec<Slot>,
}

impl Schedule {
    /// Rejects empty schedules, duplicate times, and slots whose lookback does not reach
    /// back to the previous slot (cyclically), which would leave part of the day uncovered.
    pub fn new(tz: Tz, mut slots: Vec<Slot>) -> Result<Self> {
        if slots.is_empty() {
            return Err(Error::InvalidSchedule("at least one slot is required".into()));
        }
        slots.sort_by_key(|s| s.time);
        if let Some(w) = slots.windows(2).find(|w| w[0].time == w[1].time) {
            return Err(Error::InvalidSchedule(format!(
                "duplicate slot time {}",
                w[0].time.format("%H:%M")
            )));
        }

        for (i, slot) in slots.iter().enumerate() {
            let previous = if i == 0 { slots[slots.len() - 1] } else { slots[i - 1] };
            let gap = match minutes_of_day(slot.time) - minutes_of_day(previous.time) {
                gap if gap > 0 => gap,
                gap => gap + MINUTES_PER_DAY,
            };
            if i64::from(slot.lookback.hours()) * 60 < gap {
                return Err(Error::InvalidSchedule(format!(
                    "slot {} looks back {} but the previous slot was {} minutes earlier",
                    slot.time.format("%H:%M"),
                    slot.lookback,
                    gap
                )));
            }
        }

        Ok(Self { tz, slots })
    }

    /// 08:00 → 14 h, 14:00 → 6 h, 18:00 → 4 h, Moscow time.
    pub fn moscow_default() -> Self {
        Self {
            tz: DEFAULT_TIMEZONE,
            slots: default_slots(),
        }
    }

    /// Builds the schedule from `[scheduler]`. Missing timezone or slots fall back to the defaults.
    pub fn from_config(cfg: &common::SchedulerConfig) -> Result<Self> {
        let tz = match cfg.timezone.as_deref() {
            None => DEFAULT_TIMEZONE,
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| Error::InvalidSchedule(format!("unknown timezone '{}'", name)))?,
        };

        if cfg.slots.is_empty() {
            return Self::new(tz, default_slots());
        }

        let slots = cfg
            .slots
            .iter()
            .map(|s| {
                let time = parse_slot_time(&s.time)?;
                let lookback = LookbackHours::new(i64::from(s.lookback_hours)).map_err(|_| {
                    Error::InvalidSchedule(format!(
                        "slot {} lookback must be within 1..=24 hours, got {}",
                        s.time, s.lookback_hours
                    ))
                })?;
                Ok(Slot::new(time, lookback))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(tz, slots)
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot_at(&self, time: NaiveTime) -> Option<Slot> {
        self.slots.iter().copied().find(|s| s.time == time)
    }
}

fn default_slots() -> Vec<Slot> {
    DEFAULT_SLOTS
        .iter()
        .filter_map(|&(h, m, lookback)| {
            let time = NaiveTime::from_hms_opt(h, m, 0)?;
            let lookback = LookbackHours::new(i64::from(lookback)).ok()?;
            Some(Slot::new(time, lookback))
        })
        .collect()
}

fn minutes_of_day(time: NaiveTime) -> i64 {
    i64::from(time.hour()) * 60 + i64::from(time.minute())
}

/// Parses "HH:MM".
pub fn parse_slot_time(text: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(text.trim(), "%H:%M")
        .map_err(|_| Error::InvalidSchedule(format!("slot time '{}' is not HH:MM", text)))
}

/// A concrete firing of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub at: DateTime<Utc>,
    pub slot: Slot,
}

/// First slot instant strictly after `now`.
///
/// Local times that do not exist (DST gap) are skipped for that day; ambiguous local
/// times (DST fold) fire at the earlier instant.
pub fn next_trigger(now: DateTime<Utc>, schedule: &Schedule) -> Option<Trigger> {
    let today = now.with_timezone(&schedule.tz).date_naive();

    (-1..=7)
        .filter_map(|offset| today.checked_add_signed(ChronoDuration::days(offset)))
        .flat_map(|date| {
            schedule.slots.iter().filter_map(move |slot| {
                let local = match schedule.tz.from_local_datetime(&date.and_time(slot.time)) {
                    LocalResult::None => return None,
                    LocalResult::Single(t) => t,
                    LocalResult::Ambiguous(earliest, _) => earliest,
                };
                Some(Trigger {
                    at: local.with_timezone(&Utc),
                    slot: *slot,
                })
            })
        })
        .filter(|t| t.at > now)
        .min_by_key(|t| t.at)
}

/// Lifecycle of the slot currently tracked by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Waiting for the next trigger.
    Idle,
    /// Trigger instant reached.
    Due,
    /// Cycle handed to the engine.
    Firing,
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Fires scheduled cycles at the slots of a [`Schedule`].
///
/// Each fire spawns the cycle and goes straight back to waiting. A cycle still running
/// when the next trigger arrives makes the engine skip that trigger.
pub struct Scheduler {
    engine: Arc<IngestionEngine>,
    schedule: Schedule,
    hubs: BTreeSet<HubId>,
    shutdown: Arc<Notify>,
    clock: Clock,
    state: SlotState,
    last_fired: Option<DateTime<Utc>>,
}

impl Scheduler {
    /// Scheduled cycles cover every hub in the engine's catalog.
    pub fn new(engine: Arc<IngestionEngine>, schedule: Schedule, shutdown: Arc<Notify>) -> Self {
        let hubs = engine.catalog().ids();
        Self {
            engine,
            schedule,
            hubs,
            shutdown,
            clock: Arc::new(Utc::now),
            state: SlotState::Idle,
            last_fired: None,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Runs until `shutdown` is notified.
    pub async fn run(mut self) {
        info!(
            timezone = self.schedule.tz.name(),
            slots = self.schedule.slots.len(),
            hubs = self.hubs.len(),
            "scheduler started"
        );

        loop {
            // Never recompute from before the last fire: the same trigger must not fire twice.
            let now = (self.clock)();
            let from = self.last_fired.map_or(now, |fired| fired.max(now));
            let Some(trigger) = next_trigger(from, &self.schedule) else {
                error!("schedule produced no upcoming trigger, scheduler stopping");
                return;
            };

            self.state = SlotState::Idle;
            let wait = (trigger.at - now).to_std().unwrap_or_default();
            info!(
                at = %trigger.at.with_timezone(&self.schedule.tz),
                lookback = %trigger.slot.lookback,
                wait_secs = wait.as_secs(),
                "next scheduled cycle"
            );

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown.notified() => {
                    info!("scheduler shutting down");
                    return;
                }
            }

            self.state = SlotState::Due;
            debug!(state = ?self.state, at = %trigger.at, "trigger reached");
            self.fire(trigger);
            self.last_fired = Some(trigger.at);
        }
    }

    fn fire(&mut self, trigger: Trigger) {
        self.state = SlotState::Firing;
        let engine = self.engine.clone();
        let hubs = self.hubs.clone();
        tokio::spawn(async move {
            run_cycle(&engine, &hubs, trigger).await;
        });
    }

    /// Runs the slot at `time` immediately, outside the timer.
    pub async fn run_slot_now(&self, time: NaiveTime) -> Result<CycleOutcome> {
        let slot = self.schedule.slot_at(time).ok_or_else(|| {
            Error::InvalidSchedule(format!("no slot at {}", time.format("%H:%M")))
        })?;
        self.engine
            .scheduled_delivery(&self.hubs, slot.lookback, (self.clock)())
            .await
    }
}

/// The window ends at the trigger instant, so consecutive slots tile the day exactly.
async fn run_cycle(engine: &IngestionEngine, hubs: &BTreeSet<HubId>, trigger: Trigger) {
    match engine.scheduled_delivery(hubs, trigger.slot.lookback, trigger.at).await {
        Ok(CycleOutcome::Completed(summary)) => {
            info!(
                slot = %trigger.slot.time.format("%H:%M"),
                planned = summary.planned,
                accepted = summary.report.accepted,
                rejected = summary.report.rejected,
                pruned = summary.pruned,
                failed_hubs = summary.failed_hubs.len(),
                "scheduled cycle completed"
            );
        }
        Ok(CycleOutcome::Skipped) => {
            warn!(slot = %trigger.slot.time.format("%H:%M"), "scheduled cycle skipped");
        }
        Err(e) => {
            error!(slot = %trigger.slot.time.format("%H:%M"), error = %e, "scheduled cycle failed");
        }
    }
}
