//! Trigger schedules and their live timers.
//!
//! A [`Trigger`] is the validated, comparable form of a persisted
//! [`TaskTriggerInfo`]. Computing the next fire time is a pure function of the
//! trigger parameters and a [`FireContext`], so a descriptor reloaded from disk
//! schedules exactly like the one that was saved.
//!
//! A [`TriggerTimer`] arms a one-shot tokio timer for the next fire time and
//! reports a [`TriggerFired`] message on a channel when it elapses. It never
//! rearms itself; the owner restarts it once the fire has been handled.

use crate::error::TaskError;
use crate::tasks::types::{TaskOptions, TaskResult, TaskTriggerInfo, TriggerKind};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, Utc, Weekday};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MS_PER_DAY: u64 = 24 * 3600 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSchedule {
    Daily { time_of_day: Duration },
    Weekly { day: Weekday, time_of_day: Duration },
    Interval { every: Duration },
    Startup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    schedule: TriggerSchedule,
    max_runtime_ms: Option<u64>,
}

/// Inputs to a next-fire computation.
#[derive(Debug, Clone)]
pub struct FireContext<'a> {
    pub now: DateTime<Utc>,
    pub last_result: Option<&'a TaskResult>,
    pub last_fired: Option<DateTime<Utc>>,
    pub is_startup: bool,
    pub startup_delay: Duration,
}

impl Trigger {
    pub fn from_info(info: &TaskTriggerInfo) -> Result<Self, TaskError> {
        let kind = info.kind.to_string();
        let time_of_day = || -> Result<Duration, TaskError> {
            let ms = info
                .time_of_day_ms
                .ok_or_else(|| TaskError::invalid_trigger(&kind, "missing time of day"))?;
            if ms >= MS_PER_DAY {
                return Err(TaskError::invalid_trigger(
                    &kind,
                    format!("time of day {ms}ms is not within one day"),
                ));
            }
            Ok(Duration::from_millis(ms))
        };

        let schedule = match info.kind {
            TriggerKind::Daily => TriggerSchedule::Daily {
                time_of_day: time_of_day()?,
            },
            TriggerKind::Weekly => TriggerSchedule::Weekly {
                day: info
                    .day_of_week
                    .ok_or_else(|| TaskError::invalid_trigger(&kind, "missing day of week"))?,
                time_of_day: time_of_day()?,
            },
            TriggerKind::Interval => match info.interval_ms {
                Some(ms) if ms > 0 => TriggerSchedule::Interval {
                    every: Duration::from_millis(ms),
                },
                Some(_) => return Err(TaskError::invalid_trigger(&kind, "interval must be positive")),
                None => return Err(TaskError::invalid_trigger(&kind, "missing interval")),
            },
            TriggerKind::Startup => TriggerSchedule::Startup,
        };

        Ok(Self {
            schedule,
            max_runtime_ms: info.max_runtime_ms,
        })
    }

    pub fn schedule(&self) -> &TriggerSchedule {
        &self.schedule
    }

    pub fn kind(&self) -> TriggerKind {
        match self.schedule {
            TriggerSchedule::Daily { .. } => TriggerKind::Daily,
            TriggerSchedule::Weekly { .. } => TriggerKind::Weekly,
            TriggerSchedule::Interval { .. } => TriggerKind::Interval,
            TriggerSchedule::Startup => TriggerKind::Startup,
        }
    }

    pub fn info(&self) -> TaskTriggerInfo {
        let mut info = match &self.schedule {
            TriggerSchedule::Daily { time_of_day } => TaskTriggerInfo {
                time_of_day_ms: Some(time_of_day.as_millis() as u64),
                ..TaskTriggerInfo::startup()
            },
            TriggerSchedule::Weekly { day, time_of_day } => TaskTriggerInfo {
                time_of_day_ms: Some(time_of_day.as_millis() as u64),
                day_of_week: Some(*day),
                ..TaskTriggerInfo::startup()
            },
            TriggerSchedule::Interval { every } => TaskTriggerInfo::interval(*every),
            TriggerSchedule::Startup => TaskTriggerInfo::startup(),
        };
        info.kind = self.kind();
        info.max_runtime_ms = self.max_runtime_ms;
        info
    }

    /// Options handed to the task when this trigger fires.
    pub fn options(&self) -> TaskOptions {
        TaskOptions {
            max_runtime_ms: self.max_runtime_ms,
        }
    }

    /// `None` means the trigger will not fire in this cycle.
    pub fn next_fire(&self, ctx: &FireContext<'_>) -> Option<DateTime<Utc>> {
        match &self.schedule {
            TriggerSchedule::Daily { time_of_day } => {
                let today = at_time_of_day(ctx.now, *time_of_day);
                if today > ctx.now {
                    Some(today)
                } else {
                    Some(today + ChronoDuration::days(1))
                }
            }
            TriggerSchedule::Weekly { day, time_of_day } => {
                let days_ahead = (7 + day.num_days_from_monday() as i64
                    - ctx.now.weekday().num_days_from_monday() as i64)
                    % 7;
                let candidate =
                    at_time_of_day(ctx.now, *time_of_day) + ChronoDuration::days(days_ahead);
                if candidate > ctx.now {
                    Some(candidate)
                } else {
                    Some(candidate + ChronoDuration::days(7))
                }
            }
            TriggerSchedule::Interval { every } => {
                let every = to_chrono(*every);
                let anchor = ctx
                    .last_fired
                    .or_else(|| ctx.last_result.map(|r| r.end_time_utc));
                match anchor {
                    Some(anchor) => Some((anchor + every).max(ctx.now)),
                    None => Some(ctx.now + every),
                }
            }
            TriggerSchedule::Startup => {
                if ctx.is_startup {
                    Some(ctx.now + to_chrono(ctx.startup_delay))
                } else {
                    None
                }
            }
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schedule {
            TriggerSchedule::Daily { time_of_day } => {
                let secs = time_of_day.as_secs();
                write!(f, "daily at {:02}:{:02} UTC", secs / 3600, (secs % 3600) / 60)
            }
            TriggerSchedule::Weekly { day, time_of_day } => {
                let secs = time_of_day.as_secs();
                write!(
                    f,
                    "weekly on {day} at {:02}:{:02} UTC",
                    secs / 3600,
                    (secs % 3600) / 60
                )
            }
            TriggerSchedule::Interval { every } => write!(f, "every {}s", every.as_secs()),
            TriggerSchedule::Startup => write!(f, "on startup"),
        }
    }
}

fn at_time_of_day(now: DateTime<Utc>, time_of_day: Duration) -> DateTime<Utc> {
    now.date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc()
        + to_chrono(time_of_day)
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

/// Sent by a [`TriggerTimer`] when its armed time elapses.
pub struct TriggerFired {
    pub timer: Arc<TriggerTimer>,
}

/// Live instance of a trigger. One armed timer at a time.
pub struct TriggerTimer {
    trigger: Trigger,
    state: Mutex<TimerState>,
}

#[derive(Default)]
struct TimerState {
    armed: Option<CancellationToken>,
    last_fired: Option<DateTime<Utc>>,
    next_fire: Option<DateTime<Utc>>,
}

impl TriggerTimer {
    pub fn new(trigger: Trigger) -> Arc<Self> {
        Arc::new(Self {
            trigger,
            state: Mutex::new(TimerState::default()),
        })
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().armed.is_some()
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.state.lock().next_fire
    }

    /// Arms the timer for the next fire time. Any previously armed timer is
    /// disarmed first.
    pub fn start(
        self: &Arc<Self>,
        last_result: Option<&TaskResult>,
        task_name: &str,
        is_startup: bool,
        startup_delay: Duration,
        fired: mpsc::UnboundedSender<TriggerFired>,
    ) {
        let mut state = self.state.lock();
        if let Some(token) = state.armed.take() {
            token.cancel();
        }

        let now = Utc::now();
        let next = self.trigger.next_fire(&FireContext {
            now,
            last_result,
            last_fired: state.last_fired,
            is_startup,
            startup_delay,
        });
        state.next_fire = next;
        let Some(next) = next else {
            debug!("{} trigger for {} will not fire", self.trigger, task_name);
            return;
        };
        debug!("{} trigger for {} armed for {}", self.trigger, task_name, next);

        let token = CancellationToken::new();
        state.armed = Some(token.clone());
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        let timer = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    {
                        let mut state = timer.state.lock();
                        // A restart may have replaced this arming while we slept.
                        if token.is_cancelled() {
                            return;
                        }
                        state.armed = None;
                        state.next_fire = None;
                        state.last_fired = Some(Utc::now());
                    }
                    let _ = fired.send(TriggerFired { timer });
                }
            }
        });
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(token) = state.armed.take() {
            token.cancel();
        }
        state.next_fire = None;
    }
}
