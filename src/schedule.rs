//! Capture scheduling state for the monitoring daemon.
//!
//! Pure decision logic fed with timestamps; the daemon owns the actual
//! sleep loop and the camera. Gates a periodic capture on three things:
//! the configured interval, the active-hours window, and the daily quota.

use chrono::{DateTime, Datelike, Local, NaiveDate, Timelike};
use serde::Serialize;

use crate::config::MonitoringSettings;

/// Why a tick did (or did not) trigger a capture round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Capture,
    NotDue,
    OutsideActiveHours,
    QuotaReached,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub is_active_time: bool,
    pub captures_today: u32,
    pub max_daily_captures: u32,
    pub interval_minutes: u32,
}

pub struct CaptureSchedule {
    interval: chrono::Duration,
    active_hours: Option<(u8, u8)>,
    max_daily_captures: u32,

    last_capture: Option<DateTime<Local>>,
    quota_date: Option<NaiveDate>,
    captures_today: u32,
}

impl CaptureSchedule {
    pub fn from_settings(settings: &MonitoringSettings) -> Self {
        let active_hours = match (settings.active_hours_start, settings.active_hours_end) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        };

        Self {
            interval: chrono::Duration::minutes(i64::from(settings.interval_minutes.max(1))),
            active_hours,
            max_daily_captures: settings.max_daily_captures,
            last_capture: None,
            quota_date: None,
            captures_today: 0,
        }
    }

    /// Whether `now` falls inside the active window. Start is inclusive,
    /// end exclusive; a start past the end wraps overnight (e.g. 22-6).
    pub fn is_active_time(&self, now: DateTime<Local>) -> bool {
        let Some((start, end)) = self.active_hours else {
            return true;
        };

        let hour = now.hour() as u8;
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    /// Decide whether a capture round should run at `now`. Does not mutate
    /// the quota; call [`record_captures`](Self::record_captures) after the
    /// round completes.
    pub fn tick(&mut self, now: DateTime<Local>) -> Decision {
        self.roll_over_quota(now);

        if let Some(last) = self.last_capture {
            if now.signed_duration_since(last) < self.interval {
                return Decision::NotDue;
            }
        }
        if !self.is_active_time(now) {
            return Decision::OutsideActiveHours;
        }
        if self.captures_today >= self.max_daily_captures {
            return Decision::QuotaReached;
        }

        Decision::Capture
    }

    /// Count a completed capture round against today's quota.
    pub fn record_captures(&mut self, count: u32, now: DateTime<Local>) {
        self.roll_over_quota(now);
        self.captures_today += count;
        self.last_capture = Some(now);
    }

    /// Yesterday's count, surfaced once at the day boundary.
    /// Returns `None` while the day is still running.
    pub fn take_finished_day(&mut self, now: DateTime<Local>) -> Option<(NaiveDate, u32)> {
        let today = now.date_naive();
        match self.quota_date {
            Some(date) if date != today => {
                let finished = (date, self.captures_today);
                self.quota_date = Some(today);
                self.captures_today = 0;
                Some(finished)
            }
            _ => None,
        }
    }

    pub fn status(&self, now: DateTime<Local>) -> ScheduleStatus {
        ScheduleStatus {
            is_active_time: self.is_active_time(now),
            captures_today: if self.quota_date == Some(now.date_naive()) {
                self.captures_today
            } else {
                0
            },
            max_daily_captures: self.max_daily_captures,
            interval_minutes: self.interval.num_minutes().max(0) as u32,
        }
    }

    fn roll_over_quota(&mut self, now: DateTime<Local>) {
        let today = now.date_naive();
        if self.quota_date != Some(today) {
            // take_finished_day reports the old count if anyone asked;
            // by the time a tick arrives the new day starts clean.
            if self.quota_date.is_some() {
                self.captures_today = 0;
            }
            self.quota_date = Some(today);
        }
    }
}

/// True on the first tick of a new ISO week (used for the weekly
/// maintenance job).
pub fn week_of(now: DateTime<Local>) -> (i32, u32) {
    let week = now.iso_week();
    (week.year(), week.week())
}
