//! Retention policy
//!
//! Either a maximum age (checked at most once per elapsed day) or a maximum
//! clip count (applied after every insert). The eviction itself lives in
//! `ClipboardHistory`; this module decides when and with which cutoff.

use chrono::{Duration, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTimeSpan {
    Day,
    Week,
    Month,
}

impl CleanupTimeSpan {
    pub fn days(self) -> i64 {
        match self {
            CleanupTimeSpan::Day => 1,
            CleanupTimeSpan::Week => 7,
            CleanupTimeSpan::Month => 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    None,
    Period { span: CleanupTimeSpan },
    Quantity { max_clips: u32 },
}

/// Round to the closest midnight (12:00 and later rounds up).
pub fn round_to_nearest_day(time: NaiveDateTime) -> NaiveDateTime {
    (time + Duration::hours(12)).date().and_time(NaiveTime::MIN)
}

/// Clips strictly older than the returned instant are evicted.
/// The one-day span keeps time-of-day; longer spans work on whole days.
pub fn cleanup_cutoff(span: CleanupTimeSpan, now: NaiveDateTime) -> NaiveDateTime {
    let anchor = match span {
        CleanupTimeSpan::Day => now,
        CleanupTimeSpan::Week | CleanupTimeSpan::Month => round_to_nearest_day(now),
    };
    anchor - Duration::days(span.days())
}

/// Tracks the last time-based sweep
#[derive(Debug, Default)]
pub struct CleanupScheduler {
    last_run: Option<NaiveDateTime>,
}

impl CleanupScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_run(&self) -> Option<NaiveDateTime> {
        self.last_run
    }

    /// Cutoff for a sweep due at `now`, recording the run.
    /// `None` when the policy is not time based or a full day has not passed yet.
    pub fn due_cutoff(
        &mut self,
        policy: &RetentionPolicy,
        now: NaiveDateTime,
    ) -> Option<NaiveDateTime> {
        let RetentionPolicy::Period { span } = policy else {
            return None;
        };
        if let Some(last) = self.last_run {
            if now.signed_duration_since(last).num_days() < 1 {
                return None;
            }
        }
        self.last_run = Some(now);
        Some(cleanup_cutoff(*span, now))
    }
}
