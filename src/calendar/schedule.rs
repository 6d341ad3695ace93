//! Schedule heuristics used to build model prompts: the digest window,
//! free-slot search, the existing-events listing and conflict checks.
//!
//! All wall-clock reasoning is done in UTC.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::CalendarEvent;
use crate::{LoopError, Result};

/// Days before `now` included in a digest.
pub const DIGEST_DAYS_BACK: i64 = 7;
/// Days after `now` included in a digest.
pub const DIGEST_DAYS_AHEAD: i64 = 14;
/// Days scanned for free slots.
pub const FREE_SLOT_HORIZON_DAYS: i64 = 28;
/// Shortest gap reported as a free slot.
pub const MIN_FREE_SLOT_MINUTES: i64 = 60;

fn hm(hour: u32, min: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, min, 0).unwrap_or(NaiveTime::MIN)
}

/// `NaiveTime` as `"HH:MM"`.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&time.format("%H:%M"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, "%H:%M").map_err(serde::de::Error::custom)
    }
}

/// The parts of a persona that shape when free time can be suggested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayProfile {
    #[serde(with = "hhmm")]
    pub day_start: NaiveTime,
    #[serde(with = "hhmm")]
    pub day_end: NaiveTime,
    #[serde(with = "hhmm")]
    pub quiet_start: NaiveTime,
    #[serde(with = "hhmm")]
    pub quiet_end: NaiveTime,
}

impl Default for DayProfile {
    fn default() -> Self {
        Self {
            day_start: hm(9, 0),
            day_end: hm(18, 0),
            quiet_start: hm(22, 0),
            quiet_end: hm(7, 0),
        }
    }
}

impl DayProfile {
    /// Read `profile.typical_day_start_local`, `profile.typical_day_end_local`
    /// and `profile.quiet_hours` (`"22:00-07:00"`) from a persona document.
    /// Missing fields keep their defaults; malformed ones are an error.
    pub fn from_persona(persona: &serde_json::Value) -> Result<Self> {
        let mut profile = Self::default();
        let fields = &persona["profile"];

        if let Some(raw) = fields["typical_day_start_local"].as_str() {
            profile.day_start = parse_hm(raw)?;
        }
        if let Some(raw) = fields["typical_day_end_local"].as_str() {
            profile.day_end = parse_hm(raw)?;
        }
        if let Some(raw) = fields["quiet_hours"].as_str() {
            let (start, end) = raw.split_once('-').ok_or_else(|| {
                LoopError::InvalidInput(format!("quiet hours '{raw}' are not START-END"))
            })?;
            profile.quiet_start = parse_hm(start)?;
            profile.quiet_end = parse_hm(end)?;
        }
        Ok(profile)
    }
}

fn parse_hm(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| LoopError::InvalidInput(format!("invalid time '{raw}': {e}")))
}

/// A gap in the schedule long enough to suggest something in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSlot {
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub duration_minutes: i64,
    pub weekday: String,
}

/// Events starting within `[now - 7 days, now + 14 days]`.
pub fn digest_window(events: &[CalendarEvent], now: DateTime<Utc>) -> Vec<&CalendarEvent> {
    let from = now - Duration::days(DIGEST_DAYS_BACK);
    let to = now + Duration::days(DIGEST_DAYS_AHEAD);
    events
        .iter()
        .filter(|e| e.starts_at().is_some_and(|start| start >= from && start <= to))
        .collect()
}

/// Free slots of at least an hour over the next 28 days.
///
/// Each day is walked from `profile.day_start`: every gap before the next
/// event's start is a candidate, and so is the stretch from the last
/// event's end to the start of quiet hours. All-day events are treated as
/// occupying 09:00-17:00.
pub fn free_slots(
    events: &[CalendarEvent],
    profile: &DayProfile,
    now: DateTime<Utc>,
) -> Vec<FreeSlot> {
    let mut by_day: BTreeMap<NaiveDate, Vec<&CalendarEvent>> = BTreeMap::new();
    for event in events {
        let day = match (&event.start.date_time, &event.start.date) {
            (Some(dt), _) => dt.date_naive(),
            (None, Some(d)) => *d,
            (None, None) => continue,
        };
        by_day.entry(day).or_default().push(event);
    }

    let mut slots = Vec::new();
    for offset in 0..FREE_SLOT_HORIZON_DAYS {
        let date = (now + Duration::days(offset)).date_naive();
        let weekday = date.format("%A").to_string();
        let mut day_events = by_day.get(&date).cloned().unwrap_or_default();
        day_events.sort_by_key(|e| e.starts_at());

        let mut push_gap = |from: NaiveTime, to: NaiveTime| {
            let minutes = (to - from).num_minutes();
            if minutes >= MIN_FREE_SLOT_MINUTES {
                slots.push(FreeSlot {
                    date,
                    start_time: from,
                    end_time: to,
                    duration_minutes: minutes,
                    weekday: weekday.clone(),
                });
            }
        };

        let mut last_end = profile.day_start;
        for event in day_events {
            let start = event.start.date_time.map_or(hm(9, 0), |dt| dt.time());
            if start > last_end {
                push_gap(last_end, start);
            }
            let end = match event.end.date_time {
                // Runs past midnight: nothing left today.
                Some(dt) if dt.date_naive() > date => hm(23, 59),
                Some(dt) => dt.time(),
                None => hm(17, 0),
            };
            last_end = last_end.max(end);
        }

        if last_end < profile.quiet_start {
            push_gap(last_end, profile.quiet_start);
        }
    }
    slots
}

/// Rough prompt size of `events` in tokens (4 characters per token).
pub fn estimate_tokens(events: &[CalendarEvent]) -> usize {
    let chars: usize = events
        .iter()
        .map(|e| {
            let attendees: usize = e
                .attendees
                .iter()
                .map(|a| a.email.chars().count() + a.display_name.as_deref().map_or(0, |n| n.chars().count()))
                .sum();
            e.summary.chars().count()
                + e.description.as_deref().map_or(0, |d| d.chars().count())
                + e.location.as_deref().map_or(0, |l| l.chars().count())
                + e.start.raw_len()
                + e.end.raw_len()
                + e.calendar_summary.as_deref().map_or(0, |s| s.chars().count())
                + attendees
        })
        .sum();
    chars.div_ceil(4)
}

/// Chronological per-day listing of timed events in `[now, now + days)`:
///
/// ```text
/// Monday, Sep 29:
///   09:00-10:30: Team Meeting
///   14:00-15:00: Client Call
/// ```
///
/// Handed to the model so suggestions avoid existing commitments.
pub fn existing_schedule(events: &[CalendarEvent], now: DateTime<Utc>, days: i64) -> String {
    let until = now + Duration::days(days);
    let mut by_day: BTreeMap<NaiveDate, Vec<(DateTime<Utc>, DateTime<Utc>, &str)>> =
        BTreeMap::new();
    for event in events {
        let (Some(start), Some(end)) = (event.start.date_time, event.end.date_time) else {
            continue;
        };
        if start < now || start >= until {
            continue;
        }
        by_day
            .entry(start.date_naive())
            .or_default()
            .push((start, end, event.summary.as_str()));
    }

    if by_day.is_empty() {
        return "No existing events scheduled.".to_string();
    }

    let mut out = String::new();
    for (day, mut entries) in by_day {
        entries.sort_by_key(|(start, _, _)| *start);
        out.push_str(&format!("{}:\n", day.format("%A, %b %-d")));
        for (start, end, summary) in entries {
            let summary = if summary.is_empty() { "Untitled" } else { summary };
            out.push_str(&format!(
                "  {}-{}: {summary}\n",
                start.format("%H:%M"),
                end.format("%H:%M")
            ));
        }
        out.push('\n');
    }
    out.truncate(out.trim_end().len());
    out
}

/// Events overlapping the half-open interval `[start, end)`.
pub fn conflicts<'a>(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    events: &'a [CalendarEvent],
) -> Vec<&'a CalendarEvent> {
    events
        .iter()
        .filter(|e| match (e.starts_at(), e.ends_at()) {
            (Some(s), Some(en)) => s < end && en > start,
            _ => false,
        })
        .collect()
}
