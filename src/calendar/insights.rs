//! Quick identity insights from a calendar, written by a text-completion
//! model.
//!
//! The calendar is reduced to a compact JSON payload (a recent-event
//! sample plus category, time-of-day and social counts), sent through the
//! [`RequestThrottler`] under [`ApiClass::LLM`], and the reply is parsed
//! defensively. Insights are decorative: every failure degrades to an
//! empty list instead of an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::category::{CategoryKind, categorize};
use super::event::CalendarEvent;
use crate::prompt::PromptStore;
use crate::throttle::{ApiClass, RequestThrottler, request_key};
use crate::{LoopError, Result};

/// Events included in the sample sent to the model.
pub const SAMPLE_SIZE: usize = 60;
/// Most insights returned from one reply.
pub const MAX_INSIGHTS: usize = 5;

/// Returned without a model call when there are no events.
pub const QUIET_CALENDAR: &str =
    "Calendar is quiet right now, add a few events so I can learn more.";
/// Returned when the completion provider reports an exhausted quota.
pub const QUOTA_EXCEEDED: &str = "Model quota exceeded, insights temporarily unavailable";

/// System prompt for when no `insights` prompt file is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
Generate 3 short, energetic insights about a user's identity inferred from their calendar events. \
Be witty but kind.

Rules:
- Output a JSON array of strings (no markdown, no explanations).
- Each string at most 120 characters.
- Reference patterns, hobbies, or routines visible in the events.
- Avoid sensitive topics (health, politics, religion, demographics).
- If signals are weak, acknowledge light data.
";

/// Name of the insights system prompt in a [`PromptStore`].
pub const INSIGHTS_PROMPT: &str = "insights";

/// The `insights` prompt from `prompts`, or [`DEFAULT_SYSTEM_PROMPT`] when
/// it cannot be loaded.
pub fn system_prompt(prompts: &PromptStore) -> String {
    prompts.cleaned(INSIGHTS_PROMPT).unwrap_or_else(|e| {
        debug!(error = %e, "using built-in insights prompt");
        DEFAULT_SYSTEM_PROMPT.to_string()
    })
}

/// Text-completion backend: a system instruction plus a user payload in,
/// free-form text out.
#[async_trait]
pub trait Completion: Send + Sync {
    /// Provider name, for logs.
    fn name(&self) -> &str;

    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventTypeCount {
    #[serde(rename = "type")]
    pub kind: CategoryKind,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeOfDay {
    pub morning_count: usize,
    pub afternoon_count: usize,
    pub evening_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialPatterns {
    pub social_event_count: usize,
    pub recurring_social_count: usize,
    pub avg_attendees: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampledEvent {
    pub summary: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub attendee_count: usize,
    pub has_recurrence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisContext {
    pub event_types: Vec<EventTypeCount>,
    pub time_patterns: TimeOfDay,
    pub social_patterns: SocialPatterns,
}

/// The user payload sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightPayload {
    pub now_iso: DateTime<Utc>,
    pub event_sample: Vec<SampledEvent>,
    pub analysis_context: AnalysisContext,
}

/// The three most frequent categories, most frequent first.
pub fn event_type_counts(events: &[CalendarEvent]) -> Vec<EventTypeCount> {
    let mut counts: Vec<EventTypeCount> = Vec::new();
    for event in events {
        let kind = categorize(event).kind;
        match counts.iter_mut().find(|c| c.kind == kind) {
            Some(entry) => entry.count += 1,
            None => counts.push(EventTypeCount { kind, count: 1 }),
        }
    }
    // Stable: ties keep first-seen order.
    counts.sort_by(|a, b| b.count.cmp(&a.count));
    counts.truncate(3);
    counts
}

/// Timed events bucketed by start hour: morning 6-12, afternoon 12-18,
/// evening 18-24.
pub fn time_of_day(events: &[CalendarEvent]) -> TimeOfDay {
    let mut buckets = TimeOfDay::default();
    for hour in events.iter().filter_map(|e| e.start.date_time.map(|dt| dt.hour())) {
        match hour {
            6..=11 => buckets.morning_count += 1,
            12..=17 => buckets.afternoon_count += 1,
            18..=23 => buckets.evening_count += 1,
            _ => {}
        }
    }
    buckets
}

pub fn social_patterns(events: &[CalendarEvent]) -> SocialPatterns {
    if events.is_empty() {
        return SocialPatterns::default();
    }
    let social: Vec<&CalendarEvent> = events
        .iter()
        .filter(|e| categorize(e).kind == CategoryKind::Social)
        .collect();
    let total_attendees: usize = events.iter().map(|e| e.attendees.len()).sum();

    SocialPatterns {
        social_event_count: social.len(),
        recurring_social_count: social.iter().filter(|e| !e.recurrence.is_empty()).count(),
        avg_attendees: (total_attendees as f64 / events.len() as f64).round() as u64,
    }
}

/// The latest [`SAMPLE_SIZE`] events, newest first.
pub fn insight_sample(events: &[CalendarEvent]) -> Vec<SampledEvent> {
    let mut sorted: Vec<&CalendarEvent> = events.iter().collect();
    sorted.sort_by_key(|e| std::cmp::Reverse(e.starts_at()));
    sorted
        .into_iter()
        .take(SAMPLE_SIZE)
        .map(|e| SampledEvent {
            summary: if e.summary.is_empty() {
                "Untitled".to_string()
            } else {
                e.summary.clone()
            },
            start: e.starts_at(),
            end: e.ends_at(),
            location: e.location.clone(),
            attendee_count: e.attendees.len(),
            has_recurrence: e.is_recurring(),
        })
        .collect()
}

pub fn insight_payload(events: &[CalendarEvent], now: DateTime<Utc>) -> InsightPayload {
    InsightPayload {
        now_iso: now,
        event_sample: insight_sample(events),
        analysis_context: AnalysisContext {
            event_types: event_type_counts(events),
            time_patterns: time_of_day(events),
            social_patterns: social_patterns(events),
        },
    }
}

/// Extract up to [`MAX_INSIGHTS`] strings from a model reply.
///
/// Takes the outermost `[...]` in the reply (models like to wrap JSON in
/// prose or code fences). A reply that parses to something other than an
/// array yields no insights.
pub fn parse_insights(reply: &str) -> Result<Vec<String>> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Err(LoopError::EmptyResponse);
    }
    let json = match (reply.find('['), reply.rfind(']')) {
        (Some(open), Some(close)) if open < close => &reply[open..=close],
        _ => reply,
    };
    let value: serde_json::Value = serde_json::from_str(json)?;
    let Some(items) = value.as_array() else {
        return Ok(Vec::new());
    };
    Ok(items
        .iter()
        .take(MAX_INSIGHTS)
        .map(|item| match item {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect())
}

/// Writes insights for a user's calendar through a throttled model call.
#[derive(Clone)]
pub struct InsightGenerator {
    completion: Arc<dyn Completion>,
    throttler: RequestThrottler,
    system_prompt: Arc<str>,
    ttl: Duration,
}

impl InsightGenerator {
    /// Results are cached for 30 minutes by default.
    pub fn new(
        completion: Arc<dyn Completion>,
        throttler: RequestThrottler,
        system_prompt: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            completion,
            throttler,
            system_prompt: system_prompt.into(),
            ttl: Duration::from_secs(30 * 60),
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Insights for `events`, or an empty list if anything goes wrong.
    ///
    /// Identical calendars for the same user share one model call and its
    /// cached result; `now` is sent to the model but not part of the key.
    pub async fn generate(
        &self,
        user_id: &str,
        events: &[CalendarEvent],
        now: DateTime<Utc>,
    ) -> Vec<String> {
        if events.is_empty() {
            return vec![QUIET_CALENDAR.to_string()];
        }

        let payload = insight_payload(events, now);
        let key = match request_key(
            "insights",
            user_id,
            &(&payload.event_sample, &payload.analysis_context),
        ) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "could not build insight request key");
                return Vec::new();
            }
        };
        let user = match serde_json::to_string(&payload) {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "could not serialise insight payload");
                return Vec::new();
            }
        };

        let completion = Arc::clone(&self.completion);
        let system = Arc::clone(&self.system_prompt);
        let result = self
            .throttler
            .throttle(&key, &ApiClass::LLM, self.ttl, move || async move {
                let reply = completion.complete(&system, &user).await?;
                parse_insights(&reply)
            })
            .await;

        match result.map_err(LoopError::flatten) {
            Ok(insights) => insights,
            Err(LoopError::Api { status: 429, .. }) => {
                warn!(provider = self.completion.name(), "completion quota exceeded");
                vec![QUOTA_EXCEEDED.to_string()]
            }
            Err(e) => {
                warn!(provider = self.completion.name(), error = %e, "insight generation failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::event::Attendee;
    use chrono::TimeZone;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, d, h, 0, 0).unwrap()
    }

    fn timed(summary: &str, start: DateTime<Utc>) -> CalendarEvent {
        CalendarEvent::timed(summary, start, start + chrono::Duration::hours(1))
    }

    #[test]
    fn parse_plain_array() {
        let insights = parse_insights(r#"["Early riser", "Gym regular"]"#).unwrap();
        assert_eq!(insights, vec!["Early riser", "Gym regular"]);
    }

    #[test]
    fn parse_array_wrapped_in_prose() {
        let reply = "Sure! Here you go:\n```json\n[\"One\", \"Two\"]\n```";
        assert_eq!(parse_insights(reply).unwrap(), vec!["One", "Two"]);
    }

    #[test]
    fn parse_caps_at_five_and_stringifies() {
        let reply = r#"["a", "b", "c", "d", 5, "f"]"#;
        assert_eq!(parse_insights(reply).unwrap(), vec!["a", "b", "c", "d", "5"]);
    }

    #[test]
    fn parse_non_array_is_empty() {
        assert!(parse_insights(r#"{"insight": "x"}"#).unwrap().is_empty());
    }

    #[test]
    fn parse_failures() {
        assert!(matches!(parse_insights("  "), Err(LoopError::EmptyResponse)));
        assert!(matches!(
            parse_insights("[not json]"),
            Err(LoopError::Json(_))
        ));
    }

    #[test]
    fn type_counts_top_three() {
        let events = vec![
            timed("Gym", at(1, 7)),
            timed("Yoga", at(2, 7)),
            timed("Dinner", at(3, 19)),
            timed("Sprint review", at(4, 10)),
            timed("Lecture", at(5, 10)),
            timed("Swim", at(6, 7)),
        ];
        let counts = event_type_counts(&events);
        assert_eq!(counts.len(), 3);
        assert_eq!(
            counts[0],
            EventTypeCount {
                kind: CategoryKind::Health,
                count: 3
            }
        );
    }

    #[test]
    fn time_buckets() {
        let events = vec![
            timed("a", at(1, 6)),
            timed("b", at(1, 11)),
            timed("c", at(1, 12)),
            timed("d", at(1, 23)),
            timed("e", at(1, 3)),
        ];
        assert_eq!(
            time_of_day(&events),
            TimeOfDay {
                morning_count: 2,
                afternoon_count: 1,
                evening_count: 1
            }
        );
    }

    #[test]
    fn social_counts_and_average() {
        let mut dinner = timed("Dinner", at(1, 19));
        dinner.recurrence = vec!["RRULE:FREQ=WEEKLY".into()];
        dinner.attendees = vec![Attendee::default(), Attendee::default()];
        let mut party = timed("Birthday party", at(2, 20));
        party.attendees = vec![Attendee::default()];
        let events = vec![dinner, party, timed("Errand", at(3, 10))];

        let social = social_patterns(&events);
        assert_eq!(social.social_event_count, 2);
        assert_eq!(social.recurring_social_count, 1);
        assert_eq!(social.avg_attendees, 1);
        assert_eq!(social_patterns(&[]), SocialPatterns::default());
    }

    #[test]
    fn sample_is_newest_first_and_capped() {
        let events: Vec<_> = (0..70)
            .map(|i| timed(&format!("e{i}"), at(1, 0) + chrono::Duration::hours(i)))
            .collect();
        let sample = insight_sample(&events);
        assert_eq!(sample.len(), SAMPLE_SIZE);
        assert_eq!(sample[0].summary, "e69");
        assert_eq!(sample[59].summary, "e10");
    }

    #[test]
    fn untitled_events_are_named() {
        let sample = insight_sample(&[timed("", at(1, 9))]);
        assert_eq!(sample[0].summary, "Untitled");
    }

    #[test]
    fn system_prompt_prefers_the_prompt_file() {
        let dir = tempfile::tempdir().unwrap();
        let prompts = PromptStore::new(dir.path());
        assert_eq!(system_prompt(&prompts), DEFAULT_SYSTEM_PROMPT);

        std::fs::write(dir.path().join("insights.md"), "## Insights\n**Three** lines.").unwrap();
        prompts.reload();
        assert_eq!(system_prompt(&prompts), "Insights\nThree lines.");
    }
}
