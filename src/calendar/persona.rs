//! Persona profiles: a model's structured read of who the user is, built
//! from their calendar.
//!
//! The persona is the expensive call of the whole flow, so it is keyed by
//! user and calendar content and cached for 30 minutes. The reply is
//! parsed inside the throttled operation: a reply that is not a JSON
//! object fails the execution and is never cached.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::category::{CategoryKind, process};
use super::event::CalendarEvent;
use super::insights::Completion;
use super::schedule::DayProfile;
use crate::prompt::PromptStore;
use crate::throttle::{ApiClass, RequestThrottler, request_key};
use crate::{LoopError, Result};

/// Name of the persona system prompt in the [`PromptStore`].
pub const PERSONA_PROMPT: &str = "persona";

/// Compact per-event view sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaEvent {
    pub summary: String,
    pub category: CategoryKind,
    /// Minutes.
    pub duration: i64,
    pub participants: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub is_recurring: bool,
}

pub fn persona_events(events: &[CalendarEvent]) -> Vec<PersonaEvent> {
    events
        .iter()
        .map(|event| {
            let processed = process(event);
            PersonaEvent {
                summary: event.summary.clone(),
                category: processed.category.kind,
                duration: processed.duration,
                participants: processed.participants.len(),
                location: event.location.clone(),
                start: event.starts_at(),
                is_recurring: processed.is_recurring,
            }
        })
        .collect()
}

/// Extract the persona object from a model reply.
///
/// Takes the outermost `{...}`, which also drops code fences and any
/// prose around the object.
pub fn parse_persona(reply: &str) -> Result<Value> {
    let reply = reply.trim();
    if reply.is_empty() {
        return Err(LoopError::EmptyResponse);
    }
    let json = match (reply.find('{'), reply.rfind('}')) {
        (Some(open), Some(close)) if open < close => &reply[open..=close],
        _ => reply,
    };
    let value: Value = serde_json::from_str(json)?;
    if !value.is_object() {
        return Err(LoopError::InvalidInput(
            "persona reply is not a JSON object".to_string(),
        ));
    }
    Ok(value)
}

/// Generic persona used while the model quota is exhausted.
pub fn fallback_persona() -> Value {
    json!({
        "name": "Default User",
        "working_style": "Productive professional",
        "communication_preference": "Direct and efficient",
        "meeting_patterns": "Regular business hours",
        "energy_levels": "High energy in mornings",
        "focus_areas": "Work, personal development, health",
        "social_preferences": "Balanced social and solo time",
        "learning_style": "Hands-on and practical",
        "stress_indicators": "Over-scheduling, lack of breaks",
        "optimal_conditions": "Quiet environment, clear goals",
        "time_management": "Structured and organized",
        "collaboration_style": "Team-oriented",
        "decision_making": "Data-driven and analytical",
        "feedback_preference": "Constructive and specific",
        "work_life_balance": "Clear boundaries between work and personal time"
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    /// The persona document as the model wrote it.
    pub profile: Value,
    /// Set when [`fallback_persona()`] stood in for a real one.
    pub is_fallback: bool,
}

impl Persona {
    /// Day start and quiet hours for free-slot search.
    pub fn day_profile(&self) -> Result<DayProfile> {
        DayProfile::from_persona(&self.profile)
    }
}

/// Generates personas through a throttled model call.
pub struct PersonaGenerator {
    completion: Arc<dyn Completion>,
    throttler: RequestThrottler,
    prompts: PromptStore,
    ttl: Duration,
}

impl PersonaGenerator {
    /// Results are cached for 30 minutes by default.
    pub fn new(
        completion: Arc<dyn Completion>,
        throttler: RequestThrottler,
        prompts: PromptStore,
    ) -> Self {
        Self {
            completion,
            throttler,
            prompts,
            ttl: Duration::from_secs(30 * 60),
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// The persona for `events`.
    ///
    /// Identical calendars for the same user share one model call. An
    /// exhausted model quota yields [`fallback_persona()`].
    ///
    /// # Errors
    ///
    /// [`LoopError::Configuration`] if the persona prompt cannot be read;
    /// otherwise the model or parse failure, unwrapped from the throttler.
    pub async fn generate(&self, user_id: &str, events: &[CalendarEvent]) -> Result<Persona> {
        let system = self.prompts.cleaned(PERSONA_PROMPT)?;
        let sample = persona_events(events);
        let key = request_key("persona", user_id, &sample)?;
        let user = serde_json::to_string(&sample)?;

        let completion = Arc::clone(&self.completion);
        let result = self
            .throttler
            .throttle(&key, &ApiClass::LLM, self.ttl, move || async move {
                let reply = completion.complete(&system, &user).await?;
                parse_persona(&reply)
            })
            .await;

        match result.map_err(LoopError::flatten) {
            Ok(profile) => {
                info!(user_id, events = events.len(), "persona ready");
                Ok(Persona {
                    profile,
                    is_fallback: false,
                })
            }
            Err(LoopError::Api { status: 429, .. }) => {
                warn!(
                    provider = self.completion.name(),
                    "completion quota exceeded, using fallback persona"
                );
                Ok(Persona {
                    profile: fallback_persona(),
                    is_fallback: true,
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::event::Attendee;
    use chrono::TimeZone;

    #[test]
    fn parses_object_out_of_prose_and_fences() {
        let reply = "Here you go:\n```json\n{\"profile\": {\"quiet_hours\": \"23:00-07:00\"}}\n```\nEnjoy!";
        let value = parse_persona(reply).unwrap();
        assert_eq!(value["profile"]["quiet_hours"], "23:00-07:00");
    }

    #[test]
    fn rejects_non_objects() {
        assert!(matches!(parse_persona(""), Err(LoopError::EmptyResponse)));
        assert!(matches!(parse_persona("[1, 2]"), Err(LoopError::InvalidInput(_))));
        assert!(matches!(parse_persona("\"just a string\""), Err(LoopError::InvalidInput(_))));
        assert!(matches!(parse_persona("{not json}"), Err(LoopError::Json(_))));
    }

    #[test]
    fn events_are_reduced_for_the_prompt() {
        let start = Utc.with_ymd_and_hms(2025, 9, 29, 9, 0, 0).unwrap();
        let mut event = CalendarEvent::timed("Sprint planning", start, start + chrono::Duration::minutes(90));
        event.attendees = (0..4)
            .map(|i| Attendee {
                email: format!("dev{i}@example.com"),
                ..Attendee::default()
            })
            .collect();

        let reduced = persona_events(&[event]);
        assert_eq!(reduced[0].category, CategoryKind::Work);
        assert_eq!(reduced[0].duration, 90);
        assert_eq!(reduced[0].participants, 4);
        assert_eq!(reduced[0].start, Some(start));

        let value = serde_json::to_value(&reduced[0]).unwrap();
        assert_eq!(value["isRecurring"], false);
        assert!(value.get("location").is_none());
    }

    #[test]
    fn day_profile_reads_persona_fields() {
        let persona = Persona {
            profile: json!({"profile": {"typical_day_start_local": "08:30"}}),
            is_fallback: false,
        };
        let profile = persona.day_profile().unwrap();
        assert_eq!(profile.day_start, chrono::NaiveTime::from_hms_opt(8, 30, 0).unwrap());
    }
}
