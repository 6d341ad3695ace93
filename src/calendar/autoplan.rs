//! Writing accepted suggestions into the user's calendar, and undoing it.
//!
//! Suggestions go into a dedicated secondary calendar, created on first
//! use. If that calendar cannot be created they land in `primary`
//! instead, so every written event is also tagged: a `source` entry and a
//! private extended property. Undo clears the dedicated calendar, removes
//! it, then sweeps `primary` for tagged events (including events carrying
//! the older description tag).
//!
//! Every provider request goes through the [`RequestThrottler`] under
//! [`ApiClass::CALENDAR`] with a zero TTL, so writes are rate limited and
//! a double-submitted write is deduplicated but never cached.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::client::CalendarClient;
use super::event::{CalendarEvent, CalendarListEntry, EventSource, EventTime, ExtendedProperties};
use crate::throttle::{ApiClass, RequestThrottler, request_key};
use crate::{LoopError, Result};

/// Name of the calendar suggestions are written to.
pub const AUTOPLAN_CALENDAR: &str = "Loop – Autoplan";
pub const AUTOPLAN_DESCRIPTION: &str = "Auto-generated events by Loop Labs";

/// `source.title` set on every written event.
pub const SOURCE_TITLE: &str = "Loop Labs Auto-Populate";
pub const SOURCE_URL: &str = "https://loop-labs.app";

/// Private extended property set on every written event.
pub const PRIVATE_FLAG_KEY: &str = "loopAutopopulate";
pub const PRIVATE_FLAG_VALUE: &str = "v1";

/// Description tag used by older writes; still recognised by undo.
pub const LEGACY_TAG: &str = "[loop_autopopulate_v1]";

const PRIMARY: &str = "primary";

/// An event proposed to the user, as sent back when they accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    #[serde(default)]
    pub id: String,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub category: String,
    /// Why it was suggested; becomes the event description.
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub selected: bool,
}

impl Suggestion {
    /// The tagged calendar event to insert.
    pub fn to_event(&self) -> CalendarEvent {
        CalendarEvent {
            summary: self.title.clone(),
            description: (!self.reason.is_empty()).then(|| self.reason.clone()),
            start: EventTime::at(self.start_time),
            end: EventTime::at(self.end_time),
            source: Some(EventSource {
                title: SOURCE_TITLE.to_string(),
                url: SOURCE_URL.to_string(),
            }),
            extended_properties: Some(ExtendedProperties {
                private: HashMap::from([(
                    PRIVATE_FLAG_KEY.to_string(),
                    PRIVATE_FLAG_VALUE.to_string(),
                )]),
            }),
            ..CalendarEvent::default()
        }
    }
}

/// Whether `event` was written by the autoplanner, by any of its tags.
pub fn is_autoplan_event(event: &CalendarEvent) -> bool {
    event
        .source
        .as_ref()
        .is_some_and(|source| source.title == SOURCE_TITLE)
        || event.private_property(PRIVATE_FLAG_KEY) == Some(PRIVATE_FLAG_VALUE)
        || event
            .description
            .as_deref()
            .is_some_and(|d| d.contains(LEGACY_TAG))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteSummary {
    /// Calendar the events went to (`primary` if the dedicated calendar
    /// could not be created).
    pub calendar_id: String,
    pub created: Vec<CalendarEvent>,
    /// Suggestions whose insert failed.
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoSummary {
    pub deleted: usize,
    /// Events found but not deleted.
    pub failed: usize,
    /// Whether the dedicated calendar itself was removed.
    pub calendar_removed: bool,
}

/// Writes and undoes autoplanned events for one user at a time.
#[derive(Clone)]
pub struct Autoplanner {
    client: CalendarClient,
    throttler: RequestThrottler,
}

impl Autoplanner {
    pub fn new(client: CalendarClient, throttler: RequestThrottler) -> Self {
        Self { client, throttler }
    }

    /// Id of the dedicated calendar, creating it if the user has none.
    ///
    /// Falls back to `primary` when creation fails.
    ///
    /// # Errors
    ///
    /// Fails if the calendar list cannot be read.
    pub async fn calendar_id(&self, token: &str, user_id: &str) -> Result<String> {
        let key = request_key("autoplan_calendar", user_id, AUTOPLAN_CALENDAR)?;
        let token = token.to_owned();
        self.calendar_call(&key, move |client| async move {
            get_or_create(&client, &token).await
        })
        .await
    }

    /// Insert every selected suggestion. A failed insert is logged and
    /// counted; the rest still go in.
    ///
    /// # Errors
    ///
    /// [`LoopError::InvalidInput`] if nothing is selected; otherwise only
    /// failures to find or create the target calendar.
    pub async fn write(
        &self,
        token: &str,
        user_id: &str,
        suggestions: &[Suggestion],
    ) -> Result<WriteSummary> {
        let selected: Vec<&Suggestion> = suggestions.iter().filter(|s| s.selected).collect();
        if selected.is_empty() {
            return Err(LoopError::InvalidInput("no suggestions selected".to_string()));
        }

        let calendar_id = self.calendar_id(token, user_id).await?;
        let mut created = Vec::with_capacity(selected.len());
        let mut failed = 0;

        for suggestion in selected {
            let key = request_key("autoplan_write", user_id, &(&calendar_id, suggestion))?;
            let event = suggestion.to_event();
            let (token, calendar) = (token.to_owned(), calendar_id.clone());
            let result = self
                .calendar_call(&key, move |client| async move {
                    client.create_event(&token, &calendar, &event).await
                })
                .await;
            match result {
                Ok(event) => created.push(event),
                Err(e) => {
                    warn!(title = %suggestion.title, error = %e, "failed to write suggestion");
                    failed += 1;
                }
            }
        }

        info!(calendar_id, created = created.len(), failed, "suggestions written");
        Ok(WriteSummary {
            calendar_id,
            created,
            failed,
        })
    }

    /// Remove everything the autoplanner wrote.
    ///
    /// Listing or deleting individual events degrades per event; the
    /// summary says how many went.
    ///
    /// # Errors
    ///
    /// Fails only if the calendar list cannot be read.
    pub async fn undo(&self, token: &str, user_id: &str) -> Result<UndoSummary> {
        let key = request_key("autoplan_calendars", user_id, &())?;
        let owned = token.to_owned();
        let calendars: Vec<CalendarListEntry> = self
            .calendar_call(&key, move |client| async move {
                client.list_calendars(&owned).await
            })
            .await?;

        let mut summary = UndoSummary::default();

        if let Some(calendar) = calendars.iter().find(|c| c.summary == AUTOPLAN_CALENDAR) {
            match self.events(token, user_id, &calendar.id).await {
                Ok(events) => self.delete_all(token, user_id, &calendar.id, &events, &mut summary).await,
                Err(e) => warn!(error = %e, "could not list autoplan calendar events"),
            }

            let key = request_key("autoplan_remove", user_id, &calendar.id)?;
            let (owned, id) = (token.to_owned(), calendar.id.clone());
            match self
                .calendar_call(&key, move |client| async move {
                    client.delete_calendar(&owned, &id).await
                })
                .await
            {
                Ok(()) => summary.calendar_removed = true,
                Err(e) => warn!(error = %e, "could not remove autoplan calendar"),
            }
        }

        match self.events(token, user_id, PRIMARY).await {
            Ok(events) => {
                let ours: Vec<CalendarEvent> =
                    events.into_iter().filter(is_autoplan_event).collect();
                self.delete_all(token, user_id, PRIMARY, &ours, &mut summary).await;
            }
            Err(e) => warn!(error = %e, "could not list primary calendar events"),
        }

        info!(
            deleted = summary.deleted,
            failed = summary.failed,
            "autoplanned events removed"
        );
        Ok(summary)
    }

    async fn events(&self, token: &str, user_id: &str, calendar_id: &str) -> Result<Vec<CalendarEvent>> {
        let key = request_key("autoplan_list", user_id, calendar_id)?;
        let (token, id) = (token.to_owned(), calendar_id.to_owned());
        self.calendar_call(&key, move |client| async move {
            client.all_events(&token, &id).await
        })
        .await
    }

    async fn delete_all(
        &self,
        token: &str,
        user_id: &str,
        calendar_id: &str,
        events: &[CalendarEvent],
        summary: &mut UndoSummary,
    ) {
        for event in events {
            let key = match request_key("autoplan_delete", user_id, &(calendar_id, &event.id)) {
                Ok(key) => key,
                Err(e) => {
                    warn!(event = %event.id, error = %e, "could not key delete request");
                    summary.failed += 1;
                    continue;
                }
            };
            let (owned, calendar, id) = (token.to_owned(), calendar_id.to_owned(), event.id.clone());
            match self
                .calendar_call(&key, move |client| async move {
                    client.delete_event(&owned, &calendar, &id).await
                })
                .await
            {
                Ok(()) => summary.deleted += 1,
                Err(e) => {
                    warn!(event = %event.summary, error = %e, "failed to delete event");
                    summary.failed += 1;
                }
            }
        }
    }

    /// One provider request through the throttler. Errors come back as
    /// the client returned them.
    async fn calendar_call<T, F, Fut>(&self, key: &str, operation: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(CalendarClient) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let client = self.client.clone();
        self.throttler
            .throttle(key, &ApiClass::CALENDAR, Duration::ZERO, move || operation(client))
            .await
            .map_err(LoopError::flatten)
    }
}

async fn get_or_create(client: &CalendarClient, token: &str) -> Result<String> {
    let calendars = client.list_calendars(token).await?;
    if let Some(existing) = calendars.into_iter().find(|c| c.summary == AUTOPLAN_CALENDAR) {
        return Ok(existing.id);
    }

    match client
        .create_calendar(token, AUTOPLAN_CALENDAR, AUTOPLAN_DESCRIPTION)
        .await
    {
        Ok(created) => {
            info!(calendar_id = %created.id, "created autoplan calendar");
            Ok(created.id)
        }
        Err(e) => {
            warn!(error = %e, "could not create autoplan calendar, using primary");
            Ok(PRIMARY.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn suggestion(title: &str) -> Suggestion {
        Suggestion {
            id: "s1".into(),
            title: title.into(),
            start_time: Utc.with_ymd_and_hms(2025, 10, 4, 10, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2025, 10, 4, 11, 0, 0).unwrap(),
            category: "social".into(),
            reason: "Saturday mornings are free".into(),
            selected: true,
        }
    }

    #[test]
    fn written_events_carry_every_tag() {
        let event = suggestion("Farmers market").to_event();
        assert_eq!(event.summary, "Farmers market");
        assert_eq!(event.description.as_deref(), Some("Saturday mornings are free"));
        assert!(is_autoplan_event(&event));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["source"]["title"], SOURCE_TITLE);
        assert_eq!(value["extendedProperties"]["private"]["loopAutopopulate"], "v1");
    }

    #[test]
    fn empty_reason_leaves_description_unset() {
        let mut s = suggestion("Run");
        s.reason.clear();
        assert!(s.to_event().description.is_none());
    }

    #[test]
    fn recognises_each_tag_on_its_own() {
        let plain = CalendarEvent::default();
        assert!(!is_autoplan_event(&plain));

        let legacy = CalendarEvent {
            description: Some(format!("{LEGACY_TAG} Coffee with founders")),
            ..CalendarEvent::default()
        };
        assert!(is_autoplan_event(&legacy));

        let sourced = CalendarEvent {
            source: Some(EventSource {
                title: SOURCE_TITLE.into(),
                url: String::new(),
            }),
            ..CalendarEvent::default()
        };
        assert!(is_autoplan_event(&sourced));

        let flagged = CalendarEvent {
            extended_properties: Some(ExtendedProperties {
                private: HashMap::from([(PRIVATE_FLAG_KEY.into(), PRIVATE_FLAG_VALUE.into())]),
            }),
            ..CalendarEvent::default()
        };
        assert!(is_autoplan_event(&flagged));

        let other_source = CalendarEvent {
            source: Some(EventSource {
                title: "Some other app".into(),
                url: String::new(),
            }),
            ..CalendarEvent::default()
        };
        assert!(!is_autoplan_event(&other_source));
    }

    #[test]
    fn suggestion_deserializes_camel_case() {
        let json = r#"{
            "id": "s9",
            "title": "Climbing",
            "startTime": "2025-10-05T17:00:00Z",
            "endTime": "2025-10-05T19:00:00Z",
            "category": "health",
            "reason": "You climb most weeks",
            "selected": true
        }"#;
        let s: Suggestion = serde_json::from_str(json).unwrap();
        assert_eq!(s.title, "Climbing");
        assert!(s.selected);
        assert_eq!(s.end_time - s.start_time, chrono::Duration::hours(2));
    }
}
