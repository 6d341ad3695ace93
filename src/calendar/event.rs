//! Calendar event model, in the provider's JSON shape.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Start or end of an event: a timestamp, or a date for all-day events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

impl EventTime {
    pub fn at(date_time: DateTime<Utc>) -> Self {
        Self {
            date_time: Some(date_time),
            date: None,
        }
    }

    pub fn all_day(date: NaiveDate) -> Self {
        Self {
            date_time: None,
            date: Some(date),
        }
    }

    /// The instant this time refers to. All-day dates resolve to midnight UTC.
    pub fn resolve(&self) -> Option<DateTime<Utc>> {
        self.date_time
            .or_else(|| self.date.map(|d| d.and_time(NaiveTime::MIN).and_utc()))
    }

    /// Whether this is a timed (not all-day) value.
    pub fn is_timed(&self) -> bool {
        self.date_time.is_some()
    }

    /// The raw textual form the provider would send, for size estimates.
    pub(crate) fn raw_len(&self) -> usize {
        match (&self.date_time, &self.date) {
            (Some(dt), _) => dt.to_rfc3339().len(),
            (None, Some(d)) => d.to_string().len(),
            (None, None) => 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attendee {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Where an event came from, as shown to the user by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

/// Key/value properties attached to an event and hidden from attendees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedProperties {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub private: HashMap<String, String>,
}

/// A single calendar event.
///
/// Mirrors the provider's event resource. `calendar_id` and
/// `calendar_summary` are not sent by the provider; they are filled in when
/// events from several calendars are merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub start: EventTime,
    #[serde(default)]
    pub end: EventTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<Attendee>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<Person>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<Person>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recurrence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EventSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<ExtendedProperties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_summary: Option<String>,
}

impl CalendarEvent {
    /// A timed event, mostly for building events to write back.
    pub fn timed(summary: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            summary: summary.into(),
            start: EventTime::at(start),
            end: EventTime::at(end),
            ..Self::default()
        }
    }

    pub fn starts_at(&self) -> Option<DateTime<Utc>> {
        self.start.resolve()
    }

    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        self.end.resolve()
    }

    /// Recurring either by rule or as an instance of a recurring series.
    pub fn is_recurring(&self) -> bool {
        !self.recurrence.is_empty() || self.recurring_event_id.is_some()
    }

    /// A private extended property, if set.
    pub fn private_property(&self, key: &str) -> Option<&str> {
        self.extended_properties
            .as_ref()?
            .private
            .get(key)
            .map(String::as_str)
    }

    /// Summary, description and location, lowercased and space-joined.
    pub(crate) fn search_text(&self) -> String {
        format!(
            "{} {} {}",
            self.summary,
            self.description.as_deref().unwrap_or_default(),
            self.location.as_deref().unwrap_or_default()
        )
        .to_lowercase()
    }
}

/// One entry of the user's calendar list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarListEntry {
    pub id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_role: Option<String>,
    #[serde(default)]
    pub selected: bool,
}

/// Sort events chronologically; events without a start sort first.
pub fn sort_by_start(events: &mut [CalendarEvent]) {
    events.sort_by_key(|e| e.starts_at());
}
