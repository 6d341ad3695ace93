//! Keyword-based event categorisation.

use serde::{Deserialize, Serialize};

use super::event::CalendarEvent;

const WORK_KEYWORDS: &[&str] = &[
    "meeting", "standup", "review", "sprint", "retrospective", "interview",
    "conference", "workshop", "training", "presentation", "demo", "call",
    "office hours", "1:1", "team", "project", "deadline", "client",
];

const EDUCATION_KEYWORDS: &[&str] = &[
    "class", "lecture", "exam", "homework", "study", "seminar", "course",
    "assignment", "quiz", "lab", "tutorial", "office hours", "professor",
];

const HEALTH_KEYWORDS: &[&str] = &[
    "gym", "workout", "run", "yoga", "pilates", "doctor", "dentist",
    "appointment", "therapy", "massage", "fitness", "exercise", "swim",
];

const SOCIAL_KEYWORDS: &[&str] = &[
    "dinner", "lunch", "party", "birthday", "wedding", "date", "hangout",
    "coffee", "drinks", "movie", "concert", "game", "trip", "vacation",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryKind {
    Work,
    Personal,
    Education,
    Health,
    Social,
    Other,
}

impl CategoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryKind::Work => "work",
            CategoryKind::Personal => "personal",
            CategoryKind::Education => "education",
            CategoryKind::Health => "health",
            CategoryKind::Social => "social",
            CategoryKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCategory {
    #[serde(rename = "type")]
    pub kind: CategoryKind,
    pub confidence: f64,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationType {
    Office,
    Venue,
    Virtual,
    Other,
}

/// An event with the derived fields used in prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEvent {
    #[serde(flatten)]
    pub event: CalendarEvent,
    pub category: EventCategory,
    /// Minutes between start and end; 0 when either is missing.
    pub duration: i64,
    pub is_recurring: bool,
    pub participants: Vec<String>,
    pub location_type: LocationType,
}

fn matches(text: &str, keywords: &[&str]) -> Vec<String> {
    keywords
        .iter()
        .filter(|k| text.contains(*k))
        .map(|k| (*k).to_string())
        .collect()
}

fn score(matched: usize) -> f64 {
    (0.5 + matched as f64 * 0.1).min(0.9)
}

/// Categorise an event from its summary, description, location and
/// attendee count.
///
/// Groups are tried in order work, education, health, social. The first
/// match sets the category; later groups only override while confidence
/// is still below 0.7. More than two attendees counts as work even without
/// a keyword. A weak result with at most two attendees and no "meeting"
/// is reported as personal.
pub fn categorize(event: &CalendarEvent) -> EventCategory {
    let text = event.search_text();
    let attendees = event.attendees.len();

    let mut kind = CategoryKind::Other;
    let mut confidence = 0.5;
    let mut keywords = Vec::new();

    let work = matches(&text, WORK_KEYWORDS);
    if !work.is_empty() || attendees > 2 {
        kind = CategoryKind::Work;
        confidence = score(work.len());
        keywords = work;
    }

    for (group, group_kind) in [
        (EDUCATION_KEYWORDS, CategoryKind::Education),
        (HEALTH_KEYWORDS, CategoryKind::Health),
        (SOCIAL_KEYWORDS, CategoryKind::Social),
    ] {
        let found = matches(&text, group);
        if !found.is_empty() && confidence < 0.7 {
            kind = group_kind;
            confidence = score(found.len());
            keywords = found;
        }
    }

    if confidence < 0.6 && attendees <= 2 && !text.contains("meeting") {
        kind = CategoryKind::Personal;
        confidence = 0.4;
    }

    EventCategory {
        kind,
        confidence,
        keywords,
    }
}

/// Classify where an event happens from its location text.
pub fn location_type(location: Option<&str>) -> LocationType {
    let Some(location) = location else {
        return LocationType::Other;
    };
    let location = location.to_lowercase();
    if location.contains("office") || location.contains("work") {
        LocationType::Office
    } else if location.contains("home") || location.contains("zoom") || location.contains("meet") {
        LocationType::Virtual
    } else if location.contains("restaurant")
        || location.contains("venue")
        || location.contains("theater")
    {
        LocationType::Venue
    } else {
        LocationType::Other
    }
}

pub fn process(event: &CalendarEvent) -> ProcessedEvent {
    let duration = match (event.starts_at(), event.ends_at()) {
        (Some(start), Some(end)) => (end - start).num_minutes(),
        _ => 0,
    };

    ProcessedEvent {
        category: categorize(event),
        duration,
        is_recurring: !event.recurrence.is_empty(),
        participants: event.attendees.iter().map(|a| a.email.clone()).collect(),
        location_type: location_type(event.location.as_deref()),
        event: event.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::event::{Attendee, EventTime};
    use chrono::{TimeZone, Utc};

    fn event(summary: &str) -> CalendarEvent {
        CalendarEvent {
            summary: summary.to_string(),
            ..CalendarEvent::default()
        }
    }

    fn attendees(n: usize) -> Vec<Attendee> {
        (0..n)
            .map(|i| Attendee {
                email: format!("p{i}@example.com"),
                ..Attendee::default()
            })
            .collect()
    }

    #[test]
    fn single_work_keyword() {
        let category = categorize(&event("Sprint planning"));
        assert_eq!(category.kind, CategoryKind::Work);
        assert!((category.confidence - 0.6).abs() < 1e-9);
        assert_eq!(category.keywords, vec!["sprint"]);
    }

    #[test]
    fn strong_work_match_is_not_overridden() {
        // "team", "project", "review" => 0.8, social "lunch" may not override
        let category = categorize(&event("Team project review lunch"));
        assert_eq!(category.kind, CategoryKind::Work);
        assert!((category.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn weak_work_match_is_overridden() {
        let category = categorize(&event("Client dinner"));
        assert_eq!(category.kind, CategoryKind::Social);
        assert_eq!(category.keywords, vec!["dinner"]);
    }

    #[test]
    fn many_attendees_means_work() {
        let mut e = event("Sync");
        e.attendees = attendees(3);
        let category = categorize(&e);
        assert_eq!(category.kind, CategoryKind::Work);
        assert!((category.confidence - 0.5).abs() < 1e-9);
        assert!(category.keywords.is_empty());
    }

    #[test]
    fn unmatched_small_event_is_personal() {
        let category = categorize(&event("Pick up parcel"));
        assert_eq!(category.kind, CategoryKind::Personal);
        assert!((category.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn health_keywords() {
        let category = categorize(&event("Yoga then swim"));
        assert_eq!(category.kind, CategoryKind::Health);
        assert!((category.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn location_types() {
        assert_eq!(location_type(Some("Head Office, floor 3")), LocationType::Office);
        assert_eq!(location_type(Some("Zoom")), LocationType::Virtual);
        assert_eq!(location_type(Some("Lyric Theater")), LocationType::Venue);
        assert_eq!(location_type(Some("Park")), LocationType::Other);
        assert_eq!(location_type(None), LocationType::Other);
    }

    #[test]
    fn process_derives_duration_and_participants() {
        let mut e = event("Dentist");
        e.start = EventTime::at(Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap());
        e.end = EventTime::at(Utc.with_ymd_and_hms(2025, 3, 1, 10, 45, 0).unwrap());
        e.attendees = attendees(1);
        e.recurrence = vec!["RRULE:FREQ=MONTHLY".into()];

        let processed = process(&e);
        assert_eq!(processed.duration, 45);
        assert!(processed.is_recurring);
        assert_eq!(processed.participants, vec!["p0@example.com"]);
        assert_eq!(processed.category.kind, CategoryKind::Health);
    }

    #[test]
    fn processed_event_serializes_flat() {
        let value = serde_json::to_value(process(&event("Gym"))).unwrap();
        assert_eq!(value["summary"], "Gym");
        assert_eq!(value["category"]["type"], "health");
        assert_eq!(value["locationType"], "other");
    }
}
