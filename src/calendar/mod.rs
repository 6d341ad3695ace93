//! Calendar data: the event model, a REST client, and the heuristics that
//! turn a user's events into prompt context.
//!
//! Everything here reasons in UTC.

pub mod autoplan;
pub mod category;
pub mod client;
pub mod event;
pub mod insights;
pub mod persona;
pub mod schedule;

pub use autoplan::{Autoplanner, Suggestion, UndoSummary, WriteSummary, is_autoplan_event};
pub use category::{CategoryKind, EventCategory, LocationType, ProcessedEvent, categorize, process};
pub use client::{CalendarClient, RecentEvents};
pub use event::{Attendee, CalendarEvent, CalendarListEntry, EventTime, Person, sort_by_start};
pub use insights::{Completion, InsightGenerator};
pub use persona::{Persona, PersonaGenerator};
pub use schedule::{DayProfile, FreeSlot, conflicts, digest_window, estimate_tokens, existing_schedule, free_slots};
