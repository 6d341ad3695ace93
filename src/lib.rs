//! loopcal - calendar intelligence plumbing with a throttled front for paid APIs
//!
//! The heart of the crate is [`RequestThrottler`]: every outbound call to a
//! text-completion model or the calendar provider goes through it, so that
//! identical concurrent requests share one execution, each API class stays
//! inside its rate budget, and recent results are served from a TTL cache.
//!
//! Around it sit the calendar pieces that feed those calls: the event model
//! and REST client, categorisation, free-slot and schedule heuristics, and
//! the insight generator.
//!
//! # Throttling Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use loopcal::{ApiClass, RequestThrottler, ThrottleConfig, request_key};
//!
//! # #[derive(Debug, thiserror::Error)]
//! # #[error("model unavailable")]
//! # struct ModelError;
//! # async fn call_model(_prompt: String) -> Result<String, ModelError> { Ok(String::new()) }
//! #[tokio::main]
//! async fn main() -> loopcal::Result<()> {
//!     let throttler = RequestThrottler::new(ThrottleConfig::default())?;
//!
//!     let prompt = "Describe this calendar".to_string();
//!     let key = request_key("persona", "user1", &prompt)?;
//!     let persona: String = throttler
//!         .throttle(&key, &ApiClass::LLM, Duration::from_secs(30 * 60), move || {
//!             call_model(prompt)
//!         })
//!         .await?;
//!
//!     println!("{persona}");
//!     Ok(())
//! }
//! ```
//!
//! # Calendar Example
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use loopcal::calendar::{CalendarClient, DayProfile, free_slots};
//!
//! #[tokio::main]
//! async fn main() -> loopcal::Result<()> {
//!     let client = CalendarClient::new()?;
//!     let recent = client.fetch_recent("ya29.token", 3, 25_000).await?;
//!
//!     for slot in free_slots(&recent.events, &DayProfile::default(), Utc::now()) {
//!         println!("{} {}-{}", slot.date, slot.start_time, slot.end_time);
//!     }
//!     Ok(())
//! }
//! ```

pub mod calendar;
pub mod config;
pub mod error;
pub mod prompt;
pub mod telemetry;
pub mod throttle;
pub mod version;

// Re-export main types at crate root
pub use config::Config;
pub use error::{LoopError, OperationFailure, Result};
pub use prompt::PromptStore;
pub use throttle::{ApiClass, CacheStats, RateBudget, RequestThrottler, ThrottleConfig, request_key};
pub use version::{PKG_VERSION, version_string};
