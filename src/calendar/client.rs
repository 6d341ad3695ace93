//! Calendar provider REST client.
//!
//! Thin wrapper over the provider's v3 JSON API. The access token is passed
//! per call and never stored.

use std::time::Duration;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use futures_util::future::join_all;
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::event::{CalendarEvent, CalendarListEntry, sort_by_start};
use super::schedule::estimate_tokens;
use crate::telemetry;
use crate::{LoopError, Result};

/// Default base URL for the calendar API.
pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";

/// Token estimate above which [`CalendarClient::fetch_recent()`] narrows
/// its range.
pub const DEFAULT_TOKEN_BUDGET: usize = 25_000;

/// Default look-back for [`CalendarClient::fetch_recent()`].
pub const DEFAULT_MONTHS_BACK: u32 = 3;

const MAX_FETCH_ATTEMPTS: u32 = 3;
const PAGE_SIZE: &str = "2500";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Events from [`CalendarClient::fetch_recent()`] with the range that
/// produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecentEvents {
    pub events: Vec<CalendarEvent>,
    pub months_used: u32,
}

/// Client for the calendar REST API.
#[derive(Clone)]
pub struct CalendarClient {
    http: Client,
    base_url: String,
}

impl CalendarClient {
    /// Client against [`DEFAULT_BASE_URL`].
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Client with a custom base URL (for testing with wiremock).
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LoopError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    /// Every calendar on the user's calendar list.
    pub async fn list_calendars(&self, token: &str) -> Result<Vec<CalendarListEntry>> {
        let url = self.endpoint(&["users", "me", "calendarList"])?;
        self.get_all(token, url, &[], "calendar_list").await
    }

    /// Create a secondary calendar owned by the user.
    pub async fn create_calendar(
        &self,
        token: &str,
        summary: &str,
        description: &str,
    ) -> Result<CalendarListEntry> {
        let url = self.endpoint(&["calendars"])?;
        let body = serde_json::json!({
            "summary": summary,
            "description": description,
            "timeZone": "UTC",
        });
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let response = check_status(response, "create_calendar").await?;
        Ok(response.json().await?)
    }

    /// Delete a secondary calendar and everything in it.
    pub async fn delete_calendar(&self, token: &str, calendar_id: &str) -> Result<()> {
        let url = self.endpoint(&["calendars", calendar_id])?;
        let response = self.http.delete(url).bearer_auth(token).send().await?;
        check_status(response, "delete_calendar").await?;
        Ok(())
    }

    /// Every event of one calendar, without a time range. Follows
    /// pagination.
    pub async fn all_events(&self, token: &str, calendar_id: &str) -> Result<Vec<CalendarEvent>> {
        let url = self.endpoint(&["calendars", calendar_id, "events"])?;
        let query = [("maxResults", PAGE_SIZE.to_string())];
        self.get_all(token, url, &query, "events").await
    }

    /// Single (expanded) events of one calendar between `time_min` and
    /// `time_max`, ordered by start. Follows pagination.
    pub async fn list_events(
        &self,
        token: &str,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>> {
        let url = self.endpoint(&["calendars", calendar_id, "events"])?;
        let query = [
            ("timeMin", time_min.to_rfc3339()),
            ("timeMax", time_max.to_rfc3339()),
            ("singleEvents", "true".to_string()),
            ("orderBy", "startTime".to_string()),
            ("maxResults", PAGE_SIZE.to_string()),
        ];
        self.get_all(token, url, &query, "events").await
    }

    /// Insert `event` and return the provider's copy (with its id).
    pub async fn create_event(
        &self,
        token: &str,
        calendar_id: &str,
        event: &CalendarEvent,
    ) -> Result<CalendarEvent> {
        let url = self.endpoint(&["calendars", calendar_id, "events"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(event)
            .send()
            .await?;
        let response = check_status(response, "create_event").await?;
        Ok(response.json().await?)
    }

    pub async fn delete_event(&self, token: &str, calendar_id: &str, event_id: &str) -> Result<()> {
        let url = self.endpoint(&["calendars", calendar_id, "events", event_id])?;
        let response = self.http.delete(url).bearer_auth(token).send().await?;
        check_status(response, "delete_event").await?;
        Ok(())
    }

    /// Recent events from every *selected* calendar, tagged with their
    /// calendar and sorted by start.
    ///
    /// The range runs from the first day of the month `months_back` months
    /// ago to the last day of the current month. When the merged events
    /// are estimated above `token_budget` tokens the range is shrunk by 30%
    /// (to no less than one month) and fetched again, up to three
    /// attempts; after that the result is empty. A calendar that fails to
    /// load is skipped.
    ///
    /// # Errors
    ///
    /// Only listing the calendars can fail; event fetches degrade per
    /// calendar.
    pub async fn fetch_recent(
        &self,
        token: &str,
        months_back: u32,
        token_budget: usize,
    ) -> Result<RecentEvents> {
        let calendars: Vec<CalendarListEntry> = self
            .list_calendars(token)
            .await?
            .into_iter()
            .filter(|c| c.selected)
            .collect();
        info!(selected = calendars.len(), "fetching recent calendar events");

        let mut months = months_back.max(1);
        for attempt in 1..=MAX_FETCH_ATTEMPTS {
            let (time_min, time_max) = fetch_range(Utc::now(), months);
            let fetches = calendars
                .iter()
                .map(|calendar| self.fetch_calendar(token, calendar, time_min, time_max));
            let mut events: Vec<CalendarEvent> =
                join_all(fetches).await.into_iter().flatten().collect();
            sort_by_start(&mut events);

            let tokens = estimate_tokens(&events);
            debug!(attempt, months, events = events.len(), tokens, "fetched calendar range");
            if tokens <= token_budget {
                return Ok(RecentEvents {
                    events,
                    months_used: months,
                });
            }
            warn!(tokens, token_budget, months, "calendar context too large, narrowing range");
            months = shrink(months);
        }

        warn!(attempts = MAX_FETCH_ATTEMPTS, "calendar context still too large, giving up");
        Ok(RecentEvents {
            events: Vec::new(),
            months_used: months_back,
        })
    }

    async fn fetch_calendar(
        &self,
        token: &str,
        calendar: &CalendarListEntry,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Vec<CalendarEvent> {
        match self.list_events(token, &calendar.id, time_min, time_max).await {
            Ok(events) => events
                .into_iter()
                .map(|mut event| {
                    event.calendar_id = Some(calendar.id.clone());
                    event.calendar_summary = Some(calendar.summary.clone());
                    event
                })
                .collect(),
            Err(e) => {
                warn!(calendar = %calendar.summary, error = %e, "skipping calendar");
                Vec::new()
            }
        }
    }

    async fn get_all<T>(
        &self,
        token: &str,
        url: Url,
        query: &[(&str, String)],
        endpoint: &'static str,
    ) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.http.get(url.clone()).bearer_auth(token).query(query);
            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page)]);
            }
            let response = check_status(request.send().await?, endpoint).await?;
            let page: ListResponse<T> = response.json().await?;
            items.extend(page.items);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => return Ok(items),
            }
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| LoopError::Configuration(format!("invalid calendar base URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| {
                LoopError::Configuration(format!("calendar base URL cannot have a path: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Map a non-success response to an error.
async fn check_status(response: Response, endpoint: &'static str) -> Result<Response> {
    let status = response.status();
    metrics::counter!(telemetry::CALENDAR_REQUESTS_TOTAL,
        "endpoint" => endpoint,
        "status" => status.as_u16().to_string(),
    )
    .increment(1);

    if status.is_success() {
        return Ok(response);
    }

    match status.as_u16() {
        401 => Err(LoopError::AuthenticationFailed),
        403 => Err(LoopError::AccessDenied),
        code => {
            let body = response.text().await.unwrap_or_default();
            Err(LoopError::Api {
                status: code,
                message: if body.is_empty() {
                    format!("calendar API error: {status}")
                } else {
                    body
                },
            })
        }
    }
}

/// First day of the month `months_back` months before `now`, to the last
/// day of `now`'s month, both at midnight UTC.
pub fn fetch_range(now: DateTime<Utc>, months_back: u32) -> (DateTime<Utc>, DateTime<Utc>) {
    let month_start = NaiveDate::from_ymd_opt(now.year(), now.month(), 1).unwrap_or(now.date_naive());
    let start = month_start
        .checked_sub_months(Months::new(months_back))
        .unwrap_or(month_start);
    let end = month_start
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(month_start);
    (
        start.and_time(chrono::NaiveTime::MIN).and_utc(),
        end.and_time(chrono::NaiveTime::MIN).and_utc(),
    )
}

fn shrink(months: u32) -> u32 {
    (u64::from(months) * 7 / 10).max(1) as u32
}
