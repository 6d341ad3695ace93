//! loopctl: command-line tool for loopcal
//!
//! Inspect configuration and run the calendar heuristics over exported
//! event files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use loopcal::calendar::insights::INSIGHTS_PROMPT;
use loopcal::calendar::persona::PERSONA_PROMPT;
use loopcal::calendar::{self, CalendarClient, CalendarEvent, DayProfile};
use loopcal::{ApiClass, Config, LoopError, RequestThrottler, request_key};
use serde::Deserialize;

/// loopcal command-line tool
#[derive(Parser)]
#[command(name = "loopctl")]
#[command(version = loopcal::PKG_VERSION)]
#[command(about = "Calendar heuristics and throttler configuration")]
struct Args {
    /// Path to config file
    #[arg(short, long, global = true, env = "LOOPCAL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate configuration, then print the effective settings
    Config,

    /// Print free slots in the coming weeks as JSON
    Slots {
        /// Events file (JSON array, or an object with an `items` array)
        #[arg(short, long)]
        events: PathBuf,
        /// Reference time (RFC 3339, default: now)
        #[arg(long)]
        now: Option<DateTime<Utc>>,
        /// Persona JSON to read typical day and quiet hours from
        #[arg(long)]
        persona: Option<PathBuf>,
    },

    /// Print the existing-events schedule text
    Schedule {
        #[arg(short, long)]
        events: PathBuf,
        /// Days ahead to include
        #[arg(short, long, default_value_t = 14)]
        days: i64,
        #[arg(long)]
        now: Option<DateTime<Utc>>,
    },

    /// Print events with category, duration and location type as JSON
    Categorize {
        #[arg(short, long)]
        events: PathBuf,
    },

    /// Fetch recent events from the calendar API and print them as JSON
    Fetch {
        /// OAuth access token
        #[arg(long, env = "LOOPCAL_CALENDAR_TOKEN", hide_env_values = true)]
        token: String,
        /// Months to look back (default: from config)
        #[arg(short, long)]
        months: Option<u32>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EventsFile {
    Bare(Vec<CalendarEvent>),
    Listing { items: Vec<CalendarEvent> },
}

fn read_events(path: &Path) -> Result<Vec<CalendarEvent>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read events file {}: {e}", path.display()))?;
    let file: EventsFile = serde_json::from_str(&content).map_err(LoopError::from)?;
    let (EventsFile::Bare(events) | EventsFile::Listing { items: events }) = file;
    Ok(events)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!(version = %loopcal::version_string(), "loopctl starting");

    match args.command {
        Command::Config => {
            let config = Config::load(args.config.as_deref())?;
            let throttle = config.throttle_config()?;

            let mut budgets: Vec<_> = throttle.budgets.iter().collect();
            budgets.sort_by_key(|(class, _)| *class);
            println!("budgets:");
            for (class, budget) in budgets {
                println!(
                    "  {:<10} {} per {}s",
                    class.as_str(),
                    budget.requests,
                    budget.window.as_secs()
                );
            }
            println!("default ttl: {}s", throttle.default_ttl.as_secs());
            match throttle.operation_timeout {
                Some(timeout) => println!("operation timeout: {}s", timeout.as_secs()),
                None => println!("operation timeout: none"),
            }
            println!("calendar api: {}", config.calendar.base_url);
            println!(
                "calendar fetch: {} months, {} token budget",
                config.calendar.months_back, config.calendar.token_budget
            );
            println!("prompts: {}", config.prompts.dir.display());
            let prompts = config.prompt_store();
            for name in [PERSONA_PROMPT, INSIGHTS_PROMPT] {
                match prompts.get(name) {
                    Ok(text) => println!("  {name:<10} {} bytes", text.len()),
                    Err(e) => println!("  {name:<10} unavailable ({e})"),
                }
            }
        }

        Command::Slots {
            events,
            now,
            persona,
        } => {
            let events = read_events(&events)?;
            let profile = match persona {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)?;
                    let value: serde_json::Value =
                        serde_json::from_str(&content).map_err(LoopError::from)?;
                    DayProfile::from_persona(&value)?
                }
                None => DayProfile::default(),
            };
            let slots = calendar::free_slots(&events, &profile, now.unwrap_or_else(Utc::now));
            println!("{}", serde_json::to_string_pretty(&slots)?);
        }

        Command::Schedule { events, days, now } => {
            let events = read_events(&events)?;
            println!(
                "{}",
                calendar::existing_schedule(&events, now.unwrap_or_else(Utc::now), days)
            );
        }

        Command::Categorize { events } => {
            let processed: Vec<_> = read_events(&events)?.iter().map(calendar::process).collect();
            println!("{}", serde_json::to_string_pretty(&processed)?);
        }

        Command::Fetch { token, months } => {
            let config = Config::load(args.config.as_deref())?;
            let throttler = RequestThrottler::new(config.throttle_config()?)?;
            let client = CalendarClient::with_base_url(&config.calendar.base_url)?;
            let months = months.unwrap_or(config.calendar.months_back);
            let budget = config.calendar.token_budget;

            let key = request_key("calendar", "loopctl", &(months, budget))?;
            let recent = throttler
                .throttle(&key, &ApiClass::CALENDAR, Duration::ZERO, move || async move {
                    client.fetch_recent(&token, months, budget).await
                })
                .await?;

            eprintln!(
                "{} events over {} months",
                recent.events.len(),
                recent.months_used
            );
            println!("{}", serde_json::to_string_pretty(&recent.events)?);
        }
    }

    Ok(())
}
