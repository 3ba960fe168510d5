//! Web surface and renderer for Kulturkal: the Askama-rendered calendar and
//! archive pages, the ics/rss/json feeds, and a static export of the same
//! set for plain-webserver hosting.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use icalendar::{Calendar, Component, EventLike};
use kulturkal_core::CanonicalEvent;
use kulturkal_store::EventStore;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "kulturkal-web";

const APP_CSS: &str = include_str!("../assets/app.css");

const WEEKDAYS: [&str; 7] = [
    "Mandag", "Tirsdag", "Onsdag", "Torsdag", "Fredag", "Lørdag", "Søndag",
];
const MONTHS: [&str; 12] = [
    "januar", "februar", "mars", "april", "mai", "juni", "juli", "august", "september", "oktober",
    "november", "desember",
];

#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub title: String,
    pub base_url: String,
    pub timezone: Tz,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            title: "Kulturkalenderen".to_string(),
            base_url: "https://kulturkal.no".to_string(),
            timezone: chrono_tz::Europe::Oslo,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: EventStore,
    pub site: SiteConfig,
}

impl AppState {
    pub fn new(store: EventStore, site: SiteConfig) -> Self {
        Self { store, site }
    }
}

#[derive(Debug, Clone)]
struct EventRow {
    time_label: String,
    title: String,
    event_url: String,
    venue_label: String,
    price: String,
    category: String,
    teaser: String,
    ticket_url: String,
}

#[derive(Debug, Clone)]
struct DayGroup {
    label: String,
    events: Vec<EventRow>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    site_title: String,
    total: usize,
    generated_label: String,
    days: Vec<DayGroup>,
}

#[derive(Template)]
#[template(path = "arkiv.html")]
struct ArchiveTemplate {
    site_title: String,
    total: usize,
    events: Vec<EventRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/arkiv", get(archive_handler))
        .route("/events.json", get(events_json_handler))
        .route("/feed.ics", get(ics_handler))
        .route("/rss.xml", get(rss_handler))
        .route("/helse", get(health_handler))
        .route("/assets/app.css", get(css_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(store: EventStore, site: SiteConfig, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "web server listening");
    axum::serve(listener, app(AppState::new(store, site))).await?;
    Ok(())
}

fn day_label(date: NaiveDate) -> String {
    let weekday = WEEKDAYS[date.weekday().num_days_from_monday() as usize];
    let month = MONTHS[date.month0() as usize];
    format!("{} {}. {} {}", weekday, date.day(), month, date.year())
}

fn teaser_of(description: Option<&str>) -> String {
    let Some(description) = description else {
        return String::new();
    };
    let mut teaser: String = description.chars().take(140).collect();
    if description.chars().count() > 140 {
        teaser.push('…');
    }
    teaser
}

fn event_row(event: &CanonicalEvent, tz: Tz) -> EventRow {
    let local = event.start.with_timezone(&tz);
    EventRow {
        time_label: local.format("%H:%M").to_string(),
        title: event.title.clone(),
        event_url: event.event_url.clone().unwrap_or_default(),
        venue_label: event
            .venue
            .clone()
            .or_else(|| event.city.clone())
            .unwrap_or_default(),
        price: event.price.clone().unwrap_or_default(),
        category: event.category.clone().unwrap_or_default(),
        teaser: teaser_of(event.description.as_deref()),
        ticket_url: event.ticket_url.clone().unwrap_or_default(),
    }
}

/// Group start-ordered events into per-day sections in the site timezone.
fn day_groups(events: &[CanonicalEvent], tz: Tz) -> Vec<DayGroup> {
    let mut days: Vec<DayGroup> = Vec::new();
    let mut current: Option<NaiveDate> = None;

    for event in events {
        let local_date = event.start.with_timezone(&tz).date_naive();
        if current != Some(local_date) {
            current = Some(local_date);
            days.push(DayGroup {
                label: day_label(local_date),
                events: Vec::new(),
            });
        }
        if let Some(day) = days.last_mut() {
            day.events.push(event_row(event, tz));
        }
    }
    days
}

fn generated_label(now: DateTime<Utc>, tz: Tz) -> String {
    now.with_timezone(&tz).format("%d.%m.%Y kl. %H:%M").to_string()
}

pub fn render_calendar_page(
    events: &[CanonicalEvent],
    site: &SiteConfig,
    now: DateTime<Utc>,
) -> anyhow::Result<String> {
    let template = IndexTemplate {
        site_title: site.title.clone(),
        total: events.len(),
        generated_label: generated_label(now, site.timezone),
        days: day_groups(events, site.timezone),
    };
    template.render().context("rendering calendar page")
}

pub fn render_archive_page(
    events: &[CanonicalEvent],
    site: &SiteConfig,
) -> anyhow::Result<String> {
    let template = ArchiveTemplate {
        site_title: site.title.clone(),
        total: events.len(),
        events: events.iter().map(|e| event_row(e, site.timezone)).collect(),
    };
    template.render().context("rendering archive page")
}

/// iCal feed over the upcoming canonical set.
pub fn build_ics(events: &[CanonicalEvent], site: &SiteConfig) -> String {
    let mut calendar = Calendar::new();
    calendar.name(&site.title);

    for event in events {
        let mut ics_event = icalendar::Event::new();
        ics_event.uid(&format!("{}@kulturkal", event.id));
        ics_event.summary(&event.title);
        ics_event.starts(event.start);
        if let Some(end) = event.end {
            ics_event.ends(end);
        }
        let location = match (event.venue.as_deref(), event.address.as_deref()) {
            (Some(venue), Some(address)) => Some(format!("{venue}, {address}")),
            (Some(venue), None) => Some(venue.to_string()),
            (None, Some(address)) => Some(address.to_string()),
            (None, None) => None,
        };
        if let Some(location) = location {
            ics_event.location(&location);
        }
        if let Some(description) = &event.description {
            ics_event.description(description);
        }
        if let Some(url) = &event.event_url {
            ics_event.add_property("URL", url);
        }
        calendar.push(ics_event.done());
    }

    calendar.done().to_string()
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// RSS 2.0 feed over the upcoming canonical set, newest publication first.
pub fn build_rss(events: &[CanonicalEvent], site: &SiteConfig) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<rss version=\"2.0\">\n<channel>\n");
    out.push_str(&format!("<title>{}</title>\n", xml_escape(&site.title)));
    out.push_str(&format!("<link>{}</link>\n", xml_escape(&site.base_url)));
    out.push_str("<description>Kommende kulturarrangementer fra lokale kilder</description>\n");

    for event in events.iter().take(50) {
        let local = event.start.with_timezone(&site.timezone);
        let when = local.format("%d.%m.%Y kl. %H:%M").to_string();
        let link = event
            .event_url
            .clone()
            .unwrap_or_else(|| site.base_url.clone());
        let mut description = event.venue.clone().unwrap_or_default();
        if let Some(price) = &event.price {
            if !description.is_empty() {
                description.push_str(" · ");
            }
            description.push_str(price);
        }
        let teaser = teaser_of(event.description.as_deref());
        if !teaser.is_empty() {
            if !description.is_empty() {
                description.push_str(" · ");
            }
            description.push_str(&teaser);
        }

        out.push_str("<item>\n");
        out.push_str(&format!(
            "<title>{} – {}</title>\n",
            xml_escape(&event.title),
            xml_escape(&when)
        ));
        out.push_str(&format!("<link>{}</link>\n", xml_escape(&link)));
        out.push_str(&format!(
            "<guid isPermaLink=\"false\">{}</guid>\n",
            xml_escape(&event.id)
        ));
        if !description.is_empty() {
            out.push_str(&format!("<description>{}</description>\n", xml_escape(&description)));
        }
        out.push_str(&format!("<pubDate>{}</pubDate>\n", event.first_seen.to_rfc2822()));
        out.push_str("</item>\n");
    }

    out.push_str("</channel>\n</rss>\n");
    out
}

/// Write the calendar, archive, feeds and stylesheet as static files so the
/// output can be hosted by any dumb webserver.
pub async fn export_static(
    store: &EventStore,
    site: &SiteConfig,
    output_dir: &Path,
) -> anyhow::Result<Vec<PathBuf>> {
    let upcoming = store.load_upcoming(500).await?;
    let archived = store.load_archived(200).await?;

    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("creating {}", output_dir.display()))?;
    let assets_dir = output_dir.join("assets");
    tokio::fs::create_dir_all(&assets_dir)
        .await
        .with_context(|| format!("creating {}", assets_dir.display()))?;

    let files = vec![
        (output_dir.join("index.html"), render_calendar_page(&upcoming, site, Utc::now())?),
        (output_dir.join("arkiv.html"), render_archive_page(&archived, site)?),
        (output_dir.join("events.ics"), build_ics(&upcoming, site)),
        (output_dir.join("rss.xml"), build_rss(&upcoming, site)),
        (output_dir.join("events.json"), serde_json::to_string_pretty(&upcoming)?),
        (assets_dir.join("app.css"), APP_CSS.to_string()),
    ];

    let mut written = Vec::with_capacity(files.len());
    for (path, contents) in files {
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        written.push(path);
    }
    info!(output_dir = %output_dir.display(), files = written.len(), "static export written");
    Ok(written)
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.load_upcoming(500).await {
        Ok(events) => match render_calendar_page(&events, &state.site, Utc::now()) {
            Ok(html) => Html(html).into_response(),
            Err(err) => server_error(err),
        },
        Err(err) => server_error(err.into()),
    }
}

async fn archive_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.load_archived(200).await {
        Ok(events) => match render_archive_page(&events, &state.site) {
            Ok(html) => Html(html).into_response(),
            Err(err) => server_error(err),
        },
        Err(err) => server_error(err.into()),
    }
}

async fn events_json_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.load_upcoming(500).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn ics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.load_upcoming(500).await {
        Ok(events) => (
            [(header::CONTENT_TYPE, "text/calendar; charset=utf-8")],
            build_ics(&events, &state.site),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn rss_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.load_upcoming(500).await {
        Ok(events) => (
            [(header::CONTENT_TYPE, "application/rss+xml; charset=utf-8")],
            build_rss(&events, &state.site),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn health_handler() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

async fn css_handler() -> Response {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], APP_CSS).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
