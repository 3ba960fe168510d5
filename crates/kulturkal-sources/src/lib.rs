//! Source adapters: parsers that turn raw payloads from municipal iCal
//! feeds, RSS feeds, venue HTML pages and ticketing APIs into event
//! candidates. Fetching, snapshotting and circuit breaking live in the
//! crawl pipeline; adapters only know their URLs and how to parse.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use icalendar::{Calendar, CalendarComponent, CalendarDateTime, Component, DatePerhapsTime, EventLike};
use kulturkal_core::{EventCandidate, SourceKind};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "kulturkal-sources";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Parse(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub fetched_at: DateTime<Utc>,
    pub timezone: Tz,
}

/// One entry of the source registry (`sources.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub urls: Vec<String>,
    /// Environment variable holding the API key for `api` sources.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Free-text query parameters appended to API requests (city, radius).
    #[serde(default)]
    pub api_params: Vec<(String, String)>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A source adapter parses raw payloads into candidates. The contract is
/// best-effort: an unparseable record is skipped with a warning, never an
/// error that kills the batch.
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;
    /// Snapshot file extension for payloads of this source.
    fn payload_extension(&self) -> &'static str;
    /// The URLs the pipeline should fetch this cycle.
    fn request_urls(&self) -> Vec<String>;
    fn parse_payload(
        &self,
        payload: &[u8],
        url: &str,
        ctx: &AdapterContext,
    ) -> Result<Vec<EventCandidate>, AdapterError>;
}

/// Build the adapter for a registry entry. `None` when the spec names a
/// kind we cannot serve (e.g. `manual` entries are ingested elsewhere).
pub fn adapter_for_spec(spec: &SourceSpec) -> Option<Box<dyn SourceAdapter>> {
    match spec.kind {
        SourceKind::Ical => Some(Box::new(IcalAdapter {
            source_id: spec.source_id.clone(),
            urls: spec.urls.clone(),
        })),
        SourceKind::Rss => Some(Box::new(RssAdapter {
            source_id: spec.source_id.clone(),
            urls: spec.urls.clone(),
        })),
        SourceKind::Html => Some(Box::new(HtmlAdapter {
            source_id: spec.source_id.clone(),
            urls: spec.urls.clone(),
        })),
        SourceKind::Api => {
            let api_key = spec
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())?;
            Some(Box::new(TicketingApiAdapter {
                source_id: spec.source_id.clone(),
                base_urls: spec.urls.clone(),
                api_key,
                extra_params: spec.api_params.clone(),
            }))
        }
        SourceKind::Manual => None,
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Split an iCal LOCATION / JSON-LD location string into venue and address.
pub fn split_location(location: &str) -> (Option<String>, Option<String>) {
    match location.split_once(',') {
        Some((venue, address)) => (
            text_or_none(venue.to_string()),
            text_or_none(address.to_string()),
        ),
        None => (text_or_none(location.to_string()), None),
    }
}

fn empty_candidate(
    source_id: &str,
    kind: SourceKind,
    source_url: &str,
    title: String,
    ctx: &AdapterContext,
) -> EventCandidate {
    EventCandidate {
        source_id: source_id.to_string(),
        source_kind: kind,
        source_url: Some(source_url.to_string()),
        title,
        description: None,
        start: None,
        end: None,
        venue: None,
        address: None,
        city: None,
        lat: None,
        lon: None,
        category: None,
        price: None,
        event_url: None,
        ticket_url: None,
        image_url: None,
        fetched_at: ctx.fetched_at,
    }
}

// ---------------------------------------------------------------------------
// Date parsing
// ---------------------------------------------------------------------------

const NORWEGIAN_MONTHS: [&str; 12] = [
    "januar", "februar", "mars", "april", "mai", "juni", "juli", "august", "september", "oktober",
    "november", "desember",
];

fn month_number(token: &str) -> Option<u32> {
    let token = token.trim_matches(|c: char| !c.is_alphabetic()).to_lowercase();
    NORWEGIAN_MONTHS
        .iter()
        .position(|m| *m == token || (token.len() >= 3 && m.starts_with(&token)))
        .map(|i| i as u32 + 1)
}

fn numeric(token: &str) -> Option<u32> {
    let digits: String = token.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits.len() != token.trim_matches('.').len() {
        return None;
    }
    digits.parse().ok()
}

fn parse_date_token(token: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = token.trim_matches(|c: char| c == '.' || c == ',').split(['.', '/']).collect();
    if parts.len() != 3 {
        return None;
    }
    let day: u32 = parts[0].parse().ok()?;
    let month: u32 = parts[1].parse().ok()?;
    let year: i32 = parts[2].parse().ok()?;
    if !(1..=31).contains(&day) || !(1..=12).contains(&month) || !(1900..=2100).contains(&year) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_time_token(token: &str) -> Option<NaiveTime> {
    let token = token.trim_matches(|c: char| !c.is_ascii_digit() && c != ':' && c != '.');
    for sep in [':', '.'] {
        if let Some((h, m)) = token.split_once(sep) {
            let hour: u32 = h.parse().ok()?;
            let minute: u32 = m.parse().ok()?;
            if hour < 24 && minute < 60 {
                return NaiveTime::from_hms_opt(hour, minute, 0);
            }
        }
    }
    None
}

/// Parse Norwegian date expressions out of free text: `25.12.2025 kl. 19:30`,
/// `1. mars 2025 19.00`, `25/12/2025`. A date without a time is local midnight.
pub fn parse_norwegian_datetime(text: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut date: Option<NaiveDate> = None;
    let mut time: Option<NaiveTime> = None;

    for (i, token) in tokens.iter().enumerate() {
        if date.is_none() {
            if let Some(d) = parse_date_token(token) {
                date = Some(d);
                continue;
            }
            // `1. mars 2025` — day token, month name, year token.
            if let Some(month) = month_number(token) {
                let day = i.checked_sub(1).and_then(|p| numeric(tokens[p]));
                let year = tokens.get(i + 1).and_then(|t| numeric(t));
                if let (Some(day), Some(year)) = (day, year) {
                    if (1..=31).contains(&day) && (1900..=2100).contains(&(year as i32)) {
                        date = NaiveDate::from_ymd_opt(year as i32, month, day);
                        continue;
                    }
                }
            }
        } else if time.is_none() {
            if let Some(t) = parse_time_token(token) {
                time = Some(t);
            }
        }
    }

    let date = date?;
    let naive = NaiveDateTime::new(date, time.unwrap_or(NaiveTime::MIN));
    local_to_utc(naive, tz)
}

/// ISO-ish timestamps as found in JSON-LD and ticketing APIs.
pub fn parse_iso_datetime(s: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return local_to_utc(naive, tz);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return local_to_utc(NaiveDateTime::new(date, NaiveTime::MIN), tz);
    }
    None
}

fn local_to_utc(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn date_perhaps_time_to_utc(value: DatePerhapsTime, tz: Tz, end_of_day: bool) -> Option<DateTime<Utc>> {
    match value {
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(dt)) => Some(dt),
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(naive)) => local_to_utc(naive, tz),
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, tzid }) => {
            let tz: Tz = tzid.parse().ok()?;
            local_to_utc(date_time, tz)
        }
        DatePerhapsTime::Date(date) => {
            let time = if end_of_day {
                NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
            } else {
                NaiveTime::MIN
            };
            local_to_utc(NaiveDateTime::new(date, time), tz)
        }
    }
}

// ---------------------------------------------------------------------------
// iCal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IcalAdapter {
    pub source_id: String,
    pub urls: Vec<String>,
}

impl SourceAdapter for IcalAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Ical
    }

    fn payload_extension(&self) -> &'static str {
        "ics"
    }

    fn request_urls(&self) -> Vec<String> {
        self.urls.clone()
    }

    fn parse_payload(
        &self,
        payload: &[u8],
        url: &str,
        ctx: &AdapterContext,
    ) -> Result<Vec<EventCandidate>, AdapterError> {
        let text = String::from_utf8_lossy(payload);
        let calendar: Calendar = text
            .parse()
            .map_err(|e| AdapterError::Parse(format!("invalid ical from {url}: {e}")))?;

        let mut out = Vec::new();
        for component in &calendar.components {
            let CalendarComponent::Event(ical_event) = component else {
                continue;
            };
            let Some(title) = ical_event.get_summary().and_then(|s| text_or_none(s.to_string()))
            else {
                warn!(source_id = %self.source_id, url, "ical event without summary skipped");
                continue;
            };

            let mut candidate = empty_candidate(&self.source_id, SourceKind::Ical, url, title, ctx);
            candidate.start = ical_event
                .get_start()
                .and_then(|v| date_perhaps_time_to_utc(v, ctx.timezone, false));
            candidate.end = ical_event
                .get_end()
                .and_then(|v| date_perhaps_time_to_utc(v, ctx.timezone, true));
            candidate.description = ical_event
                .get_description()
                .and_then(|s| text_or_none(s.to_string()));
            if let Some(location) = ical_event.get_location() {
                let (venue, address) = split_location(location);
                candidate.venue = venue;
                candidate.address = address;
            }
            candidate.event_url = ical_event
                .property_value("URL")
                .and_then(|s| text_or_none(s.to_string()));
            candidate.category = ical_event
                .property_value("CATEGORIES")
                .and_then(|s| text_or_none(s.split(',').next().unwrap_or("").to_string()));
            out.push(candidate);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// RSS / Atom
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RssAdapter {
    pub source_id: String,
    pub urls: Vec<String>,
}

impl SourceAdapter for RssAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Rss
    }

    fn payload_extension(&self) -> &'static str {
        "xml"
    }

    fn request_urls(&self) -> Vec<String> {
        self.urls.clone()
    }

    fn parse_payload(
        &self,
        payload: &[u8],
        url: &str,
        ctx: &AdapterContext,
    ) -> Result<Vec<EventCandidate>, AdapterError> {
        let feed = feed_rs::parser::parse(payload)
            .map_err(|e| AdapterError::Parse(format!("invalid feed from {url}: {e}")))?;

        let mut out = Vec::new();
        for entry in feed.entries {
            let Some(title) = entry
                .title
                .as_ref()
                .and_then(|t| text_or_none(t.content.clone()))
            else {
                continue;
            };
            let summary = entry.summary.as_ref().map(|t| t.content.clone());

            let mut candidate = empty_candidate(&self.source_id, SourceKind::Rss, url, title, ctx);
            // Feed items announce events in prose; the date usually sits in
            // the title or lede, with the publish date as a weak fallback.
            candidate.start = parse_norwegian_datetime(&candidate.title, ctx.timezone)
                .or_else(|| {
                    summary
                        .as_deref()
                        .and_then(|s| parse_norwegian_datetime(s, ctx.timezone))
                })
                .or(entry.published);
            candidate.description = summary.and_then(text_or_none);
            candidate.event_url = entry.links.first().map(|l| l.href.clone());
            out.push(candidate);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// HTML (schema.org JSON-LD with CSS-selector fallback)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HtmlAdapter {
    pub source_id: String,
    pub urls: Vec<String>,
}

impl SourceAdapter for HtmlAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Html
    }

    fn payload_extension(&self) -> &'static str {
        "html"
    }

    fn request_urls(&self) -> Vec<String> {
        self.urls.clone()
    }

    fn parse_payload(
        &self,
        payload: &[u8],
        url: &str,
        ctx: &AdapterContext,
    ) -> Result<Vec<EventCandidate>, AdapterError> {
        let text = String::from_utf8_lossy(payload);
        let document = Html::parse_document(&text);

        let structured = self.parse_json_ld(&document, url, ctx)?;
        if !structured.is_empty() {
            return Ok(structured);
        }
        self.parse_fallback_selectors(&document, url, ctx)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(e.to_string()))
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    // Ticketing APIs ship coordinates as strings.
    cur.as_f64().or_else(|| cur.as_str().and_then(|s| s.parse().ok()))
}

fn is_schema_event(value: &JsonValue) -> bool {
    match value.get("@type") {
        Some(JsonValue::String(t)) => t == "Event" || t.ends_with(":Event"),
        Some(JsonValue::Array(types)) => types
            .iter()
            .filter_map(|t| t.as_str())
            .any(|t| t == "Event" || t.ends_with(":Event")),
        _ => false,
    }
}

fn collect_schema_events<'a>(value: &'a JsonValue, out: &mut Vec<&'a JsonValue>) {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                collect_schema_events(item, out);
            }
        }
        JsonValue::Object(_) => {
            if is_schema_event(value) {
                out.push(value);
            }
            if let Some(graph) = value.get("@graph") {
                collect_schema_events(graph, out);
            }
        }
        _ => {}
    }
}

impl HtmlAdapter {
    fn parse_json_ld(
        &self,
        document: &Html,
        url: &str,
        ctx: &AdapterContext,
    ) -> Result<Vec<EventCandidate>, AdapterError> {
        let script_sel = selector("script[type=\"application/ld+json\"]")?;
        let mut out = Vec::new();

        for script in document.select(&script_sel) {
            let raw = script.text().collect::<String>();
            let Ok(value) = serde_json::from_str::<JsonValue>(&raw) else {
                warn!(source_id = %self.source_id, url, "unparseable JSON-LD block skipped");
                continue;
            };
            let mut events = Vec::new();
            collect_schema_events(&value, &mut events);

            for event in events {
                let Some(title) = json_str(event, &["name"]).and_then(|s| text_or_none(s.to_string()))
                else {
                    continue;
                };
                let mut candidate =
                    empty_candidate(&self.source_id, SourceKind::Html, url, title, ctx);
                candidate.start = json_str(event, &["startDate"])
                    .and_then(|s| parse_iso_datetime(s, ctx.timezone));
                candidate.end = json_str(event, &["endDate"])
                    .and_then(|s| parse_iso_datetime(s, ctx.timezone));
                candidate.description =
                    json_str(event, &["description"]).and_then(|s| text_or_none(s.to_string()));
                candidate.event_url =
                    json_str(event, &["url"]).and_then(|s| text_or_none(s.to_string()));

                match event.get("location") {
                    Some(JsonValue::String(loc)) => {
                        let (venue, address) = split_location(loc);
                        candidate.venue = venue;
                        candidate.address = address;
                    }
                    Some(location) => {
                        candidate.venue = json_str(location, &["name"])
                            .and_then(|s| text_or_none(s.to_string()));
                        candidate.address = json_str(location, &["address", "streetAddress"])
                            .or_else(|| json_str(location, &["address"]))
                            .and_then(|s| text_or_none(s.to_string()));
                        candidate.city = json_str(location, &["address", "addressLocality"])
                            .and_then(|s| text_or_none(s.to_string()));
                        candidate.lat = json_f64(location, &["geo", "latitude"]);
                        candidate.lon = json_f64(location, &["geo", "longitude"]);
                    }
                    None => {}
                }

                let offers = match event.get("offers") {
                    Some(JsonValue::Array(items)) => items.first(),
                    Some(offer) => Some(offer),
                    None => None,
                };
                if let Some(offer) = offers {
                    candidate.price = json_str(offer, &["price"])
                        .map(ToString::to_string)
                        .or_else(|| json_f64(offer, &["price"]).map(|p| format!("{p}")));
                    candidate.ticket_url =
                        json_str(offer, &["url"]).and_then(|s| text_or_none(s.to_string()));
                }

                candidate.image_url = match event.get("image") {
                    Some(JsonValue::String(s)) => text_or_none(s.clone()),
                    Some(JsonValue::Array(items)) => items
                        .first()
                        .and_then(|i| i.as_str().or_else(|| json_str(i, &["url"])))
                        .map(ToString::to_string),
                    Some(image) => json_str(image, &["url"]).map(ToString::to_string),
                    None => None,
                };
                out.push(candidate);
            }
        }
        Ok(out)
    }

    /// Selector fallback for venue pages without structured data.
    fn parse_fallback_selectors(
        &self,
        document: &Html,
        url: &str,
        ctx: &AdapterContext,
    ) -> Result<Vec<EventCandidate>, AdapterError> {
        let card_sel = selector(".event-card, .event-item, article.event")?;
        let title_sel = selector(".event-title, h2, h3")?;
        let date_sel = selector(".event-date, .date, time")?;
        let venue_sel = selector(".event-venue, .venue, .location")?;
        let link_sel = selector("a[href]")?;

        let mut out = Vec::new();
        for card in document.select(&card_sel) {
            let Some(title) = card
                .select(&title_sel)
                .next()
                .and_then(|n| text_or_none(n.text().collect::<String>()))
            else {
                continue;
            };
            let mut candidate = empty_candidate(&self.source_id, SourceKind::Html, url, title, ctx);

            let date_text = card
                .select(&date_sel)
                .next()
                .map(|n| n.text().collect::<String>());
            candidate.start = date_text
                .as_deref()
                .and_then(|t| parse_norwegian_datetime(t, ctx.timezone));
            candidate.venue = card
                .select(&venue_sel)
                .next()
                .and_then(|n| text_or_none(n.text().collect::<String>()));
            candidate.event_url = card
                .select(&link_sel)
                .next()
                .and_then(|n| n.value().attr("href"))
                .and_then(|s| text_or_none(s.to_string()));
            out.push(candidate);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Ticketing REST API (Discovery-v2-shaped)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TicketingApiAdapter {
    pub source_id: String,
    pub base_urls: Vec<String>,
    pub api_key: String,
    pub extra_params: Vec<(String, String)>,
}

impl SourceAdapter for TicketingApiAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    fn payload_extension(&self) -> &'static str {
        "json"
    }

    fn request_urls(&self) -> Vec<String> {
        self.base_urls
            .iter()
            .map(|base| {
                let mut url = format!(
                    "{base}{}apikey={}&locale=no-no",
                    if base.contains('?') { "&" } else { "?" },
                    self.api_key
                );
                for (key, value) in &self.extra_params {
                    url.push('&');
                    url.push_str(key);
                    url.push('=');
                    url.push_str(value);
                }
                url
            })
            .collect()
    }

    fn parse_payload(
        &self,
        payload: &[u8],
        url: &str,
        ctx: &AdapterContext,
    ) -> Result<Vec<EventCandidate>, AdapterError> {
        let value: JsonValue = serde_json::from_slice(payload)
            .map_err(|e| AdapterError::Parse(format!("invalid ticketing JSON from {url}: {e}")))?;

        let events = value
            .pointer("/_embedded/events")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for event in &events {
            let Some(title) = json_str(event, &["name"]).and_then(|s| text_or_none(s.to_string()))
            else {
                continue;
            };
            let mut candidate = empty_candidate(&self.source_id, SourceKind::Api, url, title, ctx);

            candidate.start = json_str(event, &["dates", "start", "dateTime"])
                .and_then(|s| parse_iso_datetime(s, ctx.timezone))
                .or_else(|| {
                    let date = json_str(event, &["dates", "start", "localDate"])?;
                    let time = json_str(event, &["dates", "start", "localTime"]).unwrap_or("00:00:00");
                    parse_iso_datetime(&format!("{date}T{time}"), ctx.timezone)
                });
            candidate.description = json_str(event, &["info"])
                .or_else(|| json_str(event, &["pleaseNote"]))
                .and_then(|s| text_or_none(s.to_string()));
            candidate.event_url = json_str(event, &["url"]).and_then(|s| text_or_none(s.to_string()));
            candidate.ticket_url = candidate.event_url.clone();
            candidate.image_url = event
                .pointer("/images/0/url")
                .and_then(|v| v.as_str())
                .map(ToString::to_string);
            candidate.category = event
                .pointer("/classifications/0/segment/name")
                .and_then(|v| v.as_str())
                .and_then(|s| text_or_none(s.to_string()));

            if let Some(venue) = event.pointer("/_embedded/venues/0") {
                candidate.venue = json_str(venue, &["name"]).and_then(|s| text_or_none(s.to_string()));
                candidate.address = json_str(venue, &["address", "line1"])
                    .and_then(|s| text_or_none(s.to_string()));
                candidate.city = json_str(venue, &["city", "name"])
                    .and_then(|s| text_or_none(s.to_string()));
                candidate.lat = json_f64(venue, &["location", "latitude"]);
                candidate.lon = json_f64(venue, &["location", "longitude"]);
            }

            if let Some(range) = event.pointer("/priceRanges/0") {
                let min = json_f64(range, &["min"]);
                let max = json_f64(range, &["max"]);
                candidate.price = match (min, max) {
                    (Some(min), Some(max)) if (max - min).abs() > f64::EPSILON => {
                        Some(format!("kr {min:.0}–{max:.0}"))
                    }
                    (Some(min), _) => Some(format!("kr {min:.0}")),
                    _ => None,
                };
            }
            out.push(candidate);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> AdapterContext {
        AdapterContext {
            fetched_at: Utc.with_ymd_and_hms(2025, 2, 1, 8, 0, 0).single().unwrap(),
            timezone: chrono_tz::Europe::Oslo,
        }
    }

    #[test]
    fn norwegian_dates_parse_in_common_shapes() {
        let tz = chrono_tz::Europe::Oslo;
        let dt = parse_norwegian_datetime("Jazzkveld 01.03.2025 kl. 19:30", tz).unwrap();
        // Oslo is UTC+1 in March.
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 3, 1, 18, 30, 0).single().unwrap());

        let dt = parse_norwegian_datetime("Konsert 1. mars 2025 19.00", tz).unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).single().unwrap());

        let dt = parse_norwegian_datetime("Marked 25/12/2025", tz).unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 12, 24, 23, 0, 0).single().unwrap());

        assert!(parse_norwegian_datetime("ingen dato her", tz).is_none());
    }

    #[test]
    fn iso_dates_accept_rfc3339_and_naive_forms() {
        let tz = chrono_tz::Europe::Oslo;
        assert_eq!(
            parse_iso_datetime("2025-03-01T19:00:00+01:00", tz).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).single().unwrap()
        );
        assert_eq!(
            parse_iso_datetime("2025-03-01T19:00", tz).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).single().unwrap()
        );
        assert_eq!(
            parse_iso_datetime("2025-03-01", tz).unwrap(),
            Utc.with_ymd_and_hms(2025, 2, 28, 23, 0, 0).single().unwrap()
        );
    }

    #[test]
    fn ical_payload_parses_timed_and_all_day_events() {
        let ics = concat!(
            "BEGIN:VCALENDAR\r\n",
            "VERSION:2.0\r\n",
            "PRODID:-//Moss kommune//kalender//NO\r\n",
            "BEGIN:VEVENT\r\n",
            "UID:abc-1\r\n",
            "SUMMARY:Jazzkveld\r\n",
            "DESCRIPTION:Kveldskonsert med lokale band\r\n",
            "LOCATION:Verket Scene, Verkslunden 1\r\n",
            "DTSTART:20250301T180000Z\r\n",
            "DTEND:20250301T210000Z\r\n",
            "URL:https://moss.kommune.no/jazzkveld\r\n",
            "CATEGORIES:Musikk\r\n",
            "END:VEVENT\r\n",
            "BEGIN:VEVENT\r\n",
            "UID:abc-2\r\n",
            "SUMMARY:Kunstmarked\r\n",
            "DTSTART;VALUE=DATE:20250302\r\n",
            "END:VEVENT\r\n",
            "END:VCALENDAR\r\n",
        );
        let adapter = IcalAdapter {
            source_id: "moss-kommune".into(),
            urls: vec![],
        };
        let events = adapter
            .parse_payload(ics.as_bytes(), "https://moss.kommune.no/kalender.ics", &ctx())
            .unwrap();
        assert_eq!(events.len(), 2);

        let jazz = &events[0];
        assert_eq!(jazz.title, "Jazzkveld");
        assert_eq!(jazz.venue.as_deref(), Some("Verket Scene"));
        assert_eq!(jazz.address.as_deref(), Some("Verkslunden 1"));
        assert_eq!(jazz.category.as_deref(), Some("Musikk"));
        assert_eq!(
            jazz.start,
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).single().unwrap())
        );
        assert!(jazz.end.is_some());

        let market = &events[1];
        // Date-only start becomes local midnight.
        assert_eq!(
            market.start,
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 23, 0, 0).single().unwrap())
        );
    }

    #[test]
    fn rss_payload_extracts_dates_from_titles() {
        let xml = concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
            "<rss version=\"2.0\"><channel>",
            "<title>Kulturnytt</title>",
            "<item>",
            "<title>Rockekveld 01.03.2025 kl. 21:00</title>",
            "<link>https://avis.example.no/rockekveld</link>",
            "<description>Konsert med tre band.</description>",
            "</item>",
            "</channel></rss>",
        );
        let adapter = RssAdapter {
            source_id: "avis-kultur".into(),
            urls: vec![],
        };
        let events = adapter
            .parse_payload(xml.as_bytes(), "https://avis.example.no/rss", &ctx())
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].start,
            Some(Utc.with_ymd_and_hms(2025, 3, 1, 20, 0, 0).single().unwrap())
        );
        assert_eq!(
            events[0].event_url.as_deref(),
            Some("https://avis.example.no/rockekveld")
        );
    }

    #[test]
    fn html_payload_prefers_json_ld() {
        let html = r#"<html><head>
            <script type="application/ld+json">
            {"@context":"https://schema.org","@graph":[{
              "@type":"Event",
              "name":"Jazzkveld",
              "startDate":"2025-03-01T19:00:00+01:00",
              "location":{"@type":"Place","name":"Verket Scene",
                "address":{"streetAddress":"Verkslunden 1","addressLocality":"Moss"},
                "geo":{"latitude":59.4389,"longitude":10.6572}},
              "offers":{"price":"250","url":"https://tix.example.no/jazzkveld"}
            }]}
            </script></head>
            <body><div class="event-card"><h3>Skal ikke brukes</h3></div></body></html>"#;
        let adapter = HtmlAdapter {
            source_id: "verket-scene".into(),
            urls: vec![],
        };
        let events = adapter
            .parse_payload(html.as_bytes(), "https://verketscene.no/program", &ctx())
            .unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.title, "Jazzkveld");
        assert_eq!(event.venue.as_deref(), Some("Verket Scene"));
        assert_eq!(event.city.as_deref(), Some("Moss"));
        assert_eq!(event.price.as_deref(), Some("250"));
        assert_eq!(event.ticket_url.as_deref(), Some("https://tix.example.no/jazzkveld"));
        assert_eq!(event.lat, Some(59.4389));
    }

    #[test]
    fn html_payload_falls_back_to_selectors() {
        let html = r#"<html><body>
            <div class="event-card">
              <h3>Rockekveld</h3>
              <span class="event-date">01.03.2025 kl. 21:00</span>
              <span class="event-venue">Verket Scene</span>
              <a href="https://verketscene.no/rockekveld">Les mer</a>
            </div>
            <div class="event-card"><span class="event-date">uten tittel</span></div>
            </body></html>"#;
        let adapter = HtmlAdapter {
            source_id: "verket-scene".into(),
            urls: vec![],
        };
        let events = adapter
            .parse_payload(html.as_bytes(), "https://verketscene.no/program", &ctx())
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Rockekveld");
        assert_eq!(events[0].venue.as_deref(), Some("Verket Scene"));
        assert!(events[0].start.is_some());
    }

    #[test]
    fn ticketing_payload_maps_venue_and_prices() {
        let json = r#"{
          "_embedded": {"events": [{
            "name": "Jazzkveld",
            "url": "https://ticketing.example.com/jazzkveld",
            "dates": {"start": {"dateTime": "2025-03-01T18:00:00Z"}},
            "classifications": [{"segment": {"name": "Music"}}],
            "priceRanges": [{"min": 250.0, "max": 450.0, "currency": "NOK"}],
            "images": [{"url": "https://img.example.com/jazz.jpg"}],
            "_embedded": {"venues": [{
              "name": "Verket Scene",
              "address": {"line1": "Verkslunden 1"},
              "city": {"name": "Moss"},
              "location": {"latitude": "59.4389", "longitude": "10.6572"}
            }]}
          }]}
        }"#;
        let adapter = TicketingApiAdapter {
            source_id: "ticketing".into(),
            base_urls: vec!["https://ticketing.example.com/discovery/v2/events.json".into()],
            api_key: "k".into(),
            extra_params: vec![("city".into(), "Moss".into())],
        };
        let events = adapter
            .parse_payload(json.as_bytes(), "https://ticketing.example.com", &ctx())
            .unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.venue.as_deref(), Some("Verket Scene"));
        assert_eq!(event.price.as_deref(), Some("kr 250–450"));
        assert_eq!(event.lat, Some(59.4389));
        assert_eq!(event.category.as_deref(), Some("Music"));

        let urls = adapter.request_urls();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].contains("apikey=k"));
        assert!(urls[0].contains("locale=no-no"));
        assert!(urls[0].contains("city=Moss"));
    }

    #[test]
    fn adapter_registry_respects_kind_and_missing_keys() {
        let spec = SourceSpec {
            source_id: "moss-kommune".into(),
            display_name: "Moss kommune".into(),
            enabled: true,
            kind: SourceKind::Ical,
            urls: vec!["https://moss.kommune.no/kalender.ics".into()],
            api_key_env: None,
            api_params: vec![],
            notes: None,
        };
        assert!(adapter_for_spec(&spec).is_some());

        let api_spec = SourceSpec {
            kind: SourceKind::Api,
            api_key_env: Some("KULTURKAL_TEST_KEY_THAT_IS_NOT_SET".into()),
            ..spec
        };
        assert!(adapter_for_spec(&api_spec).is_none());
    }
}
