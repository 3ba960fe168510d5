//! Core domain model for the Kulturkal event aggregator.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "kulturkal-core";

/// How a source exposes its events. Ordering doubles as merge priority:
/// when two sources disagree on URLs, the lower-numbered kind wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Ical,
    Api,
    Html,
    Rss,
    Manual,
}

impl SourceKind {
    pub fn merge_priority(self) -> u8 {
        match self {
            SourceKind::Ical => 1,
            SourceKind::Api => 2,
            SourceKind::Html => 3,
            SourceKind::Rss => 4,
            SourceKind::Manual => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Ical => "ical",
            SourceKind::Api => "api",
            SourceKind::Html => "html",
            SourceKind::Rss => "rss",
            SourceKind::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ical" => Some(SourceKind::Ical),
            "api" => Some(SourceKind::Api),
            "html" => Some(SourceKind::Html),
            "rss" => Some(SourceKind::Rss),
            "manual" => Some(SourceKind::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Upcoming,
    Archived,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Upcoming => "upcoming",
            EventStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upcoming" => Some(EventStatus::Upcoming),
            "archived" => Some(EventStatus::Archived),
            _ => None,
        }
    }
}

/// One scraped occurrence, exactly as an adapter produced it.
/// Immutable after creation; the pipeline normalizes a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCandidate {
    pub source_id: String,
    pub source_kind: SourceKind,
    pub source_url: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub venue: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub category: Option<String>,
    pub price: Option<String>,
    pub event_url: Option<String>,
    pub ticket_url: Option<String>,
    pub image_url: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// The persisted, deduplicated record representing one real-world occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub venue: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub category: Option<String>,
    pub price: Option<String>,
    pub event_url: Option<String>,
    pub ticket_url: Option<String>,
    pub image_url: Option<String>,
    pub source_id: String,
    pub source_kind: SourceKind,
    pub source_url: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: EventStatus,
}

/// Counters accounting for every candidate that entered a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCounters {
    pub sources_attempted: usize,
    pub sources_succeeded: usize,
    pub sources_failed: usize,
    pub fetched: usize,
    pub new: usize,
    pub merged: usize,
    pub dropped: usize,
    pub archived: usize,
}

/// Lowercased, alphanumeric-only, dash-joined key fragment.
pub fn slug(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Stable canonical key: digest over slugged title, calendar date, and venue.
/// Survives minor start-time corrections within the same day.
pub fn canonical_id(title: &str, start: DateTime<Utc>, venue: Option<&str>) -> String {
    let venue_slug = venue.map(slug).filter(|s| !s.is_empty());
    let key = format!(
        "{}|{}|{}",
        slug(title),
        start.format("%Y-%m-%d"),
        venue_slug.as_deref().unwrap_or("unknown")
    );
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Exact-duplicate fingerprint: slugged title + venue + start rounded to the
/// minute. Two candidates with equal fingerprints are the same occurrence.
pub fn exact_fingerprint(title: &str, venue: Option<&str>, start: DateTime<Utc>) -> String {
    let rounded = start.with_second(0).and_then(|d| d.with_nanosecond(0)).unwrap_or(start);
    let venue_slug = venue.map(slug).filter(|s| !s.is_empty());
    format!(
        "{}|{}|{}",
        slug(title),
        venue_slug.as_deref().unwrap_or("unknown"),
        rounded.format("%Y%m%d%H%M")
    )
}

/// Great-circle distance in meters (haversine).
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

impl CanonicalEvent {
    /// Promote a candidate to a fresh canonical record. Returns `None` when
    /// the candidate is missing a start time, which dedup treats as malformed.
    pub fn from_candidate(candidate: &EventCandidate, now: DateTime<Utc>) -> Option<Self> {
        let start = candidate.start?;
        Some(Self {
            id: canonical_id(&candidate.title, start, candidate.venue.as_deref()),
            title: candidate.title.clone(),
            description: candidate.description.clone(),
            start,
            end: candidate.end,
            venue: candidate.venue.clone(),
            address: candidate.address.clone(),
            city: candidate.city.clone(),
            lat: candidate.lat,
            lon: candidate.lon,
            category: candidate.category.clone(),
            price: candidate.price.clone(),
            event_url: candidate.event_url.clone(),
            ticket_url: candidate.ticket_url.clone(),
            image_url: candidate.image_url.clone(),
            source_id: candidate.source_id.clone(),
            source_kind: candidate.source_kind,
            source_url: candidate.source_url.clone(),
            first_seen: now,
            last_seen: now,
            status: EventStatus::Upcoming,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, m, s).single().unwrap()
    }

    #[test]
    fn slug_strips_punctuation_and_case() {
        assert_eq!(slug("  Jazzkveld: Verket Scene!  "), "jazzkveld-verket-scene");
        assert_eq!(slug("Blåmandag på Bylab"), "blåmandag-på-bylab");
    }

    #[test]
    fn canonical_id_is_stable_within_a_day() {
        let a = canonical_id("Jazzkveld", ts(19, 0, 0), Some("Verket Scene"));
        let b = canonical_id("jazzkveld!", ts(21, 30, 0), Some("verket scene"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn exact_fingerprint_rounds_to_the_minute() {
        let a = exact_fingerprint("Jazzkveld", Some("Verket Scene"), ts(19, 0, 1));
        let b = exact_fingerprint("Jazzkveld", Some("Verket Scene"), ts(19, 0, 59));
        let c = exact_fingerprint("Jazzkveld", Some("Verket Scene"), ts(19, 1, 0));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn missing_venue_uses_unknown_marker() {
        let a = exact_fingerprint("Jazzkveld", None, ts(19, 0, 0));
        assert!(a.contains("|unknown|"));
    }

    #[test]
    fn from_candidate_requires_a_start_time() {
        let now = ts(12, 0, 0);
        let mut candidate = EventCandidate {
            source_id: "moss-kommune".into(),
            source_kind: SourceKind::Ical,
            source_url: None,
            title: "Jazzkveld".into(),
            description: None,
            start: Some(ts(19, 0, 0)),
            end: None,
            venue: Some("Verket Scene".into()),
            address: None,
            city: None,
            lat: None,
            lon: None,
            category: None,
            price: None,
            event_url: None,
            ticket_url: None,
            image_url: None,
            fetched_at: now,
        };
        let canonical = CanonicalEvent::from_candidate(&candidate, now).unwrap();
        assert_eq!(canonical.status, EventStatus::Upcoming);
        assert_eq!(canonical.first_seen, canonical.last_seen);

        candidate.start = None;
        assert!(CanonicalEvent::from_candidate(&candidate, now).is_none());
    }

    #[test]
    fn haversine_distance_is_plausible() {
        // Verket Scene to Moss town hall is well under a kilometer.
        let d = distance_meters(59.4389, 10.6572, 59.4369, 10.6610);
        assert!(d > 100.0 && d < 1_000.0, "unexpected distance {d}");
    }

    #[test]
    fn source_kind_priority_prefers_structured_feeds() {
        assert!(SourceKind::Ical.merge_priority() < SourceKind::Html.merge_priority());
        assert!(SourceKind::Api.merge_priority() < SourceKind::Rss.merge_priority());
        assert_eq!(SourceKind::parse("ical"), Some(SourceKind::Ical));
        assert_eq!(SourceKind::parse("webcal"), None);
    }
}
