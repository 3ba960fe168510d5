//! Crawl pipeline orchestration: source registry → concurrent scrape →
//! normalize → dedup → transactional persist → archival sweep.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use kulturkal_core::{
    distance_meters, exact_fingerprint, slug, CanonicalEvent, CycleCounters, EventCandidate,
    EventStatus,
};
use kulturkal_fetch::{BreakerConfig, CircuitBreaker, HttpClientConfig, HttpFetcher, SnapshotStore};
use kulturkal_sources::{adapter_for_spec, AdapterContext, SourceAdapter, SourceSpec};
use kulturkal_store::{CyclePlan, EventStore};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kulturkal-pipeline";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceSpec>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub database_url: String,
    pub snapshots_dir: PathBuf,
    pub sources_file: PathBuf,
    pub rules_file: PathBuf,
    pub lock_file: PathBuf,
    pub output_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fanout_limit: usize,
    pub per_source_timeout_secs: u64,
    pub cycle_timeout_secs: u64,
    pub snapshot_max_age_hours: u64,
    pub archive_grace_hours: i64,
    pub lock_stale_secs: u64,
    pub timezone: Tz,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl CrawlConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("KULTURKAL_DB_URL")
                .unwrap_or_else(|_| "sqlite://kulturkal.db".to_string()),
            snapshots_dir: std::env::var("KULTURKAL_SNAPSHOTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./snapshots")),
            sources_file: std::env::var("KULTURKAL_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            rules_file: std::env::var("KULTURKAL_RULES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./rules.yaml")),
            lock_file: std::env::var("KULTURKAL_LOCK_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./kulturkal.lock")),
            output_dir: std::env::var("KULTURKAL_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./public")),
            user_agent: std::env::var("KULTURKAL_USER_AGENT")
                .unwrap_or_else(|_| "kulturkal-bot/0.1 (+https://kulturkal.no)".to_string()),
            http_timeout_secs: env_or("KULTURKAL_HTTP_TIMEOUT_SECS", 15),
            fanout_limit: env_or("KULTURKAL_FANOUT", 6),
            per_source_timeout_secs: env_or("KULTURKAL_SOURCE_TIMEOUT_SECS", 60),
            cycle_timeout_secs: env_or("KULTURKAL_CYCLE_TIMEOUT_SECS", 600),
            snapshot_max_age_hours: env_or("KULTURKAL_SNAPSHOT_MAX_AGE_HOURS", 24),
            archive_grace_hours: env_or("KULTURKAL_ARCHIVE_GRACE_HOURS", 1),
            lock_stale_secs: env_or("KULTURKAL_LOCK_STALE_SECS", 3600),
            timezone: std::env::var("KULTURKAL_TZ")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(chrono_tz::Europe::Oslo),
            scheduler_enabled: std::env::var("KULTURKAL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("KULTURKAL_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 5,17 * * *".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RulesFile {
    #[allow(dead_code)]
    pub version: u32,
    #[serde(default = "default_city")]
    pub default_city: String,
    #[serde(default)]
    pub category_rules: Vec<CategoryRule>,
}

fn default_city() -> String {
    "Moss".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRule {
    pub category: String,
    pub contains_any: Vec<String>,
}

impl RulesFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn builtin() -> Self {
        Self {
            version: 1,
            default_city: default_city(),
            category_rules: vec![
                CategoryRule {
                    category: "Musikk".into(),
                    contains_any: vec!["konsert".into(), "band".into(), "dj".into(), "jazz".into()],
                },
                CategoryRule {
                    category: "Teater".into(),
                    contains_any: vec!["teater".into(), "standup".into(), "forestilling".into()],
                },
                CategoryRule {
                    category: "Utstilling".into(),
                    contains_any: vec!["utstilling".into(), "vernissage".into(), "galleri".into()],
                },
                CategoryRule {
                    category: "Familie".into(),
                    contains_any: vec!["familie".into(), "barn".into(), "familiedag".into()],
                },
            ],
        }
    }
}

const TITLE_NOISE_PREFIXES: [&str; 4] = ["event:", "arrangement:", "forestilling:", "konsert:"];
const KNOWN_CITIES: [&str; 8] = [
    "Oslo", "Bergen", "Trondheim", "Stavanger", "Moss", "Fredrikstad", "Sarpsborg", "Horten",
];

/// Remove tags and collapse entities well enough for titles and teasers.
fn strip_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&amp;", "&")
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case-insensitive prefix strip that respects char boundaries.
fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let mut indices = text.char_indices();
    let mut prefix_chars = prefix.chars();
    loop {
        let Some(p) = prefix_chars.next() else {
            let rest = indices.next().map(|(i, _)| i).unwrap_or(text.len());
            return Some(text[rest..].trim_start());
        };
        let (_, c) = indices.next()?;
        if !c.to_lowercase().eq(p.to_lowercase()) {
            return None;
        }
    }
}

fn cap_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn extract_price_text(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    if ["gratis", "free", "fri adgang"].iter().any(|w| lower.contains(w)) {
        return Some("Gratis".to_string());
    }
    let pos = lower.find("kr")?;
    let digits: String = lower[pos + 2..]
        .chars()
        .skip_while(|c| c.is_whitespace() || *c == '.')
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(format!("kr {digits}"))
    }
}

fn infer_city_from_address(address: &str) -> Option<String> {
    // Norwegian postal pattern: four digits then the locality name.
    let chars: Vec<char> = address.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if i - start == 4 {
                let rest: String = chars[i..].iter().collect();
                let name: String = rest
                    .split_whitespace()
                    .take_while(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
                    .collect::<Vec<_>>()
                    .join(" ");
                if !name.is_empty() {
                    return Some(name.trim_end_matches([',', '.']).to_string());
                }
            }
        } else {
            i += 1;
        }
    }
    let upper = address.to_lowercase();
    KNOWN_CITIES
        .iter()
        .find(|city| upper.contains(&city.to_lowercase()))
        .map(ToString::to_string)
}

/// Maps raw candidate fields onto the canonical schema.
#[derive(Debug, Clone)]
pub struct Normalizer {
    default_city: String,
    category_rules: Vec<CategoryRule>,
}

impl Normalizer {
    pub fn new(rules: &RulesFile) -> Self {
        Self {
            default_city: rules.default_city.clone(),
            category_rules: rules.category_rules.clone(),
        }
    }

    pub fn normalize_title(&self, title: &str) -> String {
        let mut title = collapse_whitespace(&strip_html(title));
        for prefix in TITLE_NOISE_PREFIXES {
            if let Some(rest) = strip_prefix_ci(&title, prefix) {
                title = rest.to_string();
            }
        }
        let mut chars = title.chars();
        let title = match chars.next() {
            Some(first) if first.is_lowercase() => {
                first.to_uppercase().collect::<String>() + chars.as_str()
            }
            _ => title.clone(),
        };
        cap_chars(title.trim(), 200)
    }

    pub fn normalize_description(&self, description: &str) -> Option<String> {
        let clean = collapse_whitespace(&strip_html(description));
        if clean.chars().count() < 10 {
            return None;
        }
        Some(cap_chars(&clean, 1000))
    }

    pub fn categorize(&self, title: &str, description: Option<&str>) -> Option<String> {
        let haystack = format!("{} {}", title, description.unwrap_or("")).to_lowercase();
        self.category_rules
            .iter()
            .find(|rule| {
                rule.contains_any
                    .iter()
                    .any(|needle| haystack.contains(&needle.to_lowercase()))
            })
            .map(|rule| rule.category.clone())
    }

    pub fn normalize(&self, mut candidate: EventCandidate) -> EventCandidate {
        candidate.title = self.normalize_title(&candidate.title);
        candidate.description = candidate
            .description
            .as_deref()
            .and_then(|d| self.normalize_description(d));

        if let Some(venue) = candidate.venue.take() {
            let venue = collapse_whitespace(&strip_html(&venue));
            if candidate.address.is_none() {
                let (v, a) = kulturkal_sources::split_location(&venue);
                candidate.venue = v;
                candidate.address = a;
            } else {
                candidate.venue = if venue.is_empty() { None } else { Some(venue) };
            }
        }

        candidate.city = candidate
            .city
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(ToString::to_string)
            .or_else(|| candidate.address.as_deref().and_then(infer_city_from_address))
            .or_else(|| Some(self.default_city.clone()));

        candidate.price = candidate
            .price
            .as_deref()
            .and_then(extract_price_text)
            .or_else(|| candidate.price.as_deref().map(|p| cap_chars(p.trim(), 50)))
            .filter(|p| !p.is_empty())
            .or_else(|| candidate.description.as_deref().and_then(extract_price_text));

        if candidate.category.is_none() {
            candidate.category = self.categorize(&candidate.title, candidate.description.as_deref());
        }
        candidate
    }
}

// ---------------------------------------------------------------------------
// Deduplication engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// At or above this combined score, merge automatically.
    pub upper_threshold: f64,
    /// Below this, events are definitely distinct. Scores in between are
    /// treated as distinct too (conservative), but logged for tuning.
    pub lower_threshold: f64,
    pub time_window_minutes: i64,
    pub geo_bonus_radius_m: f64,
    pub geo_bonus: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            upper_threshold: 0.90,
            lower_threshold: 0.75,
            time_window_minutes: 120,
            geo_bonus_radius_m: 250.0,
            geo_bonus: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DedupDecision {
    New { canonical_id: String },
    Merge { canonical_id: String, score: f64 },
    Dropped { reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    pub new_events: Vec<CanonicalEvent>,
    /// Pre-existing canonical events that received at least one merge.
    pub updated_events: Vec<CanonicalEvent>,
    pub decisions: Vec<DedupDecision>,
    pub merged_count: usize,
    pub dropped_count: usize,
}

struct WorkingEntry {
    event: CanonicalEvent,
    pre_existing: bool,
    touched: bool,
}

pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    fn title_similarity(a: &str, b: &str) -> f64 {
        jaro_winkler(&slug(a), &slug(b))
    }

    /// Combined similarity. Title and time carry the evidence; venue helps;
    /// geo proximity may only top up an already-plausible pair.
    pub fn similarity(&self, candidate: &EventCandidate, existing: &CanonicalEvent) -> f64 {
        let Some(start) = candidate.start else {
            return 0.0;
        };
        let title_score = Self::title_similarity(&candidate.title, &existing.title);

        let minutes_apart = (start - existing.start).num_minutes().abs();
        let time_score = if minutes_apart <= self.config.time_window_minutes {
            1.0
        } else {
            0.0
        };

        let venue_score = match (candidate.venue.as_deref(), existing.venue.as_deref()) {
            (Some(a), Some(b)) => jaro_winkler(&a.to_lowercase(), &b.to_lowercase()),
            // One side missing is weak evidence either way.
            _ => 0.5,
        };

        let mut score = title_score * 0.5 + time_score * 0.3 + venue_score * 0.2;

        if score >= self.config.lower_threshold {
            if let (Some(lat1), Some(lon1), Some(lat2), Some(lon2)) =
                (candidate.lat, candidate.lon, existing.lat, existing.lon)
            {
                if distance_meters(lat1, lon1, lat2, lon2) <= self.config.geo_bonus_radius_m {
                    score = (score + self.config.geo_bonus).min(1.0);
                }
            }
        }
        score
    }

    /// Assign every candidate to exactly one decision against the existing
    /// canonical set. Candidates are processed in input order, which makes
    /// the assignment deterministic for a given batch and reference set.
    pub fn assign(
        &self,
        candidates: &[EventCandidate],
        existing: &[CanonicalEvent],
        now: DateTime<Utc>,
    ) -> DedupOutcome {
        let mut working: Vec<WorkingEntry> = existing
            .iter()
            .map(|event| WorkingEntry {
                event: event.clone(),
                pre_existing: true,
                touched: false,
            })
            .collect();
        let mut by_id: HashMap<String, usize> = working
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.event.id.clone(), i))
            .collect();
        let mut by_fingerprint: HashMap<String, usize> = working
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let fp = exact_fingerprint(
                    &entry.event.title,
                    entry.event.venue.as_deref(),
                    entry.event.start,
                );
                (fp, i)
            })
            .collect();

        let mut outcome = DedupOutcome::default();

        for candidate in candidates {
            let Some(start) = candidate.start else {
                warn!(
                    source_id = %candidate.source_id,
                    title = %candidate.title,
                    "candidate without start time dropped"
                );
                outcome.dropped_count += 1;
                outcome.decisions.push(DedupDecision::Dropped {
                    reason: "missing start time".into(),
                });
                continue;
            };
            if candidate.title.trim().is_empty() {
                warn!(source_id = %candidate.source_id, "candidate without title dropped");
                outcome.dropped_count += 1;
                outcome.decisions.push(DedupDecision::Dropped {
                    reason: "empty title".into(),
                });
                continue;
            }

            // Stage 1: exact fingerprint.
            let fingerprint = exact_fingerprint(&candidate.title, candidate.venue.as_deref(), start);
            if let Some(&idx) = by_fingerprint.get(&fingerprint) {
                let score = 1.0;
                merge_into(&mut working[idx], candidate, now);
                outcome.merged_count += 1;
                outcome.decisions.push(DedupDecision::Merge {
                    canonical_id: working[idx].event.id.clone(),
                    score,
                });
                continue;
            }

            // The persisted key is title|date|venue; a candidate that maps to
            // an existing key is the same occurrence by definition.
            let id = kulturkal_core::canonical_id(&candidate.title, start, candidate.venue.as_deref());
            if let Some(&idx) = by_id.get(&id) {
                merge_into(&mut working[idx], candidate, now);
                outcome.merged_count += 1;
                outcome.decisions.push(DedupDecision::Merge {
                    canonical_id: id,
                    score: 1.0,
                });
                continue;
            }

            // Stage 2: fuzzy scan with a one-day prefilter.
            let mut best: Option<(f64, usize)> = None;
            for (idx, entry) in working.iter().enumerate() {
                if (start - entry.event.start).num_days().abs() > 1 {
                    continue;
                }
                let score = self.similarity(candidate, &entry.event);
                if score < self.config.lower_threshold {
                    continue;
                }
                best = match best {
                    None => Some((score, idx)),
                    Some((best_score, best_idx)) => {
                        if score > best_score + f64::EPSILON {
                            Some((score, idx))
                        } else if (score - best_score).abs() <= f64::EPSILON
                            && entry.event.last_seen > working[best_idx].event.last_seen
                        {
                            Some((score, idx))
                        } else {
                            Some((best_score, best_idx))
                        }
                    }
                };
            }

            match best {
                Some((score, idx)) if score >= self.config.upper_threshold => {
                    merge_into(&mut working[idx], candidate, now);
                    outcome.merged_count += 1;
                    outcome.decisions.push(DedupDecision::Merge {
                        canonical_id: working[idx].event.id.clone(),
                        score,
                    });
                    continue;
                }
                Some((score, idx)) => {
                    // Mid-band: conservative, keep distinct, leave a trace.
                    debug!(
                        candidate = %candidate.title,
                        existing = %working[idx].event.title,
                        score,
                        "borderline similarity treated as distinct"
                    );
                }
                None => {}
            }

            let Some(canonical) = CanonicalEvent::from_candidate(candidate, now) else {
                outcome.dropped_count += 1;
                outcome.decisions.push(DedupDecision::Dropped {
                    reason: "missing start time".into(),
                });
                continue;
            };
            by_id.insert(canonical.id.clone(), working.len());
            by_fingerprint.insert(fingerprint, working.len());
            outcome.decisions.push(DedupDecision::New {
                canonical_id: canonical.id.clone(),
            });
            working.push(WorkingEntry {
                event: canonical,
                pre_existing: false,
                touched: false,
            });
        }

        for entry in working {
            if entry.pre_existing {
                if entry.touched {
                    outcome.updated_events.push(entry.event);
                }
            } else {
                outcome.new_events.push(entry.event);
            }
        }
        outcome
    }
}

/// Fold a duplicate observation into its canonical event: bump last-seen,
/// fill gaps, and let higher-priority source kinds win the URL fields.
fn merge_into(entry: &mut WorkingEntry, candidate: &EventCandidate, now: DateTime<Utc>) {
    let event = &mut entry.event;
    event.last_seen = now;

    fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
        if slot.is_none() {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }
    }

    fill(&mut event.description, &candidate.description);
    fill(&mut event.end, &candidate.end);
    fill(&mut event.venue, &candidate.venue);
    fill(&mut event.address, &candidate.address);
    fill(&mut event.city, &candidate.city);
    fill(&mut event.category, &candidate.category);
    fill(&mut event.price, &candidate.price);
    fill(&mut event.event_url, &candidate.event_url);
    fill(&mut event.ticket_url, &candidate.ticket_url);
    fill(&mut event.image_url, &candidate.image_url);
    if event.lat.is_none() {
        event.lat = candidate.lat;
        event.lon = candidate.lon;
    }

    if candidate.source_kind.merge_priority() < event.source_kind.merge_priority() {
        if candidate.event_url.is_some() {
            event.event_url = candidate.event_url.clone();
        }
        if candidate.ticket_url.is_some() {
            event.ticket_url = candidate.ticket_url.clone();
        }
    }

    entry.touched = true;
}

/// An event whose (end, or start when endless) time passed the grace period
/// moves to the archive on the next cycle.
pub fn should_archive(event: &CanonicalEvent, now: DateTime<Utc>, grace_hours: i64) -> bool {
    if event.status == EventStatus::Archived {
        return false;
    }
    let reference = event.end.unwrap_or(event.start);
    reference < now - chrono::Duration::hours(grace_hours)
}

// ---------------------------------------------------------------------------
// Cycle lock
// ---------------------------------------------------------------------------

/// Marker file guarding against overlapping crawl invocations. The second
/// invocation sees the marker and exits instead of interleaving writes.
#[derive(Debug)]
pub struct CycleLock {
    path: PathBuf,
}

impl CycleLock {
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Option<CycleLock>> {
        match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                use std::io::Write;
                let _ = writeln!(file, "{} {}", std::process::id(), Utc::now().to_rfc3339());
                Ok(Some(CycleLock { path: path.to_path_buf() }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let age = std::fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|mtime| mtime.elapsed().ok());
                match age {
                    Some(age) if age > stale_after => {
                        warn!(path = %path.display(), "removing stale cycle lock");
                        std::fs::remove_file(path)
                            .with_context(|| format!("removing stale lock {}", path.display()))?;
                        Self::acquire(path, stale_after)
                    }
                    _ => Ok(None),
                }
            }
            Err(err) => {
                Err(err).with_context(|| format!("creating cycle lock {}", path.display()))
            }
        }
    }
}

impl Drop for CycleLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counters: CycleCounters,
    pub active_total: usize,
    pub dry_run: bool,
}

struct SourceOutcome {
    source_id: String,
    candidates: Vec<EventCandidate>,
    succeeded: bool,
    error: Option<String>,
}

pub struct CrawlPipeline {
    config: CrawlConfig,
    fetcher: HttpFetcher,
    breaker: CircuitBreaker,
    snapshots: SnapshotStore,
    store: EventStore,
    dedup: DedupEngine,
}

impl CrawlPipeline {
    pub async fn new(config: CrawlConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            global_concurrency: config.fanout_limit.max(1) * 2,
            ..Default::default()
        })?;
        let store = EventStore::connect(&config.database_url)
            .await
            .context("opening event store")?;
        Ok(Self {
            snapshots: SnapshotStore::new(config.snapshots_dir.clone()),
            breaker: CircuitBreaker::new(BreakerConfig::default()),
            dedup: DedupEngine::new(DedupConfig::default()),
            fetcher,
            store,
            config,
        })
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub async fn run_once(&self, dry_run: bool, only: Option<&[String]>) -> Result<CycleSummary> {
        let Some(_lock) = CycleLock::acquire(
            &self.config.lock_file,
            Duration::from_secs(self.config.lock_stale_secs),
        )?
        else {
            bail!(
                "another crawl cycle holds {}; exiting without touching the store",
                self.config.lock_file.display()
            );
        };

        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        info!(%run_id, "crawl cycle starting");

        let registry = SourceRegistry::load(&self.config.sources_file).await?;
        let rules = match RulesFile::load(&self.config.rules_file).await {
            Ok(rules) => rules,
            Err(err) => {
                warn!(error = %err, "rules file unavailable, using built-in rules");
                RulesFile::builtin()
            }
        };
        let normalizer = Normalizer::new(&rules);

        let specs: Vec<SourceSpec> = registry
            .sources
            .into_iter()
            .filter(|s| s.enabled)
            .filter(|s| only.is_none_or(|ids| ids.iter().any(|id| id == &s.source_id)))
            .collect();

        let ctx = AdapterContext {
            fetched_at: started_at,
            timezone: self.config.timezone,
        };

        let specs_len = specs.len();
        let ctx_ref = &ctx;
        let scrape = stream::iter(specs.into_iter())
            .map(|spec| async move { self.scrape_source(&spec, ctx_ref).await })
            .buffer_unordered(self.config.fanout_limit.max(1))
            .collect::<Vec<_>>();
        let mut outcomes =
            match tokio::time::timeout(Duration::from_secs(self.config.cycle_timeout_secs), scrape)
                .await
            {
                Ok(outcomes) => outcomes,
                Err(_) => {
                    warn!(%run_id, "scrape phase hit the cycle timeout; deferring batch");
                    Vec::new()
                }
            };
        // Completion order is racy; a stable order keeps dedup deterministic.
        outcomes.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        let mut counters = CycleCounters {
            sources_attempted: specs_len,
            ..Default::default()
        };
        let mut candidates = Vec::new();
        for outcome in &outcomes {
            if outcome.succeeded {
                counters.sources_succeeded += 1;
            } else {
                counters.sources_failed += 1;
                warn!(
                    source_id = %outcome.source_id,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "source failed this cycle"
                );
            }
            candidates.extend(outcome.candidates.iter().cloned());
        }
        counters.fetched = candidates.len();

        let candidates: Vec<EventCandidate> = candidates
            .into_iter()
            .map(|c| normalizer.normalize(c))
            .collect();

        let existing = self.store.load_active().await?;
        let now = Utc::now();
        let outcome = self.dedup.assign(&candidates, &existing, now);
        counters.new = outcome.new_events.len();
        counters.merged = outcome.merged_count;
        counters.dropped = outcome.dropped_count;

        let updated_ids: Vec<&str> = outcome.updated_events.iter().map(|e| e.id.as_str()).collect();
        let mut archive_ids = Vec::new();
        for event in existing
            .iter()
            .filter(|e| !updated_ids.contains(&e.id.as_str()))
            .chain(outcome.updated_events.iter())
            .chain(outcome.new_events.iter())
        {
            if should_archive(event, now, self.config.archive_grace_hours) {
                archive_ids.push(event.id.clone());
            }
        }
        counters.archived = archive_ids.len();

        let finished_at = Utc::now();
        let active_total =
            existing.len() + outcome.new_events.len() - archive_ids.len().min(existing.len());

        if dry_run {
            info!(%run_id, ?counters, "dry run; skipping persistence");
        } else {
            let plan = CyclePlan {
                run_id: run_id.clone(),
                started_at,
                finished_at,
                counters,
                inserts: outcome.new_events,
                updates: outcome.updated_events,
                archive_ids,
            };
            // Persistence failure is fatal for the cycle: no partial commit.
            self.store.apply_cycle(&plan).await.context("committing crawl cycle")?;
            self.record_health(&outcomes, now).await;
        }

        info!(
            %run_id,
            fetched = counters.fetched,
            new = counters.new,
            merged = counters.merged,
            dropped = counters.dropped,
            archived = counters.archived,
            "crawl cycle finished"
        );

        Ok(CycleSummary {
            run_id,
            started_at,
            finished_at,
            counters,
            active_total,
            dry_run,
        })
    }

    async fn scrape_source(&self, spec: &SourceSpec, ctx: &AdapterContext) -> SourceOutcome {
        let Some(adapter) = adapter_for_spec(spec) else {
            return SourceOutcome {
                source_id: spec.source_id.clone(),
                candidates: Vec::new(),
                succeeded: false,
                error: Some("no adapter for source (missing API key?)".into()),
            };
        };

        let work = self.scrape_with_adapter(spec, adapter.as_ref(), ctx);
        match tokio::time::timeout(
            Duration::from_secs(self.config.per_source_timeout_secs),
            work,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => SourceOutcome {
                source_id: spec.source_id.clone(),
                candidates: Vec::new(),
                succeeded: false,
                error: Some("source timed out".into()),
            },
        }
    }

    async fn scrape_with_adapter(
        &self,
        spec: &SourceSpec,
        adapter: &dyn SourceAdapter,
        ctx: &AdapterContext,
    ) -> SourceOutcome {
        let mut candidates = Vec::new();
        let mut last_error = None;

        for url in adapter.request_urls() {
            if let Err(err) = self.breaker.check(&spec.source_id) {
                warn!(source_id = %spec.source_id, error = %err, "circuit open, trying snapshot");
                match self.replay_snapshot(spec, adapter, &url, ctx).await {
                    Some(mut replayed) => candidates.append(&mut replayed),
                    None => last_error = Some(err.to_string()),
                }
                continue;
            }

            match self.fetcher.fetch_bytes(&spec.source_id, &url).await {
                Ok(response) => {
                    self.breaker.record_success(&spec.source_id);
                    if let Err(err) = self
                        .snapshots
                        .store_bytes(
                            &spec.source_id,
                            ctx.fetched_at,
                            adapter.payload_extension(),
                            &response.body,
                        )
                        .await
                    {
                        warn!(source_id = %spec.source_id, error = %err, "snapshot write failed");
                    }
                    match adapter.parse_payload(&response.body, &url, ctx) {
                        Ok(mut parsed) => candidates.append(&mut parsed),
                        Err(err) => {
                            warn!(source_id = %spec.source_id, url, error = %err, "payload unparseable");
                            last_error = Some(err.to_string());
                        }
                    }
                }
                Err(err) => {
                    self.breaker.record_failure(&spec.source_id, &err.to_string());
                    warn!(source_id = %spec.source_id, url, error = %err, "fetch failed, trying snapshot");
                    match self.replay_snapshot(spec, adapter, &url, ctx).await {
                        Some(mut replayed) => candidates.append(&mut replayed),
                        None => last_error = Some(err.to_string()),
                    }
                }
            }
        }

        SourceOutcome {
            source_id: spec.source_id.clone(),
            succeeded: last_error.is_none(),
            error: last_error,
            candidates,
        }
    }

    async fn replay_snapshot(
        &self,
        spec: &SourceSpec,
        adapter: &dyn SourceAdapter,
        url: &str,
        ctx: &AdapterContext,
    ) -> Option<Vec<EventCandidate>> {
        let max_age = Duration::from_secs(self.config.snapshot_max_age_hours * 3600);
        match self.snapshots.load_latest(&spec.source_id, max_age, ctx.fetched_at).await {
            Ok(Some((bytes, fetched_at))) => {
                info!(
                    source_id = %spec.source_id,
                    snapshot_age_hours = (ctx.fetched_at - fetched_at).num_hours(),
                    "replaying cached snapshot"
                );
                adapter.parse_payload(&bytes, url, ctx).ok()
            }
            Ok(None) => None,
            Err(err) => {
                warn!(source_id = %spec.source_id, error = %err, "snapshot replay failed");
                None
            }
        }
    }

    async fn record_health(&self, outcomes: &[SourceOutcome], now: DateTime<Utc>) {
        for outcome in outcomes {
            let health = self.breaker.health(&outcome.source_id);
            if let Err(err) = self
                .store
                .record_source_health(
                    &outcome.source_id,
                    health.last_success,
                    health.last_failure,
                    health.consecutive_failures,
                    health.last_error.as_deref(),
                    now,
                )
                .await
            {
                warn!(source_id = %outcome.source_id, error = %err, "source health write failed");
            }
        }
    }
}

/// Build the in-process scheduler when enabled. Each tick runs one crawl
/// cycle; lock contention makes overlapping ticks exit early.
pub async fn build_scheduler(pipeline: Arc<CrawlPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once(false, None).await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled cycle finished"),
                Err(err) => warn!(error = %err, "scheduled cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kulturkal_core::SourceKind;

    fn ts(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, minute, 0).single().unwrap()
    }

    fn candidate(title: &str, venue: Option<&str>, start: Option<DateTime<Utc>>) -> EventCandidate {
        EventCandidate {
            source_id: "moss-kommune".into(),
            source_kind: SourceKind::Ical,
            source_url: None,
            title: title.to_string(),
            description: None,
            start,
            end: None,
            venue: venue.map(ToString::to_string),
            address: None,
            city: None,
            lat: None,
            lon: None,
            category: None,
            price: None,
            event_url: None,
            ticket_url: None,
            image_url: None,
            fetched_at: ts(1, 8, 0),
        }
    }

    fn existing(title: &str, venue: &str, start: DateTime<Utc>, last_seen: DateTime<Utc>) -> CanonicalEvent {
        let mut event = CanonicalEvent::from_candidate(
            &candidate(title, Some(venue), Some(start)),
            last_seen,
        )
        .unwrap();
        event.last_seen = last_seen;
        event
    }

    fn engine() -> DedupEngine {
        DedupEngine::new(DedupConfig::default())
    }

    #[test]
    fn identical_fingerprints_collapse_within_a_batch() {
        let batch = vec![
            candidate("Jazzkveld", Some("Verket Scene"), Some(ts(1, 19, 0))),
            candidate("Jazzkveld!", Some("Verket Scene"), Some(ts(1, 19, 0))),
            candidate("jazzkveld", Some("verket scene"), Some(ts(1, 19, 0))),
        ];
        let outcome = engine().assign(&batch, &[], ts(1, 9, 0));
        assert_eq!(outcome.new_events.len(), 1);
        assert_eq!(outcome.merged_count, 2);
        assert_eq!(outcome.dropped_count, 0);
    }

    #[test]
    fn near_start_times_merge_into_the_existing_event() {
        let reference = vec![existing("Jazzkveld", "Verket Scene", ts(1, 19, 5), ts(1, 0, 0))];
        let batch = vec![candidate("Jazzkveld", Some("Verket Scene"), Some(ts(1, 19, 0)))];
        let now = ts(1, 9, 0);
        let outcome = engine().assign(&batch, &reference, now);

        assert!(outcome.new_events.is_empty());
        assert_eq!(outcome.merged_count, 1);
        assert_eq!(outcome.updated_events.len(), 1);
        assert_eq!(outcome.updated_events[0].id, reference[0].id);
        assert_eq!(outcome.updated_events[0].last_seen, now);
    }

    #[test]
    fn different_titles_at_the_same_venue_stay_distinct() {
        let reference = vec![existing("Jazzkveld", "Verket Scene", ts(1, 19, 0), ts(1, 0, 0))];
        let batch = vec![candidate("Rockekveld", Some("Verket Scene"), Some(ts(1, 19, 0)))];
        let outcome = engine().assign(&batch, &reference, ts(1, 9, 0));

        assert_eq!(outcome.new_events.len(), 1);
        assert_eq!(outcome.merged_count, 0);
        assert!(outcome.updated_events.is_empty());
    }

    #[test]
    fn assignment_is_deterministic() {
        let reference = vec![
            existing("Jazzkveld", "Verket Scene", ts(1, 19, 0), ts(1, 0, 0)),
            existing("Kunstmarked", "Galleri F15", ts(2, 12, 0), ts(1, 0, 0)),
        ];
        let batch = vec![
            candidate("Jazzkveld", Some("Verket Scene"), Some(ts(1, 19, 30))),
            candidate("Rockekveld", Some("Verket Scene"), Some(ts(1, 21, 0))),
            candidate("Kunstmarked", Some("Galleri F15"), Some(ts(2, 12, 0))),
        ];
        let a = engine().assign(&batch, &reference, ts(1, 9, 0));
        let b = engine().assign(&batch, &reference, ts(1, 9, 0));
        assert_eq!(a.decisions, b.decisions);
        assert_eq!(
            a.new_events.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
            b.new_events.iter().map(|e| e.id.clone()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn malformed_candidates_are_dropped_not_fatal() {
        let batch = vec![
            candidate("Jazzkveld", Some("Verket Scene"), None),
            candidate("", Some("Verket Scene"), Some(ts(1, 19, 0))),
            candidate("Rockekveld", Some("Verket Scene"), Some(ts(1, 21, 0))),
        ];
        let outcome = engine().assign(&batch, &[], ts(1, 9, 0));
        assert_eq!(outcome.dropped_count, 2);
        assert_eq!(outcome.new_events.len(), 1);
        assert_eq!(outcome.new_events[0].title, "Rockekveld");
    }

    #[test]
    fn ties_prefer_the_most_recently_seen_canonical() {
        let reference = vec![
            existing("Jazzkveld A", "Verket Scene", ts(1, 19, 0), ts(1, 0, 0)),
            existing("Jazzkveld B", "Verket Scene", ts(1, 19, 0), ts(1, 6, 0)),
        ];
        let batch = vec![candidate("Jazzkveld", Some("Verket Scene"), Some(ts(1, 19, 0)))];
        let outcome = engine().assign(&batch, &reference, ts(1, 9, 0));

        assert_eq!(outcome.merged_count, 1);
        assert_eq!(outcome.updated_events.len(), 1);
        assert_eq!(outcome.updated_events[0].id, reference[1].id);
    }

    #[test]
    fn merge_fills_missing_fields_and_prefers_structured_urls() {
        let mut reference = existing("Jazzkveld", "Verket Scene", ts(1, 19, 0), ts(1, 0, 0));
        reference.source_kind = SourceKind::Html;
        reference.event_url = Some("https://venue.example.no/jazz".into());

        let mut dup = candidate("Jazzkveld", Some("Verket Scene"), Some(ts(1, 19, 0)));
        dup.source_kind = SourceKind::Ical;
        dup.description = Some("Kveldskonsert med lokale band".into());
        dup.event_url = Some("https://moss.kommune.no/jazz".into());

        let outcome = engine().assign(&[dup], &[reference], ts(1, 9, 0));
        let updated = &outcome.updated_events[0];
        assert_eq!(updated.description.as_deref(), Some("Kveldskonsert med lokale band"));
        assert_eq!(updated.event_url.as_deref(), Some("https://moss.kommune.no/jazz"));
    }

    #[test]
    fn geo_bonus_never_creates_a_match_on_its_own() {
        let mut reference = existing("Jazzkveld", "Verket Scene", ts(1, 19, 0), ts(1, 0, 0));
        reference.lat = Some(59.4389);
        reference.lon = Some(10.6572);

        let mut unrelated = candidate("Strikkekafé", Some("Biblioteket"), Some(ts(1, 19, 0)));
        unrelated.lat = Some(59.4389);
        unrelated.lon = Some(10.6572);

        let outcome = engine().assign(&[unrelated], &[reference], ts(1, 9, 0));
        assert_eq!(outcome.merged_count, 0);
        assert_eq!(outcome.new_events.len(), 1);
    }

    #[test]
    fn archive_sweep_uses_end_then_start_with_grace() {
        let now = ts(2, 12, 0);
        let mut ended = existing("Jazzkveld", "Verket Scene", ts(1, 19, 0), ts(1, 0, 0));
        ended.end = Some(ts(1, 22, 0));
        assert!(should_archive(&ended, now, 1));

        let endless = existing("Kunstmarked", "Galleri F15", ts(2, 11, 30), ts(1, 0, 0));
        assert!(!should_archive(&endless, now, 1));

        let mut archived = ended.clone();
        archived.status = EventStatus::Archived;
        assert!(!should_archive(&archived, now, 1));
    }

    #[test]
    fn normalizer_cleans_titles_prices_and_categories() {
        let normalizer = Normalizer::new(&RulesFile::builtin());

        assert_eq!(normalizer.normalize_title("  KONSERT:   jazzkveld  "), "Jazzkveld");
        assert_eq!(normalizer.normalize_title("<b>Rockekveld</b>"), "Rockekveld");

        let mut c = candidate("konsert: jazzkveld", None, Some(ts(1, 19, 0)));
        c.venue = Some("Verket Scene, Verkslunden 1, 1534 Moss".into());
        c.price = Some("Billetter fra kr 250,-".into());
        let normalized = normalizer.normalize(c);
        assert_eq!(normalized.title, "Jazzkveld");
        assert_eq!(normalized.venue.as_deref(), Some("Verket Scene"));
        assert_eq!(normalized.price.as_deref(), Some("kr 250"));
        assert_eq!(normalized.category.as_deref(), Some("Musikk"));
        assert_eq!(normalized.city.as_deref(), Some("Moss"));
    }

    #[test]
    fn normalizer_infers_city_from_postal_address() {
        let normalizer = Normalizer::new(&RulesFile::builtin());
        let mut c = candidate("Kunstmarked", Some("Galleri F15"), Some(ts(2, 12, 0)));
        c.address = Some("Albyalleen 60, 1519 Moss".into());
        let normalized = normalizer.normalize(c);
        assert_eq!(normalized.city.as_deref(), Some("Moss"));

        let mut fallback = candidate("Noe", Some("Et sted"), Some(ts(2, 12, 0)));
        fallback.address = Some("en gate uten postnummer".into());
        let normalized = normalizer.normalize(fallback);
        assert_eq!(normalized.city.as_deref(), Some("Moss"));
    }

    #[test]
    fn gratis_events_normalize_price_from_description() {
        let normalizer = Normalizer::new(&RulesFile::builtin());
        let mut c = candidate("Familiedag", Some("Kulturhuset"), Some(ts(2, 12, 0)));
        c.description = Some("Gratis inngang for alle, hele dagen til ende.".into());
        let normalized = normalizer.normalize(c);
        assert_eq!(normalized.price.as_deref(), Some("Gratis"));
        assert_eq!(normalized.category.as_deref(), Some("Familie"));
    }

    #[test]
    fn cycle_lock_blocks_second_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kulturkal.lock");

        let first = CycleLock::acquire(&path, Duration::from_secs(3600)).unwrap();
        assert!(first.is_some());
        let second = CycleLock::acquire(&path, Duration::from_secs(3600)).unwrap();
        assert!(second.is_none());

        drop(first);
        let third = CycleLock::acquire(&path, Duration::from_secs(3600)).unwrap();
        assert!(third.is_some());
    }
}
