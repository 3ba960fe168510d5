//! SQLite persistence for canonical events and crawl-cycle bookkeeping.
//!
//! Writes for a crawl cycle go through [`EventStore::apply_cycle`], which
//! commits the whole merge set in one transaction: either every insert,
//! merge and archival of the cycle lands, or none of it does.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use kulturkal_core::{CanonicalEvent, CycleCounters, EventStatus, SourceKind};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "kulturkal-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("malformed row: {0}")]
    BadRow(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Everything a cycle wants to write, applied atomically.
#[derive(Debug, Clone)]
pub struct CyclePlan {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counters: CycleCounters,
    pub inserts: Vec<CanonicalEvent>,
    /// Merged canonical events, rewritten in full.
    pub updates: Vec<CanonicalEvent>,
    pub archive_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CycleRow {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counters: CycleCounters,
}

#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT,
    start_time TEXT NOT NULL,
    end_time TEXT,
    venue TEXT,
    address TEXT,
    city TEXT,
    lat REAL,
    lon REAL,
    category TEXT,
    price TEXT,
    event_url TEXT,
    ticket_url TEXT,
    image_url TEXT,
    source_id TEXT NOT NULL,
    source_kind TEXT NOT NULL,
    source_url TEXT,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'upcoming'
);

CREATE INDEX IF NOT EXISTS idx_events_status_start ON events(status, start_time);

CREATE TABLE IF NOT EXISTS cycles (
    run_id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    counters_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS source_health (
    source_id TEXT PRIMARY KEY,
    last_success TEXT,
    last_failure TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    updated_at TEXT NOT NULL
);
"#;

impl EventStore {
    /// Open (and create if missing) the database behind `database_url`,
    /// e.g. `sqlite://events.db` or `sqlite::memory:`.
    ///
    /// A single connection keeps the store single-writer, which the crawl
    /// cycle requires anyway.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The reference set dedup compares against: every not-yet-archived event.
    pub async fn load_active(&self) -> Result<Vec<CanonicalEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM events
             WHERE status = 'upcoming'
             ORDER BY start_time ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn load_upcoming(&self, limit: i64) -> Result<Vec<CanonicalEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM events
             WHERE status = 'upcoming'
             ORDER BY start_time ASC, id ASC
             LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn load_archived(&self, limit: i64) -> Result<Vec<CanonicalEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM events
             WHERE status = 'archived'
             ORDER BY start_time DESC, id ASC
             LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Apply a whole cycle in one transaction. The cycle row shares the
    /// transaction, so replaying a committed run id fails and rolls back.
    pub async fn apply_cycle(&self, plan: &CyclePlan) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for event in plan.inserts.iter().chain(plan.updates.iter()) {
            upsert_event(&mut tx, event).await?;
        }

        for id in &plan.archive_ids {
            sqlx::query("UPDATE events SET status = 'archived' WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO cycles (run_id, started_at, finished_at, counters_json)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&plan.run_id)
        .bind(plan.started_at)
        .bind(plan.finished_at)
        .bind(serde_json::to_string(&plan.counters)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            run_id = %plan.run_id,
            new = plan.inserts.len(),
            merged = plan.updates.len(),
            archived = plan.archive_ids.len(),
            "cycle committed"
        );
        Ok(())
    }

    pub async fn recent_cycles(&self, limit: i64) -> Result<Vec<CycleRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, started_at, finished_at, counters_json
              FROM cycles
             ORDER BY started_at DESC
             LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<CycleRow, StoreError> {
                let counters_json: String = row.try_get("counters_json")?;
                Ok(CycleRow {
                    run_id: row.try_get("run_id")?,
                    started_at: row.try_get("started_at")?,
                    finished_at: row.try_get("finished_at")?,
                    counters: serde_json::from_str(&counters_json)?,
                })
            })
            .collect()
    }

    pub async fn record_source_health(
        &self,
        source_id: &str,
        last_success: Option<DateTime<Utc>>,
        last_failure: Option<DateTime<Utc>>,
        consecutive_failures: u32,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO source_health
                (source_id, last_success, last_failure, consecutive_failures, last_error, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(source_id) DO UPDATE SET
                last_success = excluded.last_success,
                last_failure = excluded.last_failure,
                consecutive_failures = excluded.consecutive_failures,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source_id)
        .bind(last_success)
        .bind(last_failure)
        .bind(consecutive_failures as i64)
        .bind(last_error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn upsert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    event: &CanonicalEvent,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO events (
            id, title, description, start_time, end_time, venue, address, city,
            lat, lon, category, price, event_url, ticket_url, image_url,
            source_id, source_kind, source_url, first_seen, last_seen, status
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            description = excluded.description,
            start_time = excluded.start_time,
            end_time = excluded.end_time,
            venue = excluded.venue,
            address = excluded.address,
            city = excluded.city,
            lat = excluded.lat,
            lon = excluded.lon,
            category = excluded.category,
            price = excluded.price,
            event_url = excluded.event_url,
            ticket_url = excluded.ticket_url,
            image_url = excluded.image_url,
            source_id = excluded.source_id,
            source_kind = excluded.source_kind,
            source_url = excluded.source_url,
            last_seen = excluded.last_seen,
            status = excluded.status
        "#,
    )
    .bind(&event.id)
    .bind(&event.title)
    .bind(&event.description)
    .bind(event.start)
    .bind(event.end)
    .bind(&event.venue)
    .bind(&event.address)
    .bind(&event.city)
    .bind(event.lat)
    .bind(event.lon)
    .bind(&event.category)
    .bind(&event.price)
    .bind(&event.event_url)
    .bind(&event.ticket_url)
    .bind(&event.image_url)
    .bind(&event.source_id)
    .bind(event.source_kind.as_str())
    .bind(&event.source_url)
    .bind(event.first_seen)
    .bind(event.last_seen)
    .bind(event.status.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_event(row: &SqliteRow) -> Result<CanonicalEvent, StoreError> {
    let kind_raw: String = row.try_get("source_kind")?;
    let source_kind = SourceKind::parse(&kind_raw).unwrap_or_else(|| {
        warn!(kind = %kind_raw, "unknown source kind in store, treating as manual");
        SourceKind::Manual
    });
    let status_raw: String = row.try_get("status")?;
    let status = EventStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::BadRow(format!("unknown status {status_raw}")))?;

    Ok(CanonicalEvent {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        start: row.try_get("start_time")?,
        end: row.try_get("end_time")?,
        venue: row.try_get("venue")?,
        address: row.try_get("address")?,
        city: row.try_get("city")?,
        lat: row.try_get("lat")?,
        lon: row.try_get("lon")?,
        category: row.try_get("category")?,
        price: row.try_get("price")?,
        event_url: row.try_get("event_url")?,
        ticket_url: row.try_get("ticket_url")?,
        image_url: row.try_get("image_url")?,
        source_id: row.try_get("source_id")?,
        source_kind,
        source_url: row.try_get("source_url")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).single().unwrap()
    }

    fn event(id: &str, title: &str, day: u32) -> CanonicalEvent {
        CanonicalEvent {
            id: id.to_string(),
            title: title.to_string(),
            description: None,
            start: ts(day, 19),
            end: None,
            venue: Some("Verket Scene".into()),
            address: None,
            city: Some("Moss".into()),
            lat: None,
            lon: None,
            category: Some("Musikk".into()),
            price: None,
            event_url: None,
            ticket_url: None,
            image_url: None,
            source_id: "moss-kommune".into(),
            source_kind: SourceKind::Ical,
            source_url: None,
            first_seen: ts(1, 8),
            last_seen: ts(1, 8),
            status: EventStatus::Upcoming,
        }
    }

    fn plan(run_id: &str) -> CyclePlan {
        CyclePlan {
            run_id: run_id.to_string(),
            started_at: ts(1, 8),
            finished_at: ts(1, 9),
            counters: CycleCounters::default(),
            inserts: vec![],
            updates: vec![],
            archive_ids: vec![],
        }
    }

    #[tokio::test]
    async fn cycle_inserts_and_reads_back() {
        let store = EventStore::connect("sqlite::memory:").await.unwrap();
        let mut p = plan("run-1");
        p.inserts = vec![event("a", "Jazzkveld", 1), event("b", "Rockekveld", 2)];
        p.counters.new = 2;
        store.apply_cycle(&p).await.unwrap();

        let active = store.load_active().await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].title, "Jazzkveld");
        assert_eq!(active[0].source_kind, SourceKind::Ical);

        let cycles = store.recent_cycles(10).await.unwrap();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].counters.new, 2);
    }

    #[tokio::test]
    async fn upserts_are_idempotent_for_the_same_canonical_key() {
        let store = EventStore::connect("sqlite::memory:").await.unwrap();
        let mut p = plan("run-1");
        p.inserts = vec![event("a", "Jazzkveld", 1)];
        store.apply_cycle(&p).await.unwrap();

        let mut merged = event("a", "Jazzkveld", 1);
        merged.description = Some("Kveldskonsert".into());
        merged.last_seen = ts(2, 8);
        let mut p2 = plan("run-2");
        p2.updates = vec![merged];
        store.apply_cycle(&p2).await.unwrap();

        let active = store.load_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].description.as_deref(), Some("Kveldskonsert"));
        assert_eq!(active[0].last_seen, ts(2, 8));
        // first_seen survives the merge rewrite
        assert_eq!(active[0].first_seen, ts(1, 8));
    }

    #[tokio::test]
    async fn archival_moves_events_out_of_the_active_set() {
        let store = EventStore::connect("sqlite::memory:").await.unwrap();
        let mut p = plan("run-1");
        p.inserts = vec![event("a", "Jazzkveld", 1), event("b", "Rockekveld", 2)];
        store.apply_cycle(&p).await.unwrap();

        let mut p2 = plan("run-2");
        p2.archive_ids = vec!["a".into()];
        store.apply_cycle(&p2).await.unwrap();

        let active = store.load_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "b");

        let archived = store.load_archived(10).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].id, "a");
    }

    #[tokio::test]
    async fn a_failing_cycle_commits_nothing() {
        let store = EventStore::connect("sqlite::memory:").await.unwrap();
        let mut p = plan("run-1");
        p.inserts = vec![event("a", "Jazzkveld", 1)];
        store.apply_cycle(&p).await.unwrap();

        // Same run id violates the cycles primary key; the event insert in
        // the same transaction must roll back with it.
        let mut p2 = plan("run-1");
        p2.inserts = vec![event("c", "Kunstmarked", 3)];
        assert!(store.apply_cycle(&p2).await.is_err());

        let active = store.load_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
    }

    #[tokio::test]
    async fn source_health_upserts() {
        let store = EventStore::connect("sqlite::memory:").await.unwrap();
        store
            .record_source_health("ticketing", None, Some(ts(1, 8)), 2, Some("timeout"), ts(1, 8))
            .await
            .unwrap();
        store
            .record_source_health("ticketing", Some(ts(1, 9)), Some(ts(1, 8)), 0, None, ts(1, 9))
            .await
            .unwrap();

        let row = sqlx::query("SELECT consecutive_failures FROM source_health WHERE source_id = ?1")
            .bind("ticketing")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let failures: i64 = row.try_get("consecutive_failures").unwrap();
        assert_eq!(failures, 0);
    }
}
