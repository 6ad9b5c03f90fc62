//! Durable item store for evwatch: items, fetch/send audit rows and saved queries.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evwatch_core::{FetchHistory, Item, ItemSource, SavedQuery, SendUpdateHistory, UnknownSource};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, Transaction};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "evwatch-storage";

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid tags column: {0}")]
    Tags(#[from] serde_json::Error),
    #[error(transparent)]
    Source(#[from] UnknownSource),
    #[error("value out of range for column {0}")]
    OutOfRange(&'static str),
}

/// Everything one reconciliation pass writes, committed as a unit.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationCommit {
    pub inserted: Vec<Item>,
    pub updated: Vec<Item>,
    pub fetch_history: Vec<FetchHistory>,
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn items_for_sources(&self, sources: &[ItemSource]) -> Result<Vec<Item>, StoreError>;

    /// Writes inserted/updated items and fetch history rows in one transaction.
    async fn commit_reconciliation(&self, commit: &ReconciliationCommit) -> Result<(), StoreError>;

    async fn latest_fetch_started_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn last_successful_fetch_started_at(
        &self,
        source: ItemSource,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn recent_fetch_history(&self, limit: usize) -> Result<Vec<FetchHistory>, StoreError>;

    async fn list_saved_queries(&self) -> Result<Vec<SavedQuery>, StoreError>;

    async fn upsert_saved_query(&self, query: &SavedQuery) -> Result<(), StoreError>;

    /// Runs operator query text against the store without persisting any side effect.
    async fn execute_query(&self, query_text: &str) -> Result<Vec<Item>, StoreError>;

    /// Whether `query_title` was ever sent to any of `recipients`.
    async fn has_send_history(
        &self,
        query_title: &str,
        recipients: &[String],
    ) -> Result<bool, StoreError>;

    async fn append_send_history(&self, row: &SendUpdateHistory) -> Result<(), StoreError>;

    async fn recent_send_history(&self, limit: usize) -> Result<Vec<SendUpdateHistory>, StoreError>;

    /// Removes items whose start and end both precede `cutoff`.
    async fn delete_items_ended_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteItemStore {
    pool: SqlitePool,
}

impl SqliteItemStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// A private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct ItemRow {
    source: String,
    source_id: String,
    retrieved_at: DateTime<Utc>,
    event_start: DateTime<Utc>,
    event_end: DateTime<Utc>,
    enrollment_deadline: Option<DateTime<Utc>>,
    title: Option<String>,
    description: Option<String>,
    organizer: Option<String>,
    location: Option<String>,
    url: Option<String>,
    price: Option<String>,
    tags: Option<String>,
    raw_data: Option<String>,
}

impl TryFrom<ItemRow> for Item {
    type Error = StoreError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        let tags = match row.tags.as_deref() {
            Some(text) => Some(serde_json::from_str::<Vec<String>>(text)?),
            None => None,
        };
        Ok(Item {
            source: row.source.parse()?,
            source_id: row.source_id,
            retrieved_at: row.retrieved_at,
            event_start: row.event_start,
            event_end: row.event_end,
            enrollment_deadline: row.enrollment_deadline,
            title: row.title,
            description: row.description,
            organizer: row.organizer,
            location: row.location,
            url: row.url,
            price: row.price,
            tags,
            raw_data: row.raw_data,
        })
    }
}

#[derive(Debug, FromRow)]
struct FetchHistoryRow {
    source: String,
    execution_start: DateTime<Utc>,
    execution_duration_ms: i64,
    items_retrieved: i64,
    new_items: i64,
    updated_items: i64,
    is_detailed: bool,
    succeeded: bool,
}

impl TryFrom<FetchHistoryRow> for FetchHistory {
    type Error = StoreError;

    fn try_from(row: FetchHistoryRow) -> Result<Self, Self::Error> {
        Ok(FetchHistory {
            source: row.source.parse()?,
            execution_start: row.execution_start,
            execution_duration: Duration::from_millis(
                u64::try_from(row.execution_duration_ms)
                    .map_err(|_| StoreError::OutOfRange("execution_duration_ms"))?,
            ),
            items_retrieved: from_count(row.items_retrieved, "items_retrieved")?,
            new_items: from_count(row.new_items, "new_items")?,
            updated_items: from_count(row.updated_items, "updated_items")?,
            is_detailed: row.is_detailed,
            succeeded: row.succeeded,
        })
    }
}

#[derive(Debug, FromRow)]
struct SendUpdateHistoryRow {
    query_title: String,
    recipient_address: String,
    sent_at: DateTime<Utc>,
    new_items_count: i64,
    updated_items_count: i64,
}

impl TryFrom<SendUpdateHistoryRow> for SendUpdateHistory {
    type Error = StoreError;

    fn try_from(row: SendUpdateHistoryRow) -> Result<Self, Self::Error> {
        Ok(SendUpdateHistory {
            query_title: row.query_title,
            recipient_address: row.recipient_address,
            sent_at: row.sent_at,
            new_items_count: from_count(row.new_items_count, "new_items_count")?,
            updated_items_count: from_count(row.updated_items_count, "updated_items_count")?,
        })
    }
}

fn from_count(value: i64, column: &'static str) -> Result<usize, StoreError> {
    usize::try_from(value).map_err(|_| StoreError::OutOfRange(column))
}

fn to_count(value: usize, column: &'static str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange(column))
}

fn encode_tags(tags: &Option<Vec<String>>) -> Result<Option<String>, StoreError> {
    tags.as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

async fn upsert_item(tx: &mut Transaction<'_, Sqlite>, item: &Item) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO items (
            source, source_id, retrieved_at, event_start, event_end, enrollment_deadline,
            title, description, organizer, location, url, price, tags, raw_data
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source, source_id) DO UPDATE SET
            retrieved_at = excluded.retrieved_at,
            enrollment_deadline = excluded.enrollment_deadline,
            description = excluded.description,
            location = excluded.location,
            url = excluded.url,
            price = excluded.price,
            tags = excluded.tags,
            raw_data = excluded.raw_data
        "#,
    )
    .bind(item.source.as_str())
    .bind(&item.source_id)
    .bind(item.retrieved_at)
    .bind(item.event_start)
    .bind(item.event_end)
    .bind(item.enrollment_deadline)
    .bind(&item.title)
    .bind(&item.description)
    .bind(&item.organizer)
    .bind(&item.location)
    .bind(&item.url)
    .bind(&item.price)
    .bind(encode_tags(&item.tags)?)
    .bind(&item.raw_data)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_fetch_history(
    tx: &mut Transaction<'_, Sqlite>,
    row: &FetchHistory,
) -> Result<(), StoreError> {
    let duration_ms = i64::try_from(row.execution_duration.as_millis())
        .map_err(|_| StoreError::OutOfRange("execution_duration_ms"))?;
    sqlx::query(
        r#"
        INSERT INTO fetch_history (
            source, execution_start, execution_duration_ms, items_retrieved,
            new_items, updated_items, is_detailed, succeeded
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(row.source.as_str())
    .bind(row.execution_start)
    .bind(duration_ms)
    .bind(to_count(row.items_retrieved, "items_retrieved")?)
    .bind(to_count(row.new_items, "new_items")?)
    .bind(to_count(row.updated_items, "updated_items")?)
    .bind(row.is_detailed)
    .bind(row.succeeded)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl ItemStore for SqliteItemStore {
    async fn items_for_sources(&self, sources: &[ItemSource]) -> Result<Vec<Item>, StoreError> {
        let mut items = Vec::new();
        for source in sources {
            let rows = sqlx::query_as::<_, ItemRow>(
                "SELECT * FROM items WHERE source = ? ORDER BY event_start, source_id",
            )
            .bind(source.as_str())
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                items.push(Item::try_from(row)?);
            }
        }
        Ok(items)
    }

    async fn commit_reconciliation(&self, commit: &ReconciliationCommit) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for item in commit.inserted.iter().chain(commit.updated.iter()) {
            upsert_item(&mut tx, item).await?;
        }
        for row in &commit.fetch_history {
            insert_fetch_history(&mut tx, row).await?;
        }
        tx.commit().await?;
        debug!(
            inserted = commit.inserted.len(),
            updated = commit.updated.len(),
            fetch_history = commit.fetch_history.len(),
            "reconciliation committed"
        );
        Ok(())
    }

    async fn latest_fetch_started_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT execution_start FROM fetch_history ORDER BY execution_start DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn last_successful_fetch_started_at(
        &self,
        source: ItemSource,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT execution_start FROM fetch_history
            WHERE source = ? AND succeeded = 1
            ORDER BY execution_start DESC
            LIMIT 1
            "#,
        )
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn recent_fetch_history(&self, limit: usize) -> Result<Vec<FetchHistory>, StoreError> {
        let rows = sqlx::query_as::<_, FetchHistoryRow>(
            r#"
            SELECT source, execution_start, execution_duration_ms, items_retrieved,
                   new_items, updated_items, is_detailed, succeeded
            FROM fetch_history
            ORDER BY execution_start DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(to_count(limit, "limit")?)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FetchHistory::try_from).collect()
    }

    async fn list_saved_queries(&self) -> Result<Vec<SavedQuery>, StoreError> {
        let queries = sqlx::query_as::<_, (i64, String, String)>(
            "SELECT id, title, query_text FROM saved_queries ORDER BY title",
        )
        .fetch_all(&self.pool)
        .await?;
        let links = sqlx::query_as::<_, (i64, String)>(
            r#"
            SELECT l.saved_query_id, r.address
            FROM saved_query_recipients l
            JOIN recipients r ON r.id = l.recipient_id
            ORDER BY r.address
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut recipients: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for (query_id, address) in links {
            recipients.entry(query_id).or_default().push(address);
        }

        Ok(queries
            .into_iter()
            .map(|(id, title, query_text)| SavedQuery {
                title,
                query_text,
                recipients: recipients.remove(&id).unwrap_or_default(),
            })
            .collect())
    }

    async fn upsert_saved_query(&self, query: &SavedQuery) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let query_id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO saved_queries (title, query_text) VALUES (?, ?)
            ON CONFLICT(title) DO UPDATE SET title = excluded.title, query_text = excluded.query_text
            RETURNING id
            "#,
        )
        .bind(&query.title)
        .bind(&query.query_text)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM saved_query_recipients WHERE saved_query_id = ?")
            .bind(query_id)
            .execute(&mut *tx)
            .await?;

        for address in &query.recipients {
            sqlx::query("INSERT INTO recipients (address) VALUES (?) ON CONFLICT(address) DO NOTHING")
                .bind(address)
                .execute(&mut *tx)
                .await?;
            let recipient_id =
                sqlx::query_scalar::<_, i64>("SELECT id FROM recipients WHERE address = ?")
                    .bind(address)
                    .fetch_one(&mut *tx)
                    .await?;
            sqlx::query(
                "INSERT OR IGNORE INTO saved_query_recipients (saved_query_id, recipient_id) VALUES (?, ?)",
            )
            .bind(query_id)
            .bind(recipient_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn execute_query(&self, query_text: &str) -> Result<Vec<Item>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, ItemRow>(query_text)
            .fetch_all(&mut *tx)
            .await;
        tx.rollback().await?;
        rows?.into_iter().map(Item::try_from).collect()
    }

    async fn has_send_history(
        &self,
        query_title: &str,
        recipients: &[String],
    ) -> Result<bool, StoreError> {
        let sent_to = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT recipient_address FROM send_update_history WHERE query_title = ?",
        )
        .bind(query_title)
        .fetch_all(&self.pool)
        .await?;
        Ok(sent_to.iter().any(|address| {
            recipients
                .iter()
                .any(|recipient| recipient.eq_ignore_ascii_case(address))
        }))
    }

    async fn append_send_history(&self, row: &SendUpdateHistory) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO send_update_history (
                query_title, recipient_address, sent_at, new_items_count, updated_items_count
            )
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.query_title)
        .bind(&row.recipient_address)
        .bind(row.sent_at)
        .bind(to_count(row.new_items_count, "new_items_count")?)
        .bind(to_count(row.updated_items_count, "updated_items_count")?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_send_history(&self, limit: usize) -> Result<Vec<SendUpdateHistory>, StoreError> {
        let rows = sqlx::query_as::<_, SendUpdateHistoryRow>(
            r#"
            SELECT query_title, recipient_address, sent_at, new_items_count, updated_items_count
            FROM send_update_history
            ORDER BY sent_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(to_count(limit, "limit")?)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SendUpdateHistory::try_from).collect()
    }

    async fn delete_items_ended_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM items WHERE event_start < ? AND event_end < ?")
            .bind(cutoff)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, d, h, 0, 0).single().unwrap()
    }

    fn item(source: ItemSource, source_id: &str, price: &str) -> Item {
        Item {
            source,
            source_id: source_id.to_string(),
            retrieved_at: ts(1, 8),
            event_start: ts(10, 18),
            event_end: ts(10, 20),
            enrollment_deadline: None,
            title: Some(format!("Event {source_id}")),
            description: Some("desc".into()),
            organizer: None,
            location: Some("Bergen".into()),
            url: None,
            price: Some(price.to_string()),
            tags: Some(vec!["hike".into(), "family".into()]),
            raw_data: Some("{\"id\":1}".into()),
        }
    }

    #[tokio::test]
    async fn reconciliation_commit_round_trips_items_and_history() {
        let store = SqliteItemStore::in_memory().await.unwrap();
        let mut history = FetchHistory::started(ItemSource::Tekna, ts(1, 8), true);
        history.items_retrieved = 2;
        history.new_items = 2;
        history.succeeded = true;
        history.execution_duration = Duration::from_millis(1500);

        store
            .commit_reconciliation(&ReconciliationCommit {
                inserted: vec![
                    item(ItemSource::Tekna, "1", "100"),
                    item(ItemSource::Tekna, "2", "200"),
                ],
                updated: vec![],
                fetch_history: vec![history.clone()],
            })
            .await
            .unwrap();

        let items = store.items_for_sources(&[ItemSource::Tekna]).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], item(ItemSource::Tekna, "1", "100"));
        assert!(store
            .items_for_sources(&[ItemSource::DntActivities])
            .await
            .unwrap()
            .is_empty());

        let rows = store.recent_fetch_history(10).await.unwrap();
        assert_eq!(rows, vec![history]);
        assert_eq!(store.latest_fetch_started_at().await.unwrap(), Some(ts(1, 8)));
    }

    #[tokio::test]
    async fn updates_overwrite_content_fields_by_merge_key() {
        let store = SqliteItemStore::in_memory().await.unwrap();
        store
            .commit_reconciliation(&ReconciliationCommit {
                inserted: vec![item(ItemSource::Tekna, "42", "100")],
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .commit_reconciliation(&ReconciliationCommit {
                updated: vec![item(ItemSource::Tekna, "42", "150")],
                ..Default::default()
            })
            .await
            .unwrap();

        let items = store.items_for_sources(&[ItemSource::Tekna]).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].price.as_deref(), Some("150"));
    }

    #[tokio::test]
    async fn saved_query_execution_is_read_only() {
        let store = SqliteItemStore::in_memory().await.unwrap();
        store
            .commit_reconciliation(&ReconciliationCommit {
                inserted: vec![
                    item(ItemSource::Tekna, "1", "100"),
                    item(ItemSource::DntActivities, "7", "0"),
                ],
                ..Default::default()
            })
            .await
            .unwrap();

        let hits = store
            .execute_query("SELECT * FROM items WHERE source = 'dnt_activities'")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_id, "7");

        let deleted = store.execute_query("DELETE FROM items RETURNING *").await.unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(store.execute_query("SELECT * FROM items").await.unwrap().len(), 2);

        assert!(store.execute_query("SELECT nope FROM nowhere").await.is_err());
    }

    #[tokio::test]
    async fn saved_queries_upsert_replaces_recipients() {
        let store = SqliteItemStore::in_memory().await.unwrap();
        store
            .upsert_saved_query(&SavedQuery {
                title: "Hikes".into(),
                query_text: "SELECT * FROM items".into(),
                recipients: vec!["a@example.org".into(), "b@example.org".into()],
            })
            .await
            .unwrap();
        store
            .upsert_saved_query(&SavedQuery {
                title: "HIKES".into(),
                query_text: "SELECT * FROM items WHERE source = 'tekna'".into(),
                recipients: vec!["c@example.org".into()],
            })
            .await
            .unwrap();

        let queries = store.list_saved_queries().await.unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].title, "HIKES");
        assert_eq!(queries[0].recipients, vec!["c@example.org".to_string()]);
    }

    #[tokio::test]
    async fn send_history_is_matched_by_title_and_recipient() {
        let store = SqliteItemStore::in_memory().await.unwrap();
        let recipients = vec!["a@example.org".to_string()];
        assert!(!store.has_send_history("Q", &recipients).await.unwrap());

        store
            .append_send_history(&SendUpdateHistory {
                query_title: "Q".into(),
                recipient_address: "A@example.org".into(),
                sent_at: ts(2, 9),
                new_items_count: 3,
                updated_items_count: 1,
            })
            .await
            .unwrap();

        assert!(store.has_send_history("q", &recipients).await.unwrap());
        assert!(!store
            .has_send_history("Q", &["z@example.org".to_string()])
            .await
            .unwrap());
        assert_eq!(store.recent_send_history(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn last_successful_fetch_ignores_failed_attempts() {
        let store = SqliteItemStore::in_memory().await.unwrap();
        let mut ok = FetchHistory::started(ItemSource::Tekna, ts(1, 8), false);
        ok.succeeded = true;
        let failed = FetchHistory::started(ItemSource::Tekna, ts(2, 8), false);
        store
            .commit_reconciliation(&ReconciliationCommit {
                fetch_history: vec![ok, failed],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(
            store
                .last_successful_fetch_started_at(ItemSource::Tekna)
                .await
                .unwrap(),
            Some(ts(1, 8))
        );
        assert_eq!(store.latest_fetch_started_at().await.unwrap(), Some(ts(2, 8)));
        assert_eq!(
            store
                .last_successful_fetch_started_at(ItemSource::DntActivities)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn cleanup_removes_only_past_items() {
        let store = SqliteItemStore::in_memory().await.unwrap();
        let mut past = item(ItemSource::Tekna, "old", "1");
        past.event_start = ts(1, 8);
        past.event_end = ts(1, 10);
        store
            .commit_reconciliation(&ReconciliationCommit {
                inserted: vec![past, item(ItemSource::Tekna, "new", "1")],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(store.delete_items_ended_before(ts(5, 0)).await.unwrap(), 1);
        let left = store.items_for_sources(&[ItemSource::Tekna]).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].source_id, "new");
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("items.db").display());
        {
            let store = SqliteItemStore::connect(&url).await.unwrap();
            store
                .commit_reconciliation(&ReconciliationCommit {
                    inserted: vec![item(ItemSource::Tekna, "1", "100")],
                    ..Default::default()
                })
                .await
                .unwrap();
            store.pool().close().await;
        }
        let reopened = SqliteItemStore::connect(&url).await.unwrap();
        assert_eq!(
            reopened
                .items_for_sources(&[ItemSource::Tekna])
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
