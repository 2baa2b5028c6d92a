//! Persistent event store over SQLite. Filters translate into indexed
//! WHERE clauses where they can; the pure matcher re-checks every candidate
//! row, so the SQL layer only ever has to be a superset.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::error::StoreError;
use crate::event::Event;
use crate::filter::{effective_limit, matches_any, Filter};
use crate::util::unix_now;

/// Result of an insert attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored { replaced: Option<String> },
    /// Same id already present.
    Duplicate,
    /// A newer event holds the replaceable/addressable slot.
    Older,
}

pub struct EventStore {
    pool: SqlitePool,
    /// Serialises the read-compare-swap of the replace rule.
    write_lock: tokio::sync::Mutex<()>,
}

impl EventStore {
    /// Open (or create) the database at `db_path`; `":memory:"` keeps
    /// everything in RAM. Applies the schema and any lazy migrations.
    pub async fn open(db_path: &str) -> Result<Self, StoreError> {
        let in_memory = db_path == ":memory:";
        let opts = if in_memory {
            SqliteConnectOptions::new().filename(":memory:")
        } else {
            SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };
        // An in-memory database exists per connection, so the pool must
        // never grow past one there.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            write_lock: tokio::sync::Mutex::new(()),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                pubkey TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                tags TEXT NOT NULL,
                content TEXT NOT NULL,
                sig TEXT NOT NULL,
                expires_at INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE TABLE IF NOT EXISTS deleted_events (id TEXT PRIMARY KEY)")
            .execute(&self.pool)
            .await?;

        // The d_tag column arrived after the first schema; pre-existing
        // databases upgrade in place.
        let columns = sqlx::query("PRAGMA table_info(events)")
            .fetch_all(&self.pool)
            .await?;
        let has_d_tag = columns
            .iter()
            .any(|row| row.get::<String, _>("name") == "d_tag");
        if !has_d_tag {
            sqlx::query("ALTER TABLE events ADD COLUMN d_tag TEXT")
                .execute(&self.pool)
                .await?;
        }

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_events_pubkey ON events (pubkey)",
            "CREATE INDEX IF NOT EXISTS idx_events_kind ON events (kind)",
            "CREATE INDEX IF NOT EXISTS idx_events_created_at ON events (created_at)",
            "CREATE INDEX IF NOT EXISTS idx_events_pubkey_kind ON events (pubkey, kind)",
            "CREATE INDEX IF NOT EXISTS idx_events_pubkey_kind_d ON events (pubkey, kind, d_tag)",
        ] {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Insert a regular event. Fails soft with `Duplicate` when the id is
    /// already present.
    pub async fn store_regular(&self, event: &Event) -> Result<StoreOutcome, StoreError> {
        let result = insert_query(event, None).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            Ok(StoreOutcome::Duplicate)
        } else {
            Ok(StoreOutcome::Stored { replaced: None })
        }
    }

    /// Upsert keyed by `(pubkey, kind)`.
    pub async fn store_replaceable(&self, event: &Event) -> Result<StoreOutcome, StoreError> {
        self.store_keyed(event, None).await
    }

    /// Upsert keyed by `(pubkey, kind, d_tag)`.
    pub async fn store_addressable(
        &self,
        event: &Event,
        d_tag: &str,
    ) -> Result<StoreOutcome, StoreError> {
        self.store_keyed(event, Some(d_tag)).await
    }

    async fn store_keyed(
        &self,
        event: &Event,
        d_tag: Option<&str>,
    ) -> Result<StoreOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing = match d_tag {
            Some(d) => {
                sqlx::query("SELECT id, created_at FROM events WHERE pubkey = ? AND kind = ? AND d_tag = ?")
                    .bind(&event.pubkey)
                    .bind(event.kind as i64)
                    .bind(d)
                    .fetch_all(&mut *tx)
                    .await?
            }
            None => {
                sqlx::query("SELECT id, created_at FROM events WHERE pubkey = ? AND kind = ?")
                    .bind(&event.pubkey)
                    .bind(event.kind as i64)
                    .fetch_all(&mut *tx)
                    .await?
            }
        };

        // The slot winner under the (created_at desc, id asc) total order.
        let best = existing
            .iter()
            .map(|row| (row.get::<i64, _>("created_at") as u64, row.get::<String, _>("id")))
            .min_by(|(ta, ia), (tb, ib)| tb.cmp(ta).then(ia.cmp(ib)));

        if let Some((best_created, best_id)) = &best {
            if *best_id == event.id {
                return Ok(StoreOutcome::Duplicate);
            }
            let incoming_wins = event.created_at > *best_created
                || (event.created_at == *best_created && event.id < *best_id);
            if !incoming_wins {
                return Ok(StoreOutcome::Older);
            }
            match d_tag {
                Some(d) => {
                    sqlx::query("DELETE FROM events WHERE pubkey = ? AND kind = ? AND d_tag = ?")
                        .bind(&event.pubkey)
                        .bind(event.kind as i64)
                        .bind(d)
                        .execute(&mut *tx)
                        .await?
                }
                None => {
                    sqlx::query("DELETE FROM events WHERE pubkey = ? AND kind = ?")
                        .bind(&event.pubkey)
                        .bind(event.kind as i64)
                        .execute(&mut *tx)
                        .await?
                }
            };
        }

        insert_query(event, d_tag).execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(StoreOutcome::Stored {
            replaced: best.map(|(_, id)| id),
        })
    }

    /// Stored history matching any filter, `created_at` descending with
    /// ties broken by id ascending, capped by the smallest filter limit.
    pub async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>, StoreError> {
        self.query_inner(filters, effective_limit(filters)).await
    }

    /// NIP-45: number of stored events matching any filter. Limits do not
    /// apply to counts.
    pub async fn count(&self, filters: &[Filter]) -> Result<u64, StoreError> {
        Ok(self.query_inner(filters, None).await?.len() as u64)
    }

    /// Event ids matching one filter, for set reconciliation. The filter's
    /// limit is ignored: reconciliation runs over the full id set.
    pub async fn ids_matching(&self, filter: &Filter) -> Result<Vec<[u8; 32]>, StoreError> {
        let events = self
            .query_inner(std::slice::from_ref(filter), None)
            .await?;
        let mut ids = Vec::with_capacity(events.len());
        for event in &events {
            let bytes = hex::decode(&event.id)
                .ok()
                .and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok())
                .ok_or_else(|| StoreError::CorruptRow(format!("bad id {}", event.id)))?;
            ids.push(bytes);
        }
        Ok(ids)
    }

    async fn query_inner(
        &self,
        filters: &[Filter],
        limit: Option<usize>,
    ) -> Result<Vec<Event>, StoreError> {
        if filters.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, pubkey, created_at, kind, tags, content, sig FROM events \
             WHERE (expires_at IS NULL OR expires_at > ",
        );
        qb.push_bind(unix_now() as i64);
        qb.push(") AND (");
        for (i, filter) in filters.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            push_filter_sql(&mut qb, filter);
        }
        qb.push(") ORDER BY created_at DESC, id ASC");

        // Tag and search conditions are not pushed down, so the SQL limit
        // is only safe when no filter carries one: otherwise rows the
        // matcher would prune could eat the budget.
        let sql_limit_safe = filters
            .iter()
            .all(|f| f.tag_conditions().next().is_none() && f.search.is_none());
        if let (Some(limit), true) = (limit, sql_limit_safe) {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event = decode_row(&row)?;
            if matches_any(&event, filters) {
                events.push(event);
            }
        }
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    /// Fetch one event by id, expired or not.
    pub async fn get(&self, id: &str) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query(
            "SELECT id, pubkey, created_at, kind, tags, content, sig FROM events WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| decode_row(&r)).transpose()
    }

    pub async fn has(&self, id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Tombstone an id so later re-publishes can be refused.
    pub async fn mark_deleted(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO deleted_events (id) VALUES (?)")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_deleted(&self, id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM deleted_events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Total stored events (for tests and the management surface).
    pub async fn total(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

fn insert_query<'a>(
    event: &'a Event,
    d_tag: Option<&'a str>,
) -> sqlx::query::Query<'a, Sqlite, sqlx::sqlite::SqliteArguments<'a>> {
    sqlx::query(
        "INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig, expires_at, d_tag) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT (id) DO NOTHING",
    )
    .bind(&event.id)
    .bind(&event.pubkey)
    .bind(event.created_at as i64)
    .bind(event.kind as i64)
    .bind(serde_json::to_string(&event.tags).unwrap_or_default())
    .bind(&event.content)
    .bind(&event.sig)
    .bind(event.expiration().map(|t| t as i64))
    .bind(d_tag)
}

fn push_filter_sql(qb: &mut QueryBuilder<Sqlite>, filter: &Filter) {
    qb.push("(");
    let mut any = false;

    if let Some(ids) = &filter.ids {
        push_prefix_set(qb, "id", ids, &mut any);
    }
    if let Some(authors) = &filter.authors {
        push_prefix_set(qb, "pubkey", authors, &mut any);
    }
    if let Some(kinds) = &filter.kinds {
        sep(qb, &mut any);
        if kinds.is_empty() {
            qb.push("0 = 1");
        } else {
            qb.push("kind IN (");
            let mut separated = qb.separated(", ");
            for kind in kinds {
                separated.push_bind(*kind as i64);
            }
            qb.push(")");
        }
    }
    if let Some(since) = filter.since {
        sep(qb, &mut any);
        qb.push("created_at >= ");
        qb.push_bind(since as i64);
    }
    if let Some(until) = filter.until {
        sep(qb, &mut any);
        qb.push("created_at <= ");
        qb.push_bind(until as i64);
    }

    if !any {
        qb.push("1 = 1");
    }
    qb.push(")");
}

/// `column = ?` for full-length values, `column LIKE 'prefix%'` otherwise.
/// Values are hex, so the LIKE pattern needs no escaping.
fn push_prefix_set(qb: &mut QueryBuilder<Sqlite>, column: &str, values: &[String], any: &mut bool) {
    sep(qb, any);
    if values.is_empty() {
        qb.push("0 = 1");
        return;
    }
    qb.push("(");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        if value.len() == 64 {
            qb.push(column);
            qb.push(" = ");
            qb.push_bind(value.clone());
        } else {
            qb.push(column);
            qb.push(" LIKE ");
            qb.push_bind(format!("{value}%"));
        }
    }
    qb.push(")");
}

fn sep(qb: &mut QueryBuilder<Sqlite>, any: &mut bool) {
    if *any {
        qb.push(" AND ");
    }
    *any = true;
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<Event, StoreError> {
    let tags_json: String = row.get("tags");
    let tags = serde_json::from_str(&tags_json)
        .map_err(|e| StoreError::CorruptRow(format!("tags: {e}")))?;
    Ok(Event {
        id: row.get("id"),
        pubkey: row.get("pubkey"),
        created_at: row.get::<i64, _>("created_at") as u64,
        kind: row.get::<i64, _>("kind") as u16,
        tags,
        content: row.get("content"),
        sig: row.get("sig"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{keypair, sign_event};

    async fn memory_store() -> EventStore {
        EventStore::open(":memory:").await.expect("open store")
    }

    #[tokio::test]
    async fn regular_store_and_duplicate() {
        let store = memory_store().await;
        let event = sign_event(&keypair(), 1, vec![], "hi", 100);

        assert_eq!(
            store.store_regular(&event).await.unwrap(),
            StoreOutcome::Stored { replaced: None }
        );
        assert_eq!(
            store.store_regular(&event).await.unwrap(),
            StoreOutcome::Duplicate
        );
        assert!(store.has(&event.id).await.unwrap());
    }

    #[tokio::test]
    async fn replaceable_newer_wins_either_order() {
        let kp = keypair();
        let older = sign_event(&kp, 3, vec![], "old", 100);
        let newer = sign_event(&kp, 3, vec![], "new", 101);

        for (first, second) in [(&older, &newer), (&newer, &older)] {
            let store = memory_store().await;
            store.store_replaceable(first).await.unwrap();
            let _ = store.store_replaceable(second).await.unwrap();

            let mut f = Filter::new();
            f.kinds = Some(vec![3]);
            let events = store.query(&[f]).await.unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].id, newer.id);
        }
    }

    #[tokio::test]
    async fn replaceable_older_is_refused() {
        let kp = keypair();
        let newer = sign_event(&kp, 0, vec![], "new", 200);
        let older = sign_event(&kp, 0, vec![], "old", 100);

        let store = memory_store().await;
        store.store_replaceable(&newer).await.unwrap();
        assert_eq!(
            store.store_replaceable(&older).await.unwrap(),
            StoreOutcome::Older
        );
        assert!(!store.has(&older.id).await.unwrap());
    }

    #[tokio::test]
    async fn replaceable_tie_breaks_on_smaller_id() {
        let kp = keypair();
        // Different content gives different ids at the same timestamp.
        let a = sign_event(&kp, 0, vec![], "profile a", 500);
        let b = sign_event(&kp, 0, vec![], "profile b", 500);
        let (winner, loser) = if a.id < b.id { (&a, &b) } else { (&b, &a) };

        for (first, second) in [(winner, loser), (loser, winner)] {
            let store = memory_store().await;
            store.store_replaceable(first).await.unwrap();
            let _ = store.store_replaceable(second).await.unwrap();
            assert!(store.has(&winner.id).await.unwrap());
            assert!(!store.has(&loser.id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn addressable_slots_are_keyed_by_d_tag() {
        let kp = keypair();
        let post_a = sign_event(
            &kp,
            30_023,
            vec![vec!["d".into(), "post-a".into()]],
            "a",
            100,
        );
        let post_b = sign_event(
            &kp,
            30_023,
            vec![vec!["d".into(), "post-b".into()]],
            "b",
            101,
        );

        let store = memory_store().await;
        store.store_addressable(&post_a, "post-a").await.unwrap();
        store.store_addressable(&post_b, "post-b").await.unwrap();

        let mut f = Filter::new();
        f.kinds = Some(vec![30_023]);
        f.tags.insert("#d".into(), vec!["post-a".into()]);
        let events = store.query(&[f.clone()]).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, post_a.id);

        f.tags.insert("#d".into(), vec!["post-b".into()]);
        let events = store.query(&[f]).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, post_b.id);
    }

    #[tokio::test]
    async fn addressable_replaces_same_d_tag() {
        let kp = keypair();
        let v1 = sign_event(&kp, 30_023, vec![vec!["d".into(), "p".into()]], "v1", 100);
        let v2 = sign_event(&kp, 30_023, vec![vec!["d".into(), "p".into()]], "v2", 101);

        let store = memory_store().await;
        store.store_addressable(&v1, "p").await.unwrap();
        let outcome = store.store_addressable(&v2, "p").await.unwrap();
        assert_eq!(
            outcome,
            StoreOutcome::Stored {
                replaced: Some(v1.id.clone())
            }
        );
        assert!(!store.has(&v1.id).await.unwrap());
        assert!(store.has(&v2.id).await.unwrap());
    }

    #[tokio::test]
    async fn query_orders_and_limits() {
        let store = memory_store().await;
        let kp = keypair();
        for (content, t) in [("a", 100u64), ("b", 300), ("c", 200)] {
            let event = sign_event(&kp, 1, vec![], content, t);
            store.store_regular(&event).await.unwrap();
        }

        let mut f = Filter::new();
        f.kinds = Some(vec![1]);
        let events = store.query(&[f.clone()]).await.unwrap();
        let times: Vec<u64> = events.iter().map(|e| e.created_at).collect();
        assert_eq!(times, vec![300, 200, 100]);

        f.limit = Some(2);
        let events = store.query(&[f]).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].created_at, 300);
    }

    #[tokio::test]
    async fn query_limit_survives_tag_pruning() {
        // Tag conditions are applied by the matcher after SQL, so the
        // limit must not be consumed by rows the matcher discards.
        let store = memory_store().await;
        let kp = keypair();
        for i in 0..5u64 {
            let event = sign_event(&kp, 1, vec![], &format!("plain {i}"), 100 + i);
            store.store_regular(&event).await.unwrap();
        }
        let tagged = sign_event(&kp, 1, vec![vec!["t".into(), "x".into()]], "tagged", 50);
        store.store_regular(&tagged).await.unwrap();

        let mut f = Filter::new();
        f.tags.insert("#t".into(), vec!["x".into()]);
        f.limit = Some(1);
        let events = store.query(&[f]).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, tagged.id);
    }

    #[tokio::test]
    async fn prefix_queries_hit_sql_path() {
        let store = memory_store().await;
        let event = sign_event(&keypair(), 1, vec![], "x", 100);
        store.store_regular(&event).await.unwrap();

        let mut f = Filter::new();
        f.ids = Some(vec![event.id[..10].to_string()]);
        let events = store.query(&[f]).await.unwrap();
        assert_eq!(events.len(), 1);

        let mut f = Filter::new();
        f.authors = Some(vec![event.pubkey.clone()]);
        let events = store.query(&[f]).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn delete_and_tombstone() {
        let store = memory_store().await;
        let event = sign_event(&keypair(), 1, vec![], "x", 100);
        store.store_regular(&event).await.unwrap();

        assert!(store.delete(&event.id).await.unwrap());
        store.mark_deleted(&event.id).await.unwrap();
        assert!(!store.has(&event.id).await.unwrap());
        assert!(store.is_deleted(&event.id).await.unwrap());
        // Deleting again is a no-op.
        assert!(!store.delete(&event.id).await.unwrap());
    }

    #[tokio::test]
    async fn expired_events_are_invisible_to_queries() {
        let store = memory_store().await;
        let past = unix_now() - 10;
        let event = sign_event(
            &keypair(),
            1,
            vec![vec!["expiration".into(), past.to_string()]],
            "gone",
            past.saturating_sub(100),
        );
        store.store_regular(&event).await.unwrap();

        let events = store.query(&[Filter::new()]).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn empty_filter_list_returns_nothing() {
        let store = memory_store().await;
        let event = sign_event(&keypair(), 1, vec![], "x", 100);
        store.store_regular(&event).await.unwrap();
        assert!(store.query(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn count_ignores_limits() {
        let store = memory_store().await;
        let kp = keypair();
        for i in 0..4u64 {
            let event = sign_event(&kp, 1, vec![], &format!("{i}"), 100 + i);
            store.store_regular(&event).await.unwrap();
        }
        let mut f = Filter::new();
        f.kinds = Some(vec![1]);
        f.limit = Some(1);
        assert_eq!(store.count(&[f]).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn d_tag_migration_is_lazy_and_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relay.db").display().to_string();

        // Simulate a pre-d_tag database.
        {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(
                    SqliteConnectOptions::new()
                        .filename(&path)
                        .create_if_missing(true),
                )
                .await
                .unwrap();
            sqlx::query(
                "CREATE TABLE events (
                    id TEXT PRIMARY KEY,
                    pubkey TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    kind INTEGER NOT NULL,
                    tags TEXT NOT NULL,
                    content TEXT NOT NULL,
                    sig TEXT NOT NULL,
                    expires_at INTEGER
                )",
            )
            .execute(&pool)
            .await
            .unwrap();
            pool.close().await;
        }

        // Opening through the store upgrades in place, twice over.
        for _ in 0..2 {
            let store = EventStore::open(&path).await.expect("open upgraded store");
            let event = sign_event(
                &keypair(),
                30_023,
                vec![vec!["d".into(), "slug".into()]],
                "x",
                100,
            );
            let _ = store.store_addressable(&event, "slug").await.unwrap();
            store.pool.close().await;
        }
    }
}
