use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use browse_model::{ContainerRef, DistinctValue, IndexEntry};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::column_policy::{ColumnLimits, StoreCeilings};
use crate::{validate_entry, BatchOp, BrowseQuery, BrowseStore, RowKind, SortOrder, StoreError, StoredRow, WriteBatch};

/// SQLite has no practical column ceiling for TEXT.
pub const SQLITE_CEILINGS: StoreCeilings = StoreCeilings::UNLIMITED;

/// SQLite-backed browse tables: distinct values, entries and container mappings.
pub struct SqliteBrowseStore {
    conn: Mutex<Option<Connection>>,
    limits: ColumnLimits,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::Timeout(e.to_string())
            }
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

impl SqliteBrowseStore {
    /// Open an in-memory store and initialize schema.
    pub fn open_in_memory(limits: ColumnLimits) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, limits, Duration::from_millis(0), false)
    }

    /// Open a file-backed store at `path` and initialize schema if absent.
    pub fn open<P: AsRef<Path>>(path: P, limits: ColumnLimits, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        info!(path = ?path.as_ref(), "opened sqlite browse store");
        Self::init(conn, limits, busy_timeout, true)
    }

    fn init(conn: Connection, limits: ColumnLimits, busy_timeout: Duration, on_disk: bool) -> Result<Self, StoreError> {
        if on_disk {
            // Pragmas for durability and concurrency
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "FULL")?;
        }
        // Zero disables waiting: a locked database fails at once.
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS browse_distinct (
                id INTEGER PRIMARY KEY,
                index_name TEXT NOT NULL,
                value TEXT NOT NULL,
                sort_value TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_distinct_value ON browse_distinct(index_name, value);
            CREATE INDEX IF NOT EXISTS idx_distinct_sort ON browse_distinct(index_name, sort_value);

            CREATE TABLE IF NOT EXISTS browse_entries (
                index_name TEXT NOT NULL,
                id INTEGER NOT NULL,
                item_id INTEGER NOT NULL,
                sort_value TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (index_name, id, item_id)
            );
            CREATE INDEX IF NOT EXISTS idx_entries_item ON browse_entries(index_name, item_id);
            CREATE INDEX IF NOT EXISTS idx_entries_sort ON browse_entries(index_name, sort_value);
            CREATE INDEX IF NOT EXISTS idx_entries_any_item ON browse_entries(item_id);

            CREATE TABLE IF NOT EXISTS browse_containers (
                container_type TEXT NOT NULL,
                container_id INTEGER NOT NULL,
                item_id INTEGER NOT NULL,
                PRIMARY KEY (container_type, container_id, item_id)
            );
            CREATE INDEX IF NOT EXISTS idx_containers_item ON browse_containers(item_id);

            CREATE TABLE IF NOT EXISTS browse_item_sort (
                item_id INTEGER NOT NULL,
                option_name TEXT NOT NULL,
                sort_value TEXT NOT NULL,
                PRIMARY KEY (item_id, option_name)
            );
            CREATE INDEX IF NOT EXISTS idx_item_sort_option ON browse_item_sort(option_name, sort_value);
            "#,
        )?;
        Ok(Self { conn: Mutex::new(Some(conn)), limits })
    }

    fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".into()))?;
        let conn = guard.as_mut().ok_or(StoreError::NotOpen)?;
        f(conn)
    }
}

/// Entry rows of one index, joined to the requested sort option.
/// Returns the `FROM ... WHERE` clause, its parameters and the column rows are ordered by.
fn entry_source(index: &str, query: &BrowseQuery) -> (String, Vec<rusqlite::types::Value>, &'static str) {
    match &query.sort_by {
        Some(option) => (
            " FROM browse_entries e \
             LEFT JOIN browse_item_sort s ON s.item_id = e.item_id AND s.option_name = ? \
             WHERE e.index_name = ?"
                .to_string(),
            vec![option.clone().into(), index.to_string().into()],
            "IFNULL(s.sort_value, '')",
        ),
        None => (" FROM browse_entries e WHERE e.index_name = ?".to_string(), vec![index.to_string().into()], "e.sort_value"),
    }
}

/// `AND substr(col, 1, n) = ?` when a prefix filter is set.
fn push_prefix(sql: &mut String, col: &str, query: &BrowseQuery, params: &mut Vec<rusqlite::types::Value>) {
    if let Some(prefix) = &query.starts_with {
        sql.push_str(&format!(" AND substr({col}, 1, ?) = ?"));
        params.push((prefix.chars().count() as i64).into());
        params.push(prefix.clone().into());
    }
}

fn push_order_and_page(sql: &mut String, cols: &[&str], query: &BrowseQuery, params: &mut Vec<rusqlite::types::Value>) {
    let dir = match query.order {
        SortOrder::Ascending => "ASC",
        SortOrder::Descending => "DESC",
    };
    let order: Vec<String> = cols.iter().map(|c| format!("{c} {dir}")).collect();
    sql.push_str(" ORDER BY ");
    sql.push_str(&order.join(", "));
    sql.push_str(" LIMIT ? OFFSET ?");
    params.push(i64::try_from(query.limit).unwrap_or(i64::MAX).into());
    params.push(i64::try_from(query.offset).unwrap_or(i64::MAX).into());
}

impl BrowseStore for SqliteBrowseStore {
    fn name(&self) -> &'static str { "sqlite" }

    fn limits(&self) -> &ColumnLimits { &self.limits }

    fn close(&self) -> Result<(), StoreError> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".into()))?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| StoreError::from(e))?;
            debug!("closed sqlite browse store");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.conn.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn apply(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        for op in &batch.ops {
            if let BatchOp::Write { entries, .. } = op {
                entries.iter().try_for_each(validate_entry)?;
            }
        }
        let limits = &self.limits;
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            {
                let mut upsert = tx.prepare(
                    r#"
                    INSERT INTO browse_entries (index_name, id, item_id, sort_value, value)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(index_name, id, item_id) DO UPDATE SET
                        sort_value=excluded.sort_value,
                        value=excluded.value
                    "#,
                )?;
                let mut delete = tx.prepare("DELETE FROM browse_entries WHERE index_name = ?1 AND id = ?2 AND item_id = ?3")?;
                for op in &batch.ops {
                    match op {
                        BatchOp::Write { index, entries } => {
                            for e in entries {
                                let sort_value = limits.truncate_sort_value(&e.sort_key);
                                let value = limits.truncate_value(&e.value);
                                upsert.execute(params![index, e.id, e.item_id, &*sort_value, &*value])?;
                            }
                        }
                        BatchOp::Remove { index, keys } => {
                            for k in keys {
                                delete.execute(params![index, k.id, k.item_id])?;
                            }
                        }
                    }
                }
                if let Some(containers) = &batch.containers {
                    tx.execute("DELETE FROM browse_containers WHERE item_id = ?1", [batch.item_id])?;
                    let mut insert = tx.prepare(
                        "INSERT OR IGNORE INTO browse_containers (container_type, container_id, item_id) VALUES (?1, ?2, ?3)",
                    )?;
                    for c in containers {
                        insert.execute(params![c.entity_type.as_str(), c.id, batch.item_id])?;
                    }
                }
                if let Some(keys) = &batch.sort_keys {
                    tx.execute("DELETE FROM browse_item_sort WHERE item_id = ?1", [batch.item_id])?;
                    let mut insert =
                        tx.prepare("INSERT INTO browse_item_sort (item_id, option_name, sort_value) VALUES (?1, ?2, ?3)")?;
                    for (option, key) in keys {
                        insert.execute(params![batch.item_id, option, &*limits.truncate_sort_value(key)])?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn resolve_distinct_id(&self, index: &str, value: &str, sort_value: &str) -> Result<i64, StoreError> {
        let value = self.limits.truncate_value(value);
        let sort_value = self.limits.truncate_sort_value(sort_value);
        self.with_conn(|conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM browse_distinct WHERE index_name = ?1 AND value = ?2",
                    params![index, &*value],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(id);
            }
            conn.execute(
                "INSERT INTO browse_distinct (index_name, value, sort_value) VALUES (?1, ?2, ?3)",
                params![index, &*value, &*sort_value],
            )?;
            let id = conn.last_insert_rowid();
            debug!(index, id, "allocated distinct value");
            Ok(id)
        })
    }

    fn read_distinct_mapping(&self, item_id: i64, index: &str) -> Result<BTreeSet<i64>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM browse_entries WHERE index_name = ?1 AND item_id = ?2")?;
            let rows = stmt.query_map(params![index, item_id], |r| r.get::<_, i64>(0))?;
            let mut out = BTreeSet::new();
            for r in rows { out.insert(r?); }
            Ok(out)
        })
    }

    fn read_item_entry(&self, index: &str, item_id: i64) -> Result<Option<IndexEntry>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT sort_value, value FROM browse_entries WHERE index_name = ?1 AND id = ?2 AND item_id = ?2",
                    params![index, item_id],
                    |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
                )
                .optional()?;
            Ok(row.map(|(sort_key, value)| IndexEntry { index: index.to_string(), id: item_id, sort_key, value, item_id }))
        })
    }

    fn clear_index(&self, index: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let entries = tx.execute("DELETE FROM browse_entries WHERE index_name = ?1", [index])?;
            let distinct = tx.execute("DELETE FROM browse_distinct WHERE index_name = ?1", [index])?;
            tx.commit()?;
            info!(index, entries, distinct, "cleared browse index");
            Ok(())
        })
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for table in ["browse_entries", "browse_distinct", "browse_containers", "browse_item_sort"] {
                tx.execute(&format!("DELETE FROM {table}"), [])?;
            }
            tx.commit()?;
            info!("cleared all browse indexes");
            Ok(())
        })
    }

    fn indexed_item_ids(&self, index: &str) -> Result<BTreeSet<i64>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT item_id FROM browse_entries WHERE index_name = ?1")?;
            let rows = stmt.query_map([index], |r| r.get::<_, i64>(0))?;
            let mut out = BTreeSet::new();
            for r in rows { out.insert(r?); }
            Ok(out)
        })
    }

    fn known_item_ids(&self) -> Result<BTreeSet<i64>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT item_id FROM browse_entries \
                 UNION SELECT item_id FROM browse_containers \
                 UNION SELECT item_id FROM browse_item_sort",
            )?;
            let rows = stmt.query_map([], |r| r.get::<_, i64>(0))?;
            let mut out = BTreeSet::new();
            for r in rows { out.insert(r?); }
            Ok(out)
        })
    }

    fn prune_distinct(&self, index: &str) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM browse_distinct WHERE index_name = ?1 AND id NOT IN \
                 (SELECT id FROM browse_entries WHERE index_name = ?1)",
                [index],
            )?;
            if n > 0 {
                debug!(index, pruned = n, "pruned distinct values");
            }
            Ok(n)
        })
    }

    fn remove_item(&self, item_id: i64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM browse_entries WHERE item_id = ?1", [item_id])?;
            tx.execute("DELETE FROM browse_containers WHERE item_id = ?1", [item_id])?;
            tx.execute("DELETE FROM browse_item_sort WHERE item_id = ?1", [item_id])?;
            tx.commit()?;
            Ok(())
        })
    }

    fn count_items(&self, container: &ContainerRef) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT count(DISTINCT item_id) FROM browse_containers WHERE container_type = ?1 AND container_id = ?2",
                params![container.entity_type.as_str(), container.id],
                |r| r.get(0),
            )?;
            Ok(n.max(0) as u64)
        })
    }

    fn browse_values(&self, index: &str, query: &BrowseQuery) -> Result<Vec<DistinctValue>, StoreError> {
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT d.id, d.value, d.sort_value FROM browse_distinct d \
                 WHERE d.index_name = ? \
                 AND EXISTS (SELECT 1 FROM browse_entries e WHERE e.index_name = d.index_name AND e.id = d.id)",
            );
            let mut params: Vec<rusqlite::types::Value> = vec![index.to_string().into()];
            push_prefix(&mut sql, "d.sort_value", query, &mut params);
            push_order_and_page(&mut sql, &["d.sort_value", "d.id"], query, &mut params);

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
                Ok(DistinctValue { id: r.get(0)?, value: r.get(1)?, sort_key: r.get(2)? })
            })?;
            let mut out = Vec::new();
            for r in rows { out.push(r?); }
            Ok(out)
        })
    }

    fn browse_items(&self, index: &str, query: &BrowseQuery) -> Result<Vec<IndexEntry>, StoreError> {
        self.with_conn(|conn| {
            let (source, mut params, key) = entry_source(index, query);
            let mut sql = format!("SELECT e.id, e.item_id, e.sort_value, e.value{source}");
            push_prefix(&mut sql, key, query, &mut params);
            push_order_and_page(&mut sql, &[key, "e.item_id", "e.id"], query, &mut params);

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
                Ok(IndexEntry {
                    index: index.to_string(),
                    id: r.get(0)?,
                    item_id: r.get(1)?,
                    sort_key: r.get(2)?,
                    value: r.get(3)?,
                })
            })?;
            let mut out = Vec::new();
            for r in rows { out.push(r?); }
            Ok(out)
        })
    }

    fn items_for_value(&self, index: &str, distinct_id: i64, query: &BrowseQuery) -> Result<Vec<i64>, StoreError> {
        self.with_conn(|conn| {
            let (source, mut params, key) = entry_source(index, query);
            let mut sql = format!("SELECT e.item_id{source} AND e.id = ?");
            params.push(distinct_id.into());
            if query.sort_by.is_some() {
                push_prefix(&mut sql, key, query, &mut params);
                push_order_and_page(&mut sql, &[key, "e.item_id"], query, &mut params);
            } else {
                push_order_and_page(&mut sql, &["e.item_id"], query, &mut params);
            }

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| r.get::<_, i64>(0))?;
            let mut out = Vec::new();
            for r in rows { out.push(r?); }
            Ok(out)
        })
    }

    fn entry_count(&self, index: &str) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT count(*) FROM browse_entries WHERE index_name = ?1", [index], |r| r.get(0))?;
            Ok(n.max(0) as u64)
        })
    }

    fn snapshot(&self) -> Result<Vec<StoredRow>, StoreError> {
        self.with_conn(|conn| {
            let mut out = Vec::new();
            {
                let mut stmt = conn.prepare("SELECT index_name, id, value, sort_value FROM browse_distinct")?;
                let rows = stmt.query_map([], |r| {
                    Ok(StoredRow {
                        kind: RowKind::Distinct,
                        index: r.get(0)?,
                        id: r.get(1)?,
                        item_id: None,
                        value: r.get(2)?,
                        sort_key: r.get(3)?,
                    })
                })?;
                for r in rows { out.push(r?); }
            }
            {
                let mut stmt = conn.prepare("SELECT index_name, id, item_id, value, sort_value FROM browse_entries")?;
                let rows = stmt.query_map([], |r| {
                    Ok(StoredRow {
                        kind: RowKind::Entry,
                        index: r.get(0)?,
                        id: r.get(1)?,
                        item_id: Some(r.get(2)?),
                        value: r.get(3)?,
                        sort_key: r.get(4)?,
                    })
                })?;
                for r in rows { out.push(r?); }
            }
            {
                let mut stmt = conn.prepare("SELECT container_type, container_id, item_id FROM browse_containers")?;
                let rows = stmt.query_map([], |r| {
                    Ok(StoredRow {
                        kind: RowKind::Container,
                        index: r.get(0)?,
                        id: r.get(1)?,
                        item_id: Some(r.get(2)?),
                        value: String::new(),
                        sort_key: String::new(),
                    })
                })?;
                for r in rows { out.push(r?); }
            }
            {
                let mut stmt = conn.prepare("SELECT option_name, item_id, sort_value FROM browse_item_sort")?;
                let rows = stmt.query_map([], |r| {
                    let item_id: i64 = r.get(1)?;
                    Ok(StoredRow {
                        kind: RowKind::SortKey,
                        index: r.get(0)?,
                        id: item_id,
                        item_id: Some(item_id),
                        value: String::new(),
                        sort_key: r.get(2)?,
                    })
                })?;
                for r in rows { out.push(r?); }
            }
            out.sort();
            Ok(out)
        })
    }
}
