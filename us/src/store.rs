//! SQLite-backed record store

use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::{Filter, FilterOp, IndexValue, Record, Result, StoreError};

/// The embedded record store
///
/// One SQLite database holds every collection. Each collection gets a
/// payload table (`id, payload, updated_at`) and an index table
/// (`id, field, value`) used by [`Store::list`]. All mutations are
/// upserts inside a transaction so concurrent callers behind the state
/// actor can never leave a record half-written.
pub struct Store {
    conn: Connection,
    db_path: PathBuf,
    known_collections: HashSet<String>,
}

impl Store {
    /// Open (or create) the database at the given file path
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        info!(db_path = %db_path.display(), "Opened store");

        Ok(Self {
            conn,
            db_path,
            known_collections: HashSet::new(),
        })
    }

    /// Path to the underlying database file
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Validate a collection name and ensure its tables exist
    fn ensure_collection(&mut self, collection: &str) -> Result<()> {
        if self.known_collections.contains(collection) {
            return Ok(());
        }

        if collection.is_empty()
            || !collection
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(StoreError::InvalidCollection(collection.to_string()));
        }

        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {c} (
                 id TEXT PRIMARY KEY,
                 payload TEXT NOT NULL,
                 updated_at INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS {c}_idx (
                 id TEXT NOT NULL,
                 field TEXT NOT NULL,
                 value TEXT NOT NULL,
                 PRIMARY KEY (id, field)
             );
             CREATE INDEX IF NOT EXISTS {c}_idx_fv ON {c}_idx (field, value);",
            c = collection
        ))?;

        self.known_collections.insert(collection.to_string());
        Ok(())
    }

    /// Insert a new record, erroring if the ID already exists
    pub fn create<R: Record>(&mut self, record: R) -> Result<String> {
        let collection = R::collection_name();
        self.ensure_collection(collection)?;

        let id = record.id().to_string();
        let exists: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT id FROM {} WHERE id = ?1", collection),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::Duplicate(id));
        }

        self.write_record(collection, &record)?;
        debug!(collection, %id, "Created record");
        Ok(id)
    }

    /// Upsert a record (insert or replace payload and indexes)
    pub fn update<R: Record>(&mut self, record: R) -> Result<()> {
        let collection = R::collection_name();
        self.ensure_collection(collection)?;
        self.write_record(collection, &record)?;
        debug!(collection, id = %record.id(), "Upserted record");
        Ok(())
    }

    fn write_record<R: Record>(&mut self, collection: &str, record: &R) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let fields = record.indexed_fields();

        let tx = self.conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO {c} (id, payload, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET payload = ?2, updated_at = ?3",
                c = collection
            ),
            params![record.id(), payload, record.updated_at()],
        )?;
        tx.execute(
            &format!("DELETE FROM {}_idx WHERE id = ?1", collection),
            params![record.id()],
        )?;
        for (field, value) in &fields {
            tx.execute(
                &format!("INSERT INTO {}_idx (id, field, value) VALUES (?1, ?2, ?3)", collection),
                params![record.id(), field, value.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Get a record by ID
    pub fn get<R: Record>(&mut self, id: &str) -> Result<Option<R>> {
        let collection = R::collection_name();
        self.ensure_collection(collection)?;

        let payload: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT payload FROM {} WHERE id = ?1", collection),
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    /// List records matching all filters (no filters = everything)
    ///
    /// Results are ordered by updated_at ascending, then ID, so repeated
    /// queries over unchanged data are stable.
    pub fn list<R: Record>(&mut self, filters: &[Filter]) -> Result<Vec<R>> {
        let collection = R::collection_name();
        self.ensure_collection(collection)?;

        let mut sql = format!("SELECT r.payload FROM {c} r", c = collection);
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();

        for (i, filter) in filters.iter().enumerate() {
            let alias = format!("f{}", i);
            match filter.op {
                FilterOp::Eq => {
                    sql.push_str(&format!(
                        " JOIN {c}_idx {a} ON {a}.id = r.id AND {a}.field = ?{p1} AND {a}.value = ?{p2}",
                        c = collection,
                        a = alias,
                        p1 = values.len() + 1,
                        p2 = values.len() + 2,
                    ));
                    values.push(filter.field.clone());
                    values.push(filter.value.to_string());
                }
                FilterOp::Ne => {
                    clauses.push(format!(
                        "r.id NOT IN (SELECT id FROM {c}_idx WHERE field = ?{p1} AND value = ?{p2})",
                        c = collection,
                        p1 = values.len() + 1,
                        p2 = values.len() + 2,
                    ));
                    values.push(filter.field.clone());
                    values.push(filter.value.to_string());
                }
            }
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY r.updated_at ASC, r.id ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
            row.get::<_, String>(0)
        })?;

        let mut records = Vec::new();
        for payload in rows {
            records.push(serde_json::from_str(&payload?)?);
        }
        Ok(records)
    }

    /// Count records in a collection
    pub fn count<R: Record>(&mut self) -> Result<usize> {
        let collection = R::collection_name();
        self.ensure_collection(collection)?;
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", collection), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Delete a record by ID
    pub fn delete<R: Record>(&mut self, id: &str) -> Result<()> {
        let collection = R::collection_name();
        self.ensure_collection(collection)?;

        let tx = self.conn.transaction()?;
        tx.execute(&format!("DELETE FROM {} WHERE id = ?1", collection), params![id])?;
        tx.execute(&format!("DELETE FROM {}_idx WHERE id = ?1", collection), params![id])?;
        tx.commit()?;
        debug!(collection, %id, "Deleted record");
        Ok(())
    }

    /// Delete all records whose indexed field matches the given value
    ///
    /// Returns the number of records deleted.
    pub fn delete_by_index<R: Record>(&mut self, field: &str, value: IndexValue) -> Result<usize> {
        let collection = R::collection_name();
        self.ensure_collection(collection)?;

        let tx = self.conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id FROM {}_idx WHERE field = ?1 AND value = ?2",
                collection
            ))?;
            let rows = stmt.query_map(params![field, value.to_string()], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        for id in &ids {
            tx.execute(&format!("DELETE FROM {} WHERE id = ?1", collection), params![id])?;
            tx.execute(&format!("DELETE FROM {}_idx WHERE id = ?1", collection), params![id])?;
        }
        tx.commit()?;

        debug!(collection, field, count = ids.len(), "Deleted by index");
        Ok(ids.len())
    }

    /// Rebuild the index table for a record type from payloads
    ///
    /// Returns the number of records re-indexed. Needed after a record
    /// type gains or changes indexed fields.
    pub fn rebuild_indexes<R: Record>(&mut self) -> Result<usize> {
        let collection = R::collection_name();
        self.ensure_collection(collection)?;

        let records: Vec<R> = self.list(&[])?;
        let tx = self.conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}_idx", collection), [])?;
        for record in &records {
            for (field, value) in record.indexed_fields() {
                tx.execute(
                    &format!("INSERT INTO {}_idx (id, field, value) VALUES (?1, ?2, ?3)", collection),
                    params![record.id(), field, value.to_string()],
                )?;
            }
        }
        tx.commit()?;

        debug!(collection, count = records.len(), "Rebuilt indexes");
        Ok(records.len())
    }

    /// List collection names present in the database (for inspection)
    pub fn collections(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE '%_idx' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Dump raw payloads from a collection (for inspection)
    pub fn dump(&mut self, collection: &str) -> Result<Vec<(String, String)>> {
        self.ensure_collection(collection)?;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id, payload FROM {} ORDER BY updated_at", collection))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}
