//! Record persistence and search.
//!
//! The free functions take a `&Connection` so callers can compose several
//! of them inside one [`Database::transaction`]. [`RecordRepository`] wraps
//! each in its own connection scope.

use std::sync::Arc;

use rusqlite::{params, params_from_iter, Connection, Params};
use tracing::debug;

use mo_core::error::{MoError, Result};
use mo_core::types::{FsProbe, PathProbe, Record, RecordId, RecordQuery};

use crate::db::Database;
use crate::filter::{self, TagJoin};
use crate::mapper::{join_groups, row_to_record};
use crate::tags;

fn fetch<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Record>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| MoError::Storage(format!("Record query prepare failed: {}", e)))?;
    let rows = stmt
        .query_map(params, |row| Ok(row_to_record(row)))
        .map_err(|e| MoError::Storage(format!("Record query failed: {}", e)))?;

    let mut records = Vec::new();
    for row in rows {
        let record = row.map_err(|e| MoError::Storage(e.to_string()))??;
        records.push(record);
    }
    Ok(records)
}

/// Every record with its tags, ordered by id.
pub fn get_all(conn: &Connection) -> Result<Vec<Record>> {
    fetch(conn, &filter::select_sql(TagJoin::Left, None), params![])
}

pub fn get_by_id(conn: &Connection, id: RecordId) -> Result<Option<Record>> {
    let sql = filter::select_sql(TagJoin::Left, Some("r.id = ?1"));
    Ok(fetch(conn, &sql, params![id])?.into_iter().next())
}

/// Records with exactly this name. Untagged records are not returned.
pub fn get_by_name(conn: &Connection, name: &str) -> Result<Vec<Record>> {
    let sql = filter::select_sql(TagJoin::Inner, Some("r.name = ?1"));
    fetch(conn, &sql, params![name])
}

/// Records whose landing-page URL is exactly `url`. Untagged records are
/// not returned.
pub fn get_by_url(conn: &Connection, url: &str) -> Result<Vec<Record>> {
    let sql = filter::select_sql(TagJoin::Inner, Some("r.url = ?1"));
    fetch(conn, &sql, params![url])
}

/// Records that download to `path`/`filename`. Untagged records are not
/// returned.
pub fn get_by_download_destination(
    conn: &Connection,
    path: &str,
    filename: &str,
) -> Result<Vec<Record>> {
    let sql = filter::select_sql(
        TagJoin::Inner,
        Some("r.download_path = ?1 AND r.download_filename = ?2"),
    );
    fetch(conn, &sql, params![path, filename])
}

/// Records having at least one tag whose name contains `fragment`
/// (case-insensitive), each with its full tag set.
pub fn find_by_tag(conn: &Connection, fragment: &str) -> Result<Vec<Record>> {
    let sql = filter::select_sql(
        TagJoin::Left,
        Some(
            "r.id IN (SELECT ts2.record_id FROM TagSet ts2
                      JOIN Tag t2 ON t2.id = ts2.tag_id
                      WHERE t2.name LIKE ?1 ESCAPE '\\')",
        ),
    );
    let pattern = filter::like_contains(&fragment.trim().to_lowercase());
    fetch(conn, &sql, params![pattern])
}

/// The SQL half of a search: every criterion except download state.
pub fn query_rows(conn: &Connection, query: &RecordQuery) -> Result<Vec<Record>> {
    let composed = filter::compose(query);
    debug!(sql = %composed.sql, params = composed.params.len(), "Composed record query");
    fetch(conn, &composed.sql, params_from_iter(composed.params.iter()))
}

/// Non-empty `location` values of all records.
pub fn all_locations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT location FROM Record WHERE location IS NOT NULL AND location != '' ORDER BY id")
        .map_err(|e| MoError::Storage(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| MoError::Storage(e.to_string()))?;

    let mut locations = Vec::new();
    for row in rows {
        locations.push(row.map_err(|e| MoError::Storage(e.to_string()))?);
    }
    Ok(locations)
}

/// Insert a record and its tags. Returns the assigned id.
///
/// Any `id` already on the record is ignored. Run inside a transaction so
/// a rejected tag name does not leave a half-written record.
pub fn add(conn: &Connection, record: &Record) -> Result<RecordId> {
    let groups = join_groups(&record.groups)?;
    conn.execute(
        r#"INSERT INTO Record (name, model_type, download_url, url, download_path,
                download_filename, preview_url, description, positive_prompts,
                negative_prompts, sha256_hash, md5_hash, created_at, "groups",
                subdir, location, weight, backup_url)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"#,
        params![
            record.name,
            record.model_type.as_str(),
            record.download_url,
            record.url,
            record.download_path,
            record.download_filename,
            record.preview_url,
            record.description,
            record.positive_prompts,
            record.negative_prompts,
            record.sha256_hash,
            record.md5_hash,
            record.created_at,
            groups,
            record.subdir,
            record.location,
            record.weight,
            record.backup_url,
        ],
    )
    .map_err(|e| MoError::Storage(format!("Failed to add record: {}", e)))?;

    let id = conn.last_insert_rowid();
    if !record.tags.is_empty() {
        tags::set_tags_for(conn, id, &record.tags)?;
    }
    Ok(id)
}

/// Overwrite every stored field of an existing record except `created_at`,
/// then make `record.tags` its tag set.
pub fn update(conn: &Connection, record: &Record) -> Result<()> {
    let id = record
        .id
        .ok_or_else(|| MoError::invalid("record", "cannot update a record that has no id"))?;
    let groups = join_groups(&record.groups)?;

    let changed = conn
        .execute(
            r#"UPDATE Record SET name = ?1, model_type = ?2, download_url = ?3, url = ?4,
                    download_path = ?5, download_filename = ?6, preview_url = ?7,
                    description = ?8, positive_prompts = ?9, negative_prompts = ?10,
                    sha256_hash = ?11, md5_hash = ?12, "groups" = ?13, subdir = ?14,
                    location = ?15, weight = ?16, backup_url = ?17
               WHERE id = ?18"#,
            params![
                record.name,
                record.model_type.as_str(),
                record.download_url,
                record.url,
                record.download_path,
                record.download_filename,
                record.preview_url,
                record.description,
                record.positive_prompts,
                record.negative_prompts,
                record.sha256_hash,
                record.md5_hash,
                groups,
                record.subdir,
                record.location,
                record.weight,
                record.backup_url,
                id,
            ],
        )
        .map_err(|e| MoError::Storage(format!("Failed to update record: {}", e)))?;

    if changed == 0 {
        return Err(MoError::not_found("record", id));
    }
    tags::set_tags_for(conn, id, &record.tags)
}

/// Delete a record. Its tag associations go with it; the tags themselves
/// stay until the next reconciliation.
pub fn remove(conn: &Connection, id: RecordId) -> Result<()> {
    let removed = conn
        .execute("DELETE FROM Record WHERE id = ?1", params![id])
        .map_err(|e| MoError::Storage(format!("Failed to remove record: {}", e)))?;
    if removed == 0 {
        return Err(MoError::not_found("record", id));
    }
    Ok(())
}

/// Record operations against a shared [`Database`].
pub struct RecordRepository {
    db: Arc<Database>,
    probe: Arc<dyn PathProbe>,
}

impl RecordRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_probe(db, Arc::new(FsProbe))
    }

    /// Use `probe` instead of the filesystem to decide download state.
    pub fn with_probe(db: Arc<Database>, probe: Arc<dyn PathProbe>) -> Self {
        Self { db, probe }
    }

    pub fn get_all(&self) -> Result<Vec<Record>> {
        self.db.with_conn(get_all)
    }

    pub fn get_by_id(&self, id: RecordId) -> Result<Option<Record>> {
        self.db.with_conn(|conn| get_by_id(conn, id))
    }

    pub fn get_by_name(&self, name: &str) -> Result<Vec<Record>> {
        self.db.with_conn(|conn| get_by_name(conn, name))
    }

    pub fn get_by_url(&self, url: &str) -> Result<Vec<Record>> {
        self.db.with_conn(|conn| get_by_url(conn, url))
    }

    pub fn get_by_download_destination(&self, path: &str, filename: &str) -> Result<Vec<Record>> {
        self.db
            .with_conn(|conn| get_by_download_destination(conn, path, filename))
    }

    pub fn find_by_tag(&self, fragment: &str) -> Result<Vec<Record>> {
        self.db.with_conn(|conn| find_by_tag(conn, fragment))
    }

    /// Search records. Download state is checked through the probe after
    /// the SQL filter has run.
    pub fn query(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        if !query.include_downloaded && !query.include_not_downloaded {
            return Ok(Vec::new());
        }
        let rows = self.db.with_conn(|conn| query_rows(conn, query))?;
        Ok(rows
            .into_iter()
            .filter(|record| query.accepts_download_state(record.is_downloaded(self.probe.as_ref())))
            .collect())
    }

    /// Insert a record with its tags in one transaction.
    pub fn add(&self, record: &Record) -> Result<RecordId> {
        self.db.transaction(|conn| add(conn, record))
    }

    pub fn update(&self, record: &Record) -> Result<()> {
        self.db.transaction(|conn| update(conn, record))
    }

    pub fn remove(&self, id: RecordId) -> Result<()> {
        self.db.with_conn(|conn| remove(conn, id))
    }

    pub fn all_locations(&self) -> Result<Vec<String>> {
        self.db.with_conn(all_locations)
    }
}
