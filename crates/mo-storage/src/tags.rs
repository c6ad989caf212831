//! Tag catalogue and per-record tag reconciliation.

use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;

use mo_core::error::{MoError, Result};
use mo_core::types::{RecordId, TagId, TagKey};

use crate::db::Database;
use crate::mapper::DELIMITER;

/// Lower-case, drop empties and duplicates. Names containing the
/// aggregation delimiter are rejected.
pub fn normalize_tags<I, S>(names: I) -> Result<BTreeSet<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized = BTreeSet::new();
    for name in names {
        let name = name.as_ref().trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        if name.contains(DELIMITER) {
            return Err(MoError::invalid(
                "tag",
                format!("'{}' contains '{}'", name, DELIMITER),
            ));
        }
        normalized.insert(name);
    }
    Ok(normalized)
}

/// Every tag name.
pub fn all_tags(conn: &Connection) -> Result<BTreeSet<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM Tag WHERE name IS NOT NULL")
        .map_err(|e| MoError::Storage(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| MoError::Storage(e.to_string()))?;

    let mut names = BTreeSet::new();
    for row in rows {
        names.insert(row.map_err(|e| MoError::Storage(e.to_string()))?);
    }
    Ok(names)
}

/// Insert a tag with no associations. The name is stored lower-cased.
pub fn add_tag(conn: &Connection, name: &str) -> Result<TagId> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return Err(MoError::invalid("tag", "name must not be empty"));
    }
    if name.contains(DELIMITER) {
        return Err(MoError::invalid(
            "tag",
            format!("'{}' contains '{}'", name, DELIMITER),
        ));
    }

    match conn.execute("INSERT INTO Tag (name) VALUES (?1)", params![name]) {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
            Err(MoError::DuplicateTag(name))
        }
        Err(e) => Err(MoError::Storage(format!("Failed to add tag: {}", e))),
    }
}

/// Delete a tag by name or id. Its associations go with it.
pub fn remove_tag(conn: &Connection, key: &TagKey) -> Result<()> {
    let removed = match key {
        TagKey::Name(name) => conn.execute(
            "DELETE FROM Tag WHERE name = ?1",
            params![name.trim().to_lowercase()],
        ),
        TagKey::Id(id) => conn.execute("DELETE FROM Tag WHERE id = ?1", params![id]),
    }
    .map_err(|e| MoError::Storage(format!("Failed to remove tag: {}", e)))?;

    if removed == 0 {
        return Err(MoError::not_found("tag", key));
    }
    Ok(())
}

/// Tag names associated with a record.
pub fn tags_for(conn: &Connection, record_id: RecordId) -> Result<BTreeSet<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT t.name FROM TagSet ts
             JOIN Tag t ON t.id = ts.tag_id
             WHERE ts.record_id = ?1",
        )
        .map_err(|e| MoError::Storage(e.to_string()))?;
    let rows = stmt
        .query_map(params![record_id], |row| row.get::<_, String>(0))
        .map_err(|e| MoError::Storage(e.to_string()))?;

    let mut names = BTreeSet::new();
    for row in rows {
        names.insert(row.map_err(|e| MoError::Storage(e.to_string()))?);
    }
    Ok(names)
}

fn record_exists(conn: &Connection, record_id: RecordId) -> Result<bool> {
    conn.query_row("SELECT 1 FROM Record WHERE id = ?1", params![record_id], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
        .map_err(|e| MoError::Storage(e.to_string()))
}

fn tag_id(conn: &Connection, name: &str) -> Result<TagId> {
    conn.query_row("SELECT id FROM Tag WHERE name = ?1", params![name], |row| row.get(0))
        .map_err(|e| MoError::Storage(format!("Failed to look up tag '{}': {}", name, e)))
}

/// Make `names` the exact tag set of a record.
///
/// Missing tags are created, existing ones reused, and tags left without
/// any record afterwards are deleted. Does not open its own transaction;
/// run it inside one so a failure leaves the previous set intact.
pub fn set_tags_for<I, S>(conn: &Connection, record_id: RecordId, names: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let desired = normalize_tags(names)?;
    if !record_exists(conn, record_id)? {
        return Err(MoError::not_found("record", record_id));
    }

    let current = tags_for(conn, record_id)?;
    let added: Vec<&String> = desired.difference(&current).collect();
    let dropped = current.difference(&desired).count();

    let mut ids = Vec::with_capacity(desired.len());
    for name in &desired {
        if !current.contains(name) {
            conn.execute("INSERT OR IGNORE INTO Tag (name) VALUES (?1)", params![name])
                .map_err(|e| MoError::Storage(format!("Failed to create tag: {}", e)))?;
        }
        ids.push(tag_id(conn, name)?);
    }

    conn.execute("DELETE FROM TagSet WHERE record_id = ?1", params![record_id])
        .map_err(|e| MoError::Storage(format!("Failed to clear tag links: {}", e)))?;
    for id in &ids {
        conn.execute(
            "INSERT INTO TagSet (record_id, tag_id) VALUES (?1, ?2)",
            params![record_id, id],
        )
        .map_err(|e| MoError::Storage(format!("Failed to link tag: {}", e)))?;
    }

    let pruned = prune_orphans(conn)?;

    debug!(
        record = record_id,
        added = added.len(),
        dropped,
        pruned,
        "Reconciled record tags"
    );
    Ok(())
}

/// Delete tags no record refers to. Returns how many went.
pub fn prune_orphans(conn: &Connection) -> Result<usize> {
    conn.execute(
        "DELETE FROM Tag WHERE id NOT IN
            (SELECT tag_id FROM TagSet WHERE tag_id IS NOT NULL)",
        [],
    )
    .map_err(|e| MoError::Storage(format!("Failed to prune tags: {}", e)))
}

/// Tag operations against a shared [`Database`].
pub struct TagRepository {
    db: Arc<Database>,
}

impl TagRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn all_tags(&self) -> Result<BTreeSet<String>> {
        self.db.with_conn(all_tags)
    }

    /// Create an unattached tag. Fails with `DuplicateTag` if the
    /// lower-cased name exists. It survives until the next reconciliation
    /// prunes orphans.
    pub fn add_tag(&self, name: &str) -> Result<TagId> {
        self.db.with_conn(|conn| add_tag(conn, name))
    }

    pub fn remove_tag(&self, key: &TagKey) -> Result<()> {
        self.db.with_conn(|conn| remove_tag(conn, key))
    }

    pub fn tags_for(&self, record_id: RecordId) -> Result<BTreeSet<String>> {
        self.db.with_conn(|conn| tags_for(conn, record_id))
    }

    /// Replace a record's tag set in one transaction.
    pub fn set_tags_for<I, S>(&self, record_id: RecordId, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.db
            .transaction(|conn| set_tags_for(conn, record_id, names))
    }
}
