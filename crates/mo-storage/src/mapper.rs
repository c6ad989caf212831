//! Conversion between `Record` rows and `mo_core::Record`.

use rusqlite::Row;
use tracing::warn;

use mo_core::error::{MoError, Result};
use mo_core::types::{ModelType, Record};

/// Separator for `groups` on the row and for aggregated tag names.
pub const DELIMITER: char = ',';

/// Record columns in the order [`row_to_record`] reads them. Expects the
/// `Record` relation aliased as `r`.
pub const RECORD_COLUMNS: &str = r#"r.id, r.name, r.model_type, r.download_url, r.url,
       r.download_path, r.download_filename, r.preview_url, r.description,
       r.positive_prompts, r.negative_prompts, r.sha256_hash, r.md5_hash,
       r.created_at, r."groups", r.subdir, r.location, r.weight, r.backup_url"#;

/// Index of the aggregated tag names that follow [`RECORD_COLUMNS`].
pub const TAGS_COLUMN: usize = 19;

/// Split a delimiter-joined value, dropping empty pieces. Whitespace is
/// part of the value and kept as stored.
pub fn split_joined(value: &str) -> Vec<String> {
    value
        .split(DELIMITER)
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join groups for storage. A group that is empty or contains the
/// delimiter could not be read back as written.
pub fn join_groups(groups: &[String]) -> Result<String> {
    for group in groups {
        if group.trim().is_empty() {
            return Err(MoError::invalid("groups", "group names must not be empty"));
        }
        if group.contains(DELIMITER) {
            return Err(MoError::invalid(
                "groups",
                format!("'{}' contains '{}'", group, DELIMITER),
            ));
        }
    }
    Ok(groups.join(&DELIMITER.to_string()))
}

fn text(row: &Row<'_>, idx: usize) -> Result<String> {
    let value: Option<String> = row
        .get(idx)
        .map_err(|e| MoError::Storage(e.to_string()))?;
    Ok(value.unwrap_or_default())
}

fn optional_text(row: &Row<'_>, idx: usize) -> Result<Option<String>> {
    row.get(idx).map_err(|e| MoError::Storage(e.to_string()))
}

/// Build a record from a row selected with [`RECORD_COLUMNS`] followed by
/// the aggregated tag names.
pub fn row_to_record(row: &Row<'_>) -> Result<Record> {
    let id: i64 = row
        .get(0)
        .map_err(|e| MoError::Storage(e.to_string()))?;

    let stored_type = text(row, 2)?;
    let model_type = ModelType::parse(&stored_type).unwrap_or_else(|| {
        warn!(record = id, model_type = %stored_type, "Unknown model type, reading as other");
        ModelType::Other
    });

    let created_at: Option<i64> = row
        .get(13)
        .map_err(|e| MoError::Storage(e.to_string()))?;
    let weight: Option<f64> = row
        .get(17)
        .map_err(|e| MoError::Storage(e.to_string()))?;

    let mut tags = split_joined(&text(row, TAGS_COLUMN)?);
    tags.sort();
    tags.dedup();

    Ok(Record {
        id: Some(id),
        name: text(row, 1)?,
        model_type,
        download_url: text(row, 3)?,
        url: text(row, 4)?,
        download_path: text(row, 5)?,
        download_filename: text(row, 6)?,
        preview_url: text(row, 7)?,
        description: text(row, 8)?,
        positive_prompts: text(row, 9)?,
        negative_prompts: text(row, 10)?,
        sha256_hash: optional_text(row, 11)?,
        md5_hash: optional_text(row, 12)?,
        created_at: created_at.unwrap_or(0),
        groups: split_joined(&text(row, 14)?),
        subdir: text(row, 15)?,
        location: text(row, 16)?,
        weight: weight.unwrap_or(1.0),
        backup_url: optional_text(row, 18)?,
        tags,
    })
}
