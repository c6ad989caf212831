//! SQL composition for record searches.
//!
//! Every user-supplied value travels as a bound parameter; the SQL text is
//! assembled only from fixed fragments and placeholder numbers.

use rusqlite::types::Value;

use mo_core::types::RecordQuery;

use crate::db::UNICODE_LOWER;
use crate::mapper::RECORD_COLUMNS;

/// How tag names are joined onto record rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagJoin {
    /// Records without tags are kept.
    Left,
    /// Records without tags are dropped.
    Inner,
}

/// A SELECT statement plus the values for its numbered placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Escape LIKE wildcards so `value` matches literally, and wrap it for a
/// substring match. Pair with `ESCAPE '\'`.
pub fn like_contains(value: &str) -> String {
    let mut pattern = String::with_capacity(value.len() + 2);
    pattern.push('%');
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Record rows with their tag names aggregated into one column, filtered
/// by `condition` and ordered by id.
pub fn select_sql(join: TagJoin, condition: Option<&str>) -> String {
    let join = match join {
        TagJoin::Left => "LEFT JOIN",
        TagJoin::Inner => "JOIN",
    };
    let mut sql = format!(
        "SELECT {}, GROUP_CONCAT(t.name, ',')
         FROM Record r
         {join} TagSet ts ON ts.record_id = r.id
         {join} Tag t ON t.id = ts.tag_id",
        RECORD_COLUMNS,
        join = join
    );
    if let Some(condition) = condition {
        sql.push_str("\n         WHERE ");
        sql.push_str(condition);
    }
    sql.push_str("\n         GROUP BY r.id\n         ORDER BY r.id");
    sql
}

/// Translate a query into SQL. Download state is not part of it; that is
/// decided afterwards against the filesystem.
///
/// The name clause calls the function registered under [`UNICODE_LOWER`],
/// so the SQL only runs on connections opened through `Database`.
pub fn compose(query: &RecordQuery) -> ComposedQuery {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    if let Some(fragment) = query.name_contains.as_deref().filter(|f| !f.is_empty()) {
        params.push(Value::Text(like_contains(&fragment.to_lowercase())));
        conditions.push(format!(
            "{}(r.name) LIKE ?{} ESCAPE '\\'",
            UNICODE_LOWER,
            params.len()
        ));
    }

    if !query.model_types.is_empty() {
        // Legacy spellings such as "Embedding" must match too.
        let mut placeholders = Vec::new();
        for ty in &query.model_types {
            for name in ty.stored_names() {
                params.push(Value::Text(name.to_string()));
                placeholders.push(format!("?{}", params.len()));
            }
        }
        conditions.push(format!(
            "LOWER(TRIM(r.model_type)) IN ({})",
            placeholders.join(", ")
        ));
    }

    // Each fragment may be satisfied by a different tag of the same record.
    for fragment in query.tags.iter().filter(|f| !f.is_empty()) {
        params.push(Value::Text(like_contains(&fragment.to_lowercase())));
        conditions.push(format!(
            "EXISTS (SELECT 1 FROM TagSet fts JOIN Tag ft ON ft.id = fts.tag_id
                     WHERE fts.record_id = r.id AND ft.name LIKE ?{} ESCAPE '\\')",
            params.len()
        ));
    }

    let condition = if conditions.is_empty() {
        None
    } else {
        Some(conditions.join(" AND "))
    };

    ComposedQuery {
        sql: select_sql(TagJoin::Left, condition.as_deref()),
        params,
    }
}
