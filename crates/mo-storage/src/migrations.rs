//! Database schema migrations.
//!
//! New databases get the full current schema directly. Older databases are
//! walked forward one version at a time: the file is copied aside before
//! each step, each step commits on its own, and only the newest copy is
//! kept.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use mo_core::error::{MoError, Result};

/// Schema version written by this build.
pub const CURRENT_VERSION: u32 = 8;

/// Current full-width schema. Every statement is idempotent.
const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS Record (
        id                INTEGER PRIMARY KEY,
        name              TEXT,
        model_type        TEXT,
        download_url      TEXT,
        url               TEXT DEFAULT '',
        download_path     TEXT DEFAULT '',
        download_filename TEXT DEFAULT '',
        preview_url       TEXT DEFAULT '',
        description       TEXT DEFAULT '',
        positive_prompts  TEXT DEFAULT '',
        negative_prompts  TEXT DEFAULT '',
        sha256_hash       TEXT DEFAULT '',
        md5_hash          TEXT DEFAULT '',
        created_at        INTEGER DEFAULT 0,
        "groups"          TEXT DEFAULT '',
        subdir            TEXT DEFAULT '',
        location          TEXT DEFAULT '',
        weight            REAL DEFAULT 1,
        backup_url        TEXT
    );

    CREATE TABLE IF NOT EXISTS Tag (
        id   INTEGER PRIMARY KEY,
        name TEXT UNIQUE
    );

    -- Record <-> Tag association.
    CREATE TABLE IF NOT EXISTS TagSet (
        record_id INTEGER REFERENCES Record(id) ON DELETE CASCADE,
        tag_id    INTEGER REFERENCES Tag(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_tagset_record ON TagSet (record_id);
    CREATE INDEX IF NOT EXISTS idx_tagset_tag ON TagSet (tag_id);

    CREATE TABLE IF NOT EXISTS Version (
        version INTEGER
    );
"#;

/// One upgrade from `from` to `from + 1`. Runs inside a transaction.
#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    pub from: u32,
    pub name: &'static str,
    pub apply: fn(&Connection) -> Result<()>,
}

/// Historical upgrade steps, ordered by `from`.
pub const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        from: 1,
        name: "add_created_at",
        apply: add_created_at,
    },
    MigrationStep {
        from: 2,
        name: "add_groups",
        apply: add_groups,
    },
    MigrationStep {
        from: 3,
        name: "rename_model_hash_add_subdir",
        apply: rename_model_hash_add_subdir,
    },
    MigrationStep {
        from: 4,
        name: "add_location",
        apply: add_location,
    },
    MigrationStep {
        from: 5,
        name: "add_weight",
        apply: add_weight,
    },
    MigrationStep {
        from: 6,
        name: "add_backup_url",
        apply: add_backup_url,
    },
    MigrationStep {
        from: 7,
        name: "add_tags_rename_name",
        apply: add_tags_rename_name,
    },
];

const fn is_contiguous(steps: &[MigrationStep], target: u32) -> bool {
    if steps.len() as u32 + 1 != target {
        return false;
    }
    let mut i = 0;
    while i < steps.len() {
        if steps[i].from != i as u32 + 1 {
            return false;
        }
        i += 1;
    }
    true
}

const _: () = assert!(
    is_contiguous(MIGRATIONS, CURRENT_VERSION),
    "MIGRATIONS must hold one step per version from 1 to CURRENT_VERSION - 1"
);

/// Brings a database up to a target schema version.
#[derive(Debug, Clone, Copy)]
pub struct Migrator {
    steps: &'static [MigrationStep],
    target: u32,
}

impl Migrator {
    /// The registered chain, targeting [`CURRENT_VERSION`].
    pub fn current() -> Self {
        Self {
            steps: MIGRATIONS,
            target: CURRENT_VERSION,
        }
    }

    /// A custom chain. Steps that are missing are only detected when the
    /// walk reaches them.
    pub fn with_steps(steps: &'static [MigrationStep], target: u32) -> Self {
        Self { steps, target }
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Create missing relations and bring the schema to the target version.
    ///
    /// `db_path` is the file to snapshot before each step; pass `None` for
    /// in-memory databases. Returns the resulting version.
    pub fn initialize(&self, conn: &mut Connection, db_path: Option<&Path>) -> Result<u32> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| MoError::Storage(format!("Failed to create schema: {}", e)))?;

        match read_version(conn)? {
            None => {
                conn.execute(
                    "INSERT INTO Version (version) VALUES (?1)",
                    params![self.target],
                )
                .map_err(|e| MoError::Storage(format!("Failed to record schema version: {}", e)))?;
                info!(version = self.target, "Initialized database schema");
                Ok(self.target)
            }
            Some(version) if version == self.target => Ok(version),
            Some(version) if version > self.target => Err(MoError::SchemaTooNew {
                found: version,
                supported: self.target,
            }),
            Some(version) => self.migrate(conn, version, db_path),
        }
    }

    fn migrate(&self, conn: &mut Connection, from: u32, db_path: Option<&Path>) -> Result<u32> {
        info!(from, target = self.target, "Migrating database schema");

        for version in from..self.target {
            let step = self
                .steps
                .iter()
                .find(|step| step.from == version)
                .ok_or(MoError::MigrationChainBroken {
                    from: version,
                    target: self.target,
                })?;

            if let Some(path) = db_path {
                snapshot(conn, path, version)?;
            }

            let tx = conn
                .transaction()
                .map_err(|e| MoError::Storage(format!("Failed to begin migration: {}", e)))?;
            (step.apply)(&tx)?;
            write_version(&tx, version + 1)?;
            tx.commit().map_err(|e| {
                MoError::Storage(format!("Failed to commit migration v{}: {}", version, e))
            })?;

            info!(
                from = version,
                to = version + 1,
                step = step.name,
                "Applied schema migration"
            );
        }

        Ok(self.target)
    }
}

/// Version recorded in the `Version` relation. A NULL value reads as 0,
/// a missing row as `None`.
pub fn read_version(conn: &Connection) -> Result<Option<u32>> {
    let row: Option<Option<i64>> = conn
        .query_row("SELECT version FROM Version LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(|e| MoError::Storage(format!("Failed to query schema version: {}", e)))?;
    row.map(|version| {
        let version = version.unwrap_or(0);
        u32::try_from(version).map_err(|_| {
            MoError::Storage(format!("Stored schema version {} is out of range", version))
        })
    })
    .transpose()
}

fn write_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute("DELETE FROM Version", [])
        .and_then(|_| conn.execute("INSERT INTO Version (version) VALUES (?1)", params![version]))
        .map_err(|e| MoError::Storage(format!("Failed to record schema version: {}", e)))?;
    Ok(())
}

/// Location of the snapshot taken before migrating away from `version`.
pub fn backup_path(db_path: &Path, version: u32) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(format!(".v{}.bak", version));
    PathBuf::from(name)
}

fn snapshot(conn: &Connection, db_path: &Path, version: u32) -> Result<()> {
    // Fold the WAL into the main file so the copy stands alone.
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        .map_err(|e| MoError::Storage(format!("Failed to checkpoint before backup: {}", e)))?;

    std::fs::copy(db_path, backup_path(db_path, version))?;
    info!("Database v{} backup created", version);

    if version > 1 {
        let previous = backup_path(db_path, version - 1);
        if previous.is_file() {
            std::fs::remove_file(&previous)?;
            info!("Backup database v{} removed", version - 1);
        }
    }
    Ok(())
}

fn alter(conn: &Connection, sql: &str) -> Result<()> {
    conn.execute_batch(sql)
        .map_err(|e| MoError::Storage(format!("Migration statement failed ({}): {}", sql.trim(), e)))
}

/// Version 1 -> 2.
fn add_created_at(conn: &Connection) -> Result<()> {
    alter(conn, "ALTER TABLE Record ADD COLUMN created_at INTEGER DEFAULT 0;")
}

/// Version 2 -> 3.
fn add_groups(conn: &Connection) -> Result<()> {
    alter(conn, r#"ALTER TABLE Record ADD COLUMN "groups" TEXT DEFAULT '';"#)
}

/// Version 3 -> 4.
fn rename_model_hash_add_subdir(conn: &Connection) -> Result<()> {
    alter(conn, "ALTER TABLE Record RENAME COLUMN model_hash TO sha256_hash;")?;
    alter(conn, "ALTER TABLE Record ADD COLUMN subdir TEXT DEFAULT '';")
}

/// Version 4 -> 5.
fn add_location(conn: &Connection) -> Result<()> {
    alter(conn, "ALTER TABLE Record ADD COLUMN location TEXT DEFAULT '';")
}

/// Version 5 -> 6.
fn add_weight(conn: &Connection) -> Result<()> {
    alter(conn, "ALTER TABLE Record ADD COLUMN weight REAL DEFAULT 1;")
}

/// Version 6 -> 7.
fn add_backup_url(conn: &Connection) -> Result<()> {
    alter(conn, "ALTER TABLE Record ADD COLUMN backup_url TEXT DEFAULT '';")
}

/// Version 7 -> 8: tag relations and the final `name` column.
fn add_tags_rename_name(conn: &Connection) -> Result<()> {
    alter(
        conn,
        "CREATE TABLE IF NOT EXISTS Tag (
            id   INTEGER PRIMARY KEY,
            name TEXT UNIQUE
        );
        CREATE TABLE IF NOT EXISTS TagSet (
            record_id INTEGER REFERENCES Record(id) ON DELETE CASCADE,
            tag_id    INTEGER REFERENCES Tag(id) ON DELETE CASCADE
        );",
    )?;
    alter(conn, "ALTER TABLE Record RENAME COLUMN _name TO name;")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Record layout of the first released schema.
    const LEGACY_V1_SCHEMA: &str = "
        CREATE TABLE Record (
            id                INTEGER PRIMARY KEY,
            _name             TEXT,
            model_type        TEXT,
            download_url      TEXT,
            url               TEXT DEFAULT '',
            download_path     TEXT DEFAULT '',
            download_filename TEXT DEFAULT '',
            preview_url       TEXT DEFAULT '',
            description       TEXT DEFAULT '',
            positive_prompts  TEXT DEFAULT '',
            negative_prompts  TEXT DEFAULT '',
            model_hash        TEXT DEFAULT '',
            md5_hash          TEXT DEFAULT ''
        );
        CREATE TABLE Version (version INTEGER DEFAULT 1);
        INSERT INTO Version VALUES (1);
        INSERT INTO Record (_name, model_type, download_url, model_hash)
            VALUES ('Legacy Model', 'Checkpoint', 'https://example.com/m.safetensors', 'abc123');
    ";

    const CURRENT_COLUMNS: [&str; 19] = [
        "id",
        "name",
        "model_type",
        "download_url",
        "url",
        "download_path",
        "download_filename",
        "preview_url",
        "description",
        "positive_prompts",
        "negative_prompts",
        "sha256_hash",
        "md5_hash",
        "created_at",
        "groups",
        "subdir",
        "location",
        "weight",
        "backup_url",
    ];

    /// Build a database as an older release would have left it at `version`.
    fn build_legacy(conn: &Connection, version: u32) {
        conn.execute_batch(LEGACY_V1_SCHEMA).unwrap();
        for step in &MIGRATIONS[..(version - 1) as usize] {
            (step.apply)(conn).unwrap();
            write_version(conn, step.from + 1).unwrap();
        }
    }

    fn legacy_file(dir: &Path, version: u32) -> PathBuf {
        let path = dir.join("database.sqlite");
        let conn = Connection::open(&path).unwrap();
        build_legacy(&conn, version);
        path
    }

    fn record_columns(conn: &Connection) -> Vec<String> {
        let mut stmt = conn.prepare("PRAGMA table_info(Record)").unwrap();
        let rows = stmt.query_map([], |row| row.get::<_, String>(1)).unwrap();
        rows.map(|r| r.unwrap()).collect()
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }

    fn backups_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".bak"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_registry_is_contiguous() {
        assert!(is_contiguous(MIGRATIONS, CURRENT_VERSION));
        assert!(!is_contiguous(&MIGRATIONS[..6], CURRENT_VERSION));
        assert!(!is_contiguous(&MIGRATIONS[1..], CURRENT_VERSION - 1));
    }

    #[test]
    fn test_fresh_database_gets_current_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        let version = Migrator::current().initialize(&mut conn, None).unwrap();

        assert_eq!(version, CURRENT_VERSION);
        assert_eq!(read_version(&conn).unwrap(), Some(CURRENT_VERSION));
        assert_eq!(record_columns(&conn), CURRENT_COLUMNS);
        assert!(table_exists(&conn, "Tag"));
        assert!(table_exists(&conn, "TagSet"));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        Migrator::current().initialize(&mut conn, None).unwrap();
        Migrator::current().initialize(&mut conn, None).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM Version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_upgrade_from_every_historical_version() {
        for version in 1..CURRENT_VERSION {
            let dir = tempfile::tempdir().unwrap();
            let path = legacy_file(dir.path(), version);

            let mut conn = Connection::open(&path).unwrap();
            let result = Migrator::current().initialize(&mut conn, Some(&path)).unwrap();

            assert_eq!(result, CURRENT_VERSION, "from v{}", version);
            assert_eq!(read_version(&conn).unwrap(), Some(CURRENT_VERSION));
            assert_eq!(record_columns(&conn), CURRENT_COLUMNS, "from v{}", version);
            assert!(table_exists(&conn, "Tag"));
            assert!(table_exists(&conn, "TagSet"));

            let (name, hash, weight): (String, String, f64) = conn
                .query_row(
                    "SELECT name, sha256_hash, weight FROM Record",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .unwrap();
            assert_eq!(name, "Legacy Model");
            assert_eq!(hash, "abc123");
            assert_eq!(weight, 1.0);

            // The last step migrates away from v7, so that snapshot is the survivor.
            assert_eq!(backups_in(dir.path()), vec!["database.sqlite.v7.bak"]);
        }
    }

    #[test]
    fn test_backup_retains_only_latest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = legacy_file(dir.path(), 3);

        let mut conn = Connection::open(&path).unwrap();
        let version = Migrator::with_steps(MIGRATIONS, 5)
            .initialize(&mut conn, Some(&path))
            .unwrap();

        assert_eq!(version, 5);
        assert_eq!(read_version(&conn).unwrap(), Some(5));
        assert!(!backup_path(&path, 3).exists());
        assert!(backup_path(&path, 4).exists());
        assert_eq!(backups_in(dir.path()), vec!["database.sqlite.v4.bak"]);
    }

    #[test]
    fn test_snapshot_holds_pre_migration_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = legacy_file(dir.path(), 6);

        let mut conn = Connection::open(&path).unwrap();
        Migrator::with_steps(MIGRATIONS, 7)
            .initialize(&mut conn, Some(&path))
            .unwrap();

        let backup = Connection::open(backup_path(&path, 6)).unwrap();
        assert_eq!(read_version(&backup).unwrap(), Some(6));
        assert!(!record_columns(&backup).contains(&"backup_url".to_string()));
    }

    #[test]
    fn test_stale_backup_from_earlier_run_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = legacy_file(dir.path(), 5);
        std::fs::write(backup_path(&path, 4), b"older snapshot").unwrap();

        let mut conn = Connection::open(&path).unwrap();
        Migrator::current().initialize(&mut conn, Some(&path)).unwrap();

        assert_eq!(backups_in(dir.path()), vec!["database.sqlite.v7.bak"]);
    }

    #[test]
    fn test_missing_step_fails_and_keeps_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = legacy_file(dir.path(), 2);

        let mut conn = Connection::open(&path).unwrap();
        let err = Migrator::with_steps(&MIGRATIONS[..3], CURRENT_VERSION)
            .initialize(&mut conn, Some(&path))
            .unwrap_err();

        assert!(matches!(
            err,
            MoError::MigrationChainBroken {
                from: 4,
                target: CURRENT_VERSION
            }
        ));
        // Steps 2->3 and 3->4 were committed before the gap.
        assert_eq!(read_version(&conn).unwrap(), Some(4));
        assert!(record_columns(&conn).contains(&"subdir".to_string()));
    }

    #[test]
    fn test_null_version_is_treated_as_zero() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE Version (version INTEGER); INSERT INTO Version VALUES (NULL);")
            .unwrap();

        let err = Migrator::current().initialize(&mut conn, None).unwrap_err();
        assert!(matches!(err, MoError::MigrationChainBroken { from: 0, .. }));
    }

    #[test]
    fn test_out_of_range_version_is_an_error() {
        for stored in [i64::from(u32::MAX) + 1, -1] {
            let mut conn = Connection::open_in_memory().unwrap();
            conn.execute_batch("CREATE TABLE Version (version INTEGER);").unwrap();
            conn.execute("INSERT INTO Version (version) VALUES (?1)", [stored])
                .unwrap();

            assert!(matches!(read_version(&conn), Err(MoError::Storage(_))));
            let err = Migrator::current().initialize(&mut conn, None).unwrap_err();
            assert!(matches!(err, MoError::Storage(_)), "stored {}", stored);
        }
    }

    #[test]
    fn test_version_column_has_no_default() {
        let mut conn = Connection::open_in_memory().unwrap();
        Migrator::current().initialize(&mut conn, None).unwrap();

        let default: Option<String> = conn
            .query_row(
                "SELECT dflt_value FROM pragma_table_info('Version') WHERE name = 'version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(default, None);
        assert_eq!(read_version(&conn).unwrap(), Some(CURRENT_VERSION));
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        Migrator::current().initialize(&mut conn, None).unwrap();
        write_version(&conn, CURRENT_VERSION + 1).unwrap();

        let err = Migrator::current().initialize(&mut conn, None).unwrap_err();
        assert!(matches!(
            err,
            MoError::SchemaTooNew {
                found: 9,
                supported: CURRENT_VERSION
            }
        ));
    }

    #[test]
    fn test_in_memory_upgrade_skips_backups() {
        let mut conn = Connection::open_in_memory().unwrap();
        build_legacy(&conn, 1);

        let version = Migrator::current().initialize(&mut conn, None).unwrap();
        assert_eq!(version, CURRENT_VERSION);
        assert_eq!(record_columns(&conn), CURRENT_COLUMNS);
    }

    #[test]
    fn test_backup_path_naming() {
        let path = Path::new("/data/database.sqlite");
        assert_eq!(
            backup_path(path, 3),
            PathBuf::from("/data/database.sqlite.v3.bak")
        );
    }
}
