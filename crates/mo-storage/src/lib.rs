//! Model record storage crate - SQLite persistence for model asset records.
//!
//! Provides a per-thread connection pool over one SQLite file, a versioned
//! migration chain with pre-migration backups, record and tag repositories
//! and parameterized search.

pub mod db;
pub mod filter;
pub mod mapper;
pub mod migrations;
pub mod records;
pub mod tags;

pub use db::{resolve_database_path, Database, SharedConnection, DB_FILE};
pub use filter::{compose, ComposedQuery, TagJoin};
pub use migrations::{MigrationStep, Migrator, CURRENT_VERSION, MIGRATIONS};
pub use records::RecordRepository;
pub use tags::{normalize_tags, TagRepository};
