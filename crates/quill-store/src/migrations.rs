//! Schema migration runner.
//!
//! Migration files are embedded at compile time and named
//! `NNN-description.sql`; the three-digit prefix is the migration number.
//! Files apply in lexicographic order, each inside its own write
//! transaction that also records the number in the `migrations` ledger —
//! a failure rolls back with no partial schema state. Already-applied
//! numbers are skipped, so running the migrator is idempotent.

use std::collections::HashSet;

use regex::Regex;
use tracing::{debug, info};

use crate::errors::{Result, StoreError};
use crate::pool::Pool;

/// One embedded migration file.
struct MigrationFile {
    name: &'static str,
    sql: &'static str,
}

/// All migrations, in lexicographic (= numeric) order.
const MIGRATIONS: &[MigrationFile] = &[
    MigrationFile {
        name: "001-base.sql",
        sql: include_str!("schema/001-base.sql"),
    },
    MigrationFile {
        name: "002-settings.sql",
        sql: include_str!("schema/002-settings.sql"),
    },
];

const FILENAME_PATTERN: &str = r"^(\d{3})-.*\.sql$";

/// Apply all pending migrations. Returns the number applied.
///
/// # Errors
///
/// [`StoreError::Migration`] for a malformed file name or failing SQL.
pub fn migrate(pool: &Pool) -> Result<usize> {
    let pattern = Regex::new(FILENAME_PATTERN)
        .map_err(|e| StoreError::Migration {
            message: format!("invalid migration filename pattern: {e}"),
        })?;

    ensure_ledger(pool)?;
    let applied_numbers = applied_migrations(pool)?;

    let mut files: Vec<&MigrationFile> = MIGRATIONS.iter().collect();
    files.sort_by_key(|m| m.name);

    let mut applied = 0;
    for migration in files {
        let number = parse_number(&pattern, migration.name)?;
        if applied_numbers.contains(&number) {
            debug!(
                number,
                name = migration.name,
                "migration already applied, skipping"
            );
            continue;
        }

        info!(number, name = migration.name, "applying migration");
        pool.write(|tx| {
            tx.execute_batch(migration.sql)
                .map_err(|e| StoreError::Migration {
                    message: format!("migration {} failed: {e}", migration.name),
                })?;
            tx.execute(
                "INSERT INTO migrations (migration_number, migration_name) VALUES (?1, ?2)",
                rusqlite::params![number, migration.name],
            )
            .map_err(|e| StoreError::Migration {
                message: format!("failed to record migration {}: {e}", migration.name),
            })?;
            Ok(())
        })?;
        applied += 1;
    }

    if applied > 0 {
        info!(applied, "migrations complete");
    }
    Ok(applied)
}

fn ensure_ledger(pool: &Pool) -> Result<()> {
    pool.exec_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
           migration_number INTEGER PRIMARY KEY,
           migration_name   TEXT NOT NULL,
           applied_at       TEXT NOT NULL DEFAULT (datetime('now'))
         );",
    )
}

fn applied_migrations(pool: &Pool) -> Result<HashSet<i64>> {
    pool.read(|conn| {
        let mut stmt = conn.prepare("SELECT migration_number FROM migrations")?;
        let numbers = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(numbers)
    })
}

fn parse_number(pattern: &Regex, name: &str) -> Result<i64> {
    let captures = pattern.captures(name).ok_or_else(|| StoreError::Migration {
        message: format!("invalid migration filename format: {name}"),
    })?;
    captures[1].parse().map_err(|e| StoreError::Migration {
        message: format!("failed to parse migration number from {name}: {e}"),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    fn open_pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(&PoolConfig::new(dir.path().join("test.db"))).unwrap();
        (dir, pool)
    }

    fn ledger(pool: &Pool) -> Vec<(i64, String)> {
        pool.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT migration_number, migration_name FROM migrations ORDER BY migration_number",
            )?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .unwrap()
    }

    fn schema(pool: &Pool) -> Vec<String> {
        pool.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type IN ('table', 'index') ORDER BY name",
            )?;
            let rows = stmt
                .query_map([], |r| r.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .unwrap()
    }

    #[test]
    fn migrate_creates_schema() {
        let (_dir, pool) = open_pool();
        let applied = migrate(&pool).unwrap();
        assert_eq!(applied, MIGRATIONS.len());

        let tables = schema(&pool);
        assert!(tables.iter().any(|t| t == "conversations"));
        assert!(tables.iter().any(|t| t == "messages"));
        assert!(tables.iter().any(|t| t == "settings"));
        assert!(tables.iter().any(|t| t == "migrations"));
    }

    #[test]
    fn migrate_is_idempotent() {
        let (_dir, pool) = open_pool();
        migrate(&pool).unwrap();
        let ledger_first = ledger(&pool);
        let schema_first = schema(&pool);

        let applied = migrate(&pool).unwrap();
        assert_eq!(applied, 0);
        assert_eq!(ledger(&pool), ledger_first);
        assert_eq!(schema(&pool), schema_first);
    }

    #[test]
    fn ledger_records_numbers_from_names() {
        let (_dir, pool) = open_pool();
        migrate(&pool).unwrap();
        let rows = ledger(&pool);
        assert_eq!(rows.len(), MIGRATIONS.len());
        assert_eq!(rows[0], (1, "001-base.sql".to_owned()));
        assert_eq!(rows[1], (2, "002-settings.sql".to_owned()));
    }

    #[test]
    fn filename_pattern_accepts_and_rejects() {
        let pattern = Regex::new(FILENAME_PATTERN).unwrap();
        assert_eq!(parse_number(&pattern, "001-base.sql").unwrap(), 1);
        assert_eq!(parse_number(&pattern, "042-anything-here.sql").unwrap(), 42);
        assert!(parse_number(&pattern, "1-short.sql").is_err());
        assert!(parse_number(&pattern, "001-base.txt").is_err());
        assert!(parse_number(&pattern, "base.sql").is_err());
    }

    #[test]
    fn migration_names_all_valid() {
        let pattern = Regex::new(FILENAME_PATTERN).unwrap();
        for (i, m) in MIGRATIONS.iter().enumerate() {
            let number = parse_number(&pattern, m.name).unwrap();
            assert_eq!(number, i as i64 + 1, "migration numbers must be dense");
        }
    }
}
