//! Generic registration/versioning/promotion logic.
//!
//! Every versioned product table (calibrated images, reference images,
//! difference images) follows the same contract:
//!
//! - per natural key, versions are strictly increasing integers from 1,
//!   never reused;
//! - at most one row per natural key has vbest = 1 at any instant;
//! - rows with status = 0 are provisional and invisible to "best" queries;
//! - finalization is keyed by (id, version), never by natural key alone.
//!
//! The SQL here is built from static column descriptors only; all values
//! go through bind parameters. The concrete stores execute these statements
//! inside their own transactions.

use crate::error::RegistryError;

/// Placeholder style of the backing database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

impl SqlDialect {
    fn placeholder(&self, n: usize) -> String {
        match self {
            Self::Sqlite => "?".to_string(),
            Self::Postgres => format!("${n}"),
        }
    }
}

/// Static descriptor of one versioned product table.
pub struct ProductKind {
    pub table: &'static str,
    pub id_column: &'static str,
    pub natural_key: &'static [&'static str],
}

/// Calibrated images: one version chain per (expid, chipid).
pub const CAL_IMAGES: ProductKind = ProductKind {
    table: "cal_images",
    id_column: "rid",
    natural_key: &["expid", "chipid"],
};

/// Reference images: one version chain per (ppid, field, fid).
pub const REF_IMAGES: ProductKind = ProductKind {
    table: "ref_images",
    id_column: "rfid",
    natural_key: &["ppid", "field", "fid"],
};

/// Difference images: one version chain per (rid, rfid).
pub const DIFF_IMAGES: ProductKind = ProductKind {
    table: "diff_images",
    id_column: "pid",
    natural_key: &["rid", "rfid"],
};

impl ProductKind {
    fn key_predicate(&self, dialect: SqlDialect, first: usize) -> String {
        self.natural_key
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{col} = {}", dialect.placeholder(first + i)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Next version for a natural key: 1 + max(existing), or 1 if none.
    /// Binds: the natural-key values, in declared order.
    pub fn next_version_sql(&self, dialect: SqlDialect) -> String {
        format!(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM {} WHERE {}",
            self.table,
            self.key_predicate(dialect, 1)
        )
    }

    /// Lock the version chain of a natural key (row-level, PostgreSQL).
    /// Binds: the natural-key values.
    pub fn lock_chain_sql(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} FOR UPDATE",
            self.id_column,
            self.table,
            self.key_predicate(SqlDialect::Postgres, 1)
        )
    }

    /// Demote every other row of the chain.
    /// Binds: the natural-key values, then the winning id.
    pub fn demote_others_sql(&self, dialect: SqlDialect) -> String {
        format!(
            "UPDATE {} SET vbest = 0 WHERE {} AND {} <> {} AND vbest = 1",
            self.table,
            self.key_predicate(dialect, 1),
            self.id_column,
            dialect.placeholder(self.natural_key.len() + 1)
        )
    }

    /// Promote the winning row. Binds: the winning id.
    pub fn promote_sql(&self, dialect: SqlDialect) -> String {
        format!(
            "UPDATE {} SET vbest = 1 WHERE {} = {}",
            self.table,
            self.id_column,
            dialect.placeholder(1)
        )
    }

    /// Finalize a provisional row, identified by (id, version) so that a
    /// concurrently registered newer version is never touched. Safe to
    /// repeat with identical arguments.
    /// Binds: filename, checksum, status, id, version.
    pub fn finalize_sql(&self, dialect: SqlDialect) -> String {
        format!(
            "UPDATE {} SET filename = {}, checksum = {}, status = {} WHERE {} = {} AND version = {}",
            self.table,
            dialect.placeholder(1),
            dialect.placeholder(2),
            dialect.placeholder(3),
            self.id_column,
            dialect.placeholder(4),
            dialect.placeholder(5)
        )
    }

    /// Best visible row of a chain, if any.
    /// Binds: the natural-key values.
    pub fn select_best_sql(&self, dialect: SqlDialect) -> String {
        format!(
            "SELECT * FROM {} WHERE {} AND vbest = 1 AND status > 0",
            self.table,
            self.key_predicate(dialect, 1)
        )
    }

    /// Human-readable key for diagnostics.
    pub fn describe_key(&self, key: &[i64]) -> String {
        let pairs: Vec<String> = self
            .natural_key
            .iter()
            .zip(key)
            .map(|(col, v)| format!("{col}={v}"))
            .collect();
        format!("{}({})", self.table, pairs.join(","))
    }
}

/// Whether a database error is worth retrying inside the promotion loop:
/// serialization failures and deadlocks on PostgreSQL, busy/locked on
/// SQLite. Anything else propagates immediately.
pub fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // PostgreSQL: serialization_failure, deadlock_detected,
            // lock_not_available.
            Some("40001") | Some("40P01") | Some("55P03") => true,
            // SQLite: SQLITE_BUSY, SQLITE_LOCKED.
            Some("5") | Some("6") => true,
            _ => {
                let msg = db.message().to_lowercase();
                msg.contains("database is locked") || msg.contains("deadlock")
            }
        },
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Whether a database error is a unique-constraint violation. Two writers
/// registering the same natural key concurrently can both compute the same
/// next version; the loser's insert trips the (natural key, version) unique
/// constraint and is retried with a freshly computed version.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // PostgreSQL unique_violation; SQLite constraint codes.
            Some("23505") | Some("1555") | Some("2067") => true,
            _ => db.message().to_lowercase().contains("unique constraint"),
        },
        _ => false,
    }
}

/// Map retry exhaustion to the caller-facing error.
pub fn promotion_conflict(kind: &ProductKind, key: &[i64], attempts: u32) -> RegistryError {
    RegistryError::PromotionConflict {
        key: kind.describe_key(key),
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_version_sql() {
        assert_eq!(
            REF_IMAGES.next_version_sql(SqlDialect::Postgres),
            "SELECT COALESCE(MAX(version), 0) + 1 FROM ref_images \
             WHERE ppid = $1 AND field = $2 AND fid = $3"
        );
        assert_eq!(
            CAL_IMAGES.next_version_sql(SqlDialect::Sqlite),
            "SELECT COALESCE(MAX(version), 0) + 1 FROM cal_images \
             WHERE expid = ? AND chipid = ?"
        );
    }

    #[test]
    fn test_promotion_sql_binds_winner_after_key() {
        assert_eq!(
            DIFF_IMAGES.demote_others_sql(SqlDialect::Postgres),
            "UPDATE diff_images SET vbest = 0 WHERE rid = $1 AND rfid = $2 \
             AND pid <> $3 AND vbest = 1"
        );
        assert_eq!(
            DIFF_IMAGES.promote_sql(SqlDialect::Postgres),
            "UPDATE diff_images SET vbest = 1 WHERE pid = $1"
        );
    }

    #[test]
    fn test_finalize_is_keyed_by_id_and_version() {
        let sql = REF_IMAGES.finalize_sql(SqlDialect::Postgres);
        assert!(sql.contains("WHERE rfid = $4 AND version = $5"));
    }

    #[test]
    fn test_select_best_hides_provisional() {
        let sql = REF_IMAGES.select_best_sql(SqlDialect::Sqlite);
        assert!(sql.contains("vbest = 1"));
        assert!(sql.contains("status > 0"));
    }

    #[test]
    fn test_describe_key() {
        assert_eq!(
            REF_IMAGES.describe_key(&[12, 7001, 4]),
            "ref_images(ppid=12,field=7001,fid=4)"
        );
    }
}
