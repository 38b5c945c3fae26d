//! STORE — SQLite-backed persistence for the decision table and the
//! reduced mail-log audit trail.

pub mod decisions;
pub mod rlog;

use crate::error::StoreError;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const SCHEMA_IP: &str = "
create table if not exists ip (
    ip text not null unique,
    ban int not null check(ban in (0, 1)),
    ts datetime not null,
    toml text,
    rbl text,
    log text
)";

const SCHEMA_RLOG: &str = "
create table if not exists rlog (
    cursor text not null unique,
    ts datetime not null,
    action text not null,
    score real,
    ip text,
    subject text,
    message_id text
)";

/// Opens (creating if needed) the SQLite database backing the decision
/// table, under WAL journaling with a 30s busy timeout.
pub async fn connect(path: &Path) -> Result<SqlitePool, StoreError> {
    let opts = SqliteConnectOptions::from_str(&path.to_string_lossy())?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await?;

    sqlx::query(SCHEMA_IP).execute(&pool).await?;
    sqlx::query(SCHEMA_RLOG).execute(&pool).await?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let pool = connect(&dir.path().join("banip.sqlite")).await.unwrap();
        let row: (i64,) = sqlx::query_as("select count(*) from ip")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
