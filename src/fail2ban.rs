//! One-shot migration of a fail2ban persistent-state database into the
//! local decision store (`-load-f2b`).

use crate::db::decisions::Decisions;
use crate::error::StoreError;
use chrono::{TimeZone, Utc};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

/// Read fail2ban's `bans` table (one row per jail/ip/ban-timestamp) and
/// insert the most recent ban per (jail, ip) pair, tagged `f2b<jail>`.
pub async fn load_fail2ban(source: &Path, decisions: &Decisions) -> Result<usize, StoreError> {
    let opts = SqliteConnectOptions::from_str(&source.to_string_lossy())?.read_only(true);
    let pool = SqlitePool::connect_with(opts).await?;

    let rows = sqlx::query(
        "select jail, ip, max(timeofban) as ts from bans group by jail, ip order by ip",
    )
    .fetch_all(&pool)
    .await?;

    let mut batch = Vec::with_capacity(rows.len());
    for row in rows {
        let jail: String = row.get("jail");
        let ip: String = row.get("ip");
        let ts_unix: i64 = row.get("ts");
        let Some(ts) = Utc.timestamp_opt(ts_unix, 0).single() else {
            warn!(jail = %jail, ip = %ip, ts_unix, "skipping unparseable fail2ban timestamp");
            continue;
        };
        batch.push((ip, format!("f2b{jail}"), ts));
    }

    let migrated = decisions.insert_many(&batch).await?;
    info!(migrated, "fail2ban migration complete");
    Ok(migrated)
}
