//! The `ip` table: one row per known address, whitelisted (`ban = 0`) or
//! blacklisted (`ban = 1`).

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone)]
pub struct IpRecord {
    pub ip: String,
    pub ban: bool,
    pub ts: DateTime<Utc>,
    pub toml: Option<String>,
    pub rbl: Option<String>,
    pub log: Option<String>,
}

/// Repository over the `ip` table.
pub struct Decisions {
    pool: SqlitePool,
}

impl Decisions {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a new ban. A no-op if `ip` is already present, matching the
    /// source's idempotent `Bl()` (LIST's in-memory lookup is the real
    /// idempotency gate; this is its durable counterpart).
    pub async fn insert(
        &self,
        ip: &str,
        toml: &str,
        rbl: Option<&str>,
        log: Option<&str>,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "insert or ignore into ip(ip, ban, ts, toml, rbl, log) values(?, 1, ?, ?, ?, ?)",
        )
        .bind(ip)
        .bind(ts)
        .bind(toml)
        .bind(rbl)
        .bind(log)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh a stored ban's last-seen timestamp (the coalesced-touch path).
    pub async fn touch(&self, ip: &str, ts: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("update ip set ts = ? where ip = ?")
            .bind(ts)
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a whitelist entry (`ban = 0`, no ban metadata).
    pub async fn insert_whitelist(&self, ip: &str, ts: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("insert or replace into ip(ip, ban, ts, toml) values(?, 0, ?, null)")
            .bind(ip)
            .bind(ts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove(&self, ip: &str) -> Result<(), StoreError> {
        sqlx::query("delete from ip where ip = ?")
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn query(&self, ip: &str) -> Result<Option<IpRecord>, StoreError> {
        let row = sqlx::query(
            "select ip, ban, ts, toml, rbl, log from ip where ip = ? order by ban limit 1",
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_record))
    }

    /// Every stored row in address order, used to repopulate LIST on startup.
    pub async fn recovery_scan(&self) -> Result<Vec<IpRecord>, StoreError> {
        let rows = sqlx::query("select ip, ban, ts, toml, rbl, log from ip order by ip")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_record).collect())
    }

    /// Bulk-insert a batch of bans inside a single snapshot-isolated
    /// transaction (the fail2ban migration path), rather than autocommitting
    /// row by row. Returns the number of rows actually inserted (idempotent
    /// rows already present don't count).
    pub async fn insert_many(&self, rows: &[(String, String, DateTime<Utc>)]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for (ip, toml, ts) in rows {
            let result = sqlx::query(
                "insert or ignore into ip(ip, ban, ts, toml, rbl, log) values(?, 1, ?, ?, null, null)",
            )
            .bind(ip)
            .bind(ts)
            .bind(toml)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                inserted += 1;
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }
}

fn row_to_record(r: sqlx::sqlite::SqliteRow) -> IpRecord {
    IpRecord {
        ip: r.get("ip"),
        ban: r.get::<i64, _>("ban") != 0,
        ts: r.get("ts"),
        toml: r.get("toml"),
        rbl: r.get("rbl"),
        log: r.get("log"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn store() -> Decisions {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect(&dir.path().join("banip.sqlite")).await.unwrap();
        // leak the tempdir for the duration of the test process; fine for tests.
        std::mem::forget(dir);
        Decisions::new(pool)
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let d = store().await;
        let now = Utc::now();
        d.insert("203.0.113.9", "sshd", None, None, now).await.unwrap();
        d.insert("203.0.113.9", "sshd", None, None, now).await.unwrap();
        let rec = d.query("203.0.113.9").await.unwrap().unwrap();
        assert!(rec.ban);
        assert_eq!(rec.toml.as_deref(), Some("sshd"));
    }

    #[tokio::test]
    async fn touch_updates_timestamp() {
        let d = store().await;
        let t0 = Utc::now();
        d.insert("203.0.113.9", "sshd", None, None, t0).await.unwrap();
        let t1 = t0 + chrono::Duration::minutes(20);
        d.touch("203.0.113.9", t1).await.unwrap();
        let rec = d.query("203.0.113.9").await.unwrap().unwrap();
        assert_eq!(rec.ts, t1);
    }

    #[tokio::test]
    async fn remove_deletes_row() {
        let d = store().await;
        d.insert("203.0.113.9", "sshd", None, None, Utc::now()).await.unwrap();
        d.remove("203.0.113.9").await.unwrap();
        assert!(d.query("203.0.113.9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recovery_scan_orders_by_ip() {
        let d = store().await;
        let now = Utc::now();
        d.insert("203.0.113.9", "sshd", None, None, now).await.unwrap();
        d.insert_whitelist("198.51.100.1", now).await.unwrap();
        let rows = d.recovery_scan().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ip, "198.51.100.1");
        assert!(!rows[0].ban);
        assert_eq!(rows[1].ip, "203.0.113.9");
        assert!(rows[1].ban);
    }
}
