//! Persistence for the reduced rspamd audit trail ([`crate::rlog`]).

use crate::error::StoreError;
use crate::rlog::RlogEntry;
use sqlx::{Row, SqlitePool};

pub struct RlogStore {
    pool: SqlitePool,
}

impl RlogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, entry: &RlogEntry) -> Result<(), StoreError> {
        sqlx::query(
            "insert or ignore into rlog(cursor, ts, action, score, ip, subject, message_id)
             values(?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.cursor)
        .bind(entry.ts)
        .bind(&entry.action)
        .bind(entry.score)
        .bind(&entry.ip)
        .bind(&entry.subject)
        .bind(&entry.message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The cursor of the most recently stored row, used to resume a
    /// `journalctl --after-cursor` read across restarts.
    pub async fn last_cursor(&self) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("select cursor from rlog order by ts desc limit 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("cursor")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn store() -> RlogStore {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("banip.sqlite")).await.unwrap();
        std::mem::forget(dir);
        RlogStore::new(pool)
    }

    #[tokio::test]
    async fn insert_and_read_back_cursor() {
        let s = store().await;
        assert_eq!(s.last_cursor().await.unwrap(), None);
        let entry = RlogEntry {
            cursor: "s=abc;i=1".into(),
            ts: Utc::now(),
            action: Some("reject".into()),
            score: Some(15.0),
            ip: Some("203.0.113.9".into()),
            subject: Some("hi".into()),
            message_id: Some("id@example.com".into()),
        };
        s.insert(&entry).await.unwrap();
        assert_eq!(s.last_cursor().await.unwrap().as_deref(), Some("s=abc;i=1"));
    }
}
