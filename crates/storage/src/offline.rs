use anyhow::Result;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::time::Duration;
use tracing::warn;

use shared::{domain::UserId, protocol::Envelope};

/// Durable, per-user FIFO buffer of envelopes that could not be delivered
/// live. Bounded per user; the oldest entries give way when a backlog
/// exceeds the bound.
#[derive(Clone)]
pub struct OfflineQueue {
    pool: Pool<Sqlite>,
    max_per_user: i64,
}

impl OfflineQueue {
    pub fn new(pool: Pool<Sqlite>, max_per_user: usize) -> Self {
        Self {
            pool,
            max_per_user: max_per_user.max(1) as i64,
        }
    }

    /// Appends in arrival order. When the user's backlog exceeds the bound
    /// the oldest entries are dropped inside the same transaction; that is
    /// a capacity decision, not an error.
    pub async fn enqueue(&self, user_id: UserId, envelope: &Envelope) -> Result<()> {
        let body = serde_json::to_string(envelope)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO offline_queue (user_id, envelope, enqueued_at) VALUES (?, ?, ?)")
            .bind(user_id.0)
            .bind(&body)
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;
        let dropped = sqlx::query(
            "DELETE FROM offline_queue
             WHERE user_id = ? AND id NOT IN (
                 SELECT id FROM offline_queue WHERE user_id = ? ORDER BY id DESC LIMIT ?
             )",
        )
        .bind(user_id.0)
        .bind(user_id.0)
        .bind(self.max_per_user)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        if dropped > 0 {
            warn!(user_id = user_id.0, dropped, "offline queue over capacity, dropped oldest entries");
        }
        Ok(())
    }

    /// Returns the user's pending envelopes in enqueue order and clears
    /// them. A single `DELETE ... RETURNING` statement does both, so the
    /// drain serializes against concurrent enqueues on SQLite's write lock
    /// instead of reading first and aborting on the lock upgrade; a racing
    /// enqueue is either included here or kept for the next drain, never
    /// lost or duplicated.
    pub async fn drain(&self, user_id: UserId) -> Result<Vec<Envelope>> {
        let mut rows =
            sqlx::query("DELETE FROM offline_queue WHERE user_id = ? RETURNING id, envelope")
                .bind(user_id.0)
                .fetch_all(&self.pool)
                .await?;
        // RETURNING does not promise an order.
        rows.sort_by_key(|row| row.get::<i64, _>(0));

        let mut envelopes = Vec::with_capacity(rows.len());
        for row in &rows {
            match serde_json::from_str::<Envelope>(&row.get::<String, _>(1)) {
                Ok(envelope) => envelopes.push(envelope),
                Err(error) => {
                    warn!(user_id = user_id.0, %error, "skipping undecodable offline entry");
                }
            }
        }
        Ok(envelopes)
    }

    pub async fn pending_count(&self, user_id: UserId) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM offline_queue WHERE user_id = ?")
            .bind(user_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Retention-window cleanup across all users.
    pub async fn purge_older_than(&self, age: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - age.as_millis() as i64;
        let purged = sqlx::query("DELETE FROM offline_queue WHERE enqueued_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(purged)
    }
}

#[cfg(test)]
#[path = "tests/offline_tests.rs"]
mod tests;
