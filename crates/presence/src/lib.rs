use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Pool, Row, Sqlite};
use std::time::Duration;

use shared::domain::{InstanceId, UserId};

/// Shared record of which users are online and which instance owns their
/// live socket, visible to every server instance through the common
/// database. Entries expire unless the owning instance keeps refreshing
/// them, which reclaims ownership after a crash without an explicit
/// disconnect.
#[derive(Clone)]
pub struct PresenceRegistry {
    pool: Pool<Sqlite>,
    ttl_ms: i64,
}

#[derive(Debug, Clone)]
pub struct PresenceSnapshot {
    pub instance_id: InstanceId,
    pub last_seen: DateTime<Utc>,
}

impl PresenceRegistry {
    pub fn new(pool: Pool<Sqlite>, ttl: Duration) -> Self {
        Self {
            pool,
            ttl_ms: (ttl.as_millis() as i64).max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms as u64)
    }

    /// Newest connection wins: a user connecting on another instance
    /// overwrites the previous owner.
    pub async fn set_online(&self, user_id: UserId, instance_id: &InstanceId) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO presence (user_id, instance_id, expires_at, last_seen) VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                 instance_id = excluded.instance_id,
                 expires_at = excluded.expires_at,
                 last_seen = excluded.last_seen",
        )
        .bind(user_id.0)
        .bind(&instance_id.0)
        .bind(now + self.ttl_ms)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Guarded removal: only the instance that still owns the entry may
    /// clear it, so a late disconnect from the previous owner cannot
    /// clobber a takeover. Returns whether an entry was removed.
    pub async fn set_offline(&self, user_id: UserId, instance_id: &InstanceId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM presence WHERE user_id = ? AND instance_id = ?")
            .bind(user_id.0)
            .bind(&instance_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// The per-instance heartbeat: extends the deadline for every entry the
    /// instance still owns.
    pub async fn refresh_owned(&self, instance_id: &InstanceId) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE presence SET expires_at = ?, last_seen = ? WHERE instance_id = ?",
        )
        .bind(now + self.ttl_ms)
        .bind(now)
        .bind(&instance_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn is_online(&self, user_id: UserId) -> Result<bool> {
        Ok(self.owner_of(user_id).await?.is_some())
    }

    /// Entries past their deadline read as offline even before the reaper
    /// removes the row.
    pub async fn owner_of(&self, user_id: UserId) -> Result<Option<InstanceId>> {
        let row = sqlx::query("SELECT instance_id FROM presence WHERE user_id = ? AND expires_at > ?")
            .bind(user_id.0)
            .bind(Utc::now().timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| InstanceId(r.get::<String, _>(0))))
    }

    pub async fn snapshot(&self, user_id: UserId) -> Result<Option<PresenceSnapshot>> {
        let row = sqlx::query(
            "SELECT instance_id, last_seen FROM presence WHERE user_id = ? AND expires_at > ?",
        )
        .bind(user_id.0)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| PresenceSnapshot {
            instance_id: InstanceId(r.get::<String, _>(0)),
            last_seen: Utc
                .timestamp_millis_opt(r.get::<i64, _>(1))
                .single()
                .unwrap_or_else(Utc::now),
        }))
    }

    // ---- instance directory, consumed by the relay ----

    /// Registers (or refreshes) the advertise URL peers use to hand off
    /// envelopes to this instance. Carries the same deadline discipline as
    /// presence entries.
    pub async fn register_instance(&self, instance_id: &InstanceId, base_url: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO instances (instance_id, base_url, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(instance_id) DO UPDATE SET
                 base_url = excluded.base_url,
                 expires_at = excluded.expires_at",
        )
        .bind(&instance_id.0)
        .bind(base_url)
        .bind(now + self.ttl_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn instance_url(&self, instance_id: &InstanceId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT base_url FROM instances WHERE instance_id = ? AND expires_at > ?")
            .bind(&instance_id.0)
            .bind(Utc::now().timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Removes expired presence entries and instance registrations.
    pub async fn reap_expired(&self) -> Result<(u64, u64)> {
        let now = Utc::now().timestamp_millis();
        let presence = sqlx::query("DELETE FROM presence WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let instances = sqlx::query("DELETE FROM instances WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok((presence, instances))
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
