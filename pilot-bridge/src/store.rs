//! Durable bridge state: session bindings, allowlist and pairing requests.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use pilot_channels::ChannelName;
use pilot_opencode::SessionId;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub channel: ChannelName,
    pub peer_id: String,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    pub channel: ChannelName,
    pub peer_id: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct BridgeStore {
    conn: Mutex<Connection>,
}

impl BridgeStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("create store dir {}: {e}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| anyhow::anyhow!("open store {}: {e}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                channel TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (channel, peer_id)
            );

            CREATE TABLE IF NOT EXISTS allowlist (
                channel TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (channel, peer_id)
            );

            CREATE TABLE IF NOT EXISTS pairing_requests (
                channel TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                code TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (channel, peer_id)
            );

            CREATE INDEX IF NOT EXISTS idx_pairing_requests_code ON pairing_requests (code);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_session(&self, channel: ChannelName, peer_id: &str) -> Result<Option<SessionRecord>> {
        let row = self
            .conn()
            .query_row(
                r#"
                SELECT session_id, created_at, updated_at
                  FROM sessions
                 WHERE channel = ?1 AND peer_id = ?2
                "#,
                params![channel.as_str(), peer_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(session_id, created_at, updated_at)| {
            Ok::<_, anyhow::Error>(SessionRecord {
                channel,
                peer_id: peer_id.to_string(),
                session_id: SessionId::new(session_id),
                created_at: timestamp_from_db(created_at)?,
                updated_at: timestamp_from_db(updated_at)?,
            })
        })
        .transpose()
    }

    pub fn upsert_session(&self, channel: ChannelName, peer_id: &str, session_id: &SessionId) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        self.conn().execute(
            r#"
            INSERT INTO sessions (channel, peer_id, session_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(channel, peer_id) DO UPDATE
            SET session_id = excluded.session_id,
                updated_at = excluded.updated_at
            "#,
            params![channel.as_str(), peer_id, session_id.as_str(), now],
        )?;
        Ok(())
    }

    pub fn delete_session(&self, channel: ChannelName, peer_id: &str) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM sessions WHERE channel = ?1 AND peer_id = ?2",
            params![channel.as_str(), peer_id],
        )?;
        Ok(removed > 0)
    }

    pub fn is_allowed(&self, channel: ChannelName, peer_id: &str) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM allowlist WHERE channel = ?1 AND peer_id = ?2",
                params![channel.as_str(), peer_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn allow_peer(&self, channel: ChannelName, peer_id: &str) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO allowlist (channel, peer_id, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(channel, peer_id) DO NOTHING
            "#,
            params![channel.as_str(), peer_id, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Creates (or replaces) the pending request for this identity.
    pub fn create_pairing_request(
        &self,
        channel: ChannelName,
        peer_id: &str,
        code: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<PairingRequest> {
        let request = PairingRequest {
            channel,
            peer_id: peer_id.to_string(),
            code: code.to_string(),
            created_at: now,
            expires_at: now + ttl,
        };
        self.conn().execute(
            r#"
            INSERT INTO pairing_requests (channel, peer_id, code, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(channel, peer_id) DO UPDATE
            SET code = excluded.code,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
            params![
                channel.as_str(),
                peer_id,
                code,
                request.created_at.timestamp_millis(),
                request.expires_at.timestamp_millis(),
            ],
        )?;
        Ok(request)
    }

    /// The identity's unexpired request, if any.
    pub fn get_pairing_request(
        &self,
        channel: ChannelName,
        peer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PairingRequest>> {
        let row = self
            .conn()
            .query_row(
                r#"
                SELECT channel, peer_id, code, created_at, expires_at
                  FROM pairing_requests
                 WHERE channel = ?1 AND peer_id = ?2 AND expires_at > ?3
                "#,
                params![channel.as_str(), peer_id, now.timestamp_millis()],
                pairing_row,
            )
            .optional()?;
        row.map(pairing_from_row).transpose()
    }

    /// Unexpired requests, oldest first, optionally for one channel.
    pub fn list_pairing_requests(
        &self,
        channel: Option<ChannelName>,
        now: DateTime<Utc>,
    ) -> Result<Vec<PairingRequest>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT channel, peer_id, code, created_at, expires_at
              FROM pairing_requests
             WHERE expires_at > ?1 AND (?2 IS NULL OR channel = ?2)
             ORDER BY created_at, peer_id
            "#,
        )?;
        let rows = stmt.query_map(
            params![now.timestamp_millis(), channel.map(|c| c.as_str())],
            pairing_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(pairing_from_row(row?)?);
        }
        Ok(out)
    }

    pub fn find_pairing_requests_by_code(
        &self,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PairingRequest>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT channel, peer_id, code, created_at, expires_at
              FROM pairing_requests
             WHERE code = ?1 AND expires_at > ?2
             ORDER BY created_at, channel
            "#,
        )?;
        let rows = stmt.query_map(params![code.trim(), now.timestamp_millis()], pairing_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(pairing_from_row(row?)?);
        }
        Ok(out)
    }

    /// Removes the request and allowlists its identity in one transaction.
    pub fn approve_pairing_request(
        &self,
        channel: ChannelName,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PairingRequest>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let row = tx
            .query_row(
                r#"
                SELECT channel, peer_id, code, created_at, expires_at
                  FROM pairing_requests
                 WHERE channel = ?1 AND code = ?2 AND expires_at > ?3
                 ORDER BY created_at
                 LIMIT 1
                "#,
                params![channel.as_str(), code.trim(), now.timestamp_millis()],
                pairing_row,
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };
        let request = pairing_from_row(row)?;
        tx.execute(
            "DELETE FROM pairing_requests WHERE channel = ?1 AND peer_id = ?2",
            params![channel.as_str(), request.peer_id],
        )?;
        tx.execute(
            r#"
            INSERT INTO allowlist (channel, peer_id, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(channel, peer_id) DO NOTHING
            "#,
            params![channel.as_str(), request.peer_id, now.timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(Some(request))
    }

    pub fn deny_pairing_request(&self, channel: ChannelName, code: &str) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM pairing_requests WHERE channel = ?1 AND code = ?2",
            params![channel.as_str(), code.trim()],
        )?;
        Ok(removed > 0)
    }

    /// Deletes expired requests; returns how many were removed.
    pub fn prune_pairing_requests(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn().execute(
            "DELETE FROM pairing_requests WHERE expires_at <= ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

type PairingRow = (String, String, String, i64, i64);

fn pairing_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PairingRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn pairing_from_row((channel, peer_id, code, created_at, expires_at): PairingRow) -> Result<PairingRequest> {
    Ok(PairingRequest {
        channel: channel.parse()?,
        peer_id,
        code,
        created_at: timestamp_from_db(created_at)?,
        expires_at: timestamp_from_db(expires_at)?,
    })
}

fn timestamp_from_db(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow::anyhow!("store timestamp out of range: {millis}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(minutes: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + Duration::minutes(minutes)
    }

    #[test]
    fn sessions_upsert_and_delete() {
        let store = BridgeStore::open_in_memory().unwrap();
        assert!(store.get_session(ChannelName::Telegram, "1").unwrap().is_none());

        store
            .upsert_session(ChannelName::Telegram, "1", &SessionId::new("ses_a"))
            .unwrap();
        store
            .upsert_session(ChannelName::Telegram, "1", &SessionId::new("ses_b"))
            .unwrap();
        let record = store.get_session(ChannelName::Telegram, "1").unwrap().unwrap();
        assert_eq!(record.session_id.as_str(), "ses_b");
        assert!(store.get_session(ChannelName::Slack, "1").unwrap().is_none());

        assert!(store.delete_session(ChannelName::Telegram, "1").unwrap());
        assert!(!store.delete_session(ChannelName::Telegram, "1").unwrap());
    }

    #[test]
    fn allowlist_is_per_channel() {
        let store = BridgeStore::open_in_memory().unwrap();
        store.allow_peer(ChannelName::Whatsapp, "+1555").unwrap();
        store.allow_peer(ChannelName::Whatsapp, "+1555").unwrap();
        assert!(store.is_allowed(ChannelName::Whatsapp, "+1555").unwrap());
        assert!(!store.is_allowed(ChannelName::Telegram, "+1555").unwrap());
    }

    #[test]
    fn pairing_requests_expire_at_read_time_and_prune() {
        let store = BridgeStore::open_in_memory().unwrap();
        store
            .create_pairing_request(ChannelName::Telegram, "1", "123456", ts(0), Duration::minutes(60))
            .unwrap();
        store
            .create_pairing_request(ChannelName::Telegram, "2", "654321", ts(30), Duration::minutes(60))
            .unwrap();

        assert!(store.get_pairing_request(ChannelName::Telegram, "1", ts(59)).unwrap().is_some());
        assert!(store.get_pairing_request(ChannelName::Telegram, "1", ts(60)).unwrap().is_none());
        assert_eq!(store.list_pairing_requests(None, ts(61)).unwrap().len(), 1);

        assert_eq!(store.prune_pairing_requests(ts(61)).unwrap(), 1);
        assert_eq!(store.prune_pairing_requests(ts(61)).unwrap(), 0);
    }

    #[test]
    fn approving_a_code_allowlists_the_peer_and_removes_the_request() {
        let store = BridgeStore::open_in_memory().unwrap();
        store
            .create_pairing_request(ChannelName::Whatsapp, "+1555", "111222", ts(0), Duration::minutes(60))
            .unwrap();

        assert!(store
            .approve_pairing_request(ChannelName::Telegram, "111222", ts(1))
            .unwrap()
            .is_none());
        let approved = store
            .approve_pairing_request(ChannelName::Whatsapp, " 111222 ", ts(1))
            .unwrap()
            .expect("request approved");
        assert_eq!(approved.peer_id, "+1555");
        assert!(store.is_allowed(ChannelName::Whatsapp, "+1555").unwrap());
        assert!(store.list_pairing_requests(Some(ChannelName::Whatsapp), ts(1)).unwrap().is_empty());
    }

    #[test]
    fn codes_can_collide_across_channels() {
        let store = BridgeStore::open_in_memory().unwrap();
        store
            .create_pairing_request(ChannelName::Telegram, "1", "333444", ts(0), Duration::minutes(60))
            .unwrap();
        store
            .create_pairing_request(ChannelName::Slack, "U1", "333444", ts(1), Duration::minutes(60))
            .unwrap();
        let matches = store.find_pairing_requests_by_code("333444", ts(2)).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].channel, ChannelName::Telegram);

        assert!(store.deny_pairing_request(ChannelName::Slack, "333444").unwrap());
        assert_eq!(store.find_pairing_requests_by_code("333444", ts(2)).unwrap().len(), 1);
    }

    #[test]
    fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bridge.sqlite");
        {
            let store = BridgeStore::open(&path).unwrap();
            store
                .upsert_session(ChannelName::Telegram, "9", &SessionId::new("ses_9"))
                .unwrap();
        }
        let reopened = BridgeStore::open(&path).unwrap();
        assert_eq!(
            reopened
                .get_session(ChannelName::Telegram, "9")
                .unwrap()
                .unwrap()
                .session_id
                .as_str(),
            "ses_9"
        );
    }
}
