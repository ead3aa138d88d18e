//! SQLite storage for traffic counters, quotas, IP limits and client IP history
//!
//! The `Database` type is the production implementation of the storage
//! collaborators the jobs depend on: [`ClientIpStore`], [`LimitPolicy`] and
//! [`TrafficStore`].

use crate::error::{CoreError, Result};
use crate::iplimit::{ClientIpRecord, ClientIpStore, ClientLimit, LimitPolicy};
use crate::stats::{Counter, TrafficSnapshot};
use crate::traffic::{QuotaKind, QuotaOutcome, TrafficStore};
use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    pub id: i64,
    pub tag: String,
    pub enable: bool,
    pub up: i64,
    pub down: i64,
    /// Total byte allowance; 0 means unlimited
    pub quota: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub email: String,
    pub inbound_id: i64,
    pub enable: bool,
    /// Distinct source IPs allowed at once; 0 disables the check
    pub limit_ip: u32,
    pub up: i64,
    pub down: i64,
    pub quota: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub tag: String,
    pub enable: bool,
    pub up: i64,
    pub down: i64,
    pub quota: i64,
}

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            info!(
                from = current_version,
                to = SCHEMA_VERSION,
                "Running database migrations"
            );
            if current_version < 1 {
                migrate_v1(&conn)?;
            }
            if current_version < 2 {
                migrate_v2(&conn)?;
            }
        }
        Ok(())
    }

    pub fn upsert_inbound(&self, inbound: &InboundRecord) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO inbounds (id, tag, enable, up, down, quota)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                tag = excluded.tag, enable = excluded.enable, up = excluded.up,
                down = excluded.down, quota = excluded.quota",
            params![
                inbound.id,
                inbound.tag,
                inbound.enable,
                inbound.up,
                inbound.down,
                inbound.quota
            ],
        )?;
        Ok(())
    }

    pub fn get_inbound(&self, tag: &str) -> Result<Option<InboundRecord>> {
        let record = self
            .conn
            .lock()
            .query_row(
                "SELECT id, tag, enable, up, down, quota FROM inbounds WHERE tag = ?1",
                params![tag],
                |row| {
                    Ok(InboundRecord {
                        id: row.get(0)?,
                        tag: row.get(1)?,
                        enable: row.get(2)?,
                        up: row.get(3)?,
                        down: row.get(4)?,
                        quota: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn upsert_client(&self, client: &ClientRecord) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO clients (email, inbound_id, enable, limit_ip, up, down, quota)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(email) DO UPDATE SET
                inbound_id = excluded.inbound_id, enable = excluded.enable,
                limit_ip = excluded.limit_ip, up = excluded.up,
                down = excluded.down, quota = excluded.quota",
            params![
                client.email,
                client.inbound_id,
                client.enable,
                client.limit_ip,
                client.up,
                client.down,
                client.quota
            ],
        )?;
        Ok(())
    }

    pub fn get_client(&self, email: &str) -> Result<Option<ClientRecord>> {
        let record = self
            .conn
            .lock()
            .query_row(
                "SELECT email, inbound_id, enable, limit_ip, up, down, quota
                 FROM clients WHERE email = ?1",
                params![email],
                |row| {
                    Ok(ClientRecord {
                        email: row.get(0)?,
                        inbound_id: row.get(1)?,
                        enable: row.get(2)?,
                        limit_ip: row.get(3)?,
                        up: row.get(4)?,
                        down: row.get(5)?,
                        quota: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn upsert_outbound(&self, outbound: &OutboundRecord) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO outbounds (tag, enable, up, down, quota)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tag) DO UPDATE SET
                enable = excluded.enable, up = excluded.up,
                down = excluded.down, quota = excluded.quota",
            params![
                outbound.tag,
                outbound.enable,
                outbound.up,
                outbound.down,
                outbound.quota
            ],
        )?;
        Ok(())
    }

    pub fn get_outbound(&self, tag: &str) -> Result<Option<OutboundRecord>> {
        let record = self
            .conn
            .lock()
            .query_row(
                "SELECT tag, enable, up, down, quota FROM outbounds WHERE tag = ?1",
                params![tag],
                |row| {
                    Ok(OutboundRecord {
                        tag: row.get(0)?,
                        enable: row.get(1)?,
                        up: row.get(2)?,
                        down: row.get(3)?,
                        quota: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

fn migrate_v1(conn: &Connection) -> anyhow::Result<()> {
    debug!("Applying migration v1: traffic and limits");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS inbounds (
            id INTEGER PRIMARY KEY,
            tag TEXT NOT NULL UNIQUE,
            enable INTEGER NOT NULL DEFAULT 1,
            up INTEGER NOT NULL DEFAULT 0,
            down INTEGER NOT NULL DEFAULT 0,
            quota INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS clients (
            email TEXT PRIMARY KEY,
            inbound_id INTEGER NOT NULL,
            enable INTEGER NOT NULL DEFAULT 1,
            limit_ip INTEGER NOT NULL DEFAULT 0,
            up INTEGER NOT NULL DEFAULT 0,
            down INTEGER NOT NULL DEFAULT 0,
            quota INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (inbound_id) REFERENCES inbounds(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_clients_inbound ON clients(inbound_id);

        CREATE TABLE IF NOT EXISTS outbounds (
            tag TEXT PRIMARY KEY,
            enable INTEGER NOT NULL DEFAULT 1,
            up INTEGER NOT NULL DEFAULT 0,
            down INTEGER NOT NULL DEFAULT 0,
            quota INTEGER NOT NULL DEFAULT 0
        );

        INSERT INTO schema_migrations (version) VALUES (1);
        "#,
    )?;
    Ok(())
}

fn migrate_v2(conn: &Connection) -> anyhow::Result<()> {
    debug!("Applying migration v2: client IP history");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS client_ips (
            email TEXT PRIMARY KEY,
            ips TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT NOT NULL
        );

        INSERT INTO schema_migrations (version) VALUES (2);
        "#,
    )?;
    Ok(())
}

/// Disable enabled rows whose `up + down` reached a non-zero quota
fn disable_exhausted(
    tx: &Transaction<'_>,
    table: &str,
    key: &str,
    kind: QuotaKind,
) -> Result<Vec<(QuotaKind, String)>> {
    let keys: Vec<String> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {key} FROM {table}
             WHERE enable = 1 AND quota > 0 AND up + down >= quota
             ORDER BY {key}"
        ))?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<_, _>>()?
    };

    for name in &keys {
        tx.execute(
            &format!("UPDATE {table} SET enable = 0 WHERE {key} = ?1"),
            params![name],
        )?;
    }
    Ok(keys.into_iter().map(|name| (kind, name)).collect())
}

impl TrafficStore for Database {
    fn apply_traffic(&self, snapshot: &TrafficSnapshot) -> Result<QuotaOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for (tag, Counter { up, down }) in &snapshot.inbounds {
            tx.execute(
                "UPDATE inbounds SET up = up + ?1, down = down + ?2 WHERE tag = ?3",
                params![up, down, tag],
            )?;
        }
        for (email, Counter { up, down }) in &snapshot.clients {
            tx.execute(
                "UPDATE clients SET up = up + ?1, down = down + ?2 WHERE email = ?3",
                params![up, down, email],
            )?;
        }
        for (tag, Counter { up, down }) in &snapshot.outbounds {
            tx.execute(
                "INSERT INTO outbounds (tag, up, down) VALUES (?1, ?2, ?3)
                 ON CONFLICT(tag) DO UPDATE SET
                    up = up + excluded.up, down = down + excluded.down",
                params![tag, up, down],
            )?;
        }

        let mut outcome = QuotaOutcome::default();
        outcome
            .disabled
            .extend(disable_exhausted(&tx, "inbounds", "tag", QuotaKind::Inbound)?);
        outcome
            .disabled
            .extend(disable_exhausted(&tx, "clients", "email", QuotaKind::Client)?);
        outcome
            .disabled
            .extend(disable_exhausted(&tx, "outbounds", "tag", QuotaKind::Outbound)?);

        tx.commit()?;
        Ok(outcome)
    }
}

impl LimitPolicy for Database {
    fn ip_limit_active(&self) -> Result<bool> {
        let active: bool = self.conn.lock().query_row(
            "SELECT EXISTS (SELECT 1 FROM clients WHERE limit_ip > 0)",
            [],
            |row| row.get(0),
        )?;
        Ok(active)
    }

    fn client_limit(&self, client: &str) -> Result<Option<ClientLimit>> {
        let limit = self
            .conn
            .lock()
            .query_row(
                "SELECT c.limit_ip, i.enable FROM clients c
                 JOIN inbounds i ON i.id = c.inbound_id
                 WHERE c.email = ?1",
                params![client],
                |row| {
                    Ok(ClientLimit {
                        limit: row.get(0)?,
                        inbound_enabled: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(limit)
    }
}

impl ClientIpStore for Database {
    fn find_by_client(&self, client: &str) -> Result<Option<ClientIpRecord>> {
        let row: Option<(String, String)> = self
            .conn
            .lock()
            .query_row(
                "SELECT ips, updated_at FROM client_ips WHERE email = ?1",
                params![client],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((ips, updated_at)) = row else {
            return Ok(None);
        };
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| CoreError::Parse(format!("client_ips.updated_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(Some(ClientIpRecord {
            client: client.to_string(),
            ips: serde_json::from_str(&ips)?,
            updated_at,
        }))
    }

    fn create(&self, record: &ClientIpRecord) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO client_ips (email, ips, updated_at) VALUES (?1, ?2, ?3)",
            params![
                record.client,
                serde_json::to_string(&record.ips)?,
                record.updated_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn update(&self, record: &ClientIpRecord) -> Result<()> {
        let changed = self.conn.lock().execute(
            "UPDATE client_ips SET ips = ?1, updated_at = ?2 WHERE email = ?3",
            params![
                serde_json::to_string(&record.ips)?,
                record.updated_at.to_rfc3339(),
                record.client
            ],
        )?;
        if changed == 0 {
            return Err(CoreError::Persistence(format!(
                "no IP record for client {}",
                record.client
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.upsert_inbound(&InboundRecord {
            id: 1,
            tag: "in-443".into(),
            enable: true,
            up: 0,
            down: 0,
            quota: 0,
        })
        .unwrap();
        db.upsert_client(&ClientRecord {
            email: "alice@example.com".into(),
            inbound_id: 1,
            enable: true,
            limit_ip: 1,
            up: 0,
            down: 0,
            quota: 1000,
        })
        .unwrap();
        db
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("corekeeper.db");

        Database::open(&path).unwrap();
        let db = Database::open(&path).unwrap();
        assert!(db.get_inbound("missing").unwrap().is_none());
    }

    #[test]
    fn test_apply_traffic_is_additive() {
        let db = seeded();
        let snapshot = TrafficSnapshot::from_stats([
            ("inbound>>>in-443>>>traffic>>>uplink", 100),
            ("inbound>>>in-443>>>traffic>>>downlink", 200),
            ("user>>>alice@example.com>>>traffic>>>uplink", 10),
            ("outbound>>>direct>>>traffic>>>downlink", 7),
        ]);

        assert!(!db.apply_traffic(&snapshot).unwrap().needs_restart());
        assert!(!db.apply_traffic(&snapshot).unwrap().needs_restart());

        let inbound = db.get_inbound("in-443").unwrap().unwrap();
        assert_eq!((inbound.up, inbound.down), (200, 400));
        assert_eq!(db.get_client("alice@example.com").unwrap().unwrap().up, 20);
        assert_eq!(db.get_outbound("direct").unwrap().unwrap().down, 14);
    }

    #[test]
    fn test_quota_crossing_disables_once() {
        let db = seeded();
        let snapshot =
            TrafficSnapshot::from_stats([("user>>>alice@example.com>>>traffic>>>downlink", 600)]);

        assert!(db.apply_traffic(&snapshot).unwrap().disabled.is_empty());
        let outcome = db.apply_traffic(&snapshot).unwrap();
        assert_eq!(
            outcome.disabled,
            vec![(QuotaKind::Client, "alice@example.com".to_string())]
        );
        assert!(!db.get_client("alice@example.com").unwrap().unwrap().enable);

        // Already disabled entries are not reported again
        assert!(db.apply_traffic(&snapshot).unwrap().disabled.is_empty());
    }

    #[test]
    fn test_limit_policy() {
        let db = seeded();
        assert!(db.ip_limit_active().unwrap());
        assert_eq!(
            db.client_limit("alice@example.com").unwrap(),
            Some(ClientLimit {
                limit: 1,
                inbound_enabled: true
            })
        );
        assert_eq!(db.client_limit("nobody").unwrap(), None);

        let mut inbound = db.get_inbound("in-443").unwrap().unwrap();
        inbound.enable = false;
        db.upsert_inbound(&inbound).unwrap();
        assert!(!db.client_limit("alice@example.com").unwrap().unwrap().enforced());
    }

    #[test]
    fn test_ip_limit_inactive_without_limits() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.ip_limit_active().unwrap());
    }

    #[test]
    fn test_client_ip_records() {
        let db = seeded();
        assert!(db.find_by_client("alice@example.com").unwrap().is_none());

        let mut record = ClientIpRecord {
            client: "alice@example.com".into(),
            ips: vec!["198.51.100.9".into()],
            updated_at: Utc::now(),
        };
        assert!(db.update(&record).is_err());
        db.create(&record).unwrap();

        record.ips.push("203.0.113.5".into());
        db.update(&record).unwrap();

        let stored = db.find_by_client("alice@example.com").unwrap().unwrap();
        assert_eq!(stored.ips, vec!["198.51.100.9", "203.0.113.5"]);
        assert_eq!(stored.updated_at.timestamp(), record.updated_at.timestamp());
    }
}
