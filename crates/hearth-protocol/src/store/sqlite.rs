//! `SQLite`-backed `KeyStore`.
//!
//! One connection behind a mutex. Every multi-statement change, including a
//! ratchet receive, runs in its own transaction.

use std::collections::BTreeSet;
use std::path::Path;

use hearth_crypto::ratchet::{Retention, StoredMessageKey};
use hearth_crypto::{CryptoError, RatchetState, RatchetStore};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    BundleStore, HashRatchetKey, HashRatchetStore, InstallationStore, RatchetInfo,
    RatchetInfoStore, SharedSecretStore, StoredPreKey, StoredSecret,
};
use crate::error::ProtocolError;
use crate::multidevice::{Installation, InstallationMetadata};

/// Key store schema version. Bump when the schema changes.
const KEY_STORE_SCHEMA_VERSION: i64 = 1;

pub struct SqliteKeyStore {
    conn: Mutex<Connection>,
}

impl SqliteKeyStore {
    /// Open (or create) the key store database and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let conn = Connection::open(path)
            .map_err(|e| ProtocolError::Storage(format!("failed to open key store: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| ProtocolError::Storage(format!("failed to set WAL mode: {e}")))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ProtocolError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ProtocolError::Storage(format!("failed to open key store: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, ProtocolError> {
        let current: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if current != KEY_STORE_SCHEMA_VERSION {
            if current != 0 {
                tracing::info!(
                    old = current,
                    new = KEY_STORE_SCHEMA_VERSION,
                    "key store schema version mismatch, recreating"
                );
                drop_all_tables(&conn)?;
            }
            conn.execute_batch(KEY_STORE_SCHEMA)
                .map_err(|e| ProtocolError::Storage(format!("failed to run key store schema: {e}")))?;
            conn.pragma_update(None, "user_version", KEY_STORE_SCHEMA_VERSION)
                .map_err(|e| ProtocolError::Storage(format!("failed to set schema version: {e}")))?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Drop every user table so the schema can be cleanly re-applied.
fn drop_all_tables(conn: &Connection) -> Result<(), ProtocolError> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(Result::ok)
        .collect();
    drop(stmt);

    for table in &tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))?;
    }
    Ok(())
}

fn to_sql_int(value: u64) -> Result<i64, ProtocolError> {
    i64::try_from(value).map_err(|_| ProtocolError::Storage(format!("{value} does not fit in SQLite")))
}

fn from_sql_int(value: i64) -> Result<u64, ProtocolError> {
    u64::try_from(value).map_err(|_| ProtocolError::Storage(format!("negative stored id {value}")))
}

fn key_32(bytes: &[u8]) -> Result<[u8; 32], ProtocolError> {
    bytes
        .try_into()
        .map_err(|_| ProtocolError::Storage("stored key is not 32 bytes".into()))
}

fn opt_key_32(bytes: Option<Vec<u8>>) -> Result<Option<[u8; 32]>, ProtocolError> {
    bytes.as_deref().map(key_32).transpose()
}

fn storage_err(e: impl std::fmt::Display) -> CryptoError {
    CryptoError::StorageError(e.to_string())
}

impl BundleStore for SqliteKeyStore {
    fn add_signed_pre_key(&self, entry: &StoredPreKey) -> Result<bool, ProtocolError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let superseded: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM bundles WHERE signed_pre_key = ?1
                OR (identity = ?2 AND installation_id = ?3 AND version >= ?4))",
            params![
                entry.signed_pre_key,
                entry.identity,
                entry.installation_id,
                entry.version
            ],
            |row| row.get(0),
        )?;
        if superseded {
            return Ok(false);
        }

        tx.execute(
            "UPDATE bundles SET expired = 1 WHERE identity = ?1 AND installation_id = ?2",
            params![entry.identity, entry.installation_id],
        )?;
        tx.execute(
            "INSERT INTO bundles (identity, installation_id, signed_pre_key, private_key, version, protocol_version, timestamp, expired)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                entry.identity,
                entry.installation_id,
                entry.signed_pre_key,
                entry.private_key.map(|k| k.to_vec()),
                entry.version,
                entry.protocol_version,
                entry.timestamp
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn latest_signed_pre_key(
        &self,
        identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<StoredPreKey>, ProtocolError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT signed_pre_key, private_key, version, protocol_version, timestamp FROM bundles
                 WHERE identity = ?1 AND installation_id = ?2 AND expired = 0
                 ORDER BY version DESC LIMIT 1",
                params![identity, installation_id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(signed_pre_key, private_key, version, protocol_version, timestamp)| {
                Ok(StoredPreKey {
                    identity: identity.to_vec(),
                    installation_id: installation_id.to_string(),
                    signed_pre_key,
                    private_key: opt_key_32(private_key)?,
                    version,
                    protocol_version,
                    timestamp,
                })
            },
        )
        .transpose()
    }

    fn private_key_for_signed_pre_key(
        &self,
        signed_pre_key: &[u8],
    ) -> Result<Option<[u8; 32]>, ProtocolError> {
        let conn = self.conn.lock();
        let private_key: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT private_key FROM bundles WHERE signed_pre_key = ?1",
                params![signed_pre_key],
                |row| row.get(0),
            )
            .optional()?;
        opt_key_32(private_key.flatten())
    }
}

fn read_ratchet_info(row: &rusqlite::Row<'_>) -> rusqlite::Result<RatchetInfoRow> {
    Ok(RatchetInfoRow {
        id: row.get(0)?,
        sk: row.get(1)?,
        private_key: row.get(2)?,
        public_key: row.get(3)?,
        identity: row.get(4)?,
        bundle_id: row.get(5)?,
        ephemeral_key: row.get(6)?,
        installation_id: row.get(7)?,
    })
}

struct RatchetInfoRow {
    id: Vec<u8>,
    sk: Vec<u8>,
    private_key: Option<Vec<u8>>,
    public_key: Vec<u8>,
    identity: Vec<u8>,
    bundle_id: Vec<u8>,
    ephemeral_key: Option<Vec<u8>>,
    installation_id: String,
}

impl RatchetInfoRow {
    fn into_info(self) -> Result<RatchetInfo, ProtocolError> {
        Ok(RatchetInfo {
            id: self.id,
            sk: key_32(&self.sk)?,
            private_key: opt_key_32(self.private_key)?,
            public_key: key_32(&self.public_key)?,
            identity: self.identity,
            bundle_id: self.bundle_id,
            ephemeral_key: opt_key_32(self.ephemeral_key)?,
            installation_id: self.installation_id,
        })
    }
}

const RATCHET_INFO_COLUMNS: &str =
    "id, sk, private_key, public_key, identity, bundle_id, ephemeral_key, installation_id";

impl SqliteKeyStore {
    fn insert_ratchet_info(&self, verb: &str, info: &RatchetInfo) -> Result<(), ProtocolError> {
        self.conn.lock().execute(
            &format!("{verb} INTO ratchet_info ({RATCHET_INFO_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                info.id,
                info.sk.as_slice(),
                info.private_key.map(|k| k.to_vec()),
                info.public_key.as_slice(),
                info.identity,
                info.bundle_id,
                info.ephemeral_key.map(|k| k.to_vec()),
                info.installation_id
            ],
        )?;
        Ok(())
    }
}

impl RatchetInfoStore for SqliteKeyStore {
    fn add_ratchet_info(&self, info: &RatchetInfo) -> Result<(), ProtocolError> {
        self.insert_ratchet_info("INSERT OR IGNORE", info)
    }

    // REPLACE deletes the old row, so the new one gets the highest rowid.
    fn replace_ratchet_info(&self, info: &RatchetInfo) -> Result<(), ProtocolError> {
        self.insert_ratchet_info("INSERT OR REPLACE", info)
    }

    fn ratchet_info(
        &self,
        bundle_id: &[u8],
        identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<RatchetInfo>, ProtocolError> {
        let id = RatchetInfo::session_id(bundle_id, identity, installation_id);
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {RATCHET_INFO_COLUMNS} FROM ratchet_info WHERE id = ?1"),
            params![id],
            read_ratchet_info,
        )
        .optional()?
        .map(RatchetInfoRow::into_info)
        .transpose()
    }

    fn latest_ratchet_info(
        &self,
        identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<RatchetInfo>, ProtocolError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {RATCHET_INFO_COLUMNS} FROM ratchet_info
                 WHERE identity = ?1 AND installation_id = ?2 ORDER BY rowid DESC LIMIT 1"
            ),
            params![identity, installation_id],
            read_ratchet_info,
        )
        .optional()?
        .map(RatchetInfoRow::into_info)
        .transpose()
    }

    fn confirm_ratchet_info(
        &self,
        bundle_id: &[u8],
        identity: &[u8],
        installation_id: &str,
    ) -> Result<(), ProtocolError> {
        let id = RatchetInfo::session_id(bundle_id, identity, installation_id);
        self.conn.lock().execute(
            "UPDATE ratchet_info SET ephemeral_key = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

impl InstallationStore for SqliteKeyStore {
    fn installations(&self, identity: &[u8]) -> Result<Vec<Installation>, ProtocolError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT installation_id, version, enabled, timestamp FROM installations WHERE identity = ?1",
        )?;
        let rows = stmt.query_map(params![identity], |row| {
            Ok(Installation {
                id: row.get(0)?,
                identity: identity.to_vec(),
                version: row.get(1)?,
                enabled: row.get(2)?,
                timestamp: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn upsert_installation(
        &self,
        identity: &[u8],
        installation: &Installation,
    ) -> Result<(), ProtocolError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO installations (identity, installation_id, version, enabled, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                identity,
                installation.id,
                installation.version,
                installation.enabled,
                installation.timestamp
            ],
        )?;
        Ok(())
    }

    fn set_installation_enabled(
        &self,
        identity: &[u8],
        installation_id: &str,
        enabled: bool,
    ) -> Result<(), ProtocolError> {
        self.conn.lock().execute(
            "UPDATE installations SET enabled = ?3 WHERE identity = ?1 AND installation_id = ?2",
            params![identity, installation_id, enabled],
        )?;
        Ok(())
    }

    fn set_installation_metadata(
        &self,
        identity: &[u8],
        installation_id: &str,
        metadata: &InstallationMetadata,
    ) -> Result<(), ProtocolError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO installation_metadata (identity, installation_id, name, device_type, fcm_token)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                identity,
                installation_id,
                metadata.name,
                metadata.device_type,
                metadata.fcm_token
            ],
        )?;
        Ok(())
    }

    fn installation_metadata(
        &self,
        identity: &[u8],
        installation_id: &str,
    ) -> Result<Option<InstallationMetadata>, ProtocolError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT name, device_type, fcm_token FROM installation_metadata
                 WHERE identity = ?1 AND installation_id = ?2",
                params![identity, installation_id],
                |row| {
                    Ok(InstallationMetadata {
                        name: row.get(0)?,
                        device_type: row.get(1)?,
                        fcm_token: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }
}

impl SqliteKeyStore {
    fn secret_installation_ids(
        conn: &Connection,
        identity: &[u8],
    ) -> Result<BTreeSet<String>, ProtocolError> {
        let mut stmt =
            conn.prepare("SELECT installation_id FROM secret_installation_ids WHERE identity = ?1")?;
        let ids = stmt.query_map(params![identity], |row| row.get(0))?;
        Ok(ids.collect::<Result<BTreeSet<String>, _>>()?)
    }
}

impl SharedSecretStore for SqliteKeyStore {
    fn add_shared_secret(
        &self,
        identity: &[u8],
        secret: &[u8; 32],
        installation_id: &str,
    ) -> Result<(), ProtocolError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO secrets (identity, secret) VALUES (?1, ?2)",
            params![identity, secret.as_slice()],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO secret_installation_ids (identity, installation_id) VALUES (?1, ?2)",
            params![identity, installation_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn shared_secret(&self, identity: &[u8]) -> Result<Option<StoredSecret>, ProtocolError> {
        let conn = self.conn.lock();
        let secret: Option<Vec<u8>> = conn
            .query_row(
                "SELECT secret FROM secrets WHERE identity = ?1",
                params![identity],
                |row| row.get(0),
            )
            .optional()?;
        let Some(secret) = secret else {
            return Ok(None);
        };
        Ok(Some(StoredSecret {
            identity: identity.to_vec(),
            secret: key_32(&secret)?,
            installation_ids: Self::secret_installation_ids(&conn, identity)?,
        }))
    }

    fn all_shared_secrets(&self) -> Result<Vec<StoredSecret>, ProtocolError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT identity, secret FROM secrets")?;
        let rows: Vec<(Vec<u8>, Vec<u8>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        rows.into_iter()
            .map(|(identity, secret)| {
                Ok(StoredSecret {
                    installation_ids: Self::secret_installation_ids(&conn, &identity)?,
                    secret: key_32(&secret)?,
                    identity,
                })
            })
            .collect()
    }
}

fn read_hash_ratchet_key(
    group_id: &[u8],
    row: (i64, Vec<u8>, u32),
) -> Result<HashRatchetKey, ProtocolError> {
    let (key_id, key, seq_no) = row;
    Ok(HashRatchetKey {
        group_id: group_id.to_vec(),
        key_id: from_sql_int(key_id)?,
        key: key_32(&key)?,
        seq_no,
    })
}

impl HashRatchetStore for SqliteKeyStore {
    fn add_hash_ratchet_key(
        &self,
        group_id: &[u8],
        key_id: u64,
        key: &[u8; 32],
    ) -> Result<bool, ProtocolError> {
        let inserted = self.conn.lock().execute(
            "INSERT OR IGNORE INTO hash_ratchet_keys (group_id, key_id, key, seq_no) VALUES (?1, ?2, ?3, 0)",
            params![group_id, to_sql_int(key_id)?, key.as_slice()],
        )?;
        Ok(inserted > 0)
    }

    fn hash_ratchet_key(
        &self,
        group_id: &[u8],
        key_id: u64,
    ) -> Result<Option<HashRatchetKey>, ProtocolError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT key_id, key, seq_no FROM hash_ratchet_keys WHERE group_id = ?1 AND key_id = ?2",
            params![group_id, to_sql_int(key_id)?],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
        .map(|row| read_hash_ratchet_key(group_id, row))
        .transpose()
    }

    fn current_hash_ratchet_key(
        &self,
        group_id: &[u8],
    ) -> Result<Option<HashRatchetKey>, ProtocolError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT key_id, key, seq_no FROM hash_ratchet_keys WHERE group_id = ?1
             ORDER BY key_id DESC LIMIT 1",
            params![group_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
        .map(|row| read_hash_ratchet_key(group_id, row))
        .transpose()
    }

    fn hash_ratchet_key_ids(&self, group_id: &[u8]) -> Result<Vec<u64>, ProtocolError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key_id FROM hash_ratchet_keys WHERE group_id = ?1 ORDER BY key_id ASC",
        )?;
        let ids: Vec<i64> = stmt
            .query_map(params![group_id], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        ids.into_iter().map(from_sql_int).collect()
    }

    fn set_hash_ratchet_seq_no(
        &self,
        group_id: &[u8],
        key_id: u64,
        seq_no: u32,
    ) -> Result<(), ProtocolError> {
        self.conn.lock().execute(
            "UPDATE hash_ratchet_keys SET seq_no = ?3 WHERE group_id = ?1 AND key_id = ?2",
            params![group_id, to_sql_int(key_id)?, seq_no],
        )?;
        Ok(())
    }

    fn delete_hash_ratchet_key(&self, group_id: &[u8], key_id: u64) -> Result<(), ProtocolError> {
        let key_id = to_sql_int(key_id)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM hash_ratchet_cache WHERE group_id = ?1 AND key_id = ?2",
            params![group_id, key_id],
        )?;
        tx.execute(
            "DELETE FROM hash_ratchet_keys WHERE group_id = ?1 AND key_id = ?2",
            params![group_id, key_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn nearest_cached_hash(
        &self,
        group_id: &[u8],
        key_id: u64,
        seq_no: u32,
    ) -> Result<Option<(u32, [u8; 32])>, ProtocolError> {
        let conn = self.conn.lock();
        let row: Option<(u32, Vec<u8>)> = conn
            .query_row(
                "SELECT seq_no, hash FROM hash_ratchet_cache
                 WHERE group_id = ?1 AND key_id = ?2 AND seq_no <= ?3
                 ORDER BY seq_no DESC LIMIT 1",
                params![group_id, to_sql_int(key_id)?, seq_no],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(seq, hash)| Ok((seq, key_32(&hash)?))).transpose()
    }

    fn cache_hash(
        &self,
        group_id: &[u8],
        key_id: u64,
        seq_no: u32,
        hash: &[u8; 32],
    ) -> Result<(), ProtocolError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO hash_ratchet_cache (group_id, key_id, seq_no, hash) VALUES (?1, ?2, ?3, ?4)",
            params![group_id, to_sql_int(key_id)?, seq_no, hash.as_slice()],
        )?;
        Ok(())
    }
}

impl RatchetStore for SqliteKeyStore {
    fn load_state(&self, session_id: &[u8]) -> Result<Option<RatchetState>, CryptoError> {
        let conn = self.conn.lock();
        let state: Option<Vec<u8>> = conn
            .query_row(
                "SELECT state FROM ratchet_states WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        state
            .map(|bytes| serde_json::from_slice(&bytes).map_err(storage_err))
            .transpose()
    }

    fn save_state(&self, session_id: &[u8], state: &RatchetState) -> Result<(), CryptoError> {
        let bytes = serde_json::to_vec(state).map_err(storage_err)?;
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO ratchet_states (session_id, state) VALUES (?1, ?2)",
                params![session_id, bytes],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn get_message_key(
        &self,
        session_id: &[u8],
        ratchet_key: &[u8; 32],
        index: u32,
    ) -> Result<Option<[u8; 32]>, CryptoError> {
        let conn = self.conn.lock();
        let key: Option<Vec<u8>> = conn
            .query_row(
                "SELECT message_key FROM message_keys
                 WHERE session_id = ?1 AND ratchet_key = ?2 AND msg_num = ?3",
                params![session_id, ratchet_key.as_slice(), index],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        key.map(|k| {
            <[u8; 32]>::try_from(k.as_slice())
                .map_err(|_| CryptoError::StorageError("stored message key is not 32 bytes".into()))
        })
        .transpose()
    }

    fn delete_message_key(
        &self,
        session_id: &[u8],
        ratchet_key: &[u8; 32],
        index: u32,
    ) -> Result<(), CryptoError> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM message_keys WHERE session_id = ?1 AND ratchet_key = ?2 AND msg_num = ?3",
                params![session_id, ratchet_key.as_slice(), index],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn count_message_keys(&self, session_id: &[u8]) -> Result<usize, CryptoError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM message_keys WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        usize::try_from(count).map_err(storage_err)
    }

    fn commit(
        &self,
        session_id: &[u8],
        state: &RatchetState,
        new_keys: &[StoredMessageKey],
        retention: Retention,
    ) -> Result<(), CryptoError> {
        let bytes = serde_json::to_vec(state).map_err(storage_err)?;
        let max_keys = i64::try_from(retention.max_keys).unwrap_or(i64::MAX);
        let purge_below = i64::try_from(retention.purge_below_seq).map_err(storage_err)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(storage_err)?;
        tx.execute(
            "INSERT OR REPLACE INTO ratchet_states (session_id, state) VALUES (?1, ?2)",
            params![session_id, bytes],
        )
        .map_err(storage_err)?;

        for key in new_keys {
            tx.execute(
                "INSERT OR REPLACE INTO message_keys (session_id, ratchet_key, msg_num, message_key, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session_id,
                    key.ratchet_key.as_slice(),
                    key.index,
                    key.key.as_slice(),
                    i64::try_from(key.seq).map_err(storage_err)?
                ],
            )
            .map_err(storage_err)?;
        }

        tx.execute(
            "DELETE FROM message_keys WHERE session_id = ?1 AND seq NOT IN (
                SELECT seq FROM message_keys WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2)",
            params![session_id, max_keys],
        )
        .map_err(storage_err)?;
        tx.execute(
            "DELETE FROM message_keys WHERE session_id = ?1 AND seq < ?2",
            params![session_id, purge_below],
        )
        .map_err(storage_err)?;

        tx.commit().map_err(storage_err)
    }
}

const KEY_STORE_SCHEMA: &str = r"
-- Signed pre-keys, ours (with private_key) and our peers'
CREATE TABLE IF NOT EXISTS bundles (
    signed_pre_key BLOB PRIMARY KEY,
    identity BLOB NOT NULL,
    installation_id TEXT NOT NULL,
    private_key BLOB,
    version INTEGER NOT NULL,
    protocol_version INTEGER NOT NULL DEFAULT 0,
    timestamp INTEGER NOT NULL,
    expired INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_bundles_installation
    ON bundles(identity, installation_id, version);

CREATE TABLE IF NOT EXISTS ratchet_info (
    id BLOB PRIMARY KEY,
    sk BLOB NOT NULL,
    private_key BLOB,
    public_key BLOB NOT NULL,
    identity BLOB NOT NULL,
    bundle_id BLOB NOT NULL,
    ephemeral_key BLOB,
    installation_id TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ratchet_info_peer
    ON ratchet_info(identity, installation_id);

CREATE TABLE IF NOT EXISTS ratchet_states (
    session_id BLOB PRIMARY KEY,
    state BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS message_keys (
    session_id BLOB NOT NULL,
    ratchet_key BLOB NOT NULL,
    msg_num INTEGER NOT NULL,
    message_key BLOB NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (session_id, ratchet_key, msg_num)
);

CREATE INDEX IF NOT EXISTS idx_message_keys_seq
    ON message_keys(session_id, seq);

CREATE TABLE IF NOT EXISTS installations (
    identity BLOB NOT NULL,
    installation_id TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1,
    timestamp INTEGER NOT NULL,
    PRIMARY KEY (identity, installation_id)
);

CREATE TABLE IF NOT EXISTS installation_metadata (
    identity BLOB NOT NULL,
    installation_id TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    device_type TEXT NOT NULL DEFAULT '',
    fcm_token TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (identity, installation_id)
);

CREATE TABLE IF NOT EXISTS secrets (
    identity BLOB PRIMARY KEY,
    secret BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS secret_installation_ids (
    identity BLOB NOT NULL REFERENCES secrets(identity) ON DELETE CASCADE,
    installation_id TEXT NOT NULL,
    PRIMARY KEY (identity, installation_id)
);

-- Community hash ratchet generations and their derived-hash cache
CREATE TABLE IF NOT EXISTS hash_ratchet_keys (
    group_id BLOB NOT NULL,
    key_id INTEGER NOT NULL,
    key BLOB NOT NULL,
    seq_no INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (group_id, key_id)
);

CREATE TABLE IF NOT EXISTS hash_ratchet_cache (
    group_id BLOB NOT NULL,
    key_id INTEGER NOT NULL,
    seq_no INTEGER NOT NULL,
    hash BLOB NOT NULL,
    PRIMARY KEY (group_id, key_id, seq_no)
);
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    fn store() -> SqliteKeyStore {
        SqliteKeyStore::open_in_memory().unwrap()
    }

    #[test]
    fn signed_pre_key_versions() {
        contract::signed_pre_key_versions(&store());
    }

    #[test]
    fn private_keys_survive_expiry() {
        contract::private_keys_survive_expiry(&store());
    }

    #[test]
    fn ratchet_info_lifecycle() {
        contract::ratchet_info_lifecycle(&store());
    }

    #[test]
    fn installations_and_metadata() {
        contract::installations_and_metadata(&store());
    }

    #[test]
    fn shared_secrets() {
        contract::shared_secrets(&store());
    }

    #[test]
    fn hash_ratchet_keys() {
        contract::hash_ratchet_keys(&store());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");

        {
            let store = SqliteKeyStore::open(&path).unwrap();
            store.add_shared_secret(&[1; 32], &[2; 32], "peer-1").unwrap();
        }

        let store = SqliteKeyStore::open(&path).unwrap();
        let secret = store.shared_secret(&[1; 32]).unwrap().unwrap();
        assert_eq!(secret.secret, [2; 32]);
        assert!(secret.installation_ids.contains("peer-1"));
    }

    #[test]
    fn ratchet_commit_applies_retention() {
        use hearth_crypto::ratchet::DhKeyPair;
        use hearth_crypto::{DefaultRatchetCrypto, DoubleRatchetSession, RatchetLimits};

        let store = store();
        DoubleRatchetSession::new_responder(
            b"s".to_vec(),
            DefaultRatchetCrypto,
            &[1; 32],
            DhKeyPair::from_secret([2; 32]),
            &store,
            RatchetLimits::default(),
        )
        .unwrap();
        let crypto_state = store.load_state(b"s").unwrap().unwrap();

        let keys: Vec<_> = (0..5u32)
            .map(|i| StoredMessageKey {
                ratchet_key: [9; 32],
                index: i,
                key: [7; 32],
                seq: u64::from(i),
            })
            .collect();
        store
            .commit(
                b"s",
                &crypto_state,
                &keys,
                Retention {
                    max_keys: 4,
                    purge_below_seq: 2,
                },
            )
            .unwrap();

        assert_eq!(store.count_message_keys(b"s").unwrap(), 3);
        assert!(store.get_message_key(b"s", &[9; 32], 1).unwrap().is_none());
        assert!(store.get_message_key(b"s", &[9; 32], 4).unwrap().is_some());
        assert!(store.load_state(b"s").unwrap().is_some());

        store.delete_message_key(b"s", &[9; 32], 4).unwrap();
        assert!(store.get_message_key(b"s", &[9; 32], 4).unwrap().is_none());
    }
}
