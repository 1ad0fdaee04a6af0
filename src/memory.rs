//! Durable group memory.
//!
//! A master group writes every relay's value here before switching the
//! group off and reads them back when switching on. Keys are
//! `(group_id, relay_topic)` so two master groups sharing a relay never
//! overwrite each other. Storage failures are logged and read as `false`.
//!
//! Motion settings adjusted at runtime are kept per group id, so a restart
//! does not fall back to the configured values.

#[cfg(test)]
use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::group::MotionSettings;

pub trait MasterMemory: Send {
    /// Persisted value, `false` when nothing was stored yet.
    fn get(&self, group_id: &str, relay_topic: &str) -> bool;

    fn set(&mut self, group_id: &str, relay_topic: &str, value: bool);
}

pub trait SettingsMemory: Send {
    /// Settings stored by an earlier run, already clamped to their ranges.
    fn load_settings(&self, group_id: &str) -> Option<MotionSettings>;

    fn store_settings(&mut self, group_id: &str, settings: &MotionSettings);
}

/// Volatile memory for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct InMemoryMasterMemory {
    values: HashMap<(String, String), bool>,
    settings: HashMap<String, MotionSettings>,
}

#[cfg(test)]
impl InMemoryMasterMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MasterMemory for InMemoryMasterMemory {
    fn get(&self, group_id: &str, relay_topic: &str) -> bool {
        self.values
            .get(&(group_id.to_string(), relay_topic.to_string()))
            .copied()
            .unwrap_or(false)
    }

    fn set(&mut self, group_id: &str, relay_topic: &str, value: bool) {
        self.values
            .insert((group_id.to_string(), relay_topic.to_string()), value);
    }
}

#[cfg(test)]
impl SettingsMemory for InMemoryMasterMemory {
    fn load_settings(&self, group_id: &str) -> Option<MotionSettings> {
        self.settings.get(group_id).copied()
    }

    fn store_settings(&mut self, group_id: &str, settings: &MotionSettings) {
        self.settings.insert(group_id.to_string(), *settings);
    }
}

/// SQLite-backed memory (WAL), durable across restarts.
pub struct SqliteMasterMemory {
    conn: Connection,
}

impl SqliteMasterMemory {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS master_memory (
                group_id    TEXT NOT NULL,
                relay_topic TEXT NOT NULL,
                value       INTEGER NOT NULL,
                updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY(group_id, relay_topic)
            );
            CREATE TABLE IF NOT EXISTS group_settings (
                group_id        TEXT PRIMARY KEY,
                light_on        INTEGER NOT NULL,
                timeout_minutes INTEGER NOT NULL,
                sensitivity     INTEGER NOT NULL,
                updated_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );",
        )?;

        Ok(Self { conn })
    }

    /// Number of stored relay values, across all groups.
    #[cfg(test)]
    pub fn len(&self) -> rusqlite::Result<usize> {
        self.conn
            .query_row("SELECT COUNT(*) FROM master_memory", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
    }
}

impl MasterMemory for SqliteMasterMemory {
    fn get(&self, group_id: &str, relay_topic: &str) -> bool {
        let result = self
            .conn
            .query_row(
                "SELECT value FROM master_memory WHERE group_id = ?1 AND relay_topic = ?2",
                params![group_id, relay_topic],
                |row| row.get::<_, bool>(0),
            )
            .optional();

        match result {
            Ok(value) => value.unwrap_or(false),
            Err(e) => {
                tracing::error!(group = %group_id, topic = %relay_topic, "Master memory read failed: {}", e);
                false
            }
        }
    }

    fn set(&mut self, group_id: &str, relay_topic: &str, value: bool) {
        if let Err(e) = self.conn.execute(
            "INSERT INTO master_memory (group_id, relay_topic, value)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(group_id, relay_topic) DO UPDATE SET
                value = excluded.value,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
            params![group_id, relay_topic, value],
        ) {
            tracing::error!(group = %group_id, topic = %relay_topic, "Master memory write failed: {}", e);
        }
    }
}

impl SettingsMemory for SqliteMasterMemory {
    fn load_settings(&self, group_id: &str) -> Option<MotionSettings> {
        let result = self
            .conn
            .query_row(
                "SELECT light_on, timeout_minutes, sensitivity FROM group_settings WHERE group_id = ?1",
                params![group_id],
                |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional();

        match result {
            Ok(Some((light_on, timeout, sensitivity))) => {
                let mut settings = MotionSettings {
                    light_on,
                    ..MotionSettings::default()
                };
                settings.set_timeout(timeout as f64);
                settings.set_sensitivity(sensitivity as f64);
                Some(settings)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::error!(group = %group_id, "Settings read failed: {}", e);
                None
            }
        }
    }

    fn store_settings(&mut self, group_id: &str, settings: &MotionSettings) {
        if let Err(e) = self.conn.execute(
            "INSERT INTO group_settings (group_id, light_on, timeout_minutes, sensitivity)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(group_id) DO UPDATE SET
                light_on = excluded.light_on,
                timeout_minutes = excluded.timeout_minutes,
                sensitivity = excluded.sensitivity,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
            params![
                group_id,
                settings.light_on,
                settings.timeout_minutes,
                settings.sensitivity
            ],
        ) {
            tracing::error!(group = %group_id, "Settings write failed: {}", e);
        }
    }
}
