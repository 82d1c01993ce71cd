//! Per-url typed metadata in an SQLite database.
//!
//! Three tables: `Keys` (declared metadata keys with their type),
//! `ObjectUrls` (locations, lowercased) and `Metadata` (one value per url
//! and key, stored as text).

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use crate::error::{BuildError, BuildResult};

pub const DEFAULT_DATABASE_FILENAME: &str = "Metadata.db";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS Keys (
        KeyId INTEGER PRIMARY KEY AUTOINCREMENT,
        TypeId INTEGER NOT NULL,
        Name TEXT NOT NULL,
        UNIQUE (Name, TypeId)
    );
    CREATE TABLE IF NOT EXISTS ObjectUrls (
        ObjectUrlId INTEGER PRIMARY KEY AUTOINCREMENT,
        Location TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS Metadata (
        ObjectUrlId INTEGER NOT NULL,
        KeyId INTEGER NOT NULL,
        Value TEXT NOT NULL,
        PRIMARY KEY (ObjectUrlId, KeyId)
    );
";

const SELECT_METADATA: &str = "
    SELECT o.Location, k.Name, k.TypeId, m.Value
    FROM Metadata m
    JOIN ObjectUrls o ON o.ObjectUrlId = m.ObjectUrlId
    JOIN Keys k ON k.KeyId = m.KeyId";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetadataType {
    String,
    Bool,
    Long,
    ULong,
    Double,
    DateTime,
    Uuid,
}

impl MetadataType {
    pub fn id(self) -> i64 {
        match self {
            Self::String => 1,
            Self::Bool => 2,
            Self::Long => 3,
            Self::ULong => 4,
            Self::Double => 5,
            Self::DateTime => 6,
            Self::Uuid => 7,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        Some(match id {
            1 => Self::String,
            2 => Self::Bool,
            3 => Self::Long,
            4 => Self::ULong,
            5 => Self::Double,
            6 => Self::DateTime,
            7 => Self::Uuid,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MetadataValue {
    String(String),
    Bool(bool),
    Long(i64),
    ULong(u64),
    Double(f64),
    DateTime(DateTime<Utc>),
    Uuid(Uuid),
}

impl MetadataValue {
    pub fn kind(&self) -> MetadataType {
        match self {
            Self::String(_) => MetadataType::String,
            Self::Bool(_) => MetadataType::Bool,
            Self::Long(_) => MetadataType::Long,
            Self::ULong(_) => MetadataType::ULong,
            Self::Double(_) => MetadataType::Double,
            Self::DateTime(_) => MetadataType::DateTime,
            Self::Uuid(_) => MetadataType::Uuid,
        }
    }

    /// Text stored in the database.
    pub fn format(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Bool(b) => b.to_string(),
            Self::Long(v) => v.to_string(),
            Self::ULong(v) => v.to_string(),
            Self::Double(v) => v.to_string(),
            Self::DateTime(t) => t.to_rfc3339(),
            Self::Uuid(u) => u.to_string(),
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetadataKey {
    pub name: String,
    pub kind: MetadataType,
}

impl MetadataKey {
    pub fn new(name: impl Into<String>, kind: MetadataType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty()
    }

    /// Parse stored text as a value of this key's type.
    pub fn parse_value(&self, text: &str) -> Option<MetadataValue> {
        Some(match self.kind {
            MetadataType::String => MetadataValue::String(text.to_string()),
            MetadataType::Bool => MetadataValue::Bool(text.parse().ok()?),
            MetadataType::Long => MetadataValue::Long(text.parse().ok()?),
            MetadataType::ULong => MetadataValue::ULong(text.parse().ok()?),
            MetadataType::Double => MetadataValue::Double(text.parse().ok()?),
            MetadataType::DateTime => MetadataValue::DateTime(
                DateTime::parse_from_rfc3339(text).ok()?.with_timezone(&Utc),
            ),
            MetadataType::Uuid => MetadataValue::Uuid(Uuid::parse_str(text).ok()?),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ObjectMetadata {
    pub url: String,
    pub key: MetadataKey,
    pub value: MetadataValue,
}

impl ObjectMetadata {
    pub fn new(url: impl Into<String>, key: MetadataKey, value: MetadataValue) -> Self {
        Self {
            url: url.into(),
            key,
            value,
        }
    }
}

type RawRow = (String, String, i64, String);

fn to_metadata((url, name, type_id, value): RawRow) -> BuildResult<ObjectMetadata> {
    let kind = MetadataType::from_id(type_id)
        .ok_or_else(|| BuildError::InvalidData(format!("unknown metadata type {type_id}")))?;
    let key = MetadataKey::new(name, kind);
    let value = key.parse_value(&value).ok_or_else(|| {
        BuildError::InvalidData(format!("invalid {kind:?} value `{value}` for key {}", key.name))
    })?;
    Ok(ObjectMetadata { url, key, value })
}

fn normalize(url: &str) -> String {
    url.to_lowercase()
}

/// Metadata provider over an SQLite file. Closed until
/// [`open`](Self::open) or [`create`](Self::create) succeeds.
#[derive(Default)]
pub struct QueryMetadataProvider {
    connection: Mutex<Option<Connection>>,
}

impl QueryMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new database at `path`. An existing file is an error.
    pub fn create(&self, path: &Path) -> BuildResult<()> {
        if path.exists() {
            return Err(BuildError::invalid(format!(
                "metadata database {} already exists",
                path.display()
            )));
        }
        let connection = Connection::open(path)?;
        connection.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "metadata database created");
        *self.connection.lock().expect("metadata lock poisoned") = Some(connection);
        Ok(())
    }

    /// Open the database at `path`, creating it when `create` is set.
    /// Returns false if it does not exist and was not created.
    pub fn open(&self, path: &Path, create: bool) -> BuildResult<bool> {
        if !path.exists() {
            if !create {
                return Ok(false);
            }
            self.create(path)?;
            return Ok(true);
        }
        let connection = Connection::open(path)?;
        connection.execute_batch(SCHEMA)?;
        *self.connection.lock().expect("metadata lock poisoned") = Some(connection);
        Ok(true)
    }

    pub fn close(&self) {
        self.connection.lock().expect("metadata lock poisoned").take();
    }

    pub fn is_open(&self) -> bool {
        self.connection
            .lock()
            .expect("metadata lock poisoned")
            .is_some()
    }

    fn with_connection<R>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<R>,
    ) -> BuildResult<R> {
        let guard = self.connection.lock().expect("metadata lock poisoned");
        let connection = guard
            .as_ref()
            .ok_or_else(|| BuildError::invalid("metadata database is not open"))?;
        Ok(f(connection)?)
    }

    fn query(&self, filter: &str, args: &[&dyn rusqlite::ToSql]) -> BuildResult<Vec<ObjectMetadata>> {
        let rows: Vec<RawRow> = self.with_connection(|c| {
            let mut stmt = c.prepare(&format!("{SELECT_METADATA} {filter}"))?;
            let rows = stmt.query_map(args, |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect()
        })?;
        rows.into_iter().map(to_metadata).collect()
    }

    pub fn fetch_all_keys(&self) -> BuildResult<Vec<MetadataKey>> {
        let rows: Vec<(String, i64)> = self.with_connection(|c| {
            let mut stmt = c.prepare("SELECT Name, TypeId FROM Keys ORDER BY KeyId")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })?;
        Ok(rows
            .into_iter()
            .filter_map(|(name, type_id)| {
                MetadataType::from_id(type_id).map(|kind| MetadataKey::new(name, kind))
            })
            .collect())
    }

    pub fn fetch_all_object_urls(&self) -> BuildResult<Vec<String>> {
        self.with_connection(|c| {
            let mut stmt = c.prepare("SELECT Location FROM ObjectUrls ORDER BY ObjectUrlId")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
    }

    pub fn fetch_by_url(&self, url: &str) -> BuildResult<Vec<ObjectMetadata>> {
        self.query("WHERE o.Location = ?1 ORDER BY k.KeyId", &[&normalize(url)])
    }

    pub fn fetch_by_key(&self, key: &MetadataKey) -> BuildResult<Vec<ObjectMetadata>> {
        self.query(
            "WHERE k.Name = ?1 AND k.TypeId = ?2 ORDER BY o.ObjectUrlId",
            &[&key.name, &key.kind.id()],
        )
    }

    pub fn fetch(&self, url: &str, key: &MetadataKey) -> BuildResult<Option<ObjectMetadata>> {
        Ok(self
            .query(
                "WHERE o.Location = ?1 AND k.Name = ?2 AND k.TypeId = ?3",
                &[&normalize(url), &key.name, &key.kind.id()],
            )?
            .into_iter()
            .next())
    }

    pub fn fetch_all(&self) -> BuildResult<Vec<ObjectMetadata>> {
        self.query("ORDER BY o.ObjectUrlId, k.KeyId", &[])
    }

    /// Declare `key`. False if it is invalid or already declared.
    pub fn add_key(&self, key: &MetadataKey) -> BuildResult<bool> {
        if !key.is_valid() {
            return Ok(false);
        }
        let inserted = self.with_connection(|c| {
            c.execute(
                "INSERT OR IGNORE INTO Keys (TypeId, Name) VALUES (?1, ?2)",
                params![key.kind.id(), key.name],
            )
        })?;
        Ok(inserted > 0)
    }

    /// Remove `key` and every value stored under it.
    pub fn remove_key(&self, key: &MetadataKey) -> BuildResult<bool> {
        let Some(key_id) = self.key_id(key)? else {
            return Ok(false);
        };
        self.with_connection(|c| {
            c.execute("DELETE FROM Metadata WHERE KeyId = ?1", params![key_id])?;
            c.execute("DELETE FROM Keys WHERE KeyId = ?1", params![key_id])
        })?;
        Ok(true)
    }

    fn key_id(&self, key: &MetadataKey) -> BuildResult<Option<i64>> {
        self.with_connection(|c| {
            c.query_row(
                "SELECT KeyId FROM Keys WHERE Name = ?1 AND TypeId = ?2",
                params![key.name, key.kind.id()],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Insert or update a value. Its key must have been added first.
    pub fn write(&self, data: &ObjectMetadata) -> BuildResult<()> {
        if data.value.kind() != data.key.kind {
            return Err(BuildError::InvalidData(format!(
                "value of type {:?} written to key {} of type {:?}",
                data.value.kind(),
                data.key.name,
                data.key.kind
            )));
        }
        let key_id = self.key_id(&data.key)?.ok_or_else(|| {
            BuildError::invalid(format!("metadata key {} has not been added", data.key.name))
        })?;
        let url = normalize(&data.url);
        let value = data.value.format();
        self.with_connection(|c| {
            c.execute(
                "INSERT OR IGNORE INTO ObjectUrls (Location) VALUES (?1)",
                params![url],
            )?;
            let url_id: i64 = c.query_row(
                "SELECT ObjectUrlId FROM ObjectUrls WHERE Location = ?1",
                params![url],
                |row| row.get(0),
            )?;
            c.execute(
                "INSERT INTO Metadata (ObjectUrlId, KeyId, Value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (ObjectUrlId, KeyId) DO UPDATE SET Value = excluded.Value",
                params![url_id, key_id, value],
            )?;
            Ok(())
        })
    }

    /// Delete the value of `key` at `url`. False if there was none.
    pub fn delete(&self, url: &str, key: &MetadataKey) -> BuildResult<bool> {
        let Some(key_id) = self.key_id(key)? else {
            return Ok(false);
        };
        let url = normalize(url);
        let deleted = self.with_connection(|c| {
            c.execute(
                "DELETE FROM Metadata WHERE KeyId = ?1
                 AND ObjectUrlId = (SELECT ObjectUrlId FROM ObjectUrls WHERE Location = ?2)",
                params![key_id, url],
            )
        })?;
        Ok(deleted > 0)
    }
}
