use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::parser::classify::ObjectKind;

pub const DB_PATH: &str = "data/crm.sqlite";
const DOCUMENT_KEY: &str = "crm_data";
const UPDATE_CHANNEL_CAPACITY: usize = 64;

pub fn connect(path: &str) -> Result<Connection> {
    if let Some(dir) = Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {path}"))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv (
            key        TEXT PRIMARY KEY,
            value      TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

// ── Key-value ──

pub fn read_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM kv WHERE key = ?1", [key], |r| r.get(0))
        .optional()?;
    Ok(value)
}

pub fn write_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![key, value],
    )?;
    Ok(())
}

pub fn remove_value(conn: &Connection, key: &str) -> Result<()> {
    conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
    Ok(())
}

// ── Extracted rows ──

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadRow {
    pub id: String,
    pub name: String,
    pub company: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub lead_source: Option<String>,
    pub lead_status: Option<String>,
    pub lead_owner: Option<String>,
    pub extracted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRow {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub account_name: Option<String>,
    pub title: Option<String>,
    pub contact_owner: Option<String>,
    pub mailing_address: Option<String>,
    pub extracted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRow {
    pub id: String,
    pub account_name: String,
    pub website: Option<String>,
    pub phone: Option<String>,
    pub industry: Option<String>,
    #[serde(rename = "type")]
    pub account_type: Option<String>,
    pub account_owner: Option<String>,
    pub annual_revenue: Option<f64>,
    pub extracted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityRow {
    pub id: String,
    pub opportunity_name: String,
    pub amount: Option<f64>,
    pub stage: Option<String>,
    pub probability: Option<u32>,
    pub close_date: Option<String>,
    pub forecast_category: Option<String>,
    pub opportunity_owner: Option<String>,
    pub associated_account: Option<String>,
    pub extracted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRow {
    pub id: String,
    pub subject: String,
    pub due_date: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub related_to: Option<String>,
    pub assigned_to: Option<String>,
    pub extracted_at: i64,
}

// ── Stored records ──

/// A stored record: an ordered field map with at least an `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn from_row<T: Serialize>(row: &T) -> Result<Self> {
        match serde_json::to_value(row)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(anyhow!("expected a field map, got {other}")),
        }
    }

    /// Non-empty `id` field.
    pub fn id(&self) -> Option<&str> {
        self.0
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.0.get(field).and_then(Value::as_f64)
    }

    pub fn last_updated(&self) -> Option<i64> {
        self.0.get("lastUpdated").and_then(Value::as_i64)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    fn stamp(&mut self, now: i64) {
        self.0.insert("lastUpdated".to_string(), Value::from(now));
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// The whole persisted state, stored as one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDocument {
    #[serde(default)]
    pub leads: Vec<Record>,
    #[serde(default)]
    pub contacts: Vec<Record>,
    #[serde(default)]
    pub accounts: Vec<Record>,
    #[serde(default)]
    pub opportunities: Vec<Record>,
    #[serde(default)]
    pub tasks: Vec<Record>,
    /// Collection key → Unix ms of the last successful merge.
    #[serde(default)]
    pub last_sync: BTreeMap<String, i64>,
}

impl StoreDocument {
    pub fn collection(&self, kind: ObjectKind) -> Option<&Vec<Record>> {
        match kind {
            ObjectKind::Lead => Some(&self.leads),
            ObjectKind::Contact => Some(&self.contacts),
            ObjectKind::Account => Some(&self.accounts),
            ObjectKind::Opportunity => Some(&self.opportunities),
            ObjectKind::Task => Some(&self.tasks),
            ObjectKind::Unknown => None,
        }
    }

    fn collection_mut(&mut self, kind: ObjectKind) -> Result<&mut Vec<Record>> {
        match kind {
            ObjectKind::Lead => Ok(&mut self.leads),
            ObjectKind::Contact => Ok(&mut self.contacts),
            ObjectKind::Account => Ok(&mut self.accounts),
            ObjectKind::Opportunity => Ok(&mut self.opportunities),
            ObjectKind::Task => Ok(&mut self.tasks),
            ObjectKind::Unknown => bail!("no collection for unknown object kind"),
        }
    }

    pub fn last_sync(&self, kind: ObjectKind) -> Option<i64> {
        self.last_sync.get(kind.collection_key()).copied()
    }
}

/// Last-write-wins merge by `id`. Existing order is kept, new ids are appended,
/// incoming records without an id are dropped, and every incoming record is
/// stamped with `lastUpdated = now`.
pub fn merge(existing: Vec<Record>, incoming: Vec<Record>, now: i64) -> Vec<Record> {
    let mut merged: Vec<Record> = Vec::with_capacity(existing.len() + incoming.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    let mut upsert = |record: Record| {
        let Some(id) = record.id().map(str::to_string) else {
            return;
        };
        match index.get(&id) {
            Some(&i) => merged[i] = record,
            None => {
                index.insert(id, merged.len());
                merged.push(record);
            }
        }
    };

    for record in existing {
        upsert(record);
    }
    for mut record in incoming {
        record.stamp(now);
        upsert(record);
    }
    merged
}

// ── Outcomes & events ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    NothingToSave,
    Saved { incoming: usize, total: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Published after every change to a collection, carrying its full new contents.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionUpdated {
    pub kind: ObjectKind,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSnapshot {
    pub records: Vec<Record>,
    pub last_sync: Option<i64>,
}

pub struct Stats {
    pub counts: Vec<(ObjectKind, usize)>,
    pub total: usize,
}

// ── Store ──

pub struct Store {
    conn: Mutex<Connection>,
    updates: broadcast::Sender<CollectionUpdated>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        Self::with_connection(connect(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        if read_value(&conn, DOCUMENT_KEY)?.is_none() {
            write_document(&conn, &StoreDocument::default())?;
        }
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            updates,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("store connection mutex poisoned"))
    }

    /// Run `f` with exclusive access to the underlying connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn()?;
        f(&conn)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollectionUpdated> {
        self.updates.subscribe()
    }

    fn publish(&self, kind: ObjectKind, records: Vec<Record>) {
        // no subscribers is fine
        let _ = self.updates.send(CollectionUpdated { kind, records });
    }

    pub fn document(&self) -> Result<StoreDocument> {
        self.with_conn(read_document)
    }

    pub fn collection(&self, kind: ObjectKind) -> Result<CollectionSnapshot> {
        let doc = self.document()?;
        Ok(CollectionSnapshot {
            records: doc.collection(kind).cloned().unwrap_or_default(),
            last_sync: doc.last_sync(kind),
        })
    }

    pub fn last_sync(&self, kind: ObjectKind) -> Result<Option<i64>> {
        Ok(self.document()?.last_sync(kind))
    }

    pub fn save_records(&self, kind: ObjectKind, records: Vec<Record>) -> Result<SaveOutcome> {
        if records.is_empty() {
            debug!("No {} to save", kind);
            return Ok(SaveOutcome::NothingToSave);
        }
        let incoming = records.len();
        let now = Utc::now().timestamp_millis();

        let merged = self.with_conn(|conn| {
            let mut doc = read_document(conn)?;
            let collection = doc.collection_mut(kind)?;
            let existing = std::mem::take(collection);
            *collection = merge(existing, records, now);
            let merged = collection.clone();
            doc.last_sync.insert(kind.collection_key().to_string(), now);
            write_document(conn, &doc)?;
            Ok(merged)
        })?;

        let total = merged.len();
        info!("Saved {} {}, total: {}", incoming, kind, total);
        self.publish(kind, merged);
        Ok(SaveOutcome::Saved { incoming, total })
    }

    pub fn delete_record(&self, kind: ObjectKind, id: &str) -> Result<DeleteOutcome> {
        let remaining = self.with_conn(|conn| {
            let mut doc = read_document(conn)?;
            let collection = doc.collection_mut(kind)?;
            let before = collection.len();
            collection.retain(|r| r.id() != Some(id));
            if collection.len() == before {
                return Ok(None);
            }
            let remaining = collection.clone();
            write_document(conn, &doc)?;
            Ok(Some(remaining))
        })?;

        match remaining {
            Some(records) => {
                info!("Deleted {} {}", kind, id);
                self.publish(kind, records);
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    pub fn clear_kind(&self, kind: ObjectKind) -> Result<()> {
        self.with_conn(|conn| {
            let mut doc = read_document(conn)?;
            doc.collection_mut(kind)?.clear();
            doc.last_sync.remove(kind.collection_key());
            write_document(conn, &doc)
        })?;
        info!("Cleared {}", kind);
        self.publish(kind, Vec::new());
        Ok(())
    }

    pub fn clear_all(&self) -> Result<()> {
        self.with_conn(|conn| write_document(conn, &StoreDocument::default()))?;
        info!("Cleared all collections");
        for kind in ObjectKind::ALL {
            self.publish(kind, Vec::new());
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<Stats> {
        let doc = self.document()?;
        let counts: Vec<_> = ObjectKind::ALL
            .into_iter()
            .map(|k| (k, doc.collection(k).map_or(0, Vec::len)))
            .collect();
        let total = counts.iter().map(|(_, n)| n).sum();
        Ok(Stats { counts, total })
    }
}

fn read_document(conn: &Connection) -> Result<StoreDocument> {
    match read_value(conn, DOCUMENT_KEY)? {
        Some(raw) => serde_json::from_str(&raw).context("Corrupt store document"),
        None => Ok(StoreDocument::default()),
    }
}

fn write_document(conn: &Connection, doc: &StoreDocument) -> Result<()> {
    let raw = serde_json::to_string(doc)?;
    let tx = conn.unchecked_transaction()?;
    write_value(&tx, DOCUMENT_KEY, &raw)?;
    tx.commit()?;
    Ok(())
}
