//! Store contract consumed by the harvester.
//!
//! The store owns the schema; the harvester only needs to enumerate
//! entities, look up an entry by `(entity, date)`, and update or insert it.
//! Three backends implement [`ProductivityStore`]: SQLite (local runs and
//! tests), PostgREST over HTTP, and an in-memory map.

pub mod memory;
pub mod rest;
pub mod sink;
pub mod sqlite;

use crate::config::{HarvestConfig, StoreTarget};
use crate::error::{HarvestError, Result};
use crate::model::{Counter, Entity, ProductivityRecord};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

pub use memory::MemoryStore;
pub use rest::RestStore;
pub use sink::{ReconciliationSink, UpsertOutcome};
pub use sqlite::SqliteStore;

/// Table and column names of the productivity schema.
pub mod schema {
    pub const ENTITIES: &str = "usuarios";
    pub const ACCESSES: &str = "acessos";
    pub const ENTRIES: &str = "produtividade";
    /// Only third-party clinicians are harvested.
    pub const HARVESTED_KIND: &str = "terceiro";
}

/// Store-side primary key of a productivity entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct EntryId(pub String);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ISO date used as the second half of the entry key.
pub fn iso_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Descriptive fields plus every counter, keyed by store column.
pub fn entry_payload(record: &ProductivityRecord) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("nome".into(), Value::from(record.name.clone()));
    payload.insert("especialidade".into(), Value::from(record.category.clone()));
    payload.insert("vinculo".into(), Value::from(record.affiliation.clone()));
    for c in Counter::ALL {
        payload.insert(c.as_str().into(), Value::from(record.counter(c)));
    }
    payload
}

#[async_trait]
pub trait ProductivityStore: Send + Sync {
    /// Cheap reachability check; failure aborts the run before any browser
    /// work starts.
    async fn ping(&self) -> Result<()>;
    /// Harvestable entities, in a stable order.
    async fn list_entities(&self) -> Result<Vec<Entity>>;
    /// Distinct CPFs with at least one access on `date`.
    async fn entities_accessed_on(&self, date: NaiveDate) -> Result<Vec<String>>;
    async fn find_entry(&self, entity_id: &str, date: NaiveDate) -> Result<Option<EntryId>>;
    async fn update_entry(&self, id: &EntryId, record: &ProductivityRecord) -> Result<()>;
    async fn insert_entry(&self, date: NaiveDate, record: &ProductivityRecord) -> Result<EntryId>;
}

/// Open the store named by the configuration.
pub fn open_store(config: &HarvestConfig) -> Result<Arc<dyn ProductivityStore>> {
    match &config.store {
        Some(StoreTarget::Rest { url, key }) => Ok(Arc::new(RestStore::new(url, key)?)),
        Some(StoreTarget::Sqlite(path)) => Ok(Arc::new(SqliteStore::open(path)?)),
        None => Err(HarvestError::Setup(
            "no store configured: set HARVEST_STORE_URL/HARVEST_STORE_KEY or HARVEST_SQLITE_PATH"
                .to_string(),
        )),
    }
}
