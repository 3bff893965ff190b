//! In-memory store for dry runs and tests.

use super::{EntryId, ProductivityStore};
use crate::error::{HarvestError, Result};
use crate::model::{Entity, ProductivityRecord};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct Tables {
    entities: Vec<Entity>,
    accesses: BTreeMap<NaiveDate, BTreeSet<String>>,
    entries: HashMap<(String, NaiveDate), (EntryId, ProductivityRecord)>,
    writes: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: Vec<Entity>) -> Self {
        let store = Self::new();
        if let Ok(mut t) = store.tables.lock() {
            t.entities = entities;
        }
        store
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| HarvestError::persistence("memory store lock poisoned"))
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(HarvestError::persistence("store offline"));
        }
        Ok(())
    }

    /// Make every later call fail with a persistence error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn record_access(&self, cpf: &str, date: NaiveDate) {
        if let Ok(mut t) = self.tables.lock() {
            t.accesses.entry(date).or_default().insert(cpf.to_string());
        }
    }

    pub fn entry(&self, entity_id: &str, date: NaiveDate) -> Option<ProductivityRecord> {
        let t = self.tables.lock().ok()?;
        t.entries
            .get(&(entity_id.to_string(), date))
            .map(|(_, r)| r.clone())
    }

    pub fn entry_count(&self) -> usize {
        self.tables.lock().map(|t| t.entries.len()).unwrap_or(0)
    }

    /// Inserts plus updates applied so far.
    pub fn writes(&self) -> usize {
        self.tables.lock().map(|t| t.writes).unwrap_or(0)
    }
}

#[async_trait]
impl ProductivityStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    async fn list_entities(&self) -> Result<Vec<Entity>> {
        self.check_online()?;
        Ok(self.tables()?.entities.clone())
    }

    async fn entities_accessed_on(&self, date: NaiveDate) -> Result<Vec<String>> {
        self.check_online()?;
        Ok(self
            .tables()?
            .accesses
            .get(&date)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_entry(&self, entity_id: &str, date: NaiveDate) -> Result<Option<EntryId>> {
        self.check_online()?;
        Ok(self
            .tables()?
            .entries
            .get(&(entity_id.to_string(), date))
            .map(|(id, _)| id.clone()))
    }

    async fn update_entry(&self, id: &EntryId, record: &ProductivityRecord) -> Result<()> {
        self.check_online()?;
        let mut t = self.tables()?;
        let slot = t
            .entries
            .values_mut()
            .find(|(existing, _)| existing == id)
            .ok_or_else(|| HarvestError::persistence(format!("entry {id} vanished")))?;
        slot.1 = record.clone();
        t.writes += 1;
        Ok(())
    }

    async fn insert_entry(&self, date: NaiveDate, record: &ProductivityRecord) -> Result<EntryId> {
        self.check_online()?;
        let mut t = self.tables()?;
        let key = (record.entity_id.clone(), date);
        if t.entries.contains_key(&key) {
            return Err(HarvestError::persistence(format!(
                "duplicate entry for {} on {date}",
                record.entity_id
            )));
        }
        let id = EntryId((self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string());
        t.entries.insert(key, (id.clone(), record.clone()));
        t.writes += 1;
        Ok(id)
    }
}
