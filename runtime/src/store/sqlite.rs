//! SQLite-backed productivity store.
//!
//! Creates its own schema on open, so a fresh file is a valid empty store.

use super::{iso_date, schema, EntryId, ProductivityStore};
use crate::error::{HarvestError, Result};
use crate::model::{Counter, Entity, ProductivityRecord};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(path).map_err(|e| {
            HarvestError::persistence(format!("failed to open store {}: {e}", path.display()))
        })?;
        Self::with_connection(db)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(db: Connection) -> Result<Self> {
        let counters: String = Counter::ALL
            .iter()
            .map(|c| format!(",\n                {} INTEGER NOT NULL DEFAULT 0", c.as_str()))
            .collect();
        db.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {entities} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                nome TEXT NOT NULL,
                cpf TEXT,
                codigomv TEXT,
                especialidade TEXT,
                tipo TEXT NOT NULL DEFAULT '{kind}'
            );
            CREATE TABLE IF NOT EXISTS {accesses} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cpf TEXT NOT NULL,
                data_acesso TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_acessos_data ON {accesses}(data_acesso);
            CREATE TABLE IF NOT EXISTS {entries} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                codigo_mv TEXT NOT NULL,
                data TEXT NOT NULL,
                nome TEXT NOT NULL DEFAULT '',
                especialidade TEXT NOT NULL DEFAULT '',
                vinculo TEXT NOT NULL DEFAULT ''{counters},
                UNIQUE (codigo_mv, data)
            );",
            entities = schema::ENTITIES,
            accesses = schema::ACCESSES,
            entries = schema::ENTRIES,
            kind = schema::HARVESTED_KIND,
        ))?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| HarvestError::persistence("store connection lock poisoned"))
    }

    /// Register an entity row. `kind` other than the harvested kind is
    /// stored but never enumerated.
    pub fn add_entity(&self, entity: &Entity, kind: &str) -> Result<()> {
        self.conn()?.execute(
            &format!(
                "INSERT INTO {} (nome, cpf, codigomv, especialidade, tipo) VALUES (?1, ?2, ?3, ?4, ?5)",
                schema::ENTITIES
            ),
            params![entity.name, entity.cpf, entity.entity_id, entity.specialty, kind],
        )?;
        Ok(())
    }

    pub fn record_access(&self, cpf: &str, at: NaiveDateTime) -> Result<()> {
        self.conn()?.execute(
            &format!("INSERT INTO {} (cpf, data_acesso) VALUES (?1, ?2)", schema::ACCESSES),
            params![cpf, at.format("%Y-%m-%d %H:%M:%S").to_string()],
        )?;
        Ok(())
    }

    /// Stored record for `(entity_id, date)`, if any.
    pub fn entry(&self, entity_id: &str, date: NaiveDate) -> Result<Option<ProductivityRecord>> {
        let columns: Vec<&str> = Counter::ALL.iter().map(|c| c.as_str()).collect();
        let sql = format!(
            "SELECT nome, especialidade, vinculo, {} FROM {} WHERE codigo_mv = ?1 AND data = ?2",
            columns.join(", "),
            schema::ENTRIES
        );
        let conn = self.conn()?;
        let record = conn
            .query_row(&sql, params![entity_id, iso_date(date)], |row| {
                let mut counters = BTreeMap::new();
                for (i, c) in Counter::ALL.iter().enumerate() {
                    let v: i64 = row.get(3 + i)?;
                    counters.insert(*c, v.max(0) as u64);
                }
                Ok(ProductivityRecord {
                    entity_id: entity_id.to_string(),
                    name: row.get(0)?,
                    category: row.get(1)?,
                    affiliation: row.get(2)?,
                    counters,
                })
            })
            .optional()?;
        Ok(record)
    }

    pub fn entry_count(&self) -> Result<usize> {
        let n: i64 = self.conn()?.query_row(
            &format!("SELECT COUNT(*) FROM {}", schema::ENTRIES),
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

fn payload_values(record: &ProductivityRecord) -> Vec<SqlValue> {
    let mut values = vec![
        SqlValue::Text(record.name.clone()),
        SqlValue::Text(record.category.clone()),
        SqlValue::Text(record.affiliation.clone()),
    ];
    for c in Counter::ALL {
        values.push(SqlValue::Integer(
            i64::try_from(record.counter(c)).unwrap_or(i64::MAX),
        ));
    }
    values
}

fn payload_columns() -> Vec<&'static str> {
    let mut cols = vec!["nome", "especialidade", "vinculo"];
    cols.extend(Counter::ALL.iter().map(|c| c.as_str()));
    cols
}

#[async_trait]
impl ProductivityStore for SqliteStore {
    async fn ping(&self) -> Result<()> {
        self.conn()?.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    async fn list_entities(&self) -> Result<Vec<Entity>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT codigomv, nome, cpf, especialidade FROM {}
             WHERE tipo = ?1 AND codigomv IS NOT NULL AND TRIM(codigomv) <> ''
             ORDER BY nome, codigomv",
            schema::ENTITIES
        ))?;
        let rows = stmt.query_map(params![schema::HARVESTED_KIND], |row| {
            let code: String = row.get(0)?;
            Ok(Entity {
                entity_id: code.trim().to_string(),
                name: row.get(1)?,
                cpf: row.get(2)?,
                specialty: row.get(3)?,
            })
        })?;
        let entities = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entities)
    }

    async fn entities_accessed_on(&self, date: NaiveDate) -> Result<Vec<String>> {
        let next = date.succ_opt().unwrap_or(date);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT cpf FROM {}
             WHERE data_acesso >= ?1 AND data_acesso < ?2
             ORDER BY cpf",
            schema::ACCESSES
        ))?;
        let rows = stmt.query_map(
            params![
                format!("{} 00:00:00", iso_date(date)),
                format!("{} 00:00:00", iso_date(next))
            ],
            |row| row.get::<_, String>(0),
        )?;
        let cpfs = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cpfs)
    }

    async fn find_entry(&self, entity_id: &str, date: NaiveDate) -> Result<Option<EntryId>> {
        let id: Option<i64> = self
            .conn()?
            .query_row(
                &format!(
                    "SELECT id FROM {} WHERE codigo_mv = ?1 AND data = ?2",
                    schema::ENTRIES
                ),
                params![entity_id, iso_date(date)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(|i| EntryId(i.to_string())))
    }

    async fn update_entry(&self, id: &EntryId, record: &ProductivityRecord) -> Result<()> {
        let assignments: Vec<String> = payload_columns()
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{col} = ?{}", i + 1))
            .collect();
        let mut values = payload_values(record);
        let id_slot = values.len() + 1;
        values.push(SqlValue::Text(id.0.clone()));

        let changed = self.conn()?.execute(
            &format!(
                "UPDATE {} SET {} WHERE id = ?{id_slot}",
                schema::ENTRIES,
                assignments.join(", ")
            ),
            params_from_iter(values),
        )?;
        if changed == 0 {
            return Err(HarvestError::persistence(format!("entry {id} vanished")));
        }
        Ok(())
    }

    async fn insert_entry(&self, date: NaiveDate, record: &ProductivityRecord) -> Result<EntryId> {
        let mut columns = payload_columns();
        columns.extend(["codigo_mv", "data"]);
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let mut values = payload_values(record);
        values.push(SqlValue::Text(record.entity_id.clone()));
        values.push(SqlValue::Text(iso_date(date)));

        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({})",
                schema::ENTRIES,
                columns.join(", "),
                placeholders.join(", ")
            ),
            params_from_iter(values),
        )?;
        Ok(EntryId(conn.last_insert_rowid().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    fn clinician(code: &str, name: &str, cpf: &str) -> Entity {
        Entity {
            entity_id: code.into(),
            name: name.into(),
            cpf: Some(cpf.into()),
            specialty: Some("CLINICA MEDICA".into()),
        }
    }

    #[tokio::test]
    async fn lists_only_harvested_kind_with_codes() {
        let store = SqliteStore::in_memory().unwrap();
        store.add_entity(&clinician("77", "BRUNO", "2"), "terceiro").unwrap();
        store.add_entity(&clinician("12", "ANA", "1"), "terceiro").unwrap();
        store.add_entity(&clinician("99", "CARLA", "3"), "proprio").unwrap();
        store.add_entity(&clinician("  ", "DANI", "4"), "terceiro").unwrap();

        let entities = store.list_entities().await.unwrap();
        let codes: Vec<&str> = entities.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(codes, vec!["12", "77"]);
        assert_eq!(entities[0].cpf.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn accesses_are_bounded_to_the_day() {
        let store = SqliteStore::in_memory().unwrap();
        let at = |d: u32, h: u32| day(d).and_time(NaiveTime::from_hms_opt(h, 0, 0).unwrap());
        store.record_access("1", at(4, 0)).unwrap();
        store.record_access("1", at(4, 23)).unwrap();
        store.record_access("2", at(5, 0)).unwrap();
        store.record_access("3", at(3, 23)).unwrap();

        assert_eq!(store.entities_accessed_on(day(4)).await.unwrap(), vec!["1"]);
        assert_eq!(store.entities_accessed_on(day(5)).await.unwrap(), vec!["2"]);
        assert!(store.entities_accessed_on(day(6)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_then_update_keeps_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("nested/harvest.db")).unwrap();
        let mut record = ProductivityRecord::empty_for(&clinician("12", "ANA", "1"));
        record.counters.insert(Counter::Evolucao, 3);

        assert!(store.find_entry("12", day(4)).await.unwrap().is_none());
        let id = store.insert_entry(day(4), &record).await.unwrap();
        assert_eq!(store.find_entry("12", day(4)).await.unwrap(), Some(id.clone()));

        record.counters.insert(Counter::Evolucao, 9);
        record.affiliation = "PJ".into();
        store.update_entry(&id, &record).await.unwrap();

        assert_eq!(store.entry_count().unwrap(), 1);
        let stored = store.entry("12", day(4)).unwrap().unwrap();
        assert_eq!(stored.counter(Counter::Evolucao), 9);
        assert_eq!(stored.affiliation, "PJ");
        assert_eq!(stored.category, "CLINICA MEDICA");
    }

    #[tokio::test]
    async fn updating_missing_entry_is_a_persistence_error() {
        let store = SqliteStore::in_memory().unwrap();
        let record = ProductivityRecord::empty_for(&Entity::new("1", "X"));
        let err = store
            .update_entry(&EntryId("42".into()), &record)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Persistence(_)));
    }
}
