//! Read-before-write upsert of extracted records.

use super::{EntryId, ProductivityStore};
use crate::error::Result;
use crate::model::ProductivityRecord;
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted(EntryId),
    Updated(EntryId),
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted(_) => "inserted",
            Self::Updated(_) => "updated",
        }
    }

    pub fn entry_id(&self) -> &str {
        match self {
            Self::Inserted(id) | Self::Updated(id) => &id.0,
        }
    }
}

impl fmt::Display for UpsertOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.as_str(), self.entry_id())
    }
}

#[derive(Clone)]
pub struct ReconciliationSink {
    store: Arc<dyn ProductivityStore>,
}

impl ReconciliationSink {
    pub fn new(store: Arc<dyn ProductivityStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ProductivityStore> {
        &self.store
    }

    /// Update the entry keyed by `(record.entity_id, date)` or insert it.
    ///
    /// An insert that loses a race against another writer falls back to
    /// updating the winner's row, so re-applying the same record always
    /// converges on one entry holding the latest values.
    pub async fn upsert(
        &self,
        record: &ProductivityRecord,
        date: NaiveDate,
    ) -> Result<UpsertOutcome> {
        if let Some(id) = self.store.find_entry(&record.entity_id, date).await? {
            self.store.update_entry(&id, record).await?;
            debug!("updated entry {id} for {} on {date}", record.entity_id);
            return Ok(UpsertOutcome::Updated(id));
        }

        match self.store.insert_entry(date, record).await {
            Ok(id) => {
                debug!("inserted entry {id} for {} on {date}", record.entity_id);
                Ok(UpsertOutcome::Inserted(id))
            }
            Err(insert_err) => match self.store.find_entry(&record.entity_id, date).await {
                Ok(Some(id)) => {
                    warn!(
                        "insert for {} on {date} collided ({insert_err}); updating entry {id}",
                        record.entity_id
                    );
                    self.store.update_entry(&id, record).await?;
                    Ok(UpsertOutcome::Updated(id))
                }
                _ => Err(insert_err),
            },
        }
    }
}
