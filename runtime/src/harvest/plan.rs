//! Work enumeration: which entities to harvest on which dates.

use crate::error::{HarvestError, Result};
use crate::model::{Entity, HarvestTask};
use crate::store::ProductivityStore;
use chrono::{Local, NaiveDate};
use std::collections::HashSet;
use tracing::{info, warn};

/// Restrictions applied on top of the store's entity list.
#[derive(Debug, Clone, Default)]
pub struct PlanFilter {
    /// Keep only these entity ids; empty keeps all.
    pub entity_ids: Vec<String>,
    /// Keep only entities whose CPF has an access on the task date.
    pub only_accessed: bool,
}

/// Inclusive list of days from `from` to `to`.
pub fn date_range(from: NaiveDate, to: NaiveDate) -> Result<Vec<NaiveDate>> {
    if from > to {
        return Err(HarvestError::Config(format!(
            "date range is inverted: {from} > {to}"
        )));
    }
    Ok(from.iter_days().take_while(|d| *d <= to).collect())
}

/// The default harvest date.
pub fn yesterday() -> NaiveDate {
    let today = Local::now().date_naive();
    today.pred_opt().unwrap_or(today)
}

/// Resolve `--date` / `--from` / `--to` into the dates to harvest.
pub fn resolve_dates(
    date: Option<NaiveDate>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<Vec<NaiveDate>> {
    match (date, from, to) {
        (Some(d), None, None) => Ok(vec![d]),
        (Some(_), _, _) => Err(HarvestError::Config(
            "--date cannot be combined with --from/--to".into(),
        )),
        (None, Some(from), to) => date_range(from, to.unwrap_or(from)),
        (None, None, Some(to)) => Ok(vec![to]),
        (None, None, None) => Ok(vec![yesterday()]),
    }
}

fn select_entities(entities: Vec<Entity>, wanted: &[String]) -> Vec<Entity> {
    if wanted.is_empty() {
        return entities;
    }
    let known: HashSet<&str> = entities.iter().map(|e| e.entity_id.as_str()).collect();
    for id in wanted {
        if !known.contains(id.as_str()) {
            warn!("entity {id} is not a harvestable entity in the store; skipping");
        }
    }
    entities
        .into_iter()
        .filter(|e| wanted.iter().any(|w| w == &e.entity_id))
        .collect()
}

/// Date-major task list: every selected entity for the first date, then
/// the next date, keeping the store's entity order.
pub async fn build_plan(
    store: &dyn ProductivityStore,
    dates: &[NaiveDate],
    filter: &PlanFilter,
) -> Result<Vec<HarvestTask>> {
    let entities = select_entities(store.list_entities().await?, &filter.entity_ids);
    let mut tasks = Vec::with_capacity(entities.len() * dates.len());

    for date in dates {
        if filter.only_accessed {
            let accessed: HashSet<String> =
                store.entities_accessed_on(*date).await?.into_iter().collect();
            let before = tasks.len();
            tasks.extend(
                entities
                    .iter()
                    .filter(|e| e.cpf.as_ref().is_some_and(|c| accessed.contains(c)))
                    .map(|e| HarvestTask::new(e.clone(), *date)),
            );
            info!(
                "{date}: {} of {} entities accessed the system",
                tasks.len() - before,
                entities.len()
            );
        } else {
            tasks.extend(entities.iter().map(|e| HarvestTask::new(e.clone(), *date)));
        }
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
    }

    fn entity(id: &str, cpf: &str) -> Entity {
        Entity {
            cpf: Some(cpf.into()),
            ..Entity::new(id, format!("DR {id}"))
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::with_entities(vec![entity("A", "1"), entity("B", "2"), entity("C", "3")])
    }

    #[test]
    fn ranges_are_inclusive_and_ordered() {
        assert_eq!(date_range(d(1), d(3)).unwrap(), vec![d(1), d(2), d(3)]);
        assert_eq!(date_range(d(2), d(2)).unwrap(), vec![d(2)]);
        assert!(date_range(d(3), d(1)).is_err());
    }

    #[test]
    fn resolve_dates_combinations() {
        assert_eq!(resolve_dates(Some(d(5)), None, None).unwrap(), vec![d(5)]);
        assert_eq!(resolve_dates(None, Some(d(1)), Some(d(2))).unwrap(), vec![d(1), d(2)]);
        assert_eq!(resolve_dates(None, Some(d(1)), None).unwrap(), vec![d(1)]);
        assert!(resolve_dates(Some(d(1)), Some(d(1)), None).is_err());
        assert_eq!(resolve_dates(None, None, None).unwrap(), vec![yesterday()]);
    }

    #[tokio::test]
    async fn plan_is_date_major() {
        let store = store();
        let tasks = build_plan(&store, &[d(1), d(2)], &PlanFilter::default())
            .await
            .unwrap();
        let keys: Vec<(String, u32)> = tasks
            .iter()
            .map(|t| (t.entity.entity_id.clone(), chrono::Datelike::day(&t.date)))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("A".into(), 1),
                ("B".into(), 1),
                ("C".into(), 1),
                ("A".into(), 2),
                ("B".into(), 2),
                ("C".into(), 2)
            ]
        );
    }

    #[tokio::test]
    async fn filters_by_entity_and_access() {
        let store = store();
        store.record_access("2", d(1));
        store.record_access("3", d(1));
        store.record_access("3", d(2));

        let filter = PlanFilter {
            entity_ids: vec!["B".into(), "C".into(), "Z".into()],
            only_accessed: true,
        };
        let tasks = build_plan(&store, &[d(1), d(2)], &filter).await.unwrap();
        let keys: Vec<&str> = tasks.iter().map(|t| t.entity.entity_id.as_str()).collect();
        assert_eq!(keys, vec!["B", "C", "C"]);
        assert_eq!(tasks[2].date, d(2));
    }
}
