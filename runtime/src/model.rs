//! Domain types: entities, work items, counters and parsed records.

use crate::error::HarvestError;
use chrono::{Duration as DayDelta, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A clinician as listed in the store's entity table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Opaque key typed into the report form and matched against the first
    /// column of the result table.
    pub entity_id: String,
    pub name: String,
    #[serde(default)]
    pub cpf: Option<String>,
    #[serde(default)]
    pub specialty: Option<String>,
}

impl Entity {
    pub fn new(entity_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            name: name.into(),
            cpf: None,
            specialty: None,
        }
    }
}

/// One query submitted to the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub entity_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

/// Inputs of the report form, in fill order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormField {
    EntityId,
    PeriodStart,
    PeriodEnd,
}

impl fmt::Display for FormField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EntityId => "entity_id",
            Self::PeriodStart => "period_start",
            Self::PeriodEnd => "period_end",
        })
    }
}

/// Named numeric columns of the productivity report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    Procedimento,
    ParecerSolicitado,
    ParecerRealizado,
    CirurgiaRealizada,
    Prescricao,
    Evolucao,
    Urgencia,
    Ambulatorio,
    Auxiliar,
    Encaminhamento,
    FolhaObjetivoDiario,
    EvolucaoDiurnaCti,
    EvolucaoNoturnaCti,
}

/// Column holding the entity key in the result table.
pub const KEY_COLUMN: usize = 0;
pub const NAME_COLUMN: usize = 1;
pub const CATEGORY_COLUMN: usize = 2;
pub const AFFILIATION_COLUMN: usize = 3;

impl Counter {
    pub const ALL: [Counter; 13] = [
        Counter::Procedimento,
        Counter::ParecerSolicitado,
        Counter::ParecerRealizado,
        Counter::CirurgiaRealizada,
        Counter::Prescricao,
        Counter::Evolucao,
        Counter::Urgencia,
        Counter::Ambulatorio,
        Counter::Auxiliar,
        Counter::Encaminhamento,
        Counter::FolhaObjetivoDiario,
        Counter::EvolucaoDiurnaCti,
        Counter::EvolucaoNoturnaCti,
    ];

    /// Zero-based cell index in a result row.
    pub fn column(self) -> usize {
        match self {
            Self::Procedimento => 4,
            Self::ParecerSolicitado => 5,
            Self::ParecerRealizado => 6,
            Self::CirurgiaRealizada => 7,
            Self::Prescricao => 8,
            Self::Evolucao => 9,
            Self::Urgencia => 10,
            Self::Ambulatorio => 11,
            Self::Auxiliar => 12,
            Self::Encaminhamento => 13,
            Self::FolhaObjetivoDiario => 14,
            Self::EvolucaoDiurnaCti => 15,
            Self::EvolucaoNoturnaCti => 16,
        }
    }

    /// Store column name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Procedimento => "procedimento",
            Self::ParecerSolicitado => "parecer_solicitado",
            Self::ParecerRealizado => "parecer_realizado",
            Self::CirurgiaRealizada => "cirurgia_realizada",
            Self::Prescricao => "prescricao",
            Self::Evolucao => "evolucao",
            Self::Urgencia => "urgencia",
            Self::Ambulatorio => "ambulatorio",
            Self::Auxiliar => "auxiliar",
            Self::Encaminhamento => "encaminhamento",
            Self::FolhaObjetivoDiario => "folha_objetivo_diario",
            Self::EvolucaoDiurnaCti => "evolucao_diurna_cti",
            Self::EvolucaoNoturnaCti => "evolucao_noturna_cti",
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Counter {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Counter::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| HarvestError::Config(format!("unknown counter '{s}'")))
    }
}

/// One parsed result row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductivityRecord {
    pub entity_id: String,
    pub name: String,
    pub category: String,
    pub affiliation: String,
    pub counters: BTreeMap<Counter, u64>,
}

impl ProductivityRecord {
    /// A record with every counter at zero and descriptive fields taken from
    /// the entity table.
    pub fn empty_for(entity: &Entity) -> Self {
        Self {
            entity_id: entity.entity_id.clone(),
            name: entity.name.clone(),
            category: entity.specialty.clone().unwrap_or_default(),
            affiliation: String::new(),
            counters: Counter::ALL.into_iter().map(|c| (c, 0)).collect(),
        }
    }

    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters.get(&counter).copied().unwrap_or(0)
    }

    /// Copy `counters` from a record parsed for a later window of the same
    /// task.
    pub fn absorb(&mut self, other: &ProductivityRecord, counters: &[Counter]) {
        for c in counters {
            self.counters.insert(*c, other.counter(*c));
        }
    }
}

/// One query window relative to the task date D: `D - offset ..= D`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportWindow {
    pub start_offset_days: u32,
    pub counters: Vec<Counter>,
}

/// Mapping of counters to the query windows that produce them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPlan {
    windows: Vec<ReportWindow>,
}

impl WindowPlan {
    pub fn new(windows: Vec<ReportWindow>) -> Result<Self, HarvestError> {
        if windows.is_empty() {
            return Err(HarvestError::Config("window plan has no windows".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for w in &windows {
            if w.counters.is_empty() {
                return Err(HarvestError::Config(
                    "window plan contains a window with no counters".into(),
                ));
            }
            for c in &w.counters {
                if !seen.insert(*c) {
                    return Err(HarvestError::Config(format!(
                        "counter '{c}' assigned to more than one window"
                    )));
                }
            }
        }
        Ok(Self { windows })
    }

    /// One same-day window carrying every counter.
    pub fn single() -> Self {
        Self {
            windows: vec![ReportWindow {
                start_offset_days: 0,
                counters: Counter::ALL.to_vec(),
            }],
        }
    }

    /// The productivity report's two-window layout: ward and consult
    /// counters are read over D-1..D, surgical and outpatient ones over D..D.
    pub fn split() -> Self {
        use Counter::*;
        Self {
            windows: vec![
                ReportWindow {
                    start_offset_days: 1,
                    counters: vec![
                        Procedimento,
                        ParecerSolicitado,
                        ParecerRealizado,
                        Encaminhamento,
                        FolhaObjetivoDiario,
                        EvolucaoDiurnaCti,
                        EvolucaoNoturnaCti,
                    ],
                },
                ReportWindow {
                    start_offset_days: 0,
                    counters: vec![
                        CirurgiaRealizada,
                        Prescricao,
                        Evolucao,
                        Urgencia,
                        Ambulatorio,
                        Auxiliar,
                    ],
                },
            ],
        }
    }

    pub fn windows(&self) -> &[ReportWindow] {
        &self.windows
    }

    /// Counters covered by any window, in column order.
    pub fn counters(&self) -> Vec<Counter> {
        let mut all: Vec<Counter> = self
            .windows
            .iter()
            .flat_map(|w| w.counters.iter().copied())
            .collect();
        all.sort();
        all
    }
}

impl Default for WindowPlan {
    fn default() -> Self {
        Self::single()
    }
}

impl FromStr for WindowPlan {
    type Err = HarvestError;

    /// `single`, `split`, or `offset:counter,counter;offset:counter`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "single" => return Ok(Self::single()),
            "split" => return Ok(Self::split()),
            _ => {}
        }
        let mut windows = Vec::new();
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (offset, counters) = part.split_once(':').ok_or_else(|| {
                HarvestError::Config(format!("window '{part}' must look like OFFSET:counter,..."))
            })?;
            let offset = offset.trim().trim_start_matches('-');
            let start_offset_days = offset.parse::<u32>().map_err(|_| {
                HarvestError::Config(format!("invalid window offset '{offset}'"))
            })?;
            let counters = counters
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(Counter::from_str)
                .collect::<Result<Vec<_>, _>>()?;
            windows.push(ReportWindow {
                start_offset_days,
                counters,
            });
        }
        Self::new(windows)
    }
}

/// One entity on one calendar date. Expands into one work item per window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestTask {
    pub entity: Entity,
    pub date: NaiveDate,
}

impl HarvestTask {
    pub fn new(entity: Entity, date: NaiveDate) -> Self {
        Self { entity, date }
    }

    pub fn work_item(&self, window: &ReportWindow) -> WorkItem {
        WorkItem {
            entity_id: self.entity.entity_id.clone(),
            period_start: self.date - DayDelta::days(i64::from(window.start_offset_days)),
            period_end: self.date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn counter_columns_follow_report_layout() {
        let columns: Vec<usize> = Counter::ALL.iter().map(|c| c.column()).collect();
        assert_eq!(columns, (4..=16).collect::<Vec<_>>());
        assert_eq!("Evolucao_Noturna_CTI".parse::<Counter>().unwrap(), Counter::EvolucaoNoturnaCti);
    }

    #[test]
    fn split_plan_covers_every_counter_once() {
        let plan = WindowPlan::split();
        assert_eq!(plan.counters(), Counter::ALL.to_vec());
        assert_eq!(plan.windows()[0].start_offset_days, 1);
    }

    #[test]
    fn custom_plan_parses() {
        let plan: WindowPlan = "-1:procedimento,evolucao; 0:urgencia".parse().unwrap();
        assert_eq!(plan.windows().len(), 2);
        assert_eq!(plan.windows()[0].start_offset_days, 1);
        assert_eq!(plan.windows()[1].counters, vec![Counter::Urgencia]);
    }

    #[test]
    fn custom_plan_rejects_duplicates_and_unknowns() {
        assert!("0:evolucao;1:evolucao".parse::<WindowPlan>().is_err());
        assert!("0:bogus".parse::<WindowPlan>().is_err());
        assert!("evolucao".parse::<WindowPlan>().is_err());
    }

    #[test]
    fn task_expands_windows_relative_to_date() {
        let task = HarvestTask::new(Entity::new("4411", "Ana"), date("2025-03-01"));
        let plan = WindowPlan::split();
        let first = task.work_item(&plan.windows()[0]);
        assert_eq!(first.period_start, date("2025-02-28"));
        assert_eq!(first.period_end, date("2025-03-01"));
        let second = task.work_item(&plan.windows()[1]);
        assert_eq!(second.period_start, second.period_end);
    }

    #[test]
    fn absorb_copies_only_listed_counters() {
        let entity = Entity::new("1", "A");
        let mut base = ProductivityRecord::empty_for(&entity);
        let mut other = ProductivityRecord::empty_for(&entity);
        other.counters.insert(Counter::Urgencia, 9);
        other.counters.insert(Counter::Evolucao, 4);
        base.absorb(&other, &[Counter::Urgencia]);
        assert_eq!(base.counter(Counter::Urgencia), 9);
        assert_eq!(base.counter(Counter::Evolucao), 0);
    }
}
