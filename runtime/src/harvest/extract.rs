//! Result table extraction.
//!
//! The report renders its result as an HTML table whose first column holds
//! the entity key and whose remaining columns sit at fixed positions (see
//! [`Counter::column`]). The table may be inline or inside the viewer
//! iframe, so [`extract`] looks in the top document first and then in the
//! frame, always returning to the top document afterwards.

use crate::error::Result;
use crate::model::{
    Counter, ProductivityRecord, AFFILIATION_COLUMN, CATEGORY_COLUMN, KEY_COLUMN, NAME_COLUMN,
};
use crate::renderer::RenderContext;
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Outcome of looking for an entity's row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Found(ProductivityRecord),
    /// No row for the entity. A valid result, not an error.
    NotFound,
}

impl Extraction {
    pub fn into_record(self) -> Option<ProductivityRecord> {
        match self {
            Self::Found(record) => Some(record),
            Self::NotFound => None,
        }
    }
}

/// Numeric-or-zero decoding: anything that is not a plain non-negative
/// integer becomes 0.
pub fn decode_count(text: &str) -> u64 {
    text.trim().parse::<u64>().unwrap_or(0)
}

/// Rendered text of a cell with whitespace collapsed.
fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Direct `td`/`th` children of a row.
fn row_cells<'a>(row: &ElementRef<'a>) -> Vec<ElementRef<'a>> {
    row.child_elements()
        .filter(|c| matches!(c.value().name(), "td" | "th"))
        .collect()
}

/// Find the first row in any table whose first cell equals `entity_id` and
/// decode `counters` from it. Tables are scanned in document order, rows top
/// to bottom.
pub fn parse_report_table(
    html: &str,
    entity_id: &str,
    counters: &[Counter],
) -> Option<ProductivityRecord> {
    let document = Html::parse_document(html);
    let table_sel = Selector::parse("table").ok()?;
    let row_sel = Selector::parse("tr").ok()?;
    let wanted = entity_id.trim();

    for table in document.select(&table_sel) {
        let rows: Vec<Vec<String>> = table
            .select(&row_sel)
            .map(|row| row_cells(&row).iter().map(cell_text).collect::<Vec<_>>())
            .filter(|cells| !cells.is_empty())
            .collect();
        if rows.is_empty() {
            continue;
        }
        for cells in rows {
            if cells[KEY_COLUMN] != wanted {
                continue;
            }
            let text_at = |index: usize| cells.get(index).cloned().unwrap_or_default();
            let decoded: BTreeMap<Counter, u64> = counters
                .iter()
                .map(|c| (*c, cells.get(c.column()).map(|t| decode_count(t)).unwrap_or(0)))
                .collect();
            return Some(ProductivityRecord {
                entity_id: text_at(KEY_COLUMN),
                name: text_at(NAME_COLUMN),
                category: text_at(CATEGORY_COLUMN),
                affiliation: text_at(AFFILIATION_COLUMN),
                counters: decoded,
            });
        }
    }
    None
}

/// Look for the entity's row in the current document, then in the viewer
/// iframe. The top-level document is restored whatever happens inside the
/// frame.
pub async fn extract(
    context: &mut dyn RenderContext,
    entity_id: &str,
    counters: &[Counter],
    frame_marker: &str,
) -> Result<Extraction> {
    let html = context.document_html().await?;
    if let Some(record) = parse_report_table(&html, entity_id, counters) {
        info!("row for {entity_id} found in main document");
        return Ok(Extraction::Found(record));
    }

    let framed = match context.enter_frame(frame_marker).await {
        Ok(true) => context.document_html().await.map(Some),
        Ok(false) => Ok(None),
        Err(e) => Err(e),
    };
    let restored = context.exit_frame().await;
    let framed = framed?;
    restored?;

    let Some(frame_html) = framed else {
        debug!("no frame matching '{frame_marker}'; {entity_id} not found");
        return Ok(Extraction::NotFound);
    };
    match parse_report_table(&frame_html, entity_id, counters) {
        Some(record) => {
            info!("row for {entity_id} found inside report frame");
            Ok(Extraction::Found(record))
        }
        None => Ok(Extraction::NotFound),
    }
}
