pub mod accounts;
pub mod contacts;
pub mod leads;
pub mod opportunities;
pub mod tasks;

use chrono::Utc;
use scraper::ElementRef;
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::Record;
use crate::page::Page;
use crate::parser::classify::{ObjectKind, ViewKind};
use crate::parser::dom;
use crate::parser::normalize::non_empty;

/// Run the extractor for `kind` and convert its rows into stored records.
pub fn extract(kind: ObjectKind, page: &Page, view: ViewKind) -> Vec<Record> {
    match kind {
        ObjectKind::Lead => to_records(leads::extract(page, view)),
        ObjectKind::Contact => to_records(contacts::extract(page, view)),
        ObjectKind::Account => to_records(accounts::extract(page, view)),
        ObjectKind::Opportunity => to_records(opportunities::extract(page, view)),
        ObjectKind::Task => to_records(tasks::extract(page, view)),
        ObjectKind::Unknown => Vec::new(),
    }
}

fn to_records<T: Serialize>(rows: Vec<T>) -> Vec<Record> {
    rows.iter()
        .filter_map(|row| match Record::from_row(row) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("Dropping unserializable row: {e}");
                None
            }
        })
        .collect()
}

// ── Row scanning ──

/// Cells of one table row, addressed by column position.
pub struct RowCells<'a> {
    cells: Vec<ElementRef<'a>>,
}

impl<'a> RowCells<'a> {
    /// Text of cell `i`, `None` when the cell is missing or blank.
    pub fn text(&self, i: usize) -> Option<String> {
        self.cells.get(i).and_then(|c| non_empty(dom::text(*c)))
    }

    /// First cell's link text, else its text.
    pub fn primary(&self) -> String {
        self.cells
            .first()
            .map(|c| dom::cell_primary_text(*c))
            .unwrap_or_default()
    }
}

/// Walk `rows`, resolve each row's id (canonical link or synthetic
/// `<prefix>_<ms>_<index>`), and let `build` turn cells into a typed row.
/// Rows that fail to parse are logged and skipped.
pub(crate) fn scan_rows<'a, T>(
    rows: Vec<ElementRef<'a>>,
    kind: ObjectKind,
    build: impl Fn(&RowCells<'a>, String, i64) -> Option<T>,
) -> Vec<T> {
    let now = Utc::now().timestamp_millis();
    let mut items = Vec::new();

    for (index, row) in rows.into_iter().enumerate() {
        let cells = match dom::row_cells(row) {
            Ok(Some(cells)) => RowCells { cells },
            Ok(None) => continue,
            Err(e) => {
                warn!("Skipping {} row {}: {}", kind, index, e);
                continue;
            }
        };
        let id = dom::linked_record_id(row, kind)
            .unwrap_or_else(|| dom::synthetic_id(kind.id_prefix(), now, Some(index)));
        if let Some(item) = build(&cells, id, now) {
            items.push(item);
        }
    }

    debug!("{} {} from rows", items.len(), kind);
    items
}

/// Id and timestamp for a record read from a detail page.
pub(crate) fn detail_identity(page: &Page, kind: ObjectKind) -> (String, i64) {
    let now = Utc::now().timestamp_millis();
    let id = dom::page_record_id(page)
        .unwrap_or_else(|| dom::synthetic_id(kind.id_prefix(), now, None));
    (id, now)
}
