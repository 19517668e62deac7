use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::Selector;
use tracing::debug;

use super::{detail_identity, scan_rows, RowCells};
use crate::db::LeadRow;
use crate::page::Page;
use crate::parser::classify::{ObjectKind, ViewKind};
use crate::parser::dom;

static SELECTED_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        r#"[aria-selected="true"], tr[class*="selected"], input[type="checkbox"][checked]"#,
    )
    .unwrap()
});

pub fn extract(page: &Page, view: ViewKind) -> Vec<LeadRow> {
    if view == ViewKind::Detail {
        return extract_detail(page);
    }
    let rows = extract_list(page);
    if !rows.is_empty() {
        return rows;
    }
    debug!("No leads in list rows, trying selected rows");
    extract_selected(page)
}

fn extract_list(page: &Page) -> Vec<LeadRow> {
    scan_rows(dom::table_rows(page), ObjectKind::Lead, from_cells)
}

/// Rows the user has selected, each visited once however many markers it carries.
fn extract_selected(page: &Page) -> Vec<LeadRow> {
    let mut seen = HashSet::new();
    let rows: Vec<_> = page
        .html()
        .select(&SELECTED_SEL)
        .filter_map(dom::enclosing_row)
        .filter(|row| seen.insert(row.id()))
        .collect();
    scan_rows(rows, ObjectKind::Lead, from_cells)
}

fn from_cells(cells: &RowCells<'_>, id: String, extracted_at: i64) -> Option<LeadRow> {
    let name = cells.primary();
    if name.is_empty() {
        return None;
    }
    Some(LeadRow {
        id,
        name,
        company: cells.text(1),
        email: cells.text(2),
        phone: cells.text(3),
        lead_source: cells.text(4),
        lead_status: cells.text(5),
        lead_owner: cells.text(6),
        extracted_at,
    })
}

fn extract_detail(page: &Page) -> Vec<LeadRow> {
    let Some(name) = dom::lookup(page, &["Name", "Lead Name"]) else {
        debug!("Lead detail page without a name");
        return Vec::new();
    };
    let (id, extracted_at) = detail_identity(page, ObjectKind::Lead);
    vec![LeadRow {
        id,
        name,
        company: dom::lookup(page, &["Company"]),
        email: dom::lookup(page, &["Email"]),
        phone: dom::lookup(page, &["Phone"]),
        lead_source: dom::lookup(page, &["Lead Source"]),
        lead_status: dom::lookup(page, &["Lead Status", "Status"]),
        lead_owner: dom::lookup(page, &["Lead Owner", "Owner"]),
        extracted_at,
    }]
}
