use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::page::Page;
use crate::parser::classify::ObjectKind;
use crate::parser::normalize::{clean_text, non_empty};

#[derive(Debug, thiserror::Error)]
pub enum RowError {
    #[error("row wraps a nested table")]
    NestedTable,
}

fn sel(s: &str) -> Selector {
    Selector::parse(s).unwrap()
}

static GRID_SEL: LazyLock<Selector> = LazyLock::new(|| sel(r#"table[role="grid"]"#));
static TABLE_BODY_SEL: LazyLock<Selector> = LazyLock::new(|| sel("table tbody"));
static BODY_ROW_SEL: LazyLock<Selector> = LazyLock::new(|| sel("tbody tr"));
static STYLED_ROW_SEL: LazyLock<Selector> =
    LazyLock::new(|| sel(".slds-table tbody tr, table.slds-table tr"));
static ROW_SEL: LazyLock<Selector> = LazyLock::new(|| sel("tr"));
static THEAD_SEL: LazyLock<Selector> = LazyLock::new(|| sel("thead"));
static CELL_SEL: LazyLock<Selector> = LazyLock::new(|| sel("th, td"));
static ANCHOR_SEL: LazyLock<Selector> = LazyLock::new(|| sel("a"));
static HREF_SEL: LazyLock<Selector> = LazyLock::new(|| sel("a[href]"));

static LABEL_SEL: LazyLock<Selector> =
    LazyLock::new(|| sel("span.slds-form-element__label, label"));
static CONTAINER_SEL: LazyLock<Selector> =
    LazyLock::new(|| sel(".slds-form-element, .field-container, div"));
static VALUE_SEL: LazyLock<Selector> = LazyLock::new(|| {
    sel(".slds-form-element__control, .field-value, a, span:not(.slds-form-element__label)")
});
static LABELLED_ATTR_SEL: LazyLock<Selector> =
    LazyLock::new(|| sel("[data-field-label], [title]"));
static RECORD_ATTR_SEL: LazyLock<Selector> =
    LazyLock::new(|| sel("[data-record-id], [data-recordid]"));

static PATH_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/([a-zA-Z0-9]{15,18})/").unwrap());
static OBJECT_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(?:r/)?(Lead|Contact|Account|Opportunity|Task)/([a-zA-Z0-9]{15,18})").unwrap()
});

/// Whitespace-collapsed text content of an element.
pub fn text(el: ElementRef<'_>) -> String {
    clean_text(&el.text().collect::<String>())
}

/// Strict ancestors, nearest first.
pub fn ancestors<'a>(el: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    el.ancestors().filter_map(ElementRef::wrap)
}

/// Nearest element matching `selector`, starting with `el` itself.
pub fn closest<'a>(el: ElementRef<'a>, selector: &Selector) -> Option<ElementRef<'a>> {
    if selector.matches(&el) {
        return Some(el);
    }
    ancestors(el).find(|a| selector.matches(a))
}

// ── Table rows ──

type RowStrategy = for<'a> fn(&'a Html) -> Vec<ElementRef<'a>>;

/// Tried in order; the first strategy yielding rows wins.
const ROW_STRATEGIES: &[(&str, RowStrategy)] = &[
    ("grid table", grid_rows),
    ("first table body", first_table_rows),
    ("any table body", body_rows),
    ("styled table", styled_rows),
];

fn grid_rows(html: &Html) -> Vec<ElementRef<'_>> {
    html.select(&GRID_SEL)
        .next()
        .map(|grid| grid.select(&BODY_ROW_SEL).collect())
        .unwrap_or_default()
}

fn first_table_rows(html: &Html) -> Vec<ElementRef<'_>> {
    html.select(&TABLE_BODY_SEL)
        .next()
        .and_then(|body| body.parent().and_then(ElementRef::wrap))
        .map(|table| table.select(&BODY_ROW_SEL).collect())
        .unwrap_or_default()
}

fn body_rows(html: &Html) -> Vec<ElementRef<'_>> {
    html.select(&BODY_ROW_SEL).collect()
}

fn styled_rows(html: &Html) -> Vec<ElementRef<'_>> {
    html.select(&STYLED_ROW_SEL).collect()
}

pub fn table_rows(page: &Page) -> Vec<ElementRef<'_>> {
    for (name, strategy) in ROW_STRATEGIES {
        let rows = strategy(page.html());
        if !rows.is_empty() {
            tracing::debug!("{} rows via {}", rows.len(), name);
            return rows;
        }
    }
    Vec::new()
}

/// Nearest enclosing `<tr>` (inclusive).
pub fn enclosing_row(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    closest(el, &ROW_SEL)
}

/// Cells of one data row. `Ok(None)` for header rows and rows without cells.
pub fn row_cells(row: ElementRef<'_>) -> Result<Option<Vec<ElementRef<'_>>>, RowError> {
    if row.select(&ROW_SEL).next().is_some() {
        return Err(RowError::NestedTable);
    }
    if ancestors(row).any(|a| THEAD_SEL.matches(&a)) {
        return Ok(None);
    }
    let cells: Vec<_> = row.select(&CELL_SEL).collect();
    Ok(if cells.is_empty() { None } else { Some(cells) })
}

/// Text of the first link in a cell, else the cell's own text.
pub fn cell_primary_text(cell: ElementRef<'_>) -> String {
    match cell.select(&ANCHOR_SEL).next() {
        Some(a) => text(a),
        None => text(cell),
    }
}

// ── Record ids ──

/// Canonical id from the first `<Object>/<id>` link under `el` for `kind`.
pub fn linked_record_id(el: ElementRef<'_>, kind: ObjectKind) -> Option<String> {
    el.select(&HREF_SEL)
        .filter_map(|a| a.value().attr("href"))
        .find_map(|href| {
            OBJECT_LINK_RE
                .captures_iter(href)
                .find(|caps| &caps[1] == kind.object_name())
                .map(|caps| caps[2].to_string())
        })
}

/// 15–18 character id segment of the URL path.
pub fn path_record_id(page: &Page) -> Option<String> {
    PATH_ID_RE
        .captures(&page.path())
        .map(|caps| caps[1].to_string())
}

/// Id of the record shown on a detail page: URL path, then `data-record-id` markers.
pub fn page_record_id(page: &Page) -> Option<String> {
    path_record_id(page).or_else(|| {
        page.html().select(&RECORD_ATTR_SEL).find_map(|el| {
            let v = el.value();
            v.attr("data-record-id")
                .or_else(|| v.attr("data-recordid"))
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
    })
}

pub fn synthetic_id(prefix: &str, extracted_at: i64, index: Option<usize>) -> String {
    match index {
        Some(i) => format!("{prefix}_{extracted_at}_{i}"),
        None => format!("{prefix}_{extracted_at}"),
    }
}

// ── Labelled fields ──

/// Value shown next to the label `label` (case-insensitive), falling back to
/// elements whose `data-field-label` or `title` equals it. Blank values count
/// as absent.
pub fn field_by_label(page: &Page, label: &str) -> Option<String> {
    labelled_value(page, label).or_else(|| attribute_value(page, label))
}

fn labelled_value(page: &Page, label: &str) -> Option<String> {
    let wanted = label.to_lowercase();
    let label_el = page
        .html()
        .select(&LABEL_SEL)
        .find(|el| text(*el).to_lowercase() == wanted)?;
    let container = ancestors(label_el).find(|a| CONTAINER_SEL.matches(a))?;
    // skip the label itself and anything nested inside it
    let value = container.select(&VALUE_SEL).find(|v| {
        v.id() != label_el.id()
            && !LABEL_SEL.matches(v)
            && !ancestors(*v).any(|a| a.id() == label_el.id())
    })?;
    non_empty(text(value))
}

fn attribute_value(page: &Page, label: &str) -> Option<String> {
    page.html()
        .select(&LABELLED_ATTR_SEL)
        .find(|el| {
            let v = el.value();
            v.attr("data-field-label") == Some(label) || v.attr("title") == Some(label)
        })
        .and_then(|el| non_empty(text(el)))
}

/// First non-empty value among label synonyms, in order.
pub fn lookup(page: &Page, labels: &[&str]) -> Option<String> {
    labels.iter().find_map(|label| field_by_label(page, label))
}
