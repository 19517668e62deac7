use std::sync::LazyLock;

use chrono::Utc;
use scraper::{ElementRef, Selector};
use tracing::debug;

use super::{detail_identity, scan_rows, RowCells};
use crate::db::OpportunityRow;
use crate::page::Page;
use crate::parser::classify::{ObjectKind, ViewKind};
use crate::parser::dom;
use crate::parser::normalize;

static COLUMN_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#".kanban-column, [class*="kanban"], [class*="pipeline"]"#).unwrap()
});
static HEADER_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#".column-header, h2, h3, [class*="header"]"#).unwrap());
static CARD_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#".kanban-card, [class*="card"]"#).unwrap());
static CARD_TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".card-title, h4, a").unwrap());

const KANBAN_PREFIX: &str = "opp_kanban";

pub fn extract(page: &Page, view: ViewKind) -> Vec<OpportunityRow> {
    match view {
        ViewKind::Kanban => extract_kanban(page),
        ViewKind::List => scan_rows(dom::table_rows(page), ObjectKind::Opportunity, from_cells),
        _ => extract_detail(page).into_iter().collect(),
    }
}

fn from_cells(cells: &RowCells<'_>, id: String, extracted_at: i64) -> Option<OpportunityRow> {
    let opportunity_name = cells.primary();
    if opportunity_name.is_empty() {
        return None;
    }
    Some(OpportunityRow {
        id,
        opportunity_name,
        amount: cells.text(1).and_then(|t| normalize::currency(&t)),
        stage: cells.text(2).and_then(|t| normalize::stage(&t)),
        probability: cells.text(3).and_then(|t| normalize::percentage(&t)),
        close_date: cells.text(4).and_then(|t| normalize::date(&t)),
        forecast_category: cells.text(5),
        opportunity_owner: cells.text(6),
        associated_account: cells.text(7),
        extracted_at,
    })
}

fn extract_detail(page: &Page) -> Option<OpportunityRow> {
    let opportunity_name = dom::lookup(page, &["Opportunity Name", "Name"])?;
    let (id, extracted_at) = detail_identity(page, ObjectKind::Opportunity);
    Some(OpportunityRow {
        id,
        opportunity_name,
        amount: dom::lookup(page, &["Amount"]).and_then(|t| normalize::currency(&t)),
        stage: dom::lookup(page, &["Stage", "Opportunity Stage"])
            .and_then(|t| normalize::stage(&t)),
        probability: dom::lookup(page, &["Probability", "Probability (%)"])
            .and_then(|t| normalize::percentage(&t)),
        close_date: dom::lookup(page, &["Close Date"]).and_then(|t| normalize::date(&t)),
        forecast_category: dom::lookup(page, &["Forecast Category"]),
        opportunity_owner: dom::lookup(page, &["Opportunity Owner", "Owner"]),
        associated_account: dom::lookup(page, &["Account Name", "Account"]),
        extracted_at,
    })
}

// ── Kanban ──

fn is_card(el: &ElementRef<'_>) -> bool {
    CARD_SEL.matches(el)
}

fn inside_card(el: ElementRef<'_>) -> bool {
    dom::ancestors(el).any(|a| is_card(&a))
}

/// Nearest enclosing column that is not itself a card.
fn owning_column(card: ElementRef<'_>) -> Option<ElementRef<'_>> {
    dom::ancestors(card).find(|a| COLUMN_SEL.matches(a) && !is_card(a))
}

/// Cards belong to their nearest column; nested cards and card-internal
/// headers are ignored. Amount and probability are read loosely from the
/// card's whole text.
fn extract_kanban(page: &Page) -> Vec<OpportunityRow> {
    let now = Utc::now().timestamp_millis();
    let mut items = Vec::new();

    for column in page.html().select(&COLUMN_SEL) {
        if is_card(&column) {
            continue;
        }
        let cards: Vec<_> = column
            .select(&CARD_SEL)
            .filter(|card| !inside_card(*card))
            .filter(|card| owning_column(*card).map(|c| c.id()) == Some(column.id()))
            .collect();
        if cards.is_empty() {
            continue;
        }

        let header = column
            .select(&HEADER_SEL)
            .find(|h| !inside_card(*h))
            .map(dom::text)
            .unwrap_or_default();
        let stage = normalize::stage(&header);
        debug!("Kanban column {:?}: {} cards", header, cards.len());

        for (index, card) in cards.into_iter().enumerate() {
            let opportunity_name = card
                .select(&CARD_TITLE_SEL)
                .next()
                .map(dom::text)
                .unwrap_or_default();
            if opportunity_name.is_empty() {
                continue;
            }
            let card_text = dom::text(card);
            let id = dom::linked_record_id(card, ObjectKind::Opportunity)
                .unwrap_or_else(|| dom::synthetic_id(KANBAN_PREFIX, now, Some(index)));
            items.push(OpportunityRow {
                id,
                opportunity_name,
                amount: normalize::currency(&card_text),
                stage: stage.clone(),
                probability: normalize::percentage(&card_text),
                close_date: None,
                forecast_category: None,
                opportunity_owner: None,
                associated_account: None,
                extracted_at: now,
            });
        }
    }

    items
}
