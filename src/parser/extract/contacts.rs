use super::{detail_identity, scan_rows, RowCells};
use crate::db::ContactRow;
use crate::page::Page;
use crate::parser::classify::{ObjectKind, ViewKind};
use crate::parser::dom;

pub fn extract(page: &Page, view: ViewKind) -> Vec<ContactRow> {
    match view {
        ViewKind::List => scan_rows(dom::table_rows(page), ObjectKind::Contact, from_cells),
        _ => extract_detail(page).into_iter().collect(),
    }
}

fn from_cells(cells: &RowCells<'_>, id: String, extracted_at: i64) -> Option<ContactRow> {
    let name = cells.primary();
    if name.is_empty() {
        return None;
    }
    Some(ContactRow {
        id,
        name,
        email: cells.text(1),
        phone: cells.text(2),
        account_name: cells.text(3),
        title: cells.text(4),
        contact_owner: cells.text(5),
        mailing_address: cells.text(6),
        extracted_at,
    })
}

fn extract_detail(page: &Page) -> Option<ContactRow> {
    let name = dom::lookup(page, &["Name", "Contact Name"])?;
    let (id, extracted_at) = detail_identity(page, ObjectKind::Contact);
    Some(ContactRow {
        id,
        name,
        email: dom::lookup(page, &["Email"]),
        phone: dom::lookup(page, &["Phone", "Business Phone"]),
        account_name: dom::lookup(page, &["Account Name", "Account"]),
        title: dom::lookup(page, &["Title"]),
        contact_owner: dom::lookup(page, &["Contact Owner", "Owner"]),
        mailing_address: dom::lookup(page, &["Mailing Address", "Address"]),
        extracted_at,
    })
}
