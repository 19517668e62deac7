use super::{detail_identity, scan_rows, RowCells};
use crate::db::AccountRow;
use crate::page::Page;
use crate::parser::classify::{ObjectKind, ViewKind};
use crate::parser::dom;
use crate::parser::normalize;

pub fn extract(page: &Page, view: ViewKind) -> Vec<AccountRow> {
    match view {
        ViewKind::List => scan_rows(dom::table_rows(page), ObjectKind::Account, from_cells),
        _ => extract_detail(page).into_iter().collect(),
    }
}

fn from_cells(cells: &RowCells<'_>, id: String, extracted_at: i64) -> Option<AccountRow> {
    let account_name = cells.primary();
    if account_name.is_empty() {
        return None;
    }
    Some(AccountRow {
        id,
        account_name,
        website: cells.text(1),
        phone: cells.text(2),
        industry: cells.text(3),
        account_type: cells.text(4),
        account_owner: cells.text(5),
        annual_revenue: cells.text(6).and_then(|t| normalize::currency(&t)),
        extracted_at,
    })
}

fn extract_detail(page: &Page) -> Option<AccountRow> {
    let account_name = dom::lookup(page, &["Account Name", "Name"])?;
    let (id, extracted_at) = detail_identity(page, ObjectKind::Account);
    Some(AccountRow {
        id,
        account_name,
        website: dom::lookup(page, &["Website"]),
        phone: dom::lookup(page, &["Phone", "Business Phone"]),
        industry: dom::lookup(page, &["Industry"]),
        account_type: dom::lookup(page, &["Type", "Account Type"]),
        account_owner: dom::lookup(page, &["Account Owner", "Owner"]),
        annual_revenue: dom::lookup(page, &["Annual Revenue"])
            .and_then(|t| normalize::currency(&t)),
        extracted_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::extract::tests::fixture;

    #[test]
    fn list_view() {
        let page = fixture(
            "account_list",
            "https://acme.lightning.force.com/lightning/o/Account/list",
        );
        let accounts = extract(&page, ViewKind::List);
        assert_eq!(accounts.len(), 2);
        let globex = &accounts[0];
        assert_eq!(globex.id, "0015g00000QrStUvWX");
        assert_eq!(globex.account_name, "Globex");
        assert_eq!(globex.website.as_deref(), Some("globex.example.com"));
        assert_eq!(globex.account_type.as_deref(), Some("Customer - Direct"));
        assert_eq!(globex.annual_revenue, Some(12_500_000.0));

        let initech = &accounts[1];
        assert_eq!(initech.account_name, "Initech");
        // revenue cell without digits
        assert_eq!(initech.annual_revenue, None);
    }

    #[test]
    fn detail_view() {
        let page = fixture(
            "account_detail",
            "https://acme.lightning.force.com/lightning/r/Account/0015g00000ZyXwVuTS/view",
        );
        let accounts = extract(&page, ViewKind::Detail);
        assert_eq!(accounts.len(), 1);
        let a = &accounts[0];
        assert_eq!(a.id, "0015g00000ZyXwVuTS");
        assert_eq!(a.account_name, "Initech");
        assert_eq!(a.account_type.as_deref(), Some("Prospect"));
        assert_eq!(a.industry.as_deref(), Some("Technology"));
        assert_eq!(a.annual_revenue, Some(2_000_000.0));
        assert_eq!(a.account_owner.as_deref(), Some("Bill Lumbergh"));
    }

    #[test]
    fn record_uses_type_key() {
        let page = fixture(
            "account_detail",
            "https://acme.lightning.force.com/lightning/r/Account/0015g00000ZyXwVuTS/view",
        );
        let records = crate::parser::extract::extract(ObjectKind::Account, &page, ViewKind::Detail);
        assert_eq!(records[0].text("type"), Some("Prospect"));
        assert_eq!(records[0].text("accountName"), Some("Initech"));
    }
}
