pub mod classify;
pub mod dom;
pub mod extract;
pub mod normalize;

use anyhow::{bail, Result};

use crate::db::Record;
use crate::page::Page;
use classify::{ObjectKind, PageInfo};

/// Classify → extract for one settled page snapshot. Does not touch the store.
pub fn process_page(page: &Page) -> Result<(PageInfo, Vec<Record>)> {
    let info = classify::page_info(page);
    if info.object_kind == ObjectKind::Unknown {
        bail!("Unable to detect CRM object type");
    }
    if page.is_loading() {
        bail!("Page snapshot still shows a loading indicator");
    }
    let records = extract::extract(info.object_kind, page, info.view_kind);
    Ok((info, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::extract::tests::fixture;

    #[test]
    fn processes_a_list_page() {
        let page = fixture(
            "account_list",
            "https://acme.lightning.force.com/lightning/o/Account/list",
        );
        let (info, records) = process_page(&page).unwrap();
        assert_eq!(info.object_kind, ObjectKind::Account);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id(), Some("0015g00000QrStUvWX"));
    }

    #[test]
    fn rejects_unknown_and_loading_pages() {
        let unknown = Page::parse("https://example.com/", "<title>Blog</title>");
        assert!(process_page(&unknown).is_err());
        let loading = Page::parse(
            "https://acme.lightning.force.com/lightning/o/Lead/list",
            r#"<div class="slds-spinner"></div>"#,
        );
        assert!(process_page(&loading).is_err());
    }
}
