use super::{detail_identity, scan_rows, RowCells};
use crate::db::TaskRow;
use crate::page::Page;
use crate::parser::classify::{ObjectKind, ViewKind};
use crate::parser::dom;
use crate::parser::normalize;

pub fn extract(page: &Page, view: ViewKind) -> Vec<TaskRow> {
    match view {
        ViewKind::List => scan_rows(dom::table_rows(page), ObjectKind::Task, from_cells),
        _ => extract_detail(page).into_iter().collect(),
    }
}

fn from_cells(cells: &RowCells<'_>, id: String, extracted_at: i64) -> Option<TaskRow> {
    let subject = cells.primary();
    if subject.is_empty() {
        return None;
    }
    Some(TaskRow {
        id,
        subject,
        due_date: cells.text(1).and_then(|t| normalize::date(&t)),
        status: cells.text(2),
        priority: cells.text(3),
        related_to: cells.text(4),
        assigned_to: cells.text(5),
        extracted_at,
    })
}

fn extract_detail(page: &Page) -> Option<TaskRow> {
    let subject = dom::lookup(page, &["Subject"])?;
    let (id, extracted_at) = detail_identity(page, ObjectKind::Task);
    Some(TaskRow {
        id,
        subject,
        due_date: dom::lookup(page, &["Due Date"]).and_then(|t| normalize::date(&t)),
        status: dom::lookup(page, &["Status"]),
        priority: dom::lookup(page, &["Priority"]),
        related_to: dom::lookup(page, &["Related To", "Name"]),
        assigned_to: dom::lookup(page, &["Assigned To", "Owner"]),
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
            "task_list",
            "https://acme.lightning.force.com/lightning/o/Task/list",
        );
        let tasks = extract(&page, ViewKind::List);
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].id, "00T5g00000AbCdEfGH");
        assert_eq!(tasks[0].subject, "Call Ada about renewal");
        assert_eq!(tasks[0].due_date.as_deref(), Some("2024-04-01T00:00:00.000Z"));
        assert_eq!(tasks[0].priority.as_deref(), Some("High"));
        assert_eq!(tasks[0].related_to.as_deref(), Some("Globex Expansion"));
        // unparseable due date kept verbatim, blank due date is null
        assert_eq!(tasks[1].due_date.as_deref(), Some("Someday"));
        assert_eq!(tasks[2].due_date, None);
        assert!(tasks[2].id.starts_with("task_"));
    }

    #[test]
    fn detail_view() {
        let page = fixture(
            "task_detail",
            "https://acme.lightning.force.com/lightning/r/Task/00T5g00000AbCdEfGH/view",
        );
        let tasks = extract(&page, ViewKind::Detail);
        assert_eq!(tasks.len(), 1);
        let t = &tasks[0];
        assert_eq!(t.id, "00T5g00000AbCdEfGH");
        assert_eq!(t.subject, "Call Ada about renewal");
        assert_eq!(t.due_date.as_deref(), Some("2024-04-01T00:00:00.000Z"));
        assert_eq!(t.status.as_deref(), Some("Not Started"));
        assert_eq!(t.related_to.as_deref(), Some("Globex Expansion"));
        assert_eq!(t.assigned_to.as_deref(), Some("Hank Scorpio"));
    }
}
