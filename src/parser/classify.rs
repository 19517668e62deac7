use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::page::Page;
use crate::parser::dom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    #[serde(rename = "leads")]
    Lead,
    #[serde(rename = "contacts")]
    Contact,
    #[serde(rename = "accounts")]
    Account,
    #[serde(rename = "opportunities")]
    Opportunity,
    #[serde(rename = "tasks")]
    Task,
    #[serde(rename = "unknown")]
    Unknown,
}

impl ObjectKind {
    /// Every kind that has a record collection.
    pub const ALL: [ObjectKind; 5] = [
        ObjectKind::Lead,
        ObjectKind::Contact,
        ObjectKind::Account,
        ObjectKind::Opportunity,
        ObjectKind::Task,
    ];

    pub fn collection_key(self) -> &'static str {
        match self {
            ObjectKind::Lead => "leads",
            ObjectKind::Contact => "contacts",
            ObjectKind::Account => "accounts",
            ObjectKind::Opportunity => "opportunities",
            ObjectKind::Task => "tasks",
            ObjectKind::Unknown => "unknown",
        }
    }

    /// Object name as it appears in CRM URLs (`/r/Lead/...`).
    pub fn object_name(self) -> &'static str {
        match self {
            ObjectKind::Lead => "Lead",
            ObjectKind::Contact => "Contact",
            ObjectKind::Account => "Account",
            ObjectKind::Opportunity => "Opportunity",
            ObjectKind::Task => "Task",
            ObjectKind::Unknown => "Unknown",
        }
    }

    /// Prefix for ids synthesized when a record has no canonical id.
    pub fn id_prefix(self) -> &'static str {
        match self {
            ObjectKind::Lead => "lead",
            ObjectKind::Contact => "contact",
            ObjectKind::Account => "account",
            ObjectKind::Opportunity => "opp",
            ObjectKind::Task => "task",
            ObjectKind::Unknown => "record",
        }
    }

    /// The required, non-empty field every record of this kind carries.
    pub fn primary_field(self) -> &'static str {
        match self {
            ObjectKind::Account => "accountName",
            ObjectKind::Opportunity => "opportunityName",
            ObjectKind::Task => "subject",
            _ => "name",
        }
    }

    fn keywords(self) -> &'static [&'static str] {
        match self {
            ObjectKind::Lead => &["lead"],
            ObjectKind::Contact => &["contact"],
            ObjectKind::Account => &["account"],
            ObjectKind::Opportunity => &["opportunity", "pipeline"],
            ObjectKind::Task => &["task"],
            ObjectKind::Unknown => &[],
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection_key())
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        ObjectKind::ALL
            .into_iter()
            .find(|k| {
                lower == k.collection_key() || lower == k.object_name().to_lowercase()
            })
            .ok_or_else(|| {
                format!("unknown object kind '{s}' (expected leads, contacts, accounts, opportunities or tasks)")
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewKind {
    List,
    Detail,
    Kanban,
    Unknown,
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViewKind::List => "list",
            ViewKind::Detail => "detail",
            ViewKind::Kanban => "kanban",
            ViewKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub object_kind: ObjectKind,
    pub view_kind: ViewKind,
    pub record_ids: Vec<String>,
    pub url: String,
    pub timestamp: i64,
}

impl PageInfo {
    /// Both the object and the view are recognized.
    pub fn is_extraction_possible(&self) -> bool {
        self.object_kind != ObjectKind::Unknown && self.view_kind != ViewKind::Unknown
    }
}

// ── Selectors ──

static NAV_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"nav[role="navigation"]"#).unwrap());
static KANBAN_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#".kanban-board, [class*="kanban"]"#).unwrap());
static LIST_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"table[role="grid"], .slds-table"#).unwrap());
static DETAIL_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#".record-detail, [class*="record"], [class*="forceRecordLayout"]"#).unwrap()
});
static RECORD_LINK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[href*="/r/"]"#).unwrap());

static DETAIL_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/r/\w+/[a-zA-Z0-9]{15,18}/view").unwrap());
static LINK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/r/\w+/([a-zA-Z0-9]{15,18})").unwrap());

// ── Classification ──

/// URL first, then page title, then the navigation breadcrumb.
pub fn object_kind(page: &Page) -> ObjectKind {
    let url = page.url();
    if let Some(kind) = ObjectKind::ALL
        .into_iter()
        .find(|k| url.contains(&format!("/{}/", k.object_name())))
    {
        return kind;
    }

    let title = page.title().to_lowercase();
    if let Some(kind) = kind_from_keywords(&title) {
        return kind;
    }

    page.first(&NAV_SEL)
        .map(|nav| dom::text(nav).to_lowercase())
        .and_then(|text| kind_from_keywords(&text))
        .unwrap_or(ObjectKind::Unknown)
}

fn kind_from_keywords(text: &str) -> Option<ObjectKind> {
    ObjectKind::ALL
        .into_iter()
        .find(|k| k.keywords().iter().any(|kw| text.contains(kw)))
}

/// Kanban before list before detail.
pub fn view_kind(page: &Page) -> ViewKind {
    let url = page.url().to_lowercase();
    if url.contains("/kanban") || url.contains("/pipeline") || page.has(&KANBAN_SEL) {
        ViewKind::Kanban
    } else if url.contains("/list") || page.has(&LIST_SEL) {
        ViewKind::List
    } else if DETAIL_URL_RE.is_match(page.url()) || page.has(&DETAIL_SEL) {
        ViewKind::Detail
    } else {
        ViewKind::Unknown
    }
}

/// Distinct record ids referenced by `/r/<Object>/<id>` links, then the URL path,
/// in first-seen order.
pub fn record_ids(page: &Page) -> Vec<String> {
    let links = page
        .html()
        .select(&RECORD_LINK_SEL)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| LINK_ID_RE.captures(href).map(|caps| caps[1].to_string()));
    let mut seen = HashSet::new();
    links
        .chain(dom::path_record_id(page))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

pub fn page_info(page: &Page) -> PageInfo {
    PageInfo {
        object_kind: object_kind(page),
        view_kind: view_kind(page),
        record_ids: record_ids(page),
        url: page.url().to_string(),
        timestamp: Utc::now().timestamp_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://acme.lightning.force.com";

    fn page(path: &str, body: &str) -> Page {
        Page::parse(&format!("{BASE}{path}"), body)
    }

    #[test]
    fn kind_from_url() {
        let p = page("/lightning/o/Opportunity/list", "<title>Leads</title>");
        assert_eq!(object_kind(&p), ObjectKind::Opportunity);
        let p = page("/lightning/r/Task/00T5g00000AbCdEfGH/view", "");
        assert_eq!(object_kind(&p), ObjectKind::Task);
    }

    #[test]
    fn kind_from_title_and_nav() {
        let p = page("/lightning/page/home", "<title>Recently Viewed | Contacts</title>");
        assert_eq!(object_kind(&p), ObjectKind::Contact);
        let p = page("/one/one.app", "<title>Sales Pipeline</title>");
        assert_eq!(object_kind(&p), ObjectKind::Opportunity);
        let p = page(
            "/one/one.app",
            r#"<title>Salesforce</title><nav role="navigation"><ol><li>Accounts</li><li>Globex</li></ol></nav>"#,
        );
        assert_eq!(object_kind(&p), ObjectKind::Account);
    }

    #[test]
    fn unknown_page_is_not_extractable() {
        let p = page("/lightning/setup/home", "<title>Setup Home</title><div>Settings</div>");
        assert_eq!(object_kind(&p), ObjectKind::Unknown);
        assert!(!page_info(&p).is_extraction_possible());
        assert!(page_info(&page("/lightning/o/Lead/list", "")).is_extraction_possible());
        // known object, unrecognized view
        let p = page("/lightning/o/Lead/home", "<div></div>");
        assert!(!page_info(&p).is_extraction_possible());
    }

    #[test]
    fn views() {
        let kanban = page("/lightning/o/Opportunity/pipeline", "<div></div>");
        assert_eq!(view_kind(&kanban), ViewKind::Kanban);
        let kanban = page("/one/one.app", r#"<div class="board kanban-board"></div><table role="grid"></table>"#);
        assert_eq!(view_kind(&kanban), ViewKind::Kanban);
        let list = page("/lightning/o/Lead/list", "");
        assert_eq!(view_kind(&list), ViewKind::List);
        let list = page("/one/one.app", r#"<table class="slds-table"></table>"#);
        assert_eq!(view_kind(&list), ViewKind::List);
        let detail = page("/lightning/r/Lead/00Q5g00000AbCdEfGH/view", "<div></div>");
        assert_eq!(view_kind(&detail), ViewKind::Detail);
        let detail = page("/one/one.app", r#"<div class="forceRecordLayout"></div>"#);
        assert_eq!(view_kind(&detail), ViewKind::Detail);
        let other = page("/lightning/page/home", "<div>Welcome</div>");
        assert_eq!(view_kind(&other), ViewKind::Unknown);
    }

    #[test]
    fn record_ids_from_links_and_path() {
        let p = page(
            "/lightning/r/Account/0015g00000QrStUvWX/view",
            r#"<a href="/lightning/r/Contact/0035g00000AbCdEfGH/view">Ada</a>
               <a href="/lightning/r/Contact/0035g00000AbCdEfGH/view">Ada again</a>
               <a href="/lightning/r/Opportunity/0065g00000ZyXwVuTS/view">Deal</a>
               <a href="/lightning/r/Contact/short/view">Broken</a>"#,
        );
        assert_eq!(
            record_ids(&p),
            vec!["0035g00000AbCdEfGH", "0065g00000ZyXwVuTS", "0015g00000QrStUvWX"]
        );
    }

    #[test]
    fn page_info_serializes_camel_case() {
        let p = page("/lightning/o/Lead/list", "");
        let info = page_info(&p);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["objectKind"], "leads");
        assert_eq!(json["viewKind"], "list");
        assert_eq!(json["recordIds"], serde_json::json!([]));
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn kind_parsing() {
        assert_eq!("leads".parse::<ObjectKind>(), Ok(ObjectKind::Lead));
        assert_eq!("Opportunity".parse::<ObjectKind>(), Ok(ObjectKind::Opportunity));
        assert!("widgets".parse::<ObjectKind>().is_err());
        assert!("unknown".parse::<ObjectKind>().is_err());
    }
}
