use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;

static CURRENCY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\d,]+\.?\d*").unwrap());
static PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)%").unwrap());

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y, %I:%M %p",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%d %b %Y",
    "%d %B %Y",
];

/// Canonical pipeline stages, in pipeline order.
pub const STAGES: [&str; 6] = [
    "Prospecting",
    "Qualification",
    "Proposal",
    "Negotiation",
    "Closed Won",
    "Closed Lost",
];

/// Collapse runs of whitespace into single spaces and trim.
pub fn clean_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// First digit/comma run, commas stripped. `"$1,234.50"` → `1234.5`.
pub fn currency(text: &str) -> Option<f64> {
    let m = CURRENCY_RE.find(text)?;
    m.as_str().replace(',', "").parse().ok()
}

/// Integer directly before the first `%`. Not clamped.
pub fn percentage(text: &str) -> Option<u32> {
    PERCENT_RE.captures(text)?.get(1)?.as_str().parse().ok()
}

/// ISO-8601 UTC with millisecond precision. Unparseable text comes back
/// unchanged; blank text is `None`.
pub fn date(text: &str) -> Option<String> {
    let text = clean_text(text);
    if text.is_empty() {
        return None;
    }
    Some(parse_datetime(&text).map(iso).unwrap_or(text))
}

fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(text, fmt) {
            return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}

fn iso(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Map free-text stage names onto the canonical set. Unrecognized text is kept as-is.
pub fn stage(text: &str) -> Option<String> {
    let text = clean_text(text);
    if text.is_empty() {
        return None;
    }
    let lower = text.to_lowercase();
    let canonical = if lower.contains("prospect") {
        STAGES[0]
    } else if lower.contains("qualif") {
        STAGES[1]
    } else if lower.contains("proposal") || lower.contains("quote") {
        STAGES[2]
    } else if lower.contains("negotiat") {
        STAGES[3]
    } else if lower.contains("closed") && lower.contains("won") {
        STAGES[4]
    } else if lower.contains("closed") && lower.contains("lost") {
        STAGES[5]
    } else {
        return Some(text);
    };
    Some(canonical.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("  Ada \n\t Lovelace  "), "Ada Lovelace");
        assert_eq!(clean_text(" \n "), "");
    }

    #[test]
    fn test_currency() {
        assert_eq!(currency("$1,234.50"), Some(1234.5));
        assert_eq!(currency("USD 2,000,000.00"), Some(2_000_000.0));
        assert_eq!(currency("Amount: 75"), Some(75.0));
        assert_eq!(currency("no amount"), None);
        assert_eq!(currency(""), None);
        // a bare comma matches the pattern but is not a number
        assert_eq!(currency("a, b"), None);
    }

    #[test]
    fn test_percentage() {
        assert_eq!(percentage("75%"), Some(75));
        assert_eq!(percentage("Probability 10% (est.)"), Some(10));
        assert_eq!(percentage("150%"), Some(150));
        assert_eq!(percentage("75"), None);
        assert_eq!(percentage(""), None);
    }

    #[test]
    fn test_date() {
        assert_eq!(date("2024-03-15").as_deref(), Some("2024-03-15T00:00:00.000Z"));
        assert_eq!(date("3/15/2024").as_deref(), Some("2024-03-15T00:00:00.000Z"));
        assert_eq!(date("Mar 15, 2024").as_deref(), Some("2024-03-15T00:00:00.000Z"));
        assert_eq!(
            date("3/15/2024 2:30 PM").as_deref(),
            Some("2024-03-15T14:30:00.000Z")
        );
        assert_eq!(
            date("2024-03-15T09:00:00.250+02:00").as_deref(),
            Some("2024-03-15T07:00:00.250Z")
        );
        assert_eq!(date("Next Tuesday").as_deref(), Some("Next Tuesday"));
        assert_eq!(date("   "), None);
    }

    #[test]
    fn test_stage() {
        assert_eq!(stage("Prospecting (3)").as_deref(), Some("Prospecting"));
        assert_eq!(stage("Needs Qualification").as_deref(), Some("Qualification"));
        assert_eq!(stage("Quote Sent").as_deref(), Some("Proposal"));
        assert_eq!(stage("Proposal/Price Quote").as_deref(), Some("Proposal"));
        assert_eq!(stage("Negotiation/Review").as_deref(), Some("Negotiation"));
        assert_eq!(stage("Closed/Won").as_deref(), Some("Closed Won"));
        assert_eq!(stage("CLOSED LOST").as_deref(), Some("Closed Lost"));
        assert_eq!(stage("Id. Decision Makers").as_deref(), Some("Id. Decision Makers"));
        assert_eq!(stage(""), None);
    }
}
