use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::db::Record;
use crate::parser::classify::ObjectKind;
use crate::parser::normalize::STAGES;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("No data to export")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Csv,
    Json,
}

impl Format {
    pub fn extension(self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Json => "json",
        }
    }
}

// ── CSV ──

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

fn csv_field(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) if needs_quotes(s) => format!("\"{}\"", s.replace('"', "\"\"")),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Header is the first record's field order; later records are read by those
/// names, missing fields render empty.
pub fn to_csv(records: &[Record]) -> Result<String, ExportError> {
    let first = records.first().ok_or(ExportError::Empty)?;
    let headers: Vec<&String> = first.fields().map(|(k, _)| k).collect();

    let mut lines = Vec::with_capacity(records.len() + 1);
    lines.push(
        headers
            .iter()
            .map(|h| h.as_str())
            .collect::<Vec<_>>()
            .join(","),
    );
    for record in records {
        let row: Vec<String> = headers.iter().map(|h| csv_field(record.get(h))).collect();
        lines.push(row.join(","));
    }
    Ok(lines.join("\n"))
}

// ── JSON ──

pub fn to_json(records: &[Record]) -> Result<String> {
    if records.is_empty() {
        return Err(ExportError::Empty.into());
    }
    Ok(serde_json::to_string_pretty(records)?)
}

pub fn render(records: &[Record], format: Format) -> Result<String> {
    match format {
        Format::Csv => Ok(to_csv(records)?),
        Format::Json => to_json(records),
    }
}

pub fn default_filename(kind: ObjectKind, format: Format, timestamp_ms: i64) -> String {
    format!("{}_export_{}.{}", kind, timestamp_ms, format.extension())
}

pub fn write(path: &Path, records: &[Record], format: Format) -> Result<()> {
    let body = render(records, format)?;
    std::fs::write(path, body).with_context(|| format!("Failed to write {}", path.display()))
}

// ── Views ──

/// Case-insensitive substring match against every non-null field value.
pub fn filter<'a>(records: &'a [Record], query: &str) -> Vec<&'a Record> {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return records.iter().collect();
    }
    records
        .iter()
        .filter(|r| {
            r.fields().any(|(_, v)| match v {
                Value::Null => false,
                Value::String(s) => s.to_lowercase().contains(&q),
                other => other.to_string().to_lowercase().contains(&q),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: &'static str,
    pub count: usize,
    pub amount: f64,
}

/// Opportunity count and summed amount per canonical stage, in pipeline order.
pub fn stage_summary(records: &[Record]) -> Vec<StageSummary> {
    STAGES
        .iter()
        .map(|&stage| {
            let in_stage: Vec<_> = records
                .iter()
                .filter(|r| r.text("stage") == Some(stage))
                .collect();
            StageSummary {
                stage,
                count: in_stage.len(),
                amount: in_stage.iter().filter_map(|r| r.number("amount")).sum(),
            }
        })
        .collect()
}
