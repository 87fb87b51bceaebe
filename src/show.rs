//! Read-only rows for listing runs to operators.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::run::RunStatus;
use crate::task::Task;

/// Column titles, in display order.
pub const COLUMNS: [&str; 11] = [
    "Id",
    "Database",
    "Table",
    "Columns",
    "Type",
    "Schedule",
    "Properties",
    "Status",
    "StartTime",
    "EndTime",
    "Reason",
];

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One run as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRow {
    pub id: String,
    pub database: String,
    pub table: String,
    pub columns: String,
    pub kind: String,
    pub schedule: String,
    pub properties: String,
    pub status: String,
    pub start_time: String,
    pub end_time: String,
    pub reason: String,
}

impl StatusRow {
    /// Build a row from a run's status and, if it still exists, its task.
    pub fn from_run(task: Option<&Task>, status: &RunStatus) -> Self {
        let (table, columns, kind, schedule) = match task {
            Some(task) => (
                task.table.clone().unwrap_or_default(),
                format_columns(&task.columns),
                task.kind.as_str().to_uppercase(),
                task.schedule.schedule_type().to_string(),
            ),
            None => (String::new(), format_columns(&[]), String::new(), String::new()),
        };

        Self {
            id: status.query_id().to_string(),
            database: status.db_name().to_string(),
            table,
            columns,
            kind,
            schedule,
            properties: format_properties(status.properties()),
            status: status.state().to_string(),
            start_time: format_millis(status.create_time()),
            end_time: status.finish_time().map(format_millis).unwrap_or_default(),
            reason: status.error_message().unwrap_or_default().to_string(),
        }
    }

    /// Cell values in `COLUMNS` order.
    pub fn cells(&self) -> [&str; 11] {
        [
            self.id.as_str(),
            self.database.as_str(),
            self.table.as_str(),
            self.columns.as_str(),
            self.kind.as_str(),
            self.schedule.as_str(),
            self.properties.as_str(),
            self.status.as_str(),
            self.start_time.as_str(),
            self.end_time.as_str(),
            self.reason.as_str(),
        ]
    }
}

/// Render rows as a fixed-width text table.
pub fn render_table(rows: &[StatusRow]) -> String {
    let mut widths = COLUMNS.map(str::len);
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row.cells()) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |cells: [&str; 11]| -> String {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut out = line(COLUMNS);
    for row in rows {
        out.push('\n');
        out.push_str(&line(row.cells()));
    }
    out
}

fn format_columns(columns: &[String]) -> String {
    if columns.is_empty() {
        "ALL".to_string()
    } else {
        columns.join(",")
    }
}

fn format_properties(properties: &BTreeMap<String, String>) -> String {
    let body = properties
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{body}}}")
}

fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_default()
}
